use crate::logging::{LogEvent, LogFields, LogLevel};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Shared handle used by components that record into the same counters.
pub type SharedMetrics = Arc<Mutex<SyncMetrics>>;

#[derive(Debug, Default, Clone)]
pub struct SyncMetrics {
    broadcasts: u64,
    deliveries: u64,
    subscriber_failures: u64,
    storage_fallbacks: u64,
    degraded_saves: u64,
    stale_rejections: u64,
    conflicts_resolved: u64,
    entity_loads: u64,
    entity_load_failures: u64,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedMetrics {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn record_broadcast(&mut self) {
        self.broadcasts = self.broadcasts.saturating_add(1);
    }

    pub fn record_deliveries(&mut self, count: usize) {
        self.deliveries = self.deliveries.saturating_add(count as u64);
    }

    pub fn record_subscriber_failure(&mut self) {
        self.subscriber_failures = self.subscriber_failures.saturating_add(1);
    }

    pub fn record_storage_fallback(&mut self) {
        self.storage_fallbacks = self.storage_fallbacks.saturating_add(1);
    }

    pub fn record_degraded_save(&mut self) {
        self.degraded_saves = self.degraded_saves.saturating_add(1);
    }

    pub fn record_stale_rejection(&mut self) {
        self.stale_rejections = self.stale_rejections.saturating_add(1);
    }

    pub fn record_conflict_resolved(&mut self) {
        self.conflicts_resolved = self.conflicts_resolved.saturating_add(1);
    }

    pub fn record_entity_load(&mut self, failed: bool) {
        self.entity_loads = self.entity_loads.saturating_add(1);
        if failed {
            self.entity_load_failures = self.entity_load_failures.saturating_add(1);
        }
    }

    pub fn snapshot(&self, uptime: Duration) -> MetricSnapshot {
        MetricSnapshot {
            uptime_ms: uptime.as_millis() as u64,
            broadcasts: self.broadcasts,
            deliveries: self.deliveries,
            subscriber_failures: self.subscriber_failures,
            storage_fallbacks: self.storage_fallbacks,
            degraded_saves: self.degraded_saves,
            stale_rejections: self.stale_rejections,
            conflicts_resolved: self.conflicts_resolved,
            entity_loads: self.entity_loads,
            entity_load_failures: self.entity_load_failures,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSnapshot {
    pub uptime_ms: u64,
    pub broadcasts: u64,
    pub deliveries: u64,
    pub subscriber_failures: u64,
    pub storage_fallbacks: u64,
    pub degraded_saves: u64,
    pub stale_rejections: u64,
    pub conflicts_resolved: u64,
    pub entity_loads: u64,
    pub entity_load_failures: u64,
}

impl MetricSnapshot {
    pub fn to_log_event(&self, target: &str) -> LogEvent {
        LogEvent::with_fields(LogLevel::Info, target, "sync_metrics", self.as_fields())
    }

    pub fn as_fields(&self) -> LogFields {
        let mut map = LogFields::new();
        map.insert("uptime_ms".to_string(), json!(self.uptime_ms));
        map.insert("broadcasts".to_string(), json!(self.broadcasts));
        map.insert("deliveries".to_string(), json!(self.deliveries));
        map.insert(
            "subscriber_failures".to_string(),
            json!(self.subscriber_failures),
        );
        map.insert("storage_fallbacks".to_string(), json!(self.storage_fallbacks));
        map.insert("degraded_saves".to_string(), json!(self.degraded_saves));
        map.insert("stale_rejections".to_string(), json!(self.stale_rejections));
        map.insert(
            "conflicts_resolved".to_string(),
            json!(self.conflicts_resolved),
        );
        map.insert("entity_loads".to_string(), json!(self.entity_loads));
        map.insert(
            "entity_load_failures".to_string(),
            json!(self.entity_load_failures),
        );
        map
    }
}

/// Apply `record` to an optional shared metrics handle, ignoring poisoning.
pub(crate) fn record(metrics: Option<&SharedMetrics>, record: impl FnOnce(&mut SyncMetrics)) {
    if let Some(metrics) = metrics {
        if let Ok(mut guard) = metrics.lock() {
            record(&mut guard);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let mut metrics = SyncMetrics::new();
        metrics.record_broadcast();
        metrics.record_deliveries(3);
        metrics.record_entity_load(true);
        metrics.record_entity_load(false);

        let snapshot = metrics.snapshot(Duration::from_millis(1500));
        assert_eq!(snapshot.uptime_ms, 1500);
        assert_eq!(snapshot.broadcasts, 1);
        assert_eq!(snapshot.deliveries, 3);
        assert_eq!(snapshot.entity_loads, 2);
        assert_eq!(snapshot.entity_load_failures, 1);

        let event = snapshot.to_log_event("panel_sync::metrics");
        assert_eq!(event.message, "sync_metrics");
        assert_eq!(event.field("deliveries"), Some(&json!(3)));
    }
}
