//! Explicit wiring of the sync core for one application instance.
//!
//! [`SyncContext`] owns the bus, persistence chain and stores that panels
//! share; panels receive handles from it instead of reaching for globals.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;

use crate::bus::{BusConfig, EventBus, PanelId};
use crate::entity::{EntityLoader, EntitySyncManager, EntitySyncOptions};
use crate::error::{Result, StorageError};
use crate::filters::FilterStore;
use crate::logging::{LogLevel, Logger, emit, json_kv, json_str};
use crate::metrics::{MetricSnapshot, SharedMetrics, SyncMetrics};
use crate::panel_state::PanelStateStore;
use crate::registry::{LayoutManager, PanelRegistry};
use crate::storage::{FileStore, KeyValueStore, MemoryStore, PersistenceAdapter};

const LOG_TARGET: &str = "panel_sync::context";

/// Storage tiers to assemble. Loadable from JSON.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for a durable primary tier; in-memory when absent.
    pub data_dir: Option<PathBuf>,
    /// Byte quota on the in-memory primary.
    pub primary_quota_bytes: Option<usize>,
    /// Add an in-memory secondary tier behind the primary.
    pub secondary: bool,
    /// Attempts a panel state update gets when saves keep losing races.
    pub max_conflict_retries: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            primary_quota_bytes: None,
            secondary: true,
            max_conflict_retries: 3,
        }
    }
}

impl StorageConfig {
    pub fn from_json_str(text: &str) -> std::result::Result<Self, StorageError> {
        Ok(serde_json::from_str(text)?)
    }

    fn build_adapter(
        &self,
        logger: Option<Logger>,
        metrics: Option<SharedMetrics>,
    ) -> std::result::Result<PersistenceAdapter, StorageError> {
        let primary: Arc<dyn KeyValueStore> = match self.data_dir.as_ref() {
            Some(dir) => Arc::new(FileStore::new(dir)?.with_name("primary")),
            None => {
                let store = MemoryStore::new("primary");
                match self.primary_quota_bytes {
                    Some(quota) => Arc::new(store.with_quota(quota)),
                    None => Arc::new(store),
                }
            }
        };
        let mut adapter = PersistenceAdapter::new(primary);
        if self.secondary {
            adapter = adapter.with_secondary(Arc::new(MemoryStore::new("secondary")));
        }
        Ok(adapter.with_logger(logger).with_metrics(metrics))
    }
}

#[derive(Clone)]
pub struct SyncConfig {
    /// Optional structured logger shared by every component.
    pub logger: Option<Logger>,
    /// Counters shared by every component; `None` disables collection.
    pub metrics: Option<SharedMetrics>,
    /// Target field used when emitting metrics snapshots.
    pub metrics_target: String,
    pub storage: StorageConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            logger: None,
            metrics: None,
            metrics_target: "panel_sync::metrics".to_string(),
            storage: StorageConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Enable metrics collection if it has not already been configured.
    pub fn enable_metrics(&mut self) {
        if self.metrics.is_none() {
            self.metrics = Some(SyncMetrics::shared());
        }
    }

    pub fn disable_metrics(&mut self) {
        self.metrics = None;
    }

    pub fn metrics_handle(&self) -> Option<SharedMetrics> {
        self.metrics.as_ref().map(Arc::clone)
    }
}

pub struct SyncContext {
    config: SyncConfig,
    bus: EventBus,
    adapter: Arc<PersistenceAdapter>,
    panel_state: Arc<PanelStateStore>,
    filters: Arc<FilterStore>,
    registry: Arc<PanelRegistry>,
    layout: Arc<LayoutManager>,
    started: Instant,
}

impl SyncContext {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let logger = config.logger.clone();
        let metrics = config.metrics_handle();

        let bus = EventBus::with_config(BusConfig {
            logger: logger.clone(),
            metrics: metrics.clone(),
        });
        let adapter = Arc::new(
            config
                .storage
                .build_adapter(logger.clone(), metrics.clone())?,
        );
        let panel_state = Arc::new(
            PanelStateStore::new(Arc::clone(&adapter))
                .with_bus(bus.clone())
                .with_logger(logger.clone())
                .with_metrics(metrics)
                .with_max_attempts(config.storage.max_conflict_retries),
        );
        let filters = Arc::new(
            FilterStore::new(Arc::clone(&adapter), bus.clone()).with_logger(logger.clone()),
        );
        let registry = Arc::new(PanelRegistry::new());
        let layout = Arc::new(LayoutManager::new(
            Arc::clone(&adapter),
            Arc::clone(&registry),
            bus.clone(),
        ));

        emit(
            logger.as_ref(),
            LogLevel::Info,
            LOG_TARGET,
            "context_ready",
            [
                json_kv("tiers", adapter.tier_names()),
                json_kv("metrics", config.metrics.is_some()),
            ],
        );

        Ok(Self {
            config,
            bus,
            adapter,
            panel_state,
            filters,
            registry,
            layout,
            started: Instant::now(),
        })
    }

    /// Context with default in-memory storage.
    pub fn in_memory() -> Result<Self> {
        Self::new(SyncConfig::default())
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn adapter(&self) -> &Arc<PersistenceAdapter> {
        &self.adapter
    }

    pub fn panel_state(&self) -> &Arc<PanelStateStore> {
        &self.panel_state
    }

    pub fn filters(&self) -> &Arc<FilterStore> {
        &self.filters
    }

    pub fn registry(&self) -> &Arc<PanelRegistry> {
        &self.registry
    }

    pub fn layout(&self) -> &Arc<LayoutManager> {
        &self.layout
    }

    /// Entity sync manager on this context's bus. Logger and metrics default
    /// to the context's own when the options leave them unset.
    pub fn entity_sync<L: EntityLoader>(
        &self,
        mut options: EntitySyncOptions,
        loader: L,
    ) -> EntitySyncManager<L> {
        if options.logger.is_none() {
            options.logger = self.config.logger.clone();
        }
        if options.metrics.is_none() {
            options.metrics = self.config.metrics_handle();
        }
        EntitySyncManager::new(options, loader, self.bus.clone())
    }

    pub fn mount_panel(&self, panel_id: impl Into<PanelId>, content_type: &str) -> Result<()> {
        let panel_id = panel_id.into();
        self.registry.mount(panel_id.clone(), content_type)?;
        self.log(
            LogLevel::Debug,
            "panel_mounted",
            [json_str("panel", panel_id), json_str("content_type", content_type)],
        );
        Ok(())
    }

    /// Unmount a panel and drop its layout. Its persisted state is kept so a
    /// remount restores it.
    pub fn unmount_panel(&self, panel_id: &str) -> Result<bool> {
        if !self.registry.unmount(panel_id) {
            return Ok(false);
        }
        self.layout.remove(panel_id)?;
        self.panel_state.forget(panel_id);
        self.log(LogLevel::Debug, "panel_unmounted", [json_str("panel", panel_id)]);
        Ok(true)
    }

    pub fn metrics_snapshot(&self) -> Option<MetricSnapshot> {
        let metrics = self.config.metrics.as_ref()?;
        let guard = metrics.lock().ok()?;
        Some(guard.snapshot(self.started.elapsed()))
    }

    /// Log a metrics snapshot when both a logger and metrics are configured.
    pub fn emit_metrics(&self) {
        if let (Some(logger), Some(snapshot)) =
            (self.config.logger.as_ref(), self.metrics_snapshot())
        {
            let _ = logger.log_event(snapshot.to_log_event(&self.config.metrics_target));
        }
    }

    fn log<I>(&self, level: LogLevel, message: &str, fields: I)
    where
        I: IntoIterator<Item = (String, serde_json::Value)>,
    {
        emit(self.config.logger.as_ref(), level, LOG_TARGET, message, fields);
    }
}
