use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::error::StorageError;
use crate::logging::{LogLevel, Logger, emit, json_kv, json_str};
use crate::metrics::{self, SharedMetrics};

use super::envelope::StorageEnvelope;
use super::store::{KeyValueStore, MemoryStore};

const LOG_TARGET: &str = "panel_sync::storage";
const FALLBACK_STORE: &str = "memory-fallback";

/// Where a save landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Written to the primary tier.
    Stored { store: String },
    /// Primary refused; a later tier accepted the write.
    Fallback { store: String },
    /// Every tier refused; the value lives only in process memory.
    Degraded,
    /// Identical envelope already persisted.
    Unchanged,
}

impl SaveOutcome {
    pub fn is_degraded(&self) -> bool {
        matches!(self, SaveOutcome::Degraded)
    }

    pub fn is_durable(&self) -> bool {
        matches!(
            self,
            SaveOutcome::Stored { .. } | SaveOutcome::Fallback { .. } | SaveOutcome::Unchanged
        )
    }
}

/// Versioned load/save across an ordered list of stores.
///
/// Reads consult every tier and keep the highest valid version (earlier tiers
/// win ties). Corrupt or unreadable entries count as absent.
pub struct PersistenceAdapter {
    tiers: Vec<Arc<dyn KeyValueStore>>,
    fallback: Arc<dyn KeyValueStore>,
    write_lock: Mutex<()>,
    /// Tiers (by index into `stores()`) still holding a key whose removal failed.
    pending_removals: Mutex<BTreeMap<String, BTreeSet<usize>>>,
    logger: Option<Logger>,
    metrics: Option<SharedMetrics>,
}

impl PersistenceAdapter {
    pub fn new(primary: Arc<dyn KeyValueStore>) -> Self {
        Self {
            tiers: vec![primary],
            fallback: Arc::new(MemoryStore::new(FALLBACK_STORE)),
            write_lock: Mutex::new(()),
            pending_removals: Mutex::new(BTreeMap::new()),
            logger: None,
            metrics: None,
        }
    }

    /// Adapter whose only tier is a fresh in-memory store.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new("memory")))
    }

    pub fn with_secondary(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.tiers.push(store);
        self
    }

    pub fn with_logger(mut self, logger: Option<Logger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_metrics(mut self, metrics: Option<SharedMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn tier_names(&self) -> Vec<String> {
        self.tiers
            .iter()
            .map(|tier| tier.name().to_string())
            .chain(std::iter::once(FALLBACK_STORE.to_string()))
            .collect()
    }

    /// Persist `envelope` under `key`.
    ///
    /// Fails only when the envelope does not supersede what is already stored
    /// (or the value cannot be serialized); backend failures degrade instead.
    pub fn save<T: Serialize>(
        &self,
        key: &str,
        envelope: &StorageEnvelope<T>,
    ) -> Result<SaveOutcome, StorageError> {
        let text = serde_json::to_string(envelope)?;
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.settle_removals(Some(key));

        if let Some(current) = self.load::<Value>(key) {
            if envelope.version <= current.version {
                let data = serde_json::to_value(&envelope.data)?;
                if envelope.version == current.version && data == current.data {
                    return Ok(SaveOutcome::Unchanged);
                }
                metrics::record(self.metrics.as_ref(), |m| m.record_stale_rejection());
                self.log(
                    LogLevel::Warn,
                    "stale_write_rejected",
                    [
                        json_str("key", key),
                        json_kv("attempted", json!(envelope.version)),
                        json_kv("current", json!(current.version)),
                    ],
                );
                return Err(StorageError::StaleVersion {
                    key: key.to_string(),
                    attempted: envelope.version,
                    current: current.version,
                });
            }
        }

        for (index, tier) in self.tiers.iter().enumerate() {
            match tier.set(key, &text) {
                Ok(()) => {
                    self.clear_pending(key, index);
                    let store = tier.name().to_string();
                    if index == 0 {
                        return Ok(SaveOutcome::Stored { store });
                    }
                    self.log(
                        LogLevel::Info,
                        "saved_to_fallback",
                        [json_str("key", key), json_str("store", store.clone())],
                    );
                    return Ok(SaveOutcome::Fallback { store });
                }
                Err(err) => {
                    metrics::record(self.metrics.as_ref(), |m| m.record_storage_fallback());
                    self.log(
                        LogLevel::Warn,
                        "store_write_failed",
                        [
                            json_str("key", key),
                            json_str("store", tier.name()),
                            json_str("error", err.to_string()),
                        ],
                    );
                }
            }
        }

        match self.fallback.set(key, &text) {
            Ok(()) => self.clear_pending(key, self.tiers.len()),
            Err(err) => self.log(
                LogLevel::Error,
                "memory_fallback_failed",
                [json_str("key", key), json_str("error", err.to_string())],
            ),
        }
        metrics::record(self.metrics.as_ref(), |m| m.record_degraded_save());
        self.log(
            LogLevel::Warn,
            "save_degraded",
            [json_str("key", key), json_kv("version", json!(envelope.version))],
        );
        Ok(SaveOutcome::Degraded)
    }

    /// Freshest valid envelope for `key`, or `None`.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Option<StorageEnvelope<T>> {
        let mut best: Option<StorageEnvelope<T>> = None;
        let pending = self.pending_tiers(key);
        for (index, store) in self.stores().enumerate() {
            if pending.contains(&index) {
                continue;
            }
            let text = match store.get(key) {
                Ok(Some(text)) => text,
                Ok(None) => continue,
                Err(err) => {
                    self.log(
                        LogLevel::Warn,
                        "store_read_failed",
                        [
                            json_str("key", key),
                            json_str("store", store.name()),
                            json_str("error", err.to_string()),
                        ],
                    );
                    continue;
                }
            };
            match serde_json::from_str::<StorageEnvelope<T>>(&text) {
                Ok(envelope) => {
                    let newer = best
                        .as_ref()
                        .map(|current| envelope.version > current.version)
                        .unwrap_or(true);
                    if newer {
                        best = Some(envelope);
                    }
                }
                Err(err) => self.log(
                    LogLevel::Warn,
                    "corrupt_entry",
                    [
                        json_str("key", key),
                        json_str("store", store.name()),
                        json_str("error", err.to_string()),
                    ],
                ),
            }
        }
        best
    }

    /// Remove `key` from every tier. Returns whether any tier held it.
    pub fn remove(&self, key: &str) -> bool {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.settle_removals(None);
        self.remove_unlocked(key)
    }

    /// Keys across all tiers starting with `prefix`, sorted.
    pub fn keys(&self, prefix: &str) -> Vec<String> {
        let mut keys = BTreeSet::new();
        let pending = self.lock_pending().clone();
        let is_pending = |key: &str, index: usize| {
            pending
                .get(key)
                .is_some_and(|tiers| tiers.contains(&index))
        };
        for (index, store) in self.stores().enumerate() {
            match store.keys() {
                Ok(found) => keys.extend(
                    found
                        .into_iter()
                        .filter(|k| k.starts_with(prefix) && !is_pending(k, index)),
                ),
                Err(err) => self.log(
                    LogLevel::Warn,
                    "store_list_failed",
                    [json_str("store", store.name()), json_str("error", err.to_string())],
                ),
            }
        }
        keys.into_iter().collect()
    }

    /// Every valid envelope whose key starts with `prefix`.
    pub fn load_all<T: DeserializeOwned>(&self, prefix: &str) -> Vec<(String, StorageEnvelope<T>)> {
        self.keys(prefix)
            .into_iter()
            .filter_map(|key| self.load(&key).map(|envelope| (key, envelope)))
            .collect()
    }

    /// Remove every key starting with `prefix`. Returns how many were removed.
    pub fn clear_all(&self, prefix: &str) -> usize {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.settle_removals(None);
        let keys = self.keys(prefix);
        let removed = keys
            .iter()
            .filter(|key| self.remove_unlocked(key))
            .count();
        self.log(
            LogLevel::Info,
            "cleared_prefix",
            [json_str("prefix", prefix), json_kv("removed", json!(removed))],
        );
        removed
    }

    /// Remove `key` from every tier. A tier that refuses is remembered so
    /// its copy stays hidden and is deleted once the tier answers again.
    fn remove_unlocked(&self, key: &str) -> bool {
        let mut existed = false;
        for (index, store) in self.stores().enumerate() {
            if matches!(store.get(key), Ok(Some(_))) {
                existed = true;
            }
            if let Err(err) = store.remove(key) {
                self.lock_pending()
                    .entry(key.to_string())
                    .or_default()
                    .insert(index);
                self.log(
                    LogLevel::Warn,
                    "removal_pending",
                    [
                        json_str("key", key),
                        json_str("store", store.name()),
                        json_str("error", err.to_string()),
                    ],
                );
            }
        }
        existed
    }

    /// Retry outstanding removals, for `only` or for every key. Callers hold
    /// the write lock so a retry never races a fresh write.
    fn settle_removals(&self, only: Option<&str>) {
        let mut pending = self.lock_pending();
        if pending.is_empty() {
            return;
        }
        let stores: Vec<&Arc<dyn KeyValueStore>> = self.stores().collect();
        pending.retain(|key, tiers| {
            if only.is_some_and(|only| only != key) {
                return true;
            }
            tiers.retain(|&index| {
                stores
                    .get(index)
                    .is_some_and(|store| store.remove(key).is_err())
            });
            if tiers.is_empty() {
                self.log(
                    LogLevel::Info,
                    "pending_removal_applied",
                    [json_str("key", key.as_str())],
                );
            }
            !tiers.is_empty()
        });
    }

    fn pending_tiers(&self, key: &str) -> BTreeSet<usize> {
        self.lock_pending().get(key).cloned().unwrap_or_default()
    }

    /// A fresh write to tier `index` supersedes its stale copy.
    fn clear_pending(&self, key: &str, index: usize) {
        let mut pending = self.lock_pending();
        if let Some(tiers) = pending.get_mut(key) {
            tiers.remove(&index);
            if tiers.is_empty() {
                pending.remove(key);
            }
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, BTreeMap<String, BTreeSet<usize>>> {
        self.pending_removals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn stores(&self) -> impl Iterator<Item = &Arc<dyn KeyValueStore>> {
        self.tiers.iter().chain(std::iter::once(&self.fallback))
    }

    fn log<I>(&self, level: LogLevel, message: &str, fields: I)
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        emit(self.logger.as_ref(), level, LOG_TARGET, message, fields);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::MemorySink;
    use crate::metrics::SyncMetrics;
    use serde_json::json;

    struct BrokenStore;

    impl KeyValueStore for BrokenStore {
        fn name(&self) -> &str {
            "broken"
        }
        fn get(&self, _key: &str) -> Result<Option<String>, StorageError> {
            Err(StorageError::Unavailable {
                store: "broken".into(),
                reason: "disabled".into(),
            })
        }
        fn set(&self, _key: &str, _value: &str) -> Result<(), StorageError> {
            Err(StorageError::Unavailable {
                store: "broken".into(),
                reason: "disabled".into(),
            })
        }
        fn remove(&self, _key: &str) -> Result<(), StorageError> {
            Ok(())
        }
        fn keys(&self) -> Result<Vec<String>, StorageError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let adapter = PersistenceAdapter::in_memory();
        let envelope = StorageEnvelope::new(1, json!({ "x": 1 }));
        let outcome = adapter.save("panelState_p1", &envelope).unwrap();
        assert_eq!(
            outcome,
            SaveOutcome::Stored {
                store: "memory".into()
            }
        );
        assert_eq!(adapter.load::<Value>("panelState_p1"), Some(envelope));
        assert_eq!(adapter.load::<Value>("panelState_missing"), None);
    }

    #[test]
    fn stale_version_is_rejected_not_overwritten() {
        let adapter = PersistenceAdapter::in_memory();
        adapter
            .save("k", &StorageEnvelope::new(5, json!({ "v": 5 })))
            .unwrap();
        let err = adapter
            .save("k", &StorageEnvelope::new(3, json!({ "v": 3 })))
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::StaleVersion {
                attempted: 3,
                current: 5,
                ..
            }
        ));
        let stored = adapter.load::<Value>("k").unwrap();
        assert_eq!(stored.version, 5);
        assert_eq!(stored.data, json!({ "v": 5 }));
    }

    #[test]
    fn identical_resave_is_unchanged_but_same_version_conflict_fails() {
        let adapter = PersistenceAdapter::in_memory();
        let envelope = StorageEnvelope::new(2, json!({ "a": true }));
        adapter.save("k", &envelope).unwrap();
        assert_eq!(adapter.save("k", &envelope).unwrap(), SaveOutcome::Unchanged);
        assert!(
            adapter
                .save("k", &StorageEnvelope::new(2, json!({ "a": false })))
                .is_err()
        );
    }

    #[test]
    fn quota_failure_falls_back_to_secondary() {
        let metrics = SyncMetrics::shared();
        let primary = Arc::new(MemoryStore::new("primary").with_quota(16));
        let secondary = Arc::new(MemoryStore::new("secondary"));
        let adapter = PersistenceAdapter::new(primary.clone())
            .with_secondary(secondary.clone())
            .with_metrics(Some(metrics.clone()));

        let envelope = StorageEnvelope::new(1, json!({ "propertyType": "Residential" }));
        let outcome = adapter.save("activeFilters", &envelope).unwrap();

        assert_eq!(
            outcome,
            SaveOutcome::Fallback {
                store: "secondary".into()
            }
        );
        assert!(primary.is_empty());
        assert_eq!(adapter.load::<Value>("activeFilters"), Some(envelope));
        assert_eq!(metrics.lock().unwrap().snapshot(Default::default()).storage_fallbacks, 1);
    }

    #[test]
    fn all_tiers_failing_degrades_to_memory() {
        let sink = Arc::new(MemorySink::new());
        let adapter = PersistenceAdapter::new(Arc::new(BrokenStore))
            .with_logger(Some(Logger::from_arc(sink.clone())));

        let envelope = StorageEnvelope::new(1, json!([1, 2, 3]));
        let outcome = adapter.save("k", &envelope).unwrap();
        assert!(outcome.is_degraded());
        assert!(!outcome.is_durable());
        assert_eq!(adapter.load::<Value>("k"), Some(envelope));
        assert!(sink.find("save_degraded").is_some());
        assert!(sink.find("store_read_failed").is_some());
    }

    #[test]
    fn corrupt_primary_entry_is_skipped() {
        let primary = Arc::new(MemoryStore::new("primary"));
        let secondary = Arc::new(MemoryStore::new("secondary"));
        let adapter =
            PersistenceAdapter::new(primary.clone()).with_secondary(secondary.clone());

        primary.insert_raw("k", "{ not json");
        let envelope = StorageEnvelope::new(4, json!({ "ok": true }));
        secondary.insert_raw("k", serde_json::to_string(&envelope).unwrap());

        assert_eq!(adapter.load::<Value>("k"), Some(envelope));
    }

    #[test]
    fn schema_mismatch_counts_as_absent() {
        #[derive(Debug, serde::Deserialize)]
        #[allow(dead_code)]
        struct Strict {
            zoom: u8,
        }
        let adapter = PersistenceAdapter::in_memory();
        adapter
            .save("k", &StorageEnvelope::new(1, json!({ "zoom": "far" })))
            .unwrap();
        assert!(adapter.load::<Strict>("k").is_none());
    }

    #[test]
    fn newest_tier_wins_after_primary_recovers() {
        let primary = Arc::new(MemoryStore::new("primary"));
        let secondary = Arc::new(MemoryStore::new("secondary"));
        let adapter =
            PersistenceAdapter::new(primary.clone()).with_secondary(secondary.clone());

        adapter.save("k", &StorageEnvelope::new(1, json!("old"))).unwrap();
        primary.set_available(false);
        adapter.save("k", &StorageEnvelope::new(2, json!("new"))).unwrap();
        primary.set_available(true);

        let loaded = adapter.load::<Value>("k").unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.data, json!("new"));
    }

    #[test]
    fn removal_during_outage_is_not_resurrected() {
        let sink = Arc::new(MemorySink::new());
        let primary = Arc::new(MemoryStore::new("primary"));
        let secondary = Arc::new(MemoryStore::new("secondary"));
        let adapter = PersistenceAdapter::new(primary.clone())
            .with_secondary(secondary.clone())
            .with_logger(Some(Logger::from_arc(sink.clone())));

        adapter.save("k", &StorageEnvelope::new(3, json!("old"))).unwrap();
        primary.set_available(false);
        adapter.remove("k");
        assert!(sink.find("removal_pending").is_some());
        assert_eq!(
            adapter.save("k", &StorageEnvelope::new(0, json!("reset"))).unwrap(),
            SaveOutcome::Fallback {
                store: "secondary".into()
            }
        );

        primary.set_available(true);
        let loaded = adapter.load::<Value>("k").unwrap();
        assert_eq!(loaded.version, 0);
        assert_eq!(loaded.data, json!("reset"));
        assert_eq!(adapter.keys(""), vec!["k".to_string()]);

        let outcome = adapter.save("k", &StorageEnvelope::new(1, json!("next"))).unwrap();
        assert_eq!(
            outcome,
            SaveOutcome::Stored {
                store: "primary".into()
            }
        );
        assert!(sink.find("pending_removal_applied").is_some());
        assert_eq!(adapter.load::<Value>("k").unwrap().data, json!("next"));
    }

    #[test]
    fn pending_removal_hides_key_from_listings() {
        let primary = Arc::new(MemoryStore::new("primary"));
        let adapter = PersistenceAdapter::new(primary.clone());

        adapter
            .save("panelState_a", &StorageEnvelope::new(2, json!(1)))
            .unwrap();
        primary.set_available(false);
        adapter.remove("panelState_a");
        primary.set_available(true);

        assert!(adapter.keys("panelState_").is_empty());
        assert!(adapter.load::<Value>("panelState_a").is_none());
        assert_eq!(adapter.clear_all("panelState_"), 0);
        assert!(primary.is_empty());
    }

    #[test]
    fn bulk_operations_respect_prefix() {
        let adapter = PersistenceAdapter::in_memory();
        adapter
            .save("panelState_a", &StorageEnvelope::new(1, json!(1)))
            .unwrap();
        adapter
            .save("panelState_b", &StorageEnvelope::new(1, json!(2)))
            .unwrap();
        adapter
            .save("activeFilters", &StorageEnvelope::new(1, json!({})))
            .unwrap();

        let all = adapter.load_all::<Value>("panelState_");
        assert_eq!(
            all.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(),
            vec!["panelState_a", "panelState_b"]
        );

        assert_eq!(adapter.clear_all("panelState_"), 2);
        assert!(adapter.load_all::<Value>("panelState_").is_empty());
        assert!(adapter.load::<Value>("activeFilters").is_some());
        assert!(!adapter.remove("panelState_a"));
        assert!(adapter.remove("activeFilters"));
    }
}
