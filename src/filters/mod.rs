//! Global filter state shared by every panel.
//!
//! [`FilterStore`] is the only writer of the `activeFilters` and
//! `filterPresets` keys; each change is persisted and then announced as a
//! `filter` event.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::bus::{EventBus, FilterSet, OutgoingEvent, PanelId};
use crate::error::{StorageError, SyncError};
use crate::logging::{LogLevel, Logger, emit, json_kv, json_str};
use crate::storage::{
    ACTIVE_FILTERS_KEY, FILTER_PRESETS_KEY, PersistenceAdapter, StorageEnvelope,
};

const LOG_TARGET: &str = "panel_sync::filters";
pub const FILTER_SOURCE: &str = "filters";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterPreset {
    pub name: String,
    pub filters: FilterSet,
    pub saved_at: DateTime<Utc>,
}

type Presets = BTreeMap<String, FilterPreset>;

pub struct FilterStore {
    adapter: Arc<PersistenceAdapter>,
    bus: EventBus,
    source: PanelId,
    active: Mutex<StorageEnvelope<FilterSet>>,
    presets: Mutex<StorageEnvelope<Presets>>,
    logger: Option<Logger>,
}

impl FilterStore {
    pub fn new(adapter: Arc<PersistenceAdapter>, bus: EventBus) -> Self {
        let active = load_or_default(&adapter, ACTIVE_FILTERS_KEY);
        let presets = load_or_default(&adapter, FILTER_PRESETS_KEY);
        Self {
            adapter,
            bus,
            source: FILTER_SOURCE.to_string(),
            active: Mutex::new(active),
            presets: Mutex::new(presets),
            logger: None,
        }
    }

    /// Panel id stamped on outgoing `filter` events.
    pub fn with_source(mut self, source: impl Into<PanelId>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_logger(mut self, logger: Option<Logger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn active_filters(&self) -> FilterSet {
        lock(&self.active).data.clone()
    }

    pub fn version(&self) -> u32 {
        lock(&self.active).version
    }

    /// Set one criterion. A `null` value removes it.
    pub fn set_filter(&self, field: impl Into<String>, value: impl Into<Value>) -> FilterSet {
        let field = field.into();
        let value = value.into();
        self.modify(move |filters| {
            if value.is_null() {
                filters.remove(&field);
            } else {
                filters.insert(field, value);
            }
        })
    }

    pub fn remove_filter(&self, field: &str) -> FilterSet {
        self.modify(|filters| {
            filters.remove(field);
        })
    }

    pub fn set_filters(&self, filters: FilterSet) -> FilterSet {
        self.modify(move |current| *current = filters)
    }

    pub fn clear_filters(&self) -> FilterSet {
        self.modify(|filters| filters.clear())
    }

    /// Re-announce the active filters without changing them.
    pub fn apply(&self) -> u64 {
        self.bus
            .broadcast(OutgoingEvent::filter(self.active_filters(), self.source.clone()))
    }

    pub fn presets(&self) -> Vec<FilterPreset> {
        lock(&self.presets).data.values().cloned().collect()
    }

    /// Store the active filters under `name`, replacing any preset of that name.
    pub fn save_preset(&self, name: impl Into<String>) -> FilterPreset {
        let preset = FilterPreset {
            name: name.into(),
            filters: self.active_filters(),
            saved_at: Utc::now(),
        };
        let mut guard = lock(&self.presets);
        let mut presets = guard.data.clone();
        presets.insert(preset.name.clone(), preset.clone());
        self.persist(FILTER_PRESETS_KEY, &mut *guard, presets);
        preset
    }

    /// Activate a preset's filters and announce them.
    pub fn load_preset(&self, name: &str) -> Result<FilterSet, SyncError> {
        let preset = lock(&self.presets)
            .data
            .get(name)
            .cloned()
            .ok_or_else(|| SyncError::PresetNotFound(name.to_string()))?;
        Ok(self.set_filters(preset.filters))
    }

    pub fn delete_preset(&self, name: &str) -> bool {
        let mut guard = lock(&self.presets);
        if !guard.data.contains_key(name) {
            return false;
        }
        let mut presets = guard.data.clone();
        presets.remove(name);
        self.persist(FILTER_PRESETS_KEY, &mut *guard, presets);
        true
    }

    fn modify(&self, change: impl FnOnce(&mut FilterSet)) -> FilterSet {
        let filters = {
            let mut guard = lock(&self.active);
            let mut filters = guard.data.clone();
            change(&mut filters);
            if filters == guard.data {
                return filters;
            }
            self.persist(ACTIVE_FILTERS_KEY, &mut *guard, filters.clone());
            filters
        };
        self.bus
            .broadcast(OutgoingEvent::filter(filters.clone(), self.source.clone()));
        filters
    }

    /// Global filters are last-writer-wins: a stale rejection re-versions the
    /// write past whatever another writer stored.
    fn persist<T: Serialize>(&self, key: &str, slot: &mut StorageEnvelope<T>, data: T) {
        let mut next = slot.next(data);
        let outcome = match self.adapter.save(key, &next) {
            Err(StorageError::StaleVersion { current, .. }) => {
                next.version = current.saturating_add(1);
                self.log(
                    LogLevel::Debug,
                    "filters_reversioned",
                    [json_str("key", key), json_kv("version", json!(next.version))],
                );
                self.adapter.save(key, &next)
            }
            other => other,
        };
        match outcome {
            Ok(outcome) => self.log(
                LogLevel::Debug,
                "filters_saved",
                [
                    json_str("key", key),
                    json_kv("version", json!(next.version)),
                    json_str("outcome", format!("{outcome:?}")),
                ],
            ),
            Err(err) => self.log(
                LogLevel::Warn,
                "filters_save_failed",
                [json_str("key", key), json_str("error", err.to_string())],
            ),
        }
        *slot = next;
    }

    fn log<I>(&self, level: LogLevel, message: &str, fields: I)
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        emit(self.logger.as_ref(), level, LOG_TARGET, message, fields);
    }
}

fn load_or_default<T>(adapter: &PersistenceAdapter, key: &str) -> StorageEnvelope<T>
where
    T: DeserializeOwned + Default,
{
    adapter
        .load(key)
        .unwrap_or_else(|| StorageEnvelope::initial(T::default()))
}

fn lock<T>(slot: &Mutex<T>) -> MutexGuard<'_, T> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{EventFilter, FILTER_EVENT};

    fn capture(bus: &EventBus) -> (Arc<Mutex<Vec<FilterSet>>>, crate::bus::Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = bus.subscribe(EventFilter::event_type(FILTER_EVENT), move |event| {
            if let Some(filters) = event.payload.filters() {
                sink.lock().unwrap().push(filters.clone());
            }
            Ok(())
        });
        (seen, sub)
    }

    #[test]
    fn setting_a_filter_persists_and_broadcasts() {
        let adapter = Arc::new(PersistenceAdapter::in_memory());
        let bus = EventBus::new();
        let (seen, _sub) = capture(&bus);
        let store = FilterStore::new(Arc::clone(&adapter), bus.clone());

        store.set_filter("propertyType", "Residential");
        store.set_filter("minPrice", 250_000);

        let stored = adapter.load::<FilterSet>(ACTIVE_FILTERS_KEY).unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.data.get("propertyType"), Some(&json!("Residential")));
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(seen.lock().unwrap()[1].len(), 2);
    }

    #[test]
    fn unchanged_filters_are_not_rebroadcast() {
        let bus = EventBus::new();
        let (seen, _sub) = capture(&bus);
        let store = FilterStore::new(Arc::new(PersistenceAdapter::in_memory()), bus.clone());

        store.set_filter("county", "Travis");
        store.set_filter("county", "Travis");
        store.remove_filter("missing");
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(store.version(), 1);

        store.set_filter("county", Value::Null);
        assert!(store.active_filters().is_empty());
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn filters_survive_reload() {
        let adapter = Arc::new(PersistenceAdapter::in_memory());
        let bus = EventBus::new();
        {
            let store = FilterStore::new(Arc::clone(&adapter), bus.clone());
            store.set_filter("beds", 3);
            store.save_preset("family");
        }
        let reloaded = FilterStore::new(adapter, bus);
        assert_eq!(reloaded.active_filters().get("beds"), Some(&json!(3)));
        assert_eq!(reloaded.presets().len(), 1);
        assert_eq!(reloaded.version(), 1);
    }

    #[test]
    fn presets_round_trip_through_activation() {
        let bus = EventBus::new();
        let (seen, _sub) = capture(&bus);
        let store = FilterStore::new(Arc::new(PersistenceAdapter::in_memory()), bus.clone());

        store.set_filter("propertyType", "Commercial");
        let preset = store.save_preset("commercial");
        assert_eq!(preset.filters.len(), 1);

        store.clear_filters();
        assert!(store.active_filters().is_empty());

        let activated = store.load_preset("commercial").unwrap();
        assert_eq!(activated.get("propertyType"), Some(&json!("Commercial")));
        assert_eq!(seen.lock().unwrap().last(), Some(&activated));

        assert!(matches!(
            store.load_preset("nope"),
            Err(SyncError::PresetNotFound(_))
        ));
        assert!(store.delete_preset("commercial"));
        assert!(!store.delete_preset("commercial"));
        assert!(store.presets().is_empty());
    }

    #[test]
    fn second_writer_does_not_get_stuck_behind_newer_version() {
        let adapter = Arc::new(PersistenceAdapter::in_memory());
        let bus = EventBus::new();
        let tab_a = FilterStore::new(Arc::clone(&adapter), bus.clone());
        let tab_b = FilterStore::new(Arc::clone(&adapter), bus.clone());

        tab_a.set_filter("a", 1);
        tab_a.set_filter("a", 2);
        tab_b.set_filter("b", 1);

        let stored = adapter.load::<FilterSet>(ACTIVE_FILTERS_KEY).unwrap();
        assert_eq!(stored.version, 3);
        assert_eq!(stored.data.get("b"), Some(&json!(1)));
        assert_eq!(tab_b.version(), 3);
    }

    #[test]
    fn apply_rebroadcasts_current_filters() {
        let bus = EventBus::new();
        let (seen, _sub) = capture(&bus);
        let store = FilterStore::new(Arc::new(PersistenceAdapter::in_memory()), bus.clone())
            .with_source("filterPanel");
        store.apply();
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(seen.lock().unwrap()[0].is_empty());
    }
}
