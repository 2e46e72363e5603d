use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::bus::{EventBus, OutgoingEvent, PanelId};
use crate::error::{PanelStateError, StorageError};
use crate::logging::{LogLevel, Logger, emit, json_kv, json_str};
use crate::metrics::{self, SharedMetrics};
use crate::storage::{
    PANEL_STATE_PREFIX, PersistenceAdapter, SaveOutcome, StorageEnvelope, panel_state_key,
};

use super::merge::{fill_defaults, resolve_conflict, shallow_patch};

const LOG_TARGET: &str = "panel_sync::panel_state";
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Merged in-memory view of a panel's persisted state.
#[derive(Debug, Clone, PartialEq)]
pub struct PanelState<T> {
    pub panel_id: PanelId,
    pub version: u32,
    pub updated_at: DateTime<Utc>,
    pub data: T,
    /// Where the write that produced this state landed; `None` for loads.
    pub outcome: Option<SaveOutcome>,
}

impl<T> PanelState<T> {
    /// The last write survives only in process memory.
    pub fn is_degraded(&self) -> bool {
        self.outcome.as_ref().is_some_and(SaveOutcome::is_degraded)
    }
}

/// How `PanelStateStore::update` derives the next state.
pub enum StateUpdate<T> {
    /// Shallow merge of the given top-level fields.
    Patch(Value),
    /// Replace the state outright.
    Replace(T),
    /// Compute the next state from the previous one. May run more than once
    /// when a concurrent writer forces a retry.
    With(Box<dyn Fn(T) -> T + Send + Sync>),
}

impl<T> StateUpdate<T> {
    pub fn patch(fields: Value) -> Self {
        StateUpdate::Patch(fields)
    }

    pub fn with<F>(f: F) -> Self
    where
        F: Fn(T) -> T + Send + Sync + 'static,
    {
        StateUpdate::With(Box::new(f))
    }
}

impl<T> fmt::Debug for StateUpdate<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateUpdate::Patch(fields) => f.debug_tuple("Patch").field(fields).finish(),
            StateUpdate::Replace(_) => f.write_str("Replace(..)"),
            StateUpdate::With(_) => f.write_str("With(..)"),
        }
    }
}

enum Op<T> {
    Patch(serde_json::Map<String, Value>),
    Replace(Value),
    With(Box<dyn Fn(T) -> T + Send + Sync>),
}

/// Sole writer of `panelState_<panelId>` keys.
///
/// Keeps the envelope each panel last saw; an update that finds a newer
/// stored version first reconciles with it, then applies its own change on
/// top. Updates are serialized per store, so calls apply in call order.
pub struct PanelStateStore {
    adapter: Arc<PersistenceAdapter>,
    cache: Mutex<HashMap<PanelId, StorageEnvelope<Value>>>,
    update_lock: Mutex<()>,
    bus: Option<EventBus>,
    logger: Option<Logger>,
    metrics: Option<SharedMetrics>,
    max_attempts: u32,
}

impl PanelStateStore {
    pub fn new(adapter: Arc<PersistenceAdapter>) -> Self {
        Self {
            adapter,
            cache: Mutex::new(HashMap::new()),
            update_lock: Mutex::new(()),
            bus: None,
            logger: None,
            metrics: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Announce every committed update on `bus` as `panel_state_changed`.
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
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

    /// Attempts allowed when saves keep losing version races.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn adapter(&self) -> &Arc<PersistenceAdapter> {
        &self.adapter
    }

    pub fn load<T>(&self, panel_id: &str, initial: T) -> T
    where
        T: Serialize + DeserializeOwned,
    {
        self.load_state(panel_id, initial).data
    }

    /// Stored state with `initial` filling the gaps, plus its version.
    pub fn load_state<T>(&self, panel_id: &str, initial: T) -> PanelState<T>
    where
        T: Serialize + DeserializeOwned,
    {
        let defaults = match serde_json::to_value(&initial) {
            Ok(value) => value,
            Err(err) => {
                self.log(
                    LogLevel::Error,
                    "defaults_not_serializable",
                    [json_str("panel", panel_id), json_str("error", err.to_string())],
                );
                return PanelState {
                    panel_id: panel_id.to_string(),
                    version: 0,
                    updated_at: Utc::now(),
                    data: initial,
                    outcome: None,
                };
            }
        };

        let Some(stored) = self.adapter.load::<Value>(&panel_state_key(panel_id)) else {
            let envelope = StorageEnvelope::initial(defaults);
            let updated_at = envelope.updated_at;
            self.cache_put(panel_id, envelope);
            return PanelState {
                panel_id: panel_id.to_string(),
                version: 0,
                updated_at,
                data: initial,
                outcome: None,
            };
        };

        let merged = fill_defaults(&defaults, &stored.data);
        let (data, cached) = match serde_json::from_value::<T>(merged.clone()) {
            Ok(data) => (data, merged),
            Err(err) => {
                self.log(
                    LogLevel::Warn,
                    "state_schema_mismatch",
                    [
                        json_str("panel", panel_id),
                        json_kv("version", json!(stored.version)),
                        json_str("error", err.to_string()),
                    ],
                );
                (initial, defaults)
            }
        };

        let state = PanelState {
            panel_id: panel_id.to_string(),
            version: stored.version,
            updated_at: stored.updated_at,
            data,
            outcome: None,
        };
        self.cache_put(
            panel_id,
            StorageEnvelope {
                version: stored.version,
                updated_at: stored.updated_at,
                data: cached,
            },
        );
        state
    }

    /// Compute, version and persist the next state for `panel_id`.
    pub fn update<T>(
        &self,
        panel_id: &str,
        update: StateUpdate<T>,
    ) -> Result<PanelState<T>, PanelStateError>
    where
        T: Serialize + DeserializeOwned,
    {
        let op = match update {
            StateUpdate::Patch(Value::Object(fields)) => Op::Patch(fields),
            StateUpdate::Patch(_) => return Err(PanelStateError::NotAnObject(panel_id.to_string())),
            StateUpdate::Replace(next) => Op::Replace(serde_json::to_value(next)?),
            StateUpdate::With(f) => Op::With(f),
        };

        let key = panel_state_key(panel_id);
        let committed = {
            let _guard = self.update_lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.commit(panel_id, &key, &op)?
        };

        if let Some(bus) = self.bus.as_ref() {
            bus.broadcast(OutgoingEvent::panel_state_changed(
                panel_id,
                committed.version,
            ));
        }
        Ok(committed)
    }

    pub fn patch<T>(&self, panel_id: &str, fields: Value) -> Result<PanelState<T>, PanelStateError>
    where
        T: Serialize + DeserializeOwned,
    {
        self.update(panel_id, StateUpdate::Patch(fields))
    }

    pub fn update_with<T, F>(&self, panel_id: &str, f: F) -> Result<PanelState<T>, PanelStateError>
    where
        T: Serialize + DeserializeOwned,
        F: Fn(T) -> T + Send + Sync + 'static,
    {
        self.update(panel_id, StateUpdate::with(f))
    }

    /// Drop whatever is stored and persist `initial` at version 0.
    pub fn reset<T>(&self, panel_id: &str, initial: T) -> T
    where
        T: Serialize + DeserializeOwned,
    {
        let key = panel_state_key(panel_id);
        {
            let _guard = self.update_lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.adapter.remove(&key);
            self.cache_lock().remove(panel_id);

            match serde_json::to_value(&initial) {
                Ok(value) => {
                    let envelope = StorageEnvelope::initial(value);
                    if let Err(err) = self.adapter.save(&key, &envelope) {
                        self.log(
                            LogLevel::Warn,
                            "reset_save_failed",
                            [json_str("panel", panel_id), json_str("error", err.to_string())],
                        );
                    }
                    self.cache_put(panel_id, envelope);
                }
                Err(err) => self.log(
                    LogLevel::Error,
                    "defaults_not_serializable",
                    [json_str("panel", panel_id), json_str("error", err.to_string())],
                ),
            }
            self.log(LogLevel::Info, "state_reset", [json_str("panel", panel_id)]);
        }

        if let Some(bus) = self.bus.as_ref() {
            bus.broadcast(OutgoingEvent::panel_state_changed(panel_id, 0));
        }
        initial
    }

    /// Version the panel's local view is based on, falling back to storage.
    pub fn version(&self, panel_id: &str) -> Option<u32> {
        if let Some(envelope) = self.cache_lock().get(panel_id) {
            return Some(envelope.version);
        }
        self.adapter
            .load::<Value>(&panel_state_key(panel_id))
            .map(|envelope| envelope.version)
    }

    /// Ids of every panel with persisted state.
    pub fn panel_ids(&self) -> Vec<PanelId> {
        self.adapter
            .keys(PANEL_STATE_PREFIX)
            .into_iter()
            .filter_map(|key| key.strip_prefix(PANEL_STATE_PREFIX).map(str::to_string))
            .collect()
    }

    /// Forget the cached view of a panel (on unmount). Storage is untouched.
    pub fn forget(&self, panel_id: &str) {
        self.cache_lock().remove(panel_id);
    }

    /// Remove every persisted panel state.
    pub fn clear_all(&self) -> usize {
        let _guard = self.update_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.cache_lock().clear();
        self.adapter.clear_all(PANEL_STATE_PREFIX)
    }

    fn commit<T>(
        &self,
        panel_id: &str,
        key: &str,
        op: &Op<T>,
    ) -> Result<PanelState<T>, PanelStateError>
    where
        T: Serialize + DeserializeOwned,
    {
        for attempt in 1..=self.max_attempts {
            let base = self.base_envelope(panel_id, key);
            let (next_value, next_data) = apply(panel_id, op, &base.data)?;
            let envelope = base.next(next_value);

            match self.adapter.save(key, &envelope) {
                Ok(outcome) => {
                    self.log(
                        LogLevel::Debug,
                        "state_updated",
                        [
                            json_str("panel", panel_id),
                            json_kv("version", json!(envelope.version)),
                            json_str("outcome", format!("{outcome:?}")),
                        ],
                    );
                    let state = PanelState {
                        panel_id: panel_id.to_string(),
                        version: envelope.version,
                        updated_at: envelope.updated_at,
                        data: next_data,
                        outcome: Some(outcome),
                    };
                    self.cache_put(panel_id, envelope);
                    return Ok(state);
                }
                Err(StorageError::StaleVersion { current, .. }) => {
                    self.log(
                        LogLevel::Debug,
                        "update_lost_race",
                        [
                            json_str("panel", panel_id),
                            json_kv("attempt", json!(attempt)),
                            json_kv("current", json!(current)),
                        ],
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(PanelStateError::Conflict {
            panel_id: panel_id.to_string(),
            attempts: self.max_attempts,
        })
    }

    /// The envelope an update should build on: the local view, reconciled
    /// with storage when another writer got there first.
    fn base_envelope(&self, panel_id: &str, key: &str) -> StorageEnvelope<Value> {
        let local = self.cache_lock().get(panel_id).cloned();
        let remote = self.adapter.load::<Value>(key);

        match (local, remote) {
            (Some(local), Some(remote)) if remote.version > local.version => {
                let resolution = resolve_conflict(&local, &remote);
                metrics::record(self.metrics.as_ref(), |m| m.record_conflict_resolved());
                self.log(
                    LogLevel::Debug,
                    "conflict_resolved",
                    [
                        json_str("panel", panel_id),
                        json_kv("local_version", json!(local.version)),
                        json_kv("remote_version", json!(remote.version)),
                        json_kv("ambiguous", json!(resolution.ambiguous)),
                    ],
                );
                resolution.envelope
            }
            (Some(local), _) => local,
            (None, Some(remote)) => remote,
            (None, None) => StorageEnvelope::initial(Value::Null),
        }
    }

    fn cache_lock(&self) -> MutexGuard<'_, HashMap<PanelId, StorageEnvelope<Value>>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cache_put(&self, panel_id: &str, envelope: StorageEnvelope<Value>) {
        self.cache_lock().insert(panel_id.to_string(), envelope);
    }

    fn log<I>(&self, level: LogLevel, message: &str, fields: I)
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        emit(self.logger.as_ref(), level, LOG_TARGET, message, fields);
    }
}

fn apply<T>(panel_id: &str, op: &Op<T>, base: &Value) -> Result<(Value, T), PanelStateError>
where
    T: Serialize + DeserializeOwned,
{
    match op {
        Op::Patch(fields) => {
            let value = shallow_patch(base, fields)
                .ok_or_else(|| PanelStateError::NotAnObject(panel_id.to_string()))?;
            let data = serde_json::from_value(value.clone())?;
            Ok((value, data))
        }
        Op::Replace(value) => {
            let data = serde_json::from_value(value.clone())?;
            Ok((value.clone(), data))
        }
        Op::With(f) => {
            let previous = if base.is_null() {
                serde_json::from_value(Value::Object(Default::default()))?
            } else {
                serde_json::from_value(base.clone())?
            };
            let data = f(previous);
            let value = serde_json::to_value(&data)?;
            Ok((value, data))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{EventFilter, EventPayload, PANEL_STATE_CHANGED_EVENT};
    use crate::storage::MemoryStore;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Point {
        x: i32,
        y: i32,
    }

    fn store() -> PanelStateStore {
        PanelStateStore::new(Arc::new(PersistenceAdapter::in_memory()))
    }

    #[test]
    fn load_without_stored_state_returns_initial_at_version_zero() {
        let store = store();
        let state = store.load_state("p1", Point { x: 1, y: 2 });
        assert_eq!(state.data, Point { x: 1, y: 2 });
        assert_eq!(state.version, 0);
        assert_eq!(store.version("p1"), Some(0));
    }

    #[test]
    fn update_then_load_fills_gaps_from_defaults() {
        let store = store();
        let updated: PanelState<Value> = store.patch("p1", json!({ "x": 5 })).unwrap();
        assert_eq!(updated.data, json!({ "x": 5 }));

        let loaded = store.load("p1", json!({ "x": 1, "y": 2 }));
        assert_eq!(loaded, json!({ "x": 5, "y": 2 }));
    }

    #[test]
    fn version_increments_by_one_per_update() {
        let store = store();
        store.load("p1", Point { x: 0, y: 0 });
        for expected in 1..=3 {
            let state = store
                .update_with("p1", |p: Point| Point { x: p.x + 1, ..p })
                .unwrap();
            assert_eq!(state.version, expected);
            assert_eq!(state.data.x, expected as i32);
        }

        let reloaded = store.load_state("p1", Point { x: 0, y: 0 });
        assert_eq!(reloaded.version, 3);
        assert_eq!(reloaded.data, Point { x: 3, y: 0 });
    }

    #[test]
    fn persisted_envelope_uses_panel_state_key() {
        let primary = Arc::new(MemoryStore::new("primary"));
        let store = PanelStateStore::new(Arc::new(PersistenceAdapter::new(primary.clone())));
        store
            .update("map", StateUpdate::Replace(Point { x: 3, y: 4 }))
            .unwrap();

        use crate::storage::KeyValueStore;
        let raw = primary.get("panelState_map").unwrap().unwrap();
        let parsed: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["version"], json!("v1"));
        assert_eq!(parsed["data"], json!({ "x": 3, "y": 4 }));
        assert!(parsed["updatedAt"].is_string());
    }

    #[test]
    fn reset_persists_initial_at_version_zero() {
        let store = store();
        store.patch::<Value>("p1", json!({ "x": 9 })).unwrap();
        store.patch::<Value>("p1", json!({ "x": 10 })).unwrap();

        let initial = store.reset("p1", Point { x: 1, y: 1 });
        assert_eq!(initial, Point { x: 1, y: 1 });
        assert_eq!(store.version("p1"), Some(0));

        let stored = store
            .adapter()
            .load::<Point>(&panel_state_key("p1"))
            .unwrap();
        assert_eq!(stored.version, 0);
        assert_eq!(stored.data, Point { x: 1, y: 1 });

        let next = store.patch::<Point>("p1", json!({ "y": 7 })).unwrap();
        assert_eq!(next.version, 1);
        assert_eq!(next.data, Point { x: 1, y: 7 });
    }

    #[test]
    fn reset_during_outage_survives_primary_recovery() {
        let primary = Arc::new(MemoryStore::new("primary"));
        let secondary = Arc::new(MemoryStore::new("secondary"));
        let adapter = Arc::new(
            PersistenceAdapter::new(primary.clone()).with_secondary(secondary.clone()),
        );
        let store = PanelStateStore::new(Arc::clone(&adapter));
        for x in 1..=5 {
            store.patch::<Value>("p", json!({ "x": x })).unwrap();
        }

        primary.set_available(false);
        store.reset("p", json!({ "x": -1 }));
        primary.set_available(true);

        let reopened = PanelStateStore::new(Arc::clone(&adapter));
        let state = reopened.load_state("p", json!({ "x": 0 }));
        assert_eq!(state.version, 0);
        assert_eq!(state.data, json!({ "x": -1 }));

        let next = reopened.patch::<Value>("p", json!({ "x": 2 })).unwrap();
        assert_eq!(next.version, 1);
        assert_eq!(
            next.outcome,
            Some(SaveOutcome::Stored {
                store: "primary".into()
            })
        );
    }

    #[test]
    fn degraded_write_is_reported_to_the_caller() {
        let primary = Arc::new(MemoryStore::new("primary"));
        primary.set_available(false);
        let offline = PanelStateStore::new(Arc::new(PersistenceAdapter::new(primary)));

        let state = offline.patch::<Value>("p", json!({ "x": 1 })).unwrap();
        assert_eq!(state.outcome, Some(SaveOutcome::Degraded));
        assert!(state.is_degraded());
        assert_eq!(state.version, 1);

        let healthy = store();
        let state = healthy.patch::<Value>("p", json!({ "x": 1 })).unwrap();
        assert!(!state.is_degraded());
        assert_eq!(healthy.load_state("p", json!({})).outcome, None);
    }

    #[test]
    fn racing_writer_is_merged_before_local_update() {
        let adapter = Arc::new(PersistenceAdapter::in_memory());
        let tab_a = PanelStateStore::new(Arc::clone(&adapter));
        let tab_b = PanelStateStore::new(Arc::clone(&adapter));

        let defaults = json!({ "x": 1, "y": 2, "columns": { "price": true } });
        tab_a.load("list", defaults.clone());
        tab_b.load("list", defaults);

        tab_b
            .patch::<Value>("list", json!({ "x": 5, "columns": { "price": true, "beds": true } }))
            .unwrap();
        let merged = tab_a.patch::<Value>("list", json!({ "y": 9 })).unwrap();

        assert_eq!(merged.version, 2);
        assert_eq!(
            merged.data,
            json!({ "x": 5, "y": 9, "columns": { "price": true, "beds": true } })
        );
    }

    #[test]
    fn schema_mismatch_falls_back_to_initial() {
        let store = store();
        store.patch::<Value>("p1", json!({ "x": "not a number" })).unwrap();
        let state = store.load_state("p1", Point { x: 1, y: 2 });
        assert_eq!(state.data, Point { x: 1, y: 2 });
        assert_eq!(state.version, 1);
    }

    #[test]
    fn patch_must_be_an_object() {
        let store = store();
        let err = store.patch::<Value>("p1", json!(42)).unwrap_err();
        assert!(matches!(err, PanelStateError::NotAnObject(_)));
    }

    #[test]
    fn updates_are_announced_on_the_bus() {
        let bus = EventBus::new();
        let store = store().with_bus(bus.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = bus.subscribe(EventFilter::event_type(PANEL_STATE_CHANGED_EVENT), move |event| {
            if let EventPayload::PanelStateChanged { panel_id, version } = &event.payload {
                sink.lock().unwrap().push((panel_id.clone(), *version));
            }
            Ok(())
        });

        store.patch::<Value>("map", json!({ "zoom": 3 })).unwrap();
        store.reset("map", json!({}));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![("map".to_string(), 1), ("map".to_string(), 0)]
        );
    }

    #[test]
    fn handler_may_update_state_from_inside_a_broadcast() {
        let bus = EventBus::new();
        let store = Arc::new(store().with_bus(bus.clone()));
        let writer = Arc::clone(&store);
        let _sub = bus.subscribe_type("filter", move |_| {
            writer
                .patch::<Value>("list", json!({ "page": 1 }))
                .map(|_| ())
                .map_err(|err| crate::error::SubscriberError::failed(err.to_string()))
        });

        bus.broadcast(OutgoingEvent::filter(Default::default(), "filters"));
        assert_eq!(store.version("list"), Some(1));
    }

    #[test]
    fn clear_all_wipes_every_panel() {
        let store = store();
        store.patch::<Value>("a", json!({ "v": 1 })).unwrap();
        store.patch::<Value>("b", json!({ "v": 1 })).unwrap();
        assert_eq!(store.panel_ids(), vec!["a".to_string(), "b".to_string()]);

        assert_eq!(store.clear_all(), 2);
        assert!(store.panel_ids().is_empty());
        assert_eq!(store.version("a"), None);
    }
}
