use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{Value, json};

use crate::bus::{
    Event, EventBus, EventFilter, EventPayload, OutgoingEvent, PanelId, Subscription,
};
use crate::bus::{ENTITY_SELECTED_PREFIX, ENTITY_UPDATED_PREFIX};
use crate::error::{EntityLoadError, SubscriberError};
use crate::logging::{LogLevel, Logger, emit, json_kv, json_str};
use crate::metrics::{self, SharedMetrics};

use super::loader::EntityLoader;
use super::types::{Entity, EntityKind, EntityPatch};

const LOG_TARGET: &str = "panel_sync::entity";

/// Lifecycle of a sync manager: `Idle -> Loading -> Ready | Error`, back to
/// `Loading` on every fetch, `Disposed` once torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Idle,
    Loading,
    Ready,
    Error,
    Disposed,
}

#[derive(Debug, Clone)]
pub struct EntitySyncOptions {
    pub panel_id: PanelId,
    pub sync_types: Vec<EntityKind>,
    /// Apply remote selections immediately; otherwise park them in `incoming`.
    pub auto_sync: bool,
    pub logger: Option<Logger>,
    pub metrics: Option<SharedMetrics>,
}

impl EntitySyncOptions {
    pub fn new(panel_id: impl Into<PanelId>) -> Self {
        Self {
            panel_id: panel_id.into(),
            sync_types: Vec::new(),
            auto_sync: true,
            logger: None,
            metrics: None,
        }
    }

    pub fn sync_type(mut self, kind: EntityKind) -> Self {
        if !self.sync_types.contains(&kind) {
            self.sync_types.push(kind);
        }
        self
    }

    pub fn sync_types(mut self, kinds: impl IntoIterator<Item = EntityKind>) -> Self {
        for kind in kinds {
            self = self.sync_type(kind);
        }
        self
    }

    pub fn auto_sync(mut self, enabled: bool) -> Self {
        self.auto_sync = enabled;
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
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOptions {
    /// Do not announce the selection on the bus.
    pub silent: bool,
    /// Hit the loader even if the same entity is already loaded.
    pub force: bool,
}

impl FetchOptions {
    pub fn silent() -> Self {
        Self {
            silent: true,
            force: false,
        }
    }

    pub fn force() -> Self {
        Self {
            silent: false,
            force: true,
        }
    }
}

struct SyncState {
    status: SyncStatus,
    entity: Option<Arc<Entity>>,
    incoming: Option<Arc<Entity>>,
    error: Option<EntityLoadError>,
    request_seq: u64,
    last_request: Option<(String, EntityKind)>,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            status: SyncStatus::Idle,
            entity: None,
            incoming: None,
            error: None,
            request_seq: 0,
            last_request: None,
        }
    }
}

type SharedSyncState = Arc<Mutex<SyncState>>;

fn lock(state: &SharedSyncState) -> MutexGuard<'_, SyncState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

enum Fetched {
    Applied(Arc<Entity>),
    Superseded(Arc<Entity>),
    Failed,
}

/// Keeps one panel's selected entity synchronized with other panels.
///
/// Listens for `entity_selected_<type>` / `entity_updated_<type>` from every
/// other panel for its sync types, and announces its own selections and
/// edits. Received events are never re-broadcast.
pub struct EntitySyncManager<L> {
    panel_id: PanelId,
    sync_types: Vec<EntityKind>,
    loader: L,
    bus: EventBus,
    state: SharedSyncState,
    subscriptions: Mutex<Vec<Subscription>>,
    logger: Option<Logger>,
    metrics: Option<SharedMetrics>,
}

impl<L: EntityLoader> EntitySyncManager<L> {
    pub fn new(options: EntitySyncOptions, loader: L, bus: EventBus) -> Self {
        let EntitySyncOptions {
            panel_id,
            sync_types,
            auto_sync,
            logger,
            metrics,
        } = options;
        let state: SharedSyncState = Arc::new(Mutex::new(SyncState::default()));

        let subscriptions = sync_types
            .iter()
            .map(|kind| {
                let filter = EventFilter::event_types([
                    format!("{ENTITY_SELECTED_PREFIX}{}", kind.as_str()),
                    format!("{ENTITY_UPDATED_PREFIX}{}", kind.as_str()),
                ])
                .excluding_source(panel_id.clone());
                let handler_state = Arc::clone(&state);
                let handler_logger = logger.clone();
                let handler_panel = panel_id.clone();
                bus.subscribe(filter, move |event| {
                    receive(
                        &handler_state,
                        event,
                        auto_sync,
                        &handler_panel,
                        handler_logger.as_ref(),
                    )
                })
            })
            .collect();

        emit(
            logger.as_ref(),
            LogLevel::Debug,
            LOG_TARGET,
            "sync_manager_created",
            [
                json_str("panel", panel_id.clone()),
                json_kv(
                    "sync_types",
                    json!(sync_types.iter().map(EntityKind::as_str).collect::<Vec<_>>()),
                ),
                json_kv("auto_sync", json!(auto_sync)),
            ],
        );

        Self {
            panel_id,
            sync_types,
            loader,
            bus,
            state,
            subscriptions: Mutex::new(subscriptions),
            logger,
            metrics,
        }
    }

    pub fn panel_id(&self) -> &str {
        &self.panel_id
    }

    pub fn sync_types(&self) -> &[EntityKind] {
        &self.sync_types
    }

    pub fn status(&self) -> SyncStatus {
        lock(&self.state).status
    }

    pub fn is_loading(&self) -> bool {
        self.status() == SyncStatus::Loading
    }

    pub fn entity(&self) -> Option<Arc<Entity>> {
        lock(&self.state).entity.clone()
    }

    pub fn error(&self) -> Option<EntityLoadError> {
        lock(&self.state).error.clone()
    }

    /// Remote entity received while auto sync is off.
    pub fn incoming(&self) -> Option<Arc<Entity>> {
        lock(&self.state).incoming.clone()
    }

    /// Load an entity through the injected loader. Failures land in
    /// [`error`](Self::error) and yield `None`.
    pub async fn fetch_entity(
        &self,
        id: &str,
        kind: EntityKind,
        opts: FetchOptions,
    ) -> Option<Arc<Entity>> {
        match self.fetch(id, kind, opts).await {
            Fetched::Applied(entity) | Fetched::Superseded(entity) => Some(entity),
            Fetched::Failed => None,
        }
    }

    /// Fetch, then announce the selection unless `opts.silent`.
    pub async fn select_entity(
        &self,
        id: &str,
        kind: EntityKind,
        opts: FetchOptions,
    ) -> Option<Arc<Entity>> {
        match self.fetch(id, kind, opts).await {
            Fetched::Applied(entity) => {
                if !opts.silent {
                    self.bus.broadcast(OutgoingEvent::entity_selected(
                        Arc::clone(&entity),
                        self.panel_id.clone(),
                    ));
                }
                Some(entity)
            }
            Fetched::Superseded(entity) => Some(entity),
            Fetched::Failed => None,
        }
    }

    /// Repeat the most recent fetch, bypassing the already-loaded shortcut.
    pub async fn retry(&self) -> Option<Arc<Entity>> {
        let last = lock(&self.state).last_request.clone();
        let (id, kind) = last?;
        self.fetch_entity(&id, kind, FetchOptions::force()).await
    }

    /// Replace the local entity with a patched copy and announce it.
    pub fn update_entity(&self, patch: EntityPatch) -> Option<Arc<Entity>> {
        let next = {
            let mut state = lock(&self.state);
            if state.status == SyncStatus::Disposed {
                return None;
            }
            let current = match state.entity.clone() {
                Some(current) => current,
                None => {
                    drop(state);
                    self.log(
                        LogLevel::Warn,
                        "update_without_entity",
                        [json_str("panel", self.panel_id.clone())],
                    );
                    return None;
                }
            };
            let next = Arc::new(current.patched(&patch));
            state.entity = Some(Arc::clone(&next));
            next
        };

        self.bus.broadcast(OutgoingEvent::entity_updated(
            Arc::clone(&next),
            self.panel_id.clone(),
        ));
        Some(next)
    }

    /// Adopt the parked remote entity (auto sync off).
    pub fn accept_incoming(&self) -> Option<Arc<Entity>> {
        let mut state = lock(&self.state);
        let incoming = state.incoming.take()?;
        state.entity = Some(Arc::clone(&incoming));
        state.status = SyncStatus::Ready;
        state.error = None;
        Some(incoming)
    }

    /// Drop the local selection and return to `Idle`.
    pub fn clear(&self) {
        let mut state = lock(&self.state);
        if state.status == SyncStatus::Disposed {
            return;
        }
        state.request_seq += 1;
        state.entity = None;
        state.incoming = None;
        state.error = None;
        state.status = SyncStatus::Idle;
    }

    /// Release every bus subscription. Safe to call repeatedly.
    pub fn dispose(&self) {
        let mut subscriptions = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if subscriptions.is_empty() && self.status() == SyncStatus::Disposed {
            return;
        }
        for subscription in subscriptions.iter_mut() {
            subscription.unsubscribe();
        }
        subscriptions.clear();
        drop(subscriptions);

        let mut state = lock(&self.state);
        state.status = SyncStatus::Disposed;
        state.request_seq += 1;
        drop(state);
        self.log(
            LogLevel::Debug,
            "sync_manager_disposed",
            [json_str("panel", self.panel_id.clone())],
        );
    }

    async fn fetch(&self, id: &str, kind: EntityKind, opts: FetchOptions) -> Fetched {
        let seq = {
            let mut state = lock(&self.state);
            if state.status == SyncStatus::Disposed {
                return Fetched::Failed;
            }
            if !opts.force && state.status == SyncStatus::Ready {
                if let Some(current) = state.entity.as_ref() {
                    if current.id == id && current.kind == kind {
                        return Fetched::Applied(Arc::clone(current));
                    }
                }
            }
            state.request_seq += 1;
            state.status = SyncStatus::Loading;
            state.error = None;
            state.last_request = Some((id.to_string(), kind));
            state.request_seq
        };

        self.log(
            LogLevel::Debug,
            "fetch_started",
            [
                json_str("panel", self.panel_id.clone()),
                json_str("id", id),
                json_str("type", kind.as_str()),
            ],
        );

        let result = self.loader.load_entity(id, kind).await;
        let result = match result {
            Ok(Some(entity)) => Ok(Arc::new(entity)),
            Ok(None) => Err(EntityLoadError::NotFound {
                id: id.to_string(),
                kind: kind.to_string(),
            }),
            Err(err) => Err(err),
        };
        metrics::record(self.metrics.as_ref(), |m| {
            m.record_entity_load(result.is_err())
        });

        let mut state = lock(&self.state);
        if state.request_seq != seq {
            drop(state);
            self.log(
                LogLevel::Debug,
                "stale_response_dropped",
                [json_str("panel", self.panel_id.clone()), json_str("id", id)],
            );
            return match result {
                Ok(entity) => Fetched::Superseded(entity),
                Err(_) => Fetched::Failed,
            };
        }

        match result {
            Ok(entity) => {
                state.entity = Some(Arc::clone(&entity));
                state.status = SyncStatus::Ready;
                Fetched::Applied(entity)
            }
            Err(err) => {
                state.status = SyncStatus::Error;
                state.error = Some(err.clone());
                drop(state);
                self.log(
                    LogLevel::Error,
                    "entity_load_failed",
                    [
                        json_str("panel", self.panel_id.clone()),
                        json_str("id", id),
                        json_str("type", kind.as_str()),
                        json_str("error", err.to_string()),
                    ],
                );
                Fetched::Failed
            }
        }
    }

    fn log<I>(&self, level: LogLevel, message: &str, fields: I)
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        emit(self.logger.as_ref(), level, LOG_TARGET, message, fields);
    }
}

impl<L> Drop for EntitySyncManager<L> {
    fn drop(&mut self) {
        // Subscriptions unsubscribe on drop; just mark the state terminal.
        if let Ok(mut state) = self.state.lock() {
            state.status = SyncStatus::Disposed;
        }
    }
}

fn receive(
    state: &SharedSyncState,
    event: &Event,
    auto_sync: bool,
    panel_id: &str,
    logger: Option<&Logger>,
) -> Result<(), SubscriberError> {
    let (entity, selected) = match &event.payload {
        EventPayload::EntitySelected(entity) => (entity, true),
        EventPayload::EntityUpdated(entity) => (entity, false),
        _ => {
            return Err(SubscriberError::PayloadMismatch {
                expected: "entity",
            });
        }
    };

    let mut guard = lock(state);
    if guard.status == SyncStatus::Disposed {
        return Ok(());
    }

    // Updates only refresh the entity this panel is already showing.
    if !selected {
        let tracked = guard
            .entity
            .as_ref()
            .map(|current| current.id == entity.id && current.kind == entity.kind)
            .unwrap_or(false);
        if !tracked {
            return Ok(());
        }
    }

    if auto_sync {
        guard.entity = Some(Arc::clone(entity));
        guard.status = SyncStatus::Ready;
        guard.error = None;
        guard.request_seq += 1;
    } else {
        guard.incoming = Some(Arc::clone(entity));
    }
    drop(guard);

    emit(
        logger,
        LogLevel::Trace,
        LOG_TARGET,
        "remote_entity_received",
        [
            json_str("panel", panel_id),
            json_str("event_type", event.event_type.clone()),
            json_str("source", event.source.clone()),
            json_str("id", entity.id.clone()),
        ],
    );
    Ok(())
}
