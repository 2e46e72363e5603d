//! Cross-panel state synchronization core for a multi-panel dashboard.
//!
//! Independently mounted panels share an in-process [`EventBus`], persist
//! their own state through a versioned [`PersistenceAdapter`], and keep a
//! selected [`Entity`] in step via [`EntitySyncManager`]. A [`SyncContext`]
//! wires the pieces together for one application instance.

pub mod bus;
pub mod context;
pub mod entity;
pub mod error;
pub mod filters;
pub mod logging;
pub mod metrics;
pub mod panel_state;
pub mod registry;
pub mod storage;

pub use bus::{
    BusConfig, ENTITY_SELECTED_PREFIX, ENTITY_UPDATED_PREFIX, Event, EventBus, EventFilter,
    EventHandler, EventPayload, FILTER_EVENT, FilterSet, LAYOUT_CHANGED_EVENT, OutgoingEvent,
    PANEL_STATE_CHANGED_EVENT, PanelId, Priority, Subscription, SubscriptionId,
};
pub use context::{StorageConfig, SyncConfig, SyncContext};
pub use entity::{
    Entity, EntityKind, EntityLoader, EntityPatch, EntityRef, EntitySyncManager,
    EntitySyncOptions, FetchOptions, InMemoryEntityLoader, SyncStatus,
};
pub use error::{
    EntityLoadError, PanelStateError, Result, StorageError, SubscriberError, SyncError,
};
pub use filters::{FilterPreset, FilterStore};
pub use logging::{
    FileSink, LogEvent, LogFields, LogLevel, LogSink, Logger, LoggingError, LoggingResult,
    MemorySink, NullSink,
};
pub use metrics::{MetricSnapshot, SharedMetrics, SyncMetrics};
pub use panel_state::{PanelState, PanelStateStore, StateUpdate};
pub use registry::{ContentTypeInfo, LayoutChange, LayoutManager, PanelLayout, PanelRegistry};
pub use storage::{
    FileStore, KeyValueStore, MemoryStore, PersistenceAdapter, SaveOutcome, StorageEnvelope,
};
