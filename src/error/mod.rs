//! Error taxonomy for the sync core.
//!
//! Storage, subscriber and entity-load failures are recovered or recorded
//! locally; they are modelled as values so nothing crosses an event-bus
//! boundary as a panic.

mod types;

pub use types::{
    EntityLoadError, PanelStateError, Result, StorageError, SubscriberError, SyncError,
};
