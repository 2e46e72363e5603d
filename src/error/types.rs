use thiserror::Error;

/// Unified result type for the panel sync crate.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors surfaced by the sync core.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("panel state error: {0}")]
    PanelState(#[from] PanelStateError),
    #[error("entity load error: {0}")]
    EntityLoad(#[from] EntityLoadError),
    #[error("content type `{0}` is not registered")]
    UnknownContentType(String),
    #[error("panel `{0}` is not mounted")]
    PanelNotMounted(String),
    #[error("filter preset `{0}` not found")]
    PresetNotFound(String),
}

/// Failures of a single storage tier or of the version check in front of it.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{store}: quota exceeded writing `{key}` ({needed} bytes, limit {limit})")]
    QuotaExceeded {
        store: String,
        key: String,
        needed: usize,
        limit: usize,
    },
    #[error("{store}: backend unavailable: {reason}")]
    Unavailable { store: String, reason: String },
    #[error("serialization failure: {0}")]
    Serialization(String),
    #[error("{store}: I/O error: {source}")]
    Io {
        store: String,
        #[source]
        source: std::io::Error,
    },
    #[error("stale write to `{key}`: version {attempted} does not supersede {current}")]
    StaleVersion {
        key: String,
        attempted: u32,
        current: u32,
    },
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Raised by an event handler. Caught per handler by the bus.
#[derive(Debug, Clone, Error)]
pub enum SubscriberError {
    #[error("handler failed: {0}")]
    Failed(String),
    #[error("payload mismatch: expected {expected}")]
    PayloadMismatch { expected: &'static str },
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl SubscriberError {
    pub fn failed(message: impl Into<String>) -> Self {
        SubscriberError::Failed(message.into())
    }
}

/// Failure reported by the injected entity loader.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EntityLoadError {
    #[error("{kind} `{id}` not found")]
    NotFound { id: String, kind: String },
    #[error("entity backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum PanelStateError {
    #[error("panel state serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("patch for panel `{0}` requires an object-valued state")]
    NotAnObject(String),
    #[error("panel `{panel_id}` kept losing version races after {attempts} attempts")]
    Conflict { panel_id: String, attempts: u32 },
    #[error(transparent)]
    Storage(#[from] StorageError),
}
