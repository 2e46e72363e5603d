//! Versioned key/value persistence with a tiered fallback chain.
//!
//! Values are wrapped in a [`StorageEnvelope`] and written to the first tier
//! that accepts them; a built-in memory map catches writes when every tier
//! refuses, so callers only ever see a degraded status.

mod adapter;
mod envelope;
mod store;

pub use adapter::{PersistenceAdapter, SaveOutcome};
pub use envelope::StorageEnvelope;
pub use store::{FileStore, KeyValueStore, MemoryStore};

/// Prefix for per-panel state keys.
pub const PANEL_STATE_PREFIX: &str = "panelState_";
/// Key holding the globally active filter set.
pub const ACTIVE_FILTERS_KEY: &str = "activeFilters";
/// Key holding named filter presets.
pub const FILTER_PRESETS_KEY: &str = "filterPresets";
/// Key holding every panel's layout. Written only by the layout manager.
pub const PANEL_LAYOUTS_KEY: &str = "panelLayouts";

pub fn panel_state_key(panel_id: &str) -> String {
    format!("{PANEL_STATE_PREFIX}{panel_id}")
}
