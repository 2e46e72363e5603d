//! Per-panel persisted state: default filling on load, versioned updates,
//! and deterministic resolution of racing writers.

mod core;
mod merge;

pub use core::{PanelState, PanelStateStore, StateUpdate};
pub use merge::{Resolution, fill_defaults, resolve_conflict, shallow_patch, smart_merge};
