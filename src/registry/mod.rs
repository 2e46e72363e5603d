//! Content-type registrations, mounted panels and their layouts.

mod core;
mod layout;

pub use core::{ContentTypeInfo, PanelRegistry};
pub use layout::{LAYOUT_SOURCE, LayoutChange, LayoutManager, PanelLayout};
