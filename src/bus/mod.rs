//! In-process publish/subscribe bus connecting independently mounted panels.
//!
//! Events are sequenced by the bus, ordered by `(priority desc, sequence asc)`
//! and delivered to every matching subscriber before the next event starts.

mod core;
mod event;

pub use core::{BusConfig, EventBus, EventHandler, Subscription, SubscriptionId};
pub use event::{
    ENTITY_SELECTED_PREFIX, ENTITY_UPDATED_PREFIX, Event, EventFilter, EventPayload, FILTER_EVENT,
    FilterSet, LAYOUT_CHANGED_EVENT, OutgoingEvent, PANEL_STATE_CHANGED_EVENT, PanelId, Priority,
};
