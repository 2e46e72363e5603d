use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::{Entity, EntityKind};
use crate::registry::LayoutChange;

pub type PanelId = String;

/// Active filter criteria keyed by field name (e.g. `propertyType`).
pub type FilterSet = BTreeMap<String, Value>;

pub const FILTER_EVENT: &str = "filter";
pub const PANEL_STATE_CHANGED_EVENT: &str = "panel_state_changed";
pub const LAYOUT_CHANGED_EVENT: &str = "layout_changed";
pub const ENTITY_SELECTED_PREFIX: &str = "entity_selected_";
pub const ENTITY_UPDATED_PREFIX: &str = "entity_updated_";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Payload carried by an event, discriminated by what produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Filter(FilterSet),
    EntitySelected(Arc<Entity>),
    EntityUpdated(Arc<Entity>),
    PanelStateChanged { panel_id: PanelId, version: u32 },
    LayoutChanged(LayoutChange),
    Custom(Value),
    Empty,
}

impl EventPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::Filter(_) => "filter",
            EventPayload::EntitySelected(_) => "entity_selected",
            EventPayload::EntityUpdated(_) => "entity_updated",
            EventPayload::PanelStateChanged { .. } => "panel_state_changed",
            EventPayload::LayoutChanged(_) => "layout_changed",
            EventPayload::Custom(_) => "custom",
            EventPayload::Empty => "empty",
        }
    }

    pub fn entity(&self) -> Option<&Arc<Entity>> {
        match self {
            EventPayload::EntitySelected(entity) | EventPayload::EntityUpdated(entity) => {
                Some(entity)
            }
            _ => None,
        }
    }

    pub fn filters(&self) -> Option<&FilterSet> {
        match self {
            EventPayload::Filter(filters) => Some(filters),
            _ => None,
        }
    }
}

/// Event as handed to `EventBus::broadcast`; sequence and timestamp are
/// assigned by the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingEvent {
    pub event_type: String,
    pub payload: EventPayload,
    pub source: PanelId,
    pub priority: Priority,
}

impl OutgoingEvent {
    pub fn new(
        event_type: impl Into<String>,
        payload: EventPayload,
        source: impl Into<PanelId>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            source: source.into(),
            priority: Priority::Normal,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn filter(filters: FilterSet, source: impl Into<PanelId>) -> Self {
        Self::new(FILTER_EVENT, EventPayload::Filter(filters), source)
    }

    pub fn entity_selected(entity: Arc<Entity>, source: impl Into<PanelId>) -> Self {
        let event_type = entity_selected_type(entity.kind);
        Self::new(event_type, EventPayload::EntitySelected(entity), source)
    }

    pub fn entity_updated(entity: Arc<Entity>, source: impl Into<PanelId>) -> Self {
        let event_type = entity_updated_type(entity.kind);
        Self::new(event_type, EventPayload::EntityUpdated(entity), source)
    }

    pub fn panel_state_changed(panel_id: impl Into<PanelId>, version: u32) -> Self {
        let panel_id = panel_id.into();
        Self::new(
            PANEL_STATE_CHANGED_EVENT,
            EventPayload::PanelStateChanged {
                panel_id: panel_id.clone(),
                version,
            },
            panel_id,
        )
        .with_priority(Priority::Low)
    }

    pub fn layout_changed(change: LayoutChange, source: impl Into<PanelId>) -> Self {
        Self::new(LAYOUT_CHANGED_EVENT, EventPayload::LayoutChanged(change), source)
    }
}

pub(crate) fn entity_selected_type(kind: EntityKind) -> String {
    format!("{ENTITY_SELECTED_PREFIX}{}", kind.as_str())
}

pub(crate) fn entity_updated_type(kind: EntityKind) -> String {
    format!("{ENTITY_UPDATED_PREFIX}{}", kind.as_str())
}

/// A delivered event.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub event_type: String,
    pub payload: EventPayload,
    pub source: PanelId,
    pub sequence: u64,
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub(crate) fn stamp(outgoing: OutgoingEvent, sequence: u64) -> Self {
        let OutgoingEvent {
            event_type,
            payload,
            source,
            priority,
        } = outgoing;
        Self {
            event_type,
            payload,
            source,
            sequence,
            priority,
            timestamp: Utc::now(),
        }
    }
}

type Predicate = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

#[derive(Debug, Clone)]
enum TypeMatch {
    Any,
    Exact(Vec<String>),
    Prefix(String),
}

/// Selects which events reach a subscriber.
#[derive(Clone)]
pub struct EventFilter {
    types: TypeMatch,
    excluded_source: Option<PanelId>,
    predicate: Option<Predicate>,
}

impl EventFilter {
    pub fn any() -> Self {
        Self {
            types: TypeMatch::Any,
            excluded_source: None,
            predicate: None,
        }
    }

    pub fn event_type(event_type: impl Into<String>) -> Self {
        Self {
            types: TypeMatch::Exact(vec![event_type.into()]),
            ..Self::any()
        }
    }

    pub fn event_types<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            types: TypeMatch::Exact(types.into_iter().map(Into::into).collect()),
            ..Self::any()
        }
    }

    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            types: TypeMatch::Prefix(prefix.into()),
            ..Self::any()
        }
    }

    /// Drop events emitted by `source`, so a panel never hears its own echo.
    pub fn excluding_source(mut self, source: impl Into<PanelId>) -> Self {
        self.excluded_source = Some(source.into());
        self
    }

    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        let type_ok = match &self.types {
            TypeMatch::Any => true,
            TypeMatch::Exact(types) => types.iter().any(|t| *t == event.event_type),
            TypeMatch::Prefix(prefix) => event.event_type.starts_with(prefix.as_str()),
        };
        if !type_ok {
            return false;
        }
        if self.excluded_source.as_deref() == Some(event.source.as_str()) {
            return false;
        }
        self.predicate
            .as_ref()
            .map(|predicate| predicate(event))
            .unwrap_or(true)
    }
}

impl Default for EventFilter {
    fn default() -> Self {
        Self::any()
    }
}

impl fmt::Debug for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventFilter")
            .field("types", &self.types)
            .field("excluded_source", &self.excluded_source)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(event_type: &str, source: &str) -> Event {
        Event::stamp(
            OutgoingEvent::new(event_type, EventPayload::Empty, source),
            1,
        )
    }

    #[test]
    fn exact_and_prefix_matching() {
        let exact = EventFilter::event_type("filter");
        assert!(exact.matches(&event("filter", "a")));
        assert!(!exact.matches(&event("filters", "a")));

        let prefix = EventFilter::prefix(ENTITY_SELECTED_PREFIX);
        assert!(prefix.matches(&event("entity_selected_county", "a")));
        assert!(!prefix.matches(&event("entity_updated_county", "a")));
    }

    #[test]
    fn excluded_source_and_predicate() {
        let filter = EventFilter::any()
            .excluding_source("map")
            .with_predicate(|event| event.sequence == 1);
        assert!(!filter.matches(&event("filter", "map")));
        assert!(filter.matches(&event("filter", "list")));
    }

    #[test]
    fn entity_event_types_follow_kind() {
        let entity = Arc::new(Entity::new("12", EntityKind::County, "Travis"));
        let selected = OutgoingEvent::entity_selected(entity.clone(), "countyPanel");
        assert_eq!(selected.event_type, "entity_selected_county");
        let updated = OutgoingEvent::entity_updated(entity, "countyPanel");
        assert_eq!(updated.event_type, "entity_updated_county");

        let mut filters = FilterSet::new();
        filters.insert("propertyType".into(), json!("Residential"));
        let filter = OutgoingEvent::filter(filters.clone(), "countyPanel");
        assert_eq!(filter.payload.filters(), Some(&filters));
        assert_eq!(filter.priority, Priority::Normal);
    }

    #[test]
    fn priorities_order_high_first() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }
}
