use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    State,
    County,
    Property,
    Filter,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::State,
        EntityKind::County,
        EntityKind::Property,
        EntityKind::Filter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::State => "state",
            EntityKind::County => "county",
            EntityKind::Property => "property",
            EntityKind::Filter => "filter",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown entity type `{s}`"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: EntityKind,
}

impl EntityRef {
    pub fn new(id: impl Into<String>, kind: EntityKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }
}

/// Domain object shared by reference. Never mutated in place: updates produce
/// a new value so holders of an older `Arc<Entity>` keep a consistent view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: EntityKind,
    pub name: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<EntityRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<EntityRef>,
    pub last_updated: DateTime<Utc>,
}

impl Entity {
    pub fn new(id: impl Into<String>, kind: EntityKind, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            name: name.into(),
            properties: Map::new(),
            parent: None,
            children: Vec::new(),
            last_updated: Utc::now(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_parent(mut self, parent: EntityRef) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_child(mut self, child: EntityRef) -> Self {
        self.children.push(child);
        self
    }

    pub fn reference(&self) -> EntityRef {
        EntityRef::new(self.id.clone(), self.kind)
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// New entity with `patch` applied and `last_updated` bumped.
    pub fn patched(&self, patch: &EntityPatch) -> Entity {
        let mut next = self.clone();
        if let Some(name) = &patch.name {
            next.name = name.clone();
        }
        for (key, value) in &patch.properties {
            if value.is_null() {
                next.properties.remove(key);
            } else {
                next.properties.insert(key.clone(), value.clone());
            }
        }
        if let Some(parent) = &patch.parent {
            next.parent = parent.clone();
        }
        if let Some(children) = &patch.children {
            next.children = children.clone();
        }
        let now = Utc::now();
        // Keep strictly increasing even on coarse clocks.
        next.last_updated = if now > self.last_updated {
            now
        } else {
            self.last_updated + chrono::Duration::milliseconds(1)
        };
        next
    }
}

/// Partial change to an entity. A `null` property value removes the key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityPatch {
    pub name: Option<String>,
    pub properties: Map<String, Value>,
    pub parent: Option<Option<EntityRef>>,
    pub children: Option<Vec<EntityRef>>,
}

impl EntityPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn remove_property(mut self, key: impl Into<String>) -> Self {
        self.properties.insert(key.into(), Value::Null);
        self
    }

    pub fn parent(mut self, parent: Option<EntityRef>) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn children(mut self, children: Vec<EntityRef>) -> Self {
        self.children = Some(children);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_parses_and_displays() {
        assert_eq!("county".parse::<EntityKind>().unwrap(), EntityKind::County);
        assert!("parcel".parse::<EntityKind>().is_err());
        assert_eq!(EntityKind::Property.to_string(), "property");
    }

    #[test]
    fn patch_produces_new_entity() {
        let original = Entity::new("48453", EntityKind::County, "Travis")
            .with_property("population", 1_290_000)
            .with_property("seat", "Austin")
            .with_parent(EntityRef::new("TX", EntityKind::State));

        let patch = EntityPatch::new()
            .name("Travis County")
            .property("population", 1_300_000)
            .remove_property("seat");
        let updated = original.patched(&patch);

        assert_eq!(original.name, "Travis");
        assert_eq!(original.property("seat"), Some(&json!("Austin")));
        assert_eq!(updated.name, "Travis County");
        assert_eq!(updated.property("population"), Some(&json!(1_300_000)));
        assert_eq!(updated.property("seat"), None);
        assert_eq!(updated.parent, original.parent);
        assert!(updated.last_updated > original.last_updated);
    }

    #[test]
    fn serializes_with_type_field() {
        let entity = Entity::new("7", EntityKind::Property, "Lot 7")
            .with_child(EntityRef::new("7a", EntityKind::Property));
        let value = serde_json::to_value(&entity).unwrap();
        assert_eq!(value["type"], json!("property"));
        assert_eq!(value["children"][0]["type"], json!("property"));
        assert!(value.get("parent").is_none());
        assert!(value["lastUpdated"].is_string());
    }
}
