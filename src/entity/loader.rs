use std::collections::HashMap;
use std::future::{self, Future};
use std::sync::{Arc, RwLock};

use crate::error::EntityLoadError;

use super::types::{Entity, EntityKind};

/// Source of entities (normally the inventory API). Timeouts are the
/// loader's own concern.
pub trait EntityLoader: Send + Sync {
    fn load_entity(
        &self,
        id: &str,
        kind: EntityKind,
    ) -> impl Future<Output = Result<Option<Entity>, EntityLoadError>> + Send;
}

impl<L: EntityLoader> EntityLoader for Arc<L> {
    fn load_entity(
        &self,
        id: &str,
        kind: EntityKind,
    ) -> impl Future<Output = Result<Option<Entity>, EntityLoadError>> + Send {
        (**self).load_entity(id, kind)
    }
}

/// Map-backed loader for hosts that already hold their entities in memory.
#[derive(Default)]
pub struct InMemoryEntityLoader {
    entities: RwLock<HashMap<(EntityKind, String), Entity>>,
    failures: RwLock<HashMap<(EntityKind, String), String>>,
}

impl InMemoryEntityLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entity: Entity) {
        if let Ok(mut guard) = self.entities.write() {
            guard.insert((entity.kind, entity.id.clone()), entity);
        }
    }

    pub fn remove(&self, id: &str, kind: EntityKind) -> Option<Entity> {
        self.entities
            .write()
            .ok()
            .and_then(|mut guard| guard.remove(&(kind, id.to_string())))
    }

    /// Make loads of `id` fail with a backend error until `clear_failure`.
    pub fn fail_with(&self, id: &str, kind: EntityKind, message: impl Into<String>) {
        if let Ok(mut guard) = self.failures.write() {
            guard.insert((kind, id.to_string()), message.into());
        }
    }

    pub fn clear_failure(&self, id: &str, kind: EntityKind) {
        if let Ok(mut guard) = self.failures.write() {
            guard.remove(&(kind, id.to_string()));
        }
    }

    fn lookup(&self, id: &str, kind: EntityKind) -> Result<Option<Entity>, EntityLoadError> {
        let key = (kind, id.to_string());
        if let Some(message) = self
            .failures
            .read()
            .ok()
            .and_then(|guard| guard.get(&key).cloned())
        {
            return Err(EntityLoadError::Backend(message));
        }
        let guard = self
            .entities
            .read()
            .map_err(|_| EntityLoadError::Backend("entity map poisoned".to_string()))?;
        Ok(guard.get(&key).cloned())
    }
}

impl EntityLoader for InMemoryEntityLoader {
    fn load_entity(
        &self,
        id: &str,
        kind: EntityKind,
    ) -> impl Future<Output = Result<Option<Entity>, EntityLoadError>> + Send {
        future::ready(self.lookup(id, kind))
    }
}
