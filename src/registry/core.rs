use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::bus::PanelId;
use crate::error::{Result, SyncError};

/// A kind of panel content the shell knows how to mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentTypeInfo {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
}

impl ContentTypeInfo {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Registry mapping content types to the panels currently showing them.
#[derive(Debug, Default)]
pub struct PanelRegistry {
    content_types: RwLock<BTreeMap<String, ContentTypeInfo>>,
    mounted: RwLock<BTreeMap<PanelId, String>>,
}

impl PanelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the content type was already known; its info is
    /// replaced either way.
    pub fn register(&self, info: ContentTypeInfo) -> bool {
        write(&self.content_types)
            .insert(info.id.clone(), info)
            .is_none()
    }

    pub fn is_registered(&self, content_type: &str) -> bool {
        read(&self.content_types).contains_key(content_type)
    }

    pub fn content_type(&self, content_type: &str) -> Option<ContentTypeInfo> {
        read(&self.content_types).get(content_type).cloned()
    }

    pub fn content_types(&self) -> Vec<ContentTypeInfo> {
        read(&self.content_types).values().cloned().collect()
    }

    /// Mount `panel_id` showing `content_type`. Remounting an existing panel
    /// switches its content type.
    pub fn mount(&self, panel_id: impl Into<PanelId>, content_type: &str) -> Result<()> {
        if !self.is_registered(content_type) {
            return Err(SyncError::UnknownContentType(content_type.to_string()));
        }
        write(&self.mounted).insert(panel_id.into(), content_type.to_string());
        Ok(())
    }

    pub fn unmount(&self, panel_id: &str) -> bool {
        write(&self.mounted).remove(panel_id).is_some()
    }

    pub fn is_mounted(&self, panel_id: &str) -> bool {
        read(&self.mounted).contains_key(panel_id)
    }

    pub fn content_type_of(&self, panel_id: &str) -> Option<String> {
        read(&self.mounted).get(panel_id).cloned()
    }

    /// Every mounted panel with its content type, ordered by panel id.
    pub fn panels(&self) -> Vec<(PanelId, String)> {
        read(&self.mounted)
            .iter()
            .map(|(panel, content)| (panel.clone(), content.clone()))
            .collect()
    }

    pub fn panels_of(&self, content_type: &str) -> Vec<PanelId> {
        read(&self.mounted)
            .iter()
            .filter(|(_, content)| content.as_str() == content_type)
            .map(|(panel, _)| panel.clone())
            .collect()
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
