use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::bus::{EventBus, OutgoingEvent, PanelId};
use crate::error::{Result, StorageError, SyncError};
use crate::storage::{PANEL_LAYOUTS_KEY, PersistenceAdapter, StorageEnvelope};

use super::core::PanelRegistry;

/// Source stamped on `layout_changed` events.
pub const LAYOUT_SOURCE: &str = "layout";
const MAX_COMMIT_ATTEMPTS: u32 = 3;

/// Grid placement of one panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanelLayout {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub visible: bool,
    pub maximized: bool,
}

impl PanelLayout {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            ..Self::default()
        }
    }
}

impl Default for PanelLayout {
    fn default() -> Self {
        Self {
            x: 0,
            y: 0,
            width: 1,
            height: 1,
            visible: true,
            maximized: false,
        }
    }
}

/// Payload of a `layout_changed` event. `layout` is `None` once the panel's
/// layout has been removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutChange {
    pub panel_id: PanelId,
    pub layout: Option<PanelLayout>,
}

type Layouts = BTreeMap<PanelId, PanelLayout>;

/// Tracks panel layouts under their own storage key and announces every
/// effective change.
///
/// Changes are applied per panel on top of the newest stored map, so two
/// managers sharing an adapter never drop each other's panels.
pub struct LayoutManager {
    adapter: Arc<PersistenceAdapter>,
    registry: Arc<PanelRegistry>,
    bus: EventBus,
    layouts: Mutex<StorageEnvelope<Layouts>>,
}

impl LayoutManager {
    pub fn new(
        adapter: Arc<PersistenceAdapter>,
        registry: Arc<PanelRegistry>,
        bus: EventBus,
    ) -> Self {
        let layouts = adapter
            .load(PANEL_LAYOUTS_KEY)
            .unwrap_or_else(|| StorageEnvelope::initial(Layouts::new()));
        Self {
            adapter,
            registry,
            bus,
            layouts: Mutex::new(layouts),
        }
    }

    pub fn layout(&self, panel_id: &str) -> Option<PanelLayout> {
        self.lock().data.get(panel_id).copied()
    }

    pub fn layouts(&self) -> Layouts {
        self.lock().data.clone()
    }

    /// Version of the layout map this manager last saw.
    pub fn version(&self) -> u32 {
        self.lock().version
    }

    /// Returns `Ok(false)` when `layout` matches what is already recorded.
    pub fn set_layout(&self, panel_id: &str, layout: PanelLayout) -> Result<bool> {
        self.ensure_mounted(panel_id)?;
        if self.layout(panel_id) == Some(layout) {
            return Ok(false);
        }
        self.commit(vec![(panel_id.to_string(), Some(layout))])?;
        Ok(true)
    }

    pub fn set_visible(&self, panel_id: &str, visible: bool) -> Result<bool> {
        let mut layout = self.layout(panel_id).unwrap_or_default();
        layout.visible = visible;
        if !visible {
            layout.maximized = false;
        }
        self.set_layout(panel_id, layout)
    }

    /// Maximize `panel_id`, restoring any other maximized panel.
    pub fn maximize(&self, panel_id: &str) -> Result<bool> {
        self.ensure_mounted(panel_id)?;
        let current = self.layouts();
        let mut changes = Vec::new();
        for (id, layout) in &current {
            if id != panel_id && layout.maximized {
                changes.push((
                    id.clone(),
                    Some(PanelLayout {
                        maximized: false,
                        ..*layout
                    }),
                ));
            }
        }
        let target = current.get(panel_id).copied().unwrap_or_default();
        if !target.maximized || !target.visible {
            changes.push((
                panel_id.to_string(),
                Some(PanelLayout {
                    maximized: true,
                    visible: true,
                    ..target
                }),
            ));
        }
        if changes.is_empty() {
            return Ok(false);
        }
        self.commit(changes)?;
        Ok(true)
    }

    pub fn restore(&self, panel_id: &str) -> Result<bool> {
        match self.layout(panel_id) {
            Some(layout) if layout.maximized => self.set_layout(
                panel_id,
                PanelLayout {
                    maximized: false,
                    ..layout
                },
            ),
            _ => Ok(false),
        }
    }

    /// Drop a panel's layout. Does not require the panel to still be mounted.
    pub fn remove(&self, panel_id: &str) -> Result<bool> {
        if self.layout(panel_id).is_none() {
            return Ok(false);
        }
        self.commit(vec![(panel_id.to_string(), None)])?;
        Ok(true)
    }

    fn ensure_mounted(&self, panel_id: &str) -> Result<()> {
        if self.registry.is_mounted(panel_id) {
            Ok(())
        } else {
            Err(SyncError::PanelNotMounted(panel_id.to_string()))
        }
    }

    fn commit(&self, changes: Vec<(PanelId, Option<PanelLayout>)>) -> Result<()> {
        {
            let mut slot = self.lock();
            let mut attempt = 1;
            let next = loop {
                let base = match self.adapter.load::<Layouts>(PANEL_LAYOUTS_KEY) {
                    Some(stored) if stored.version > slot.version => stored,
                    _ => slot.clone(),
                };
                let mut layouts = base.data.clone();
                for (panel_id, layout) in &changes {
                    match layout {
                        Some(layout) => {
                            layouts.insert(panel_id.clone(), *layout);
                        }
                        None => {
                            layouts.remove(panel_id);
                        }
                    }
                }
                let next = base.next(layouts);
                match self.adapter.save(PANEL_LAYOUTS_KEY, &next) {
                    Ok(_) => break next,
                    Err(StorageError::StaleVersion { .. }) if attempt < MAX_COMMIT_ATTEMPTS => {
                        attempt += 1;
                    }
                    Err(err) => return Err(err.into()),
                }
            };
            *slot = next;
        }

        for (panel_id, layout) in changes {
            self.bus.broadcast(OutgoingEvent::layout_changed(
                LayoutChange { panel_id, layout },
                LAYOUT_SOURCE,
            ));
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, StorageEnvelope<Layouts>> {
        self.layouts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
