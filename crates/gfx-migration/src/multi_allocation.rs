use std::sync::Arc;

use gfx_memory::GraphicsAllocation;
use tracing::debug;

use crate::sync_data::MigrationSyncData;
use crate::{MigrationError, Result};

/// One logical allocation backed separately on several root devices.
#[derive(Clone, Debug)]
pub struct MultiGraphicsAllocation {
    backings: Vec<Option<GraphicsAllocation>>,
    size: u64,
    sync: Option<Arc<MigrationSyncData>>,
}

impl MultiGraphicsAllocation {
    /// Place each backing at its root device index. All backings must be equally sized.
    pub fn new(backings: impl IntoIterator<Item = GraphicsAllocation>) -> Result<Self> {
        let mut slots: Vec<Option<GraphicsAllocation>> = Vec::new();
        let mut size = None;
        for backing in backings {
            let root = backing.root_device_index();
            let expected = *size.get_or_insert(backing.size());
            if backing.size() != expected {
                return Err(MigrationError::SizeMismatch {
                    root_device_index: root,
                    expected,
                    actual: backing.size(),
                });
            }
            let index = root as usize;
            if slots.len() <= index {
                slots.resize(index + 1, None);
            }
            slots[index] = Some(backing);
        }
        Ok(Self {
            backings: slots,
            size: size.unwrap_or(0),
            sync: None,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn get(&self, root_device_index: u32) -> Option<&GraphicsAllocation> {
        self.backings
            .get(root_device_index as usize)
            .and_then(Option::as_ref)
    }

    pub(crate) fn backing(&self, root_device_index: u32) -> Result<&GraphicsAllocation> {
        self.get(root_device_index)
            .ok_or(MigrationError::NoBacking { root_device_index })
    }

    pub fn root_device_indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.backings
            .iter()
            .enumerate()
            .filter(|(_, backing)| backing.is_some())
            .map(|(index, _)| index as u32)
    }

    /// Migration only makes sense with more than one backing.
    pub fn requires_migrations(&self) -> bool {
        self.root_device_indices().count() > 1
    }

    /// Create the shared sync data; registering again returns the existing one.
    pub fn register_for_migration(&mut self, initial_location: u32) -> Arc<MigrationSyncData> {
        let size = self.size;
        Arc::clone(self.sync.get_or_insert_with(|| {
            debug!(size, initial_location, "allocation registered for migration");
            Arc::new(MigrationSyncData::new(size, initial_location))
        }))
    }

    pub fn migration_sync_data(&self) -> Option<&Arc<MigrationSyncData>> {
        self.sync.as_ref()
    }
}
