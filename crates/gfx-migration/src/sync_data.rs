//! Per-allocation migration bookkeeping shared by every user of a multi-root allocation.

#[cfg(all(feature = "loom", test))]
use loom::sync::atomic::{AtomicBool, AtomicU32};
#[cfg(not(all(feature = "loom", test)))]
use std::sync::atomic::{AtomicBool, AtomicU32};

use std::sync::atomic::Ordering;
use std::sync::{Mutex, MutexGuard, PoisonError};

use gfx_memory::{align_up, TagCell, PAGE_SIZE};
use tracing::trace;

/// `current_location` of an allocation nobody has placed yet.
pub const LOCATION_UNDEFINED: u32 = u32::MAX;

/// The most recent GPU access: completes once `tag` reaches `task_count`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LastUsage {
    pub tag: TagCell,
    pub task_count: u32,
    pub root_device_index: u32,
}

impl LastUsage {
    pub fn is_completed(&self) -> bool {
        self.tag.is_at_least(self.task_count)
    }
}

pub struct MigrationSyncData {
    current_location: AtomicU32,
    in_progress: AtomicBool,
    last_usage: Mutex<Option<LastUsage>>,
    staging: Mutex<Vec<u8>>,
    size: u64,
}

impl MigrationSyncData {
    pub fn new(size: u64, initial_location: u32) -> Self {
        Self {
            current_location: AtomicU32::new(initial_location),
            in_progress: AtomicBool::new(false),
            last_usage: Mutex::new(None),
            staging: Mutex::new(Vec::new()),
            size,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn current_location(&self) -> u32 {
        self.current_location.load(Ordering::Acquire)
    }

    pub fn is_location_defined(&self) -> bool {
        self.current_location() != LOCATION_UNDEFINED
    }

    pub fn set_current_location(&self, root_device_index: u32) {
        self.current_location
            .store(root_device_index, Ordering::Release);
    }

    /// Claim the migration right. `None` while another migration holds it.
    pub fn try_start_migration(&self) -> Option<MigrationGuard<'_>> {
        self.in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| MigrationGuard { sync: self })
    }

    pub fn is_migration_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    pub fn signal_usage(&self, tag: TagCell, task_count: u32, root_device_index: u32) {
        *self.last_usage() = Some(LastUsage {
            tag,
            task_count,
            root_device_index,
        });
    }

    pub fn last_usage(&self) -> MutexGuard<'_, Option<LastUsage>> {
        self.last_usage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the last recorded access came through the CSR writing `tag`.
    pub fn is_used_by(&self, tag: &TagCell) -> bool {
        self.last_usage()
            .as_ref()
            .is_some_and(|usage| usage.tag == *tag)
    }

    /// Spin until the last recorded GPU access completed.
    pub fn wait_on_cpu(&self) {
        let Some(usage) = self.last_usage().clone() else {
            return;
        };
        let mut spins = 0u32;
        while !usage.is_completed() {
            spins = spins.saturating_add(1);
            if spins < 128 {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
        trace!(
            task_count = usage.task_count,
            root_device_index = usage.root_device_index,
            "last usage retired"
        );
    }

    /// Host bounce buffer, grown to the allocation size rounded up to whole pages.
    pub(crate) fn staging(&self) -> MutexGuard<'_, Vec<u8>> {
        let mut staging = self.staging.lock().unwrap_or_else(PoisonError::into_inner);
        let len = align_up(self.size, PAGE_SIZE) as usize;
        if staging.len() < len {
            staging.resize(len, 0);
        }
        staging
    }
}

impl std::fmt::Debug for MigrationSyncData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationSyncData")
            .field("current_location", &self.current_location())
            .field("in_progress", &self.is_migration_in_progress())
            .field("last_usage", &*self.last_usage())
            .field("size", &self.size)
            .finish()
    }
}

/// Holds the in-progress flag; clears it on drop.
#[derive(Debug)]
pub struct MigrationGuard<'a> {
    sync: &'a MigrationSyncData,
}

impl Drop for MigrationGuard<'_> {
    fn drop(&mut self) {
        self.sync.in_progress.store(false, Ordering::Release);
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use gfx_memory::{AllocationProperties, AllocationType, GpuAddressSpace};
    use std::sync::Arc;

    #[test]
    fn in_progress_flag_is_exclusive_until_guard_drops() {
        let sync = MigrationSyncData::new(0x1000, LOCATION_UNDEFINED);
        let guard = sync.try_start_migration().unwrap();
        assert!(sync.is_migration_in_progress());
        assert!(sync.try_start_migration().is_none());
        drop(guard);
        assert!(!sync.is_migration_in_progress());
        assert!(sync.try_start_migration().is_some());
    }

    #[test]
    fn wait_on_cpu_returns_once_tag_reaches_task_count() {
        let memory = GpuAddressSpace::new(0);
        let tag_buffer = memory
            .allocate(AllocationProperties::new(0x1000, AllocationType::TagBuffer))
            .unwrap();
        let tag = tag_buffer.tag_cell(0).unwrap();
        let sync = Arc::new(MigrationSyncData::new(0x1000, 0));

        sync.wait_on_cpu();
        sync.signal_usage(tag.clone(), 3, 0);
        assert!(sync.is_used_by(&tag));

        let waiter = {
            let sync = Arc::clone(&sync);
            std::thread::spawn(move || sync.wait_on_cpu())
        };
        tag.store(2);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(!waiter.is_finished());
        tag.store(3);
        waiter.join().unwrap();
    }

    #[test]
    fn location_is_defined_once_set() {
        let sync = MigrationSyncData::new(0x1000, LOCATION_UNDEFINED);
        assert!(!sync.is_location_defined());
        sync.set_current_location(1);
        assert!(sync.is_location_defined());
        assert_eq!(sync.current_location(), 1);
    }

    #[test]
    fn staging_rounds_up_to_pages() {
        let sync = MigrationSyncData::new(0x1001, LOCATION_UNDEFINED);
        assert_eq!(sync.staging().len(), 0x2000);
    }
}
