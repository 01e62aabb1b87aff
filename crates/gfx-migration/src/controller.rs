use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use gfx_csr::CommandStreamReceiver;
use gfx_memory::GraphicsAllocation;
use tracing::debug;

use crate::multi_allocation::MultiGraphicsAllocation;
use crate::transfer::TransferQueue;
use crate::{MigrationError, Result};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MigrationStatsSnapshot {
    pub migrations: u64,
    pub cpu_waits: u64,
    pub cpu_copies: u64,
    pub gpu_copies: u64,
    pub skipped_in_progress: u64,
}

#[derive(Debug, Default)]
pub struct MigrationStats {
    migrations: AtomicU64,
    cpu_waits: AtomicU64,
    cpu_copies: AtomicU64,
    gpu_copies: AtomicU64,
    skipped_in_progress: AtomicU64,
}

impl MigrationStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MigrationStatsSnapshot {
        MigrationStatsSnapshot {
            migrations: self.migrations.load(Ordering::Relaxed),
            cpu_waits: self.cpu_waits.load(Ordering::Relaxed),
            cpu_copies: self.cpu_copies.load(Ordering::Relaxed),
            gpu_copies: self.gpu_copies.load(Ordering::Relaxed),
            skipped_in_progress: self.skipped_in_progress.load(Ordering::Relaxed),
        }
    }
}

/// Per-root transfer queues used for backings the CPU cannot lock, plus counters.
#[derive(Default)]
pub struct MigrationContext {
    queues: RwLock<HashMap<u32, Arc<dyn TransferQueue>>>,
    stats: MigrationStats,
}

impl MigrationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_transfer_queue(&self, queue: Arc<dyn TransferQueue>) {
        let root = queue.root_device_index();
        self.queues
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(root, queue);
    }

    pub fn transfer_queue(&self, root_device_index: u32) -> Result<Arc<dyn TransferQueue>> {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&root_device_index)
            .cloned()
            .ok_or(MigrationError::NoTransferQueue { root_device_index })
    }

    pub fn stats(&self) -> MigrationStatsSnapshot {
        self.stats.snapshot()
    }

    /// Fill `dst` from `source`: CPU map when lockable, GPU copy otherwise.
    pub(crate) fn read_backing(&self, source: &GraphicsAllocation, dst: &mut [u8]) -> Result<()> {
        if source.is_lockable() {
            source.lock()?.read(0, dst)?;
            MigrationStats::bump(&self.stats.cpu_copies);
        } else {
            self.transfer_queue(source.root_device_index())?
                .read(source, dst)?;
            MigrationStats::bump(&self.stats.gpu_copies);
        }
        Ok(())
    }

    pub(crate) fn write_backing(&self, destination: &GraphicsAllocation, src: &[u8]) -> Result<()> {
        if destination.is_lockable() {
            destination.lock()?.write(0, src)?;
            MigrationStats::bump(&self.stats.cpu_copies);
        } else {
            self.transfer_queue(destination.root_device_index())?
                .write(destination, src)?;
            MigrationStats::bump(&self.stats.gpu_copies);
        }
        Ok(())
    }
}

impl std::fmt::Debug for MigrationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let roots: Vec<u32> = self
            .queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        f.debug_struct("MigrationContext")
            .field("transfer_queues", &roots)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Keeps the authoritative copy of a multi-root allocation on the device about to use it.
pub struct MigrationController;

impl MigrationController {
    /// Make `allocation` current on `target_csr`'s root device ahead of a dispatch there,
    /// and record that dispatch as its last usage.
    ///
    /// Waits on the CPU first when the previous user was another CSR on another root
    /// device; nothing on the GPU orders work across roots.
    pub fn handle_migration(
        context: &MigrationContext,
        target_csr: &CommandStreamReceiver,
        allocation: &MultiGraphicsAllocation,
    ) -> Result<()> {
        let sync = allocation
            .migration_sync_data()
            .ok_or(MigrationError::NotRegistered)?;
        let target_root = target_csr.root_device_index();

        if sync.current_location() != target_root {
            let foreign_user = sync.last_usage().as_ref().is_some_and(|usage| {
                usage.tag != *target_csr.tag() && usage.root_device_index != target_root
            });
            if foreign_user {
                MigrationStats::bump(&context.stats.cpu_waits);
                sync.wait_on_cpu();
            }
            Self::migrate_memory(context, allocation, target_root)?;
        }

        sync.signal_usage(
            target_csr.tag().clone(),
            target_csr.task_count() + 1,
            target_root,
        );
        Ok(())
    }

    /// Move the authoritative copy to `target_root`. Returns whether data moved.
    ///
    /// Returns `Ok(false)` without touching anything when the allocation is already there
    /// or another thread is migrating it.
    pub fn migrate_memory(
        context: &MigrationContext,
        allocation: &MultiGraphicsAllocation,
        target_root: u32,
    ) -> Result<bool> {
        let sync = allocation
            .migration_sync_data()
            .ok_or(MigrationError::NotRegistered)?;
        let destination = allocation.backing(target_root)?;
        if sync.current_location() == target_root {
            return Ok(false);
        }
        let Some(_guard) = sync.try_start_migration() else {
            MigrationStats::bump(&context.stats.skipped_in_progress);
            debug!(target_root, "migration already in progress");
            return Ok(false);
        };

        let source_root = sync.current_location();
        if source_root == target_root {
            return Ok(false);
        }
        if !sync.is_location_defined() {
            sync.set_current_location(target_root);
            debug!(target_root, "first placement, nothing to copy");
            return Ok(false);
        }

        let source = allocation.backing(source_root)?;
        let size = allocation.size() as usize;
        {
            let mut staging = sync.staging();
            let bytes = &mut staging[..size];
            context.read_backing(source, bytes)?;
            context.write_backing(destination, bytes)?;
        }
        sync.set_current_location(target_root);
        MigrationStats::bump(&context.stats.migrations);
        debug!(source_root, target_root, size, "allocation migrated");
        Ok(true)
    }
}
