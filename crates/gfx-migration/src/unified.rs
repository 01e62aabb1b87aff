//! Host-visible unified memory kept coherent by page faults and migration.

use std::sync::Arc;

use gfx_csr::{CommandStreamReceiver, DispatchFlags};
use gfx_memory::GraphicsAllocation;
use gfx_pagefault::{AllocationDomain, DomainTransfer, HostAllocation, PageFaultManager};
use tracing::{debug, error};

use crate::controller::{MigrationContext, MigrationController};
use crate::multi_allocation::MultiGraphicsAllocation;
use crate::sync_data::MigrationSyncData;
use crate::{Result, LOCATION_UNDEFINED};

struct Shared {
    host: HostAllocation,
    backing: MultiGraphicsAllocation,
    sync: Arc<MigrationSyncData>,
    context: Arc<MigrationContext>,
}

impl Shared {
    fn len(&self) -> usize {
        self.backing.size() as usize
    }

    fn copy_to_host(&self) -> Result<()> {
        self.sync.wait_on_cpu();
        if !self.sync.is_location_defined() {
            return Ok(());
        }
        let location = self.sync.current_location();
        let mut bytes = vec![0; self.len()];
        self.context
            .read_backing(self.backing.backing(location)?, &mut bytes)?;
        self.host.write_unprotected(0, &bytes)?;
        Ok(())
    }

    fn copy_to_device(&self) -> Result<()> {
        if !self.sync.is_location_defined() {
            return Ok(());
        }
        let location = self.sync.current_location();
        let mut bytes = vec![0; self.len()];
        self.host.read_unprotected(0, &mut bytes)?;
        self.context
            .write_backing(self.backing.backing(location)?, &bytes)
    }
}

impl DomainTransfer for Shared {
    fn transfer_to_cpu(&self, ptr: usize, size: usize) {
        if let Err(err) = self.copy_to_host() {
            error!(ptr = format_args!("{ptr:#x}"), size, %err, "device to host transfer failed");
        }
    }

    fn transfer_to_gpu(&self, ptr: usize, size: usize) {
        if let Err(err) = self.copy_to_device() {
            error!(ptr = format_args!("{ptr:#x}"), size, %err, "host to device transfer failed");
        }
    }
}

/// Shared allocation the CPU reaches through ordinary pointers and every root device
/// reaches through its own backing.
///
/// The host pages start untouched and protected. CPU access faults the range into the CPU
/// domain; [`UnifiedAllocation::prepare_for_dispatch`] hands it to the dispatching device.
pub struct UnifiedAllocation {
    shared: Arc<Shared>,
    manager: Arc<PageFaultManager>,
}

impl UnifiedAllocation {
    pub fn new(
        manager: Arc<PageFaultManager>,
        context: Arc<MigrationContext>,
        mut backing: MultiGraphicsAllocation,
    ) -> Result<Self> {
        let host = HostAllocation::new(backing.size() as usize)?;
        let sync = backing.register_for_migration(LOCATION_UNDEFINED);
        let shared = Arc::new(Shared {
            host,
            backing,
            sync,
            context,
        });
        let transfer: Arc<dyn DomainTransfer> = shared.clone();
        manager.track_range(shared.host.as_ptr(), shared.host.len(), transfer)?;
        debug!(
            ptr = format_args!("{:#x}", shared.host.as_ptr()),
            size = shared.backing.size(),
            "unified allocation tracked"
        );
        Ok(Self { shared, manager })
    }

    /// CPU view. Accesses may fault and migrate.
    pub fn host(&self) -> &HostAllocation {
        &self.shared.host
    }

    pub fn backing(&self) -> &MultiGraphicsAllocation {
        &self.shared.backing
    }

    pub fn sync_data(&self) -> &Arc<MigrationSyncData> {
        &self.shared.sync
    }

    /// Migrate to `csr`'s device, make the backing resident and hand the pages to the GPU.
    /// Returns the backing the dispatch should address.
    pub fn prepare_for_dispatch(
        &self,
        csr: &mut CommandStreamReceiver,
        flags: &mut DispatchFlags,
    ) -> Result<GraphicsAllocation> {
        let target = csr.root_device_index();
        let backing = self.shared.backing.backing(target)?.clone();
        let ptr = self.shared.host.as_ptr();
        if self.manager.domain(ptr) == Some(AllocationDomain::Cpu) {
            // The host pages hold the only current copy and the fault that brought them home
            // already waited out the last GPU user. Handing them over below writes them
            // straight into the target backing.
            let sync = &self.shared.sync;
            sync.set_current_location(target);
            sync.signal_usage(csr.tag().clone(), csr.task_count() + 1, target);
            debug!(
                ptr = format_args!("{ptr:#x}"),
                root_device_index = target,
                "host copy placed on dispatching device"
            );
        } else {
            MigrationController::handle_migration(&self.shared.context, csr, &self.shared.backing)?;
        }
        csr.make_resident(&backing);
        self.manager.move_allocation_to_gpu_domain(ptr)?;
        flags.memory_migration_required = true;
        Ok(backing)
    }
}

impl Drop for UnifiedAllocation {
    fn drop(&mut self) {
        if let Err(err) = self.manager.untrack_range(self.shared.host.as_ptr()) {
            error!(%err, "failed to untrack unified allocation");
        }
    }
}

impl std::fmt::Debug for UnifiedAllocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnifiedAllocation")
            .field("host", &self.shared.host)
            .field("backing", &self.shared.backing)
            .field("location", &self.shared.sync.current_location())
            .finish()
    }
}
