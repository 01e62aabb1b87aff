//! GPU-side copies for backings the CPU cannot map.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use gfx_csr::{
    CommandStreamReceiver, CsrDependencies, DispatchFlags, GrfRequirement, PayloadBuilder,
    QueueThrottle, WaitStatus,
};
use gfx_hw::{L3CachingSettings, PipelineSelectArgs, PreemptionMode, ThreadArbitrationPolicy};
use gfx_memory::{AllocationProperties, AllocationType, GraphicsAllocation};
use tracing::trace;

use crate::{MigrationError, Result};

/// Moves bytes between host memory and allocations of one root device.
pub trait TransferQueue: Send + Sync {
    fn root_device_index(&self) -> u32;

    /// Fill `dst` from the start of `source`.
    fn read(&self, source: &GraphicsAllocation, dst: &mut [u8]) -> Result<()>;

    /// Write `src` to the start of `destination`.
    fn write(&self, destination: &GraphicsAllocation, src: &[u8]) -> Result<()>;
}

/// [`TransferQueue`] that copies through a lockable staging allocation with GPU copy
/// commands on a dedicated CSR, usually a copy engine.
///
/// The CSR must not be the one a caller of the migration controller is dispatching on.
pub struct CsrTransferQueue {
    csr: Arc<Mutex<CommandStreamReceiver>>,
    staging: GraphicsAllocation,
}

impl CsrTransferQueue {
    pub const DEFAULT_STAGING_SIZE: u64 = 64 * 1024;

    pub fn new(csr: Arc<Mutex<CommandStreamReceiver>>, staging_size: u64) -> Result<Self> {
        let staging = {
            let csr = csr.lock().unwrap_or_else(PoisonError::into_inner);
            csr.memory().allocate(AllocationProperties::new(
                staging_size,
                AllocationType::InternalHostMemory,
            ))?
        };
        Ok(Self { csr, staging })
    }

    fn csr(&self) -> MutexGuard<'_, CommandStreamReceiver> {
        self.csr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn chunk_len(&self) -> usize {
        self.staging.size() as usize
    }

    fn copy(
        &self,
        csr: &mut CommandStreamReceiver,
        destination: u64,
        source: u64,
        len: usize,
    ) -> Result<()> {
        let mut payload = PayloadBuilder::new();
        payload.copy_dwords(destination, source, len as u64)?;
        csr.make_resident(&self.staging);
        let stamp = csr.flush_task(payload.as_bytes(), &copy_flags())?;
        match csr.wait_for_task_count(stamp.task_count)? {
            WaitStatus::Ready => {
                trace!(task_count = stamp.task_count, len, "gpu copy retired");
                Ok(())
            }
            WaitStatus::Timeout | WaitStatus::GpuHang => Err(MigrationError::CopyIncomplete {
                task_count: stamp.task_count,
            }),
        }
    }
}

impl TransferQueue for CsrTransferQueue {
    fn root_device_index(&self) -> u32 {
        self.staging.root_device_index()
    }

    fn read(&self, source: &GraphicsAllocation, dst: &mut [u8]) -> Result<()> {
        let mut csr = self.csr();
        csr.make_resident(source);
        let chunk = self.chunk_len();
        for (index, out) in dst.chunks_mut(chunk).enumerate() {
            let offset = (index * chunk) as u64;
            self.copy(
                &mut csr,
                self.staging.gpu_address(),
                source.gpu_address() + offset,
                out.len(),
            )?;
            self.staging.lock()?.read(0, out)?;
        }
        Ok(())
    }

    fn write(&self, destination: &GraphicsAllocation, src: &[u8]) -> Result<()> {
        let mut csr = self.csr();
        csr.make_resident(destination);
        let chunk = self.chunk_len();
        for (index, input) in src.chunks(chunk).enumerate() {
            let offset = (index * chunk) as u64;
            self.staging.lock()?.write(0, input)?;
            self.copy(
                &mut csr,
                destination.gpu_address() + offset,
                self.staging.gpu_address(),
                input.len(),
            )?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for CsrTransferQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsrTransferQueue")
            .field("root_device_index", &self.root_device_index())
            .field("staging", &self.staging)
            .finish()
    }
}

fn copy_flags() -> DispatchFlags {
    DispatchFlags {
        csr_dependencies: CsrDependencies::default(),
        barrier_timestamp_packet_nodes: None,
        pipeline_select_args: PipelineSelectArgs::default(),
        flush_stamp_reference: None,
        throttle: QueueThrottle::Medium,
        preemption_mode: PreemptionMode::Disabled,
        num_grf_required: GrfRequirement::NotApplicable,
        l3_cache_settings: L3CachingSettings::L3CacheOn,
        thread_arbitration_policy: ThreadArbitrationPolicy::NotPresent,
        slice_count: 0,
        blocking: false,
        dc_flush: true,
        use_slm: false,
        guard_command_buffer_with_pipe_control: false,
        gsba_32bit_required: false,
        requires_coherency: false,
        low_priority: false,
        implicit_flush: true,
        out_of_order_execution_allowed: false,
        epilogue_required: false,
        use_per_dss_backed_buffer: false,
        memory_migration_required: false,
    }
}
