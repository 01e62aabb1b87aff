use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use gfx_hw::{L3CachingSettings, PipelineSelectArgs, PreemptionMode, ThreadArbitrationPolicy};
use serde::{Deserialize, Serialize};

use crate::os_interface::FlushStamp;
use crate::tags::{CsrDependencies, TimestampPacketContainer};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueThrottle {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GrfRequirement {
    /// Keep whatever GRF configuration was programmed last.
    NotApplicable,
    Count(u32),
}

/// Shared slot the CSR fills with the flush stamp of the submission carrying a dispatch.
#[derive(Clone, Debug, Default)]
pub struct FlushStampTracker {
    stamp: Arc<AtomicU64>,
}

impl FlushStampTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_stamp(&self, stamp: FlushStamp) {
        self.stamp.store(stamp, Ordering::Release);
    }

    /// Zero until the dispatch was submitted.
    pub fn peek_stamp(&self) -> FlushStamp {
        self.stamp.load(Ordering::Acquire)
    }
}

/// Everything one dispatch asks of the CSR.
///
/// No `Default`: every dispatch names every field.
#[derive(Clone, Debug)]
pub struct DispatchFlags {
    pub csr_dependencies: CsrDependencies,
    /// Nodes written by a stalling barrier pipe control ahead of the payload.
    pub barrier_timestamp_packet_nodes: Option<TimestampPacketContainer>,
    pub pipeline_select_args: PipelineSelectArgs,
    pub flush_stamp_reference: Option<FlushStampTracker>,
    pub throttle: QueueThrottle,
    pub preemption_mode: PreemptionMode,
    pub num_grf_required: GrfRequirement,
    pub l3_cache_settings: L3CachingSettings,
    pub thread_arbitration_policy: ThreadArbitrationPolicy,
    pub slice_count: u64,
    pub blocking: bool,
    pub dc_flush: bool,
    pub use_slm: bool,
    pub guard_command_buffer_with_pipe_control: bool,
    pub gsba_32bit_required: bool,
    pub requires_coherency: bool,
    pub low_priority: bool,
    pub implicit_flush: bool,
    pub out_of_order_execution_allowed: bool,
    pub epilogue_required: bool,
    pub use_per_dss_backed_buffer: bool,
    /// Forces a tag update with TLB invalidation so migration can observe completion.
    pub memory_migration_required: bool,
}

/// Which remembered-state fields differ from the dispatch being flushed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CsrSizeRequestFlags {
    pub l3_config_changed: bool,
    pub coherency_request_changed: bool,
    pub preemption_request_changed: bool,
    pub media_sampler_config_changed: bool,
    pub has_shared_handles: bool,
    pub num_grf_required_changed: bool,
    pub special_pipeline_select_mode_changed: bool,
}

impl CsrSizeRequestFlags {
    pub fn any(&self) -> bool {
        let Self {
            l3_config_changed,
            coherency_request_changed,
            preemption_request_changed,
            media_sampler_config_changed,
            has_shared_handles,
            num_grf_required_changed,
            special_pipeline_select_mode_changed,
        } = *self;
        l3_config_changed
            || coherency_request_changed
            || preemption_request_changed
            || media_sampler_config_changed
            || has_shared_handles
            || num_grf_required_changed
            || special_pipeline_select_mode_changed
    }
}

/// Token returned by a flush; wait on `task_count`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct CompletionStamp {
    pub task_count: u32,
    pub task_level: u32,
    /// Zero while the flush sits in an unsubmitted batch.
    pub flush_stamp: FlushStamp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WaitStatus {
    Ready,
    Timeout,
    GpuHang,
}
