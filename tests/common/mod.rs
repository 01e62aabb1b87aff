#![allow(dead_code)]

use gfx_umd::csr::{CsrDependencies, DispatchFlags, GrfRequirement, QueueThrottle};
use gfx_umd::hw::{L3CachingSettings, PipelineSelectArgs, PreemptionMode, ThreadArbitrationPolicy};

pub fn flags() -> DispatchFlags {
    DispatchFlags {
        csr_dependencies: CsrDependencies::default(),
        barrier_timestamp_packet_nodes: None,
        pipeline_select_args: PipelineSelectArgs::default(),
        flush_stamp_reference: None,
        throttle: QueueThrottle::Medium,
        preemption_mode: PreemptionMode::ThreadGroup,
        num_grf_required: GrfRequirement::NotApplicable,
        l3_cache_settings: L3CachingSettings::L3CacheOn,
        thread_arbitration_policy: ThreadArbitrationPolicy::NotPresent,
        slice_count: 0,
        blocking: false,
        dc_flush: false,
        use_slm: false,
        guard_command_buffer_with_pipe_control: false,
        gsba_32bit_required: false,
        requires_coherency: false,
        low_priority: false,
        implicit_flush: false,
        out_of_order_execution_allowed: false,
        epilogue_required: false,
        use_per_dss_backed_buffer: false,
        memory_migration_required: false,
    }
}
