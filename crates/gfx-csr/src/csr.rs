use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use gfx_cmdbuf::{CommandBufferAllocator, LinearStream, StreamPosition};
use gfx_hw::commands::MI_NOOP;
use gfx_hw::memory_sync::{
    batch_buffer_end_size, pipe_control_size, program_batch_buffer_end, program_pipe_control,
    program_pipe_control_with_post_sync, program_semaphore_wait, semaphore_wait_size,
};
use gfx_hw::state::{
    compute_mode_size, l3_config_size, pipeline_select_size, program_compute_mode, program_l3,
    program_pipeline_select, program_state_base_address, program_thread_arbitration,
    state_base_address_size, thread_arbitration_size, DEFAULT_GRF_NUMBER,
};
use gfx_hw::{
    gfx_family, preemption, BatchBufferChain, ComputeModeTriggers, GfxFamily, HardwareInfo,
    PipeControlArgs, PreemptionMode, ThreadArbitrationPolicy,
};
use gfx_memory::{
    AllocationProperties, AllocationType, GpuAddressSpace, GraphicsAllocation, TagCell,
    CACHE_LINE_SIZE, PAGE_SIZE,
};
use tracing::{debug, error, trace, warn};

use crate::config::{CsrConfig, DispatchMode};
use crate::dispatch_flags::{
    CompletionStamp, CsrSizeRequestFlags, DispatchFlags, FlushStampTracker, GrfRequirement,
    QueueThrottle, WaitStatus,
};
use crate::os_interface::{BatchBuffer, EngineId, FlushStamp, OsInterface, WaitOutcome};
use crate::stats::CsrStats;
use crate::tags::TimestampPacketContainer;
use crate::{CsrError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CsrState {
    Idle = 0,
    Diffing = 1,
    Encoding = 2,
    Submitted = 3,
    /// Terminal: submission failed or the device was lost.
    Faulted = 4,
}

impl CsrState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => CsrState::Idle,
            1 => CsrState::Diffing,
            2 => CsrState::Encoding,
            3 => CsrState::Submitted,
            _ => CsrState::Faulted,
        }
    }
}

#[derive(Debug)]
struct CsrShared {
    task_count: AtomicU32,
    state: AtomicU8,
}

impl CsrShared {
    fn state(&self) -> CsrState {
        CsrState::from_u8(self.state.load(Ordering::Acquire))
    }
}

/// Read-only view of a CSR for other threads: its tag, task count and device.
#[derive(Clone, Debug)]
pub struct CsrObserver {
    engine: EngineId,
    tag: TagCell,
    shared: Arc<CsrShared>,
}

impl CsrObserver {
    pub fn engine(&self) -> EngineId {
        self.engine
    }

    pub fn root_device_index(&self) -> u32 {
        self.engine.root_device_index
    }

    pub fn tag(&self) -> &TagCell {
        &self.tag
    }

    pub fn task_count(&self) -> u32 {
        self.shared.task_count.load(Ordering::Acquire)
    }

    pub fn state(&self) -> CsrState {
        self.shared.state()
    }

    /// Whether `tag` is this CSR's completion tag.
    pub fn owns_tag(&self, tag: &TagCell) -> bool {
        self.tag == *tag
    }
}

/// What one flush emitted. Kept for diagnostics and tests.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub task_count: u32,
    pub size_flags: CsrSizeRequestFlags,
    /// State-transition and preamble bytes ahead of the payload.
    pub state_bytes: usize,
    pub dependency_waits: usize,
    pub payload_bytes: usize,
    pub tag_update: bool,
    pub estimated_bytes: usize,
    pub submitted: bool,
}

/// Last-programmed hardware state. `None` means never programmed.
#[derive(Clone, Copy, Debug)]
struct ProgrammedState {
    l3_config: Option<u32>,
    requires_coherency: Option<bool>,
    preemption_mode: PreemptionMode,
    media_sampler_required: Option<bool>,
    special_pipeline_select_mode: bool,
    num_grf: u32,
    thread_arbitration: Option<ThreadArbitrationPolicy>,
    mocs_index: Option<u32>,
    gsba_32bit: Option<bool>,
}

impl Default for ProgrammedState {
    fn default() -> Self {
        Self {
            l3_config: None,
            requires_coherency: None,
            preemption_mode: PreemptionMode::Initial,
            media_sampler_required: None,
            special_pipeline_select_mode: false,
            num_grf: DEFAULT_GRF_NUMBER,
            thread_arbitration: None,
            mocs_index: None,
            gsba_32bit: None,
        }
    }
}

/// Decisions of the diff phase for one dispatch.
struct DispatchPlan {
    size_flags: CsrSizeRequestFlags,
    l3_config: Option<u32>,
    compute_mode: bool,
    pipeline_select: bool,
    preamble: bool,
    thread_arbitration: Option<ThreadArbitrationPolicy>,
    mocs_index: u32,
    state_base_address: bool,
    stall: bool,
    dc_flush: bool,
    tag_update: bool,
    num_grf: u32,
    wait_points: Vec<(u64, u32)>,
    state_size: usize,
    estimate: usize,
}

struct InFlight {
    task_count: u32,
    /// Segments ahead of the one holding this flush's batch end are reusable once it retired.
    batch_end: StreamPosition,
    /// Dependency and barrier nodes, kept out of their pools until this flush retired.
    nodes: TimestampPacketContainer,
}

#[derive(Default)]
struct PendingBatch {
    start: Option<StreamPosition>,
    batch_ends: Vec<StreamPosition>,
    trackers: Vec<FlushStampTracker>,
    throttle: QueueThrottle,
    low_priority: bool,
    slice_count: u64,
}

/// Per-engine command-stream receiver.
///
/// Turns a payload plus [`DispatchFlags`] into a submitted command buffer carrying only the
/// state transitions the payload needs, and tracks completion through a GPU-written tag.
/// Callers serialize dispatches to one CSR; other threads observe it through
/// [`CsrObserver`].
pub struct CommandStreamReceiver {
    engine: EngineId,
    config: CsrConfig,
    hw_info: HardwareInfo,
    family: &'static dyn GfxFamily,
    compute_mode_triggers: ComputeModeTriggers,
    memory: Arc<GpuAddressSpace>,
    os: Arc<dyn OsInterface>,
    stream: LinearStream,
    tag_allocation: GraphicsAllocation,
    tag: TagCell,
    shared: Arc<CsrShared>,
    stats: Arc<CsrStats>,

    last: ProgrammedState,
    required_thread_arbitration: ThreadArbitrationPolicy,
    preamble_sent: bool,
    has_shared_handles: bool,
    stall_requested: bool,
    sip_allocation: Option<GraphicsAllocation>,
    per_dss_buffer: Option<GraphicsAllocation>,
    residency: Vec<GraphicsAllocation>,

    task_level: u32,
    latest_sent_task_count: u32,
    latest_flushed_task_count: u32,
    last_flush_stamp: FlushStamp,
    enqueues_since_submit: u32,
    batch: PendingBatch,
    in_flight: VecDeque<InFlight>,
    last_report: FlushReport,
}

impl CommandStreamReceiver {
    pub fn new(
        engine: EngineId,
        hw_info: HardwareInfo,
        memory: Arc<GpuAddressSpace>,
        os: Arc<dyn OsInterface>,
        config: CsrConfig,
    ) -> Result<Self> {
        let family = gfx_family(hw_info.family);
        let allocator: Arc<dyn CommandBufferAllocator> = memory.clone();
        let stream = LinearStream::new(
            allocator,
            Arc::new(BatchBufferChain),
            config.command_buffer_size,
        )?;
        let tag_allocation =
            memory.allocate(AllocationProperties::new(PAGE_SIZE, AllocationType::TagBuffer))?;
        let tag = tag_allocation.tag_cell(0)?;
        tag.store(0);

        let compute_mode_triggers = config
            .compute_mode_triggers
            .unwrap_or_else(|| family.default_compute_mode_triggers());

        debug!(
            %engine,
            family = family.name(),
            tag_address = tag.gpu_address(),
            dispatch_mode = ?config.dispatch_mode,
            "command stream receiver created"
        );

        Ok(Self {
            engine,
            config,
            hw_info,
            family,
            compute_mode_triggers,
            memory,
            os,
            stream,
            tag_allocation,
            tag,
            shared: Arc::new(CsrShared {
                task_count: AtomicU32::new(0),
                state: AtomicU8::new(CsrState::Idle as u8),
            }),
            stats: Arc::new(CsrStats::new()),
            last: ProgrammedState::default(),
            required_thread_arbitration: ThreadArbitrationPolicy::RoundRobin,
            preamble_sent: false,
            has_shared_handles: false,
            stall_requested: false,
            sip_allocation: None,
            per_dss_buffer: None,
            residency: Vec::new(),
            task_level: 0,
            latest_sent_task_count: 0,
            latest_flushed_task_count: 0,
            last_flush_stamp: 0,
            enqueues_since_submit: 0,
            batch: PendingBatch::default(),
            in_flight: VecDeque::new(),
            last_report: FlushReport::default(),
        })
    }

    pub fn engine(&self) -> EngineId {
        self.engine
    }

    pub fn root_device_index(&self) -> u32 {
        self.engine.root_device_index
    }

    pub fn hw_info(&self) -> &HardwareInfo {
        &self.hw_info
    }

    pub fn memory(&self) -> &Arc<GpuAddressSpace> {
        &self.memory
    }

    pub fn tag(&self) -> &TagCell {
        &self.tag
    }

    pub fn task_count(&self) -> u32 {
        self.shared.task_count.load(Ordering::Acquire)
    }

    pub fn task_level(&self) -> u32 {
        self.task_level
    }

    pub fn latest_sent_task_count(&self) -> u32 {
        self.latest_sent_task_count
    }

    pub fn latest_flushed_task_count(&self) -> u32 {
        self.latest_flushed_task_count
    }

    pub fn state(&self) -> CsrState {
        self.shared.state()
    }

    pub fn stats(&self) -> &Arc<CsrStats> {
        &self.stats
    }

    pub fn last_flush_report(&self) -> &FlushReport {
        &self.last_report
    }

    pub fn observer(&self) -> CsrObserver {
        CsrObserver {
            engine: self.engine,
            tag: self.tag.clone(),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Add `allocation` to the residency list of the next submission.
    pub fn make_resident(&mut self, allocation: &GraphicsAllocation) {
        if !self.residency.iter().any(|a| a.ptr_eq(allocation)) {
            self.residency.push(allocation.clone());
        }
    }

    pub fn request_stalling_pipe_control_on_next_flush(&mut self) {
        self.stall_requested = true;
    }

    /// The next compute-mode decision takes shared handles into account.
    pub fn mark_shared_handles(&mut self) {
        self.has_shared_handles = true;
    }

    fn set_state(&self, state: CsrState) {
        self.shared.state.store(state as u8, Ordering::Release);
    }

    fn fault(&self, err: &CsrError) {
        error!(engine = %self.engine, task_count = self.task_count(), %err, "command stream receiver faulted");
        self.set_state(CsrState::Faulted);
    }

    fn ensure_not_faulted(&self) -> Result<()> {
        if self.state() == CsrState::Faulted {
            return Err(CsrError::Faulted);
        }
        Ok(())
    }

    fn diff(&self, flags: &DispatchFlags) -> CsrSizeRequestFlags {
        let l3_config = self.family.l3_config(flags.use_slm);
        CsrSizeRequestFlags {
            l3_config_changed: l3_config.is_some() && l3_config != self.last.l3_config,
            coherency_request_changed: self.last.requires_coherency
                != Some(flags.requires_coherency),
            preemption_request_changed: flags.preemption_mode != self.last.preemption_mode,
            media_sampler_config_changed: self.last.media_sampler_required
                != Some(flags.pipeline_select_args.media_sampler_required),
            has_shared_handles: self.has_shared_handles,
            num_grf_required_changed: matches!(
                flags.num_grf_required,
                GrfRequirement::Count(count) if count != self.last.num_grf
            ),
            special_pipeline_select_mode_changed: flags
                .pipeline_select_args
                .special_pipeline_select_mode
                != self.last.special_pipeline_select_mode,
        }
    }

    fn compute_mode_required(&self, size_flags: &CsrSizeRequestFlags) -> bool {
        if !self.family.supports_compute_mode() {
            return false;
        }
        let mut fired = ComputeModeTriggers::empty();
        fired.set(ComputeModeTriggers::COHERENCY, size_flags.coherency_request_changed);
        fired.set(ComputeModeTriggers::NUM_GRF, size_flags.num_grf_required_changed);
        fired.set(ComputeModeTriggers::SHARED_HANDLES, size_flags.has_shared_handles);
        fired.intersects(self.compute_mode_triggers)
    }

    fn plan(&self, flags: &DispatchFlags, payload_len: usize) -> DispatchPlan {
        let family = self.family;
        let size_flags = self.diff(flags);
        let l3_config = family.l3_config(flags.use_slm);
        let compute_mode = self.compute_mode_required(&size_flags);
        let preamble = !self.preamble_sent;
        let pipeline_select = preamble
            || size_flags.media_sampler_config_changed
            || size_flags.special_pipeline_select_mode_changed;

        let requested_arbitration = match flags.thread_arbitration_policy {
            ThreadArbitrationPolicy::NotPresent => self.required_thread_arbitration,
            policy => policy,
        };
        let thread_arbitration = (self.last.thread_arbitration != Some(requested_arbitration))
            .then_some(requested_arbitration);

        let mocs_index = family.mocs_index(flags.l3_cache_settings);
        let state_base_address = self.last.mocs_index != Some(mocs_index)
            || self.last.gsba_32bit != Some(flags.gsba_32bit_required);

        let num_grf = match flags.num_grf_required {
            GrfRequirement::Count(count) => count,
            GrfRequirement::NotApplicable => self.last.num_grf,
        };

        let dc_flush = flags.dc_flush || flags.guard_command_buffer_with_pipe_control;
        let tag_update = flags.blocking || dc_flush || flags.memory_migration_required;
        let stall = self.stall_requested || flags.barrier_timestamp_packet_nodes.is_some();
        let wait_points: Vec<(u64, u32)> = flags.csr_dependencies.wait_points().collect();

        let mut state_size = 0;
        if compute_mode {
            state_size += compute_mode_size(family);
        }
        if pipeline_select {
            state_size += pipeline_select_size(family);
        }
        if size_flags.l3_config_changed {
            state_size += l3_config_size(family, flags.use_slm);
        }
        if preamble {
            state_size +=
                preemption::required_preamble_size(self.hw_info.default_preemption_mode);
        }
        if let Some(policy) = thread_arbitration {
            state_size += thread_arbitration_size(family, policy);
        }
        state_size +=
            preemption::required_cmd_stream_size(flags.preemption_mode, self.last.preemption_mode);
        if state_base_address {
            state_size += state_base_address_size();
        }

        let barrier_nodes = flags
            .barrier_timestamp_packet_nodes
            .as_ref()
            .map_or(0, |nodes| nodes.len());
        let barrier_size = if stall {
            pipe_control_size() * barrier_nodes.max(1)
        } else {
            0
        };
        let mut tail_size = batch_buffer_end_size() + CACHE_LINE_SIZE as usize;
        if tag_update {
            tail_size += pipe_control_size();
        }
        if flags.epilogue_required {
            tail_size += family.epilogue_size();
        }
        let estimate = wait_points.len() * semaphore_wait_size()
            + barrier_size
            + state_size
            + payload_len
            + tail_size;

        DispatchPlan {
            size_flags,
            l3_config,
            compute_mode,
            pipeline_select,
            preamble,
            thread_arbitration,
            mocs_index,
            state_base_address,
            stall,
            dc_flush,
            tag_update,
            num_grf,
            wait_points,
            state_size,
            estimate,
        }
    }

    /// Encode `payload` behind whatever state transitions `flags` require and submit it (or
    /// queue it, in batched mode).
    pub fn flush_task(&mut self, payload: &[u8], flags: &DispatchFlags) -> Result<CompletionStamp> {
        self.ensure_not_faulted()?;
        self.release_retired();

        self.set_state(CsrState::Diffing);
        let plan = self.plan(flags, payload.len());

        self.set_state(CsrState::Encoding);
        let stamp = match self.encode_and_submit(payload, flags, &plan) {
            Ok(stamp) => stamp,
            Err(err) => {
                self.fault(&err);
                return Err(err);
            }
        };
        self.commit_programmed_state(flags, &plan);
        self.stats.inc_flushes();
        self.stats.add_state_bytes(plan.state_size as u64);
        self.stats.add_dependency_waits(plan.wait_points.len() as u64);

        debug!(
            engine = %self.engine,
            task_count = stamp.task_count,
            state_bytes = plan.state_size,
            dependency_waits = plan.wait_points.len(),
            payload_bytes = payload.len(),
            tag_update = plan.tag_update,
            "flush_task"
        );

        if flags.blocking {
            match self.wait_for_task_count(stamp.task_count)? {
                WaitStatus::Ready => {}
                WaitStatus::Timeout => {
                    warn!(engine = %self.engine, task_count = stamp.task_count, "blocking flush timed out")
                }
                WaitStatus::GpuHang => {
                    return Err(CsrError::GpuHang {
                        task_count: stamp.task_count,
                    })
                }
            }
        }
        if self.state() != CsrState::Faulted {
            self.set_state(CsrState::Idle);
        }
        Ok(stamp)
    }

    fn encode_and_submit(
        &mut self,
        payload: &[u8],
        flags: &DispatchFlags,
        plan: &DispatchPlan,
    ) -> Result<CompletionStamp> {
        let family = self.family;
        self.stream.ensure_space(plan.estimate)?;
        let start = self.stream.position();

        for &(address, value) in &plan.wait_points {
            program_semaphore_wait(&mut self.stream, address, value)?;
        }

        if plan.stall {
            let barrier_nodes = flags
                .barrier_timestamp_packet_nodes
                .as_ref()
                .map(|container| container.nodes())
                .unwrap_or_default();
            if barrier_nodes.is_empty() {
                program_pipe_control(&mut self.stream, PipeControlArgs::default())?;
            }
            for node in barrier_nodes {
                program_pipe_control_with_post_sync(
                    &mut self.stream,
                    PipeControlArgs::default(),
                    node.gpu_address(),
                    u64::from(node.completion_value()),
                )?;
            }
        }

        let state_start = self.stream.position();
        if plan.compute_mode {
            program_compute_mode(&mut self.stream, family, flags.requires_coherency, plan.num_grf)?;
        }
        if plan.pipeline_select {
            program_pipeline_select(&mut self.stream, family, flags.pipeline_select_args)?;
        }
        if plan.size_flags.l3_config_changed {
            program_l3(&mut self.stream, family, flags.use_slm)?;
        }
        if plan.preamble {
            let sip_address = self.sip_address()?;
            preemption::program_preamble(
                &mut self.stream,
                self.hw_info.default_preemption_mode,
                sip_address,
            )?;
        }
        if flags.use_per_dss_backed_buffer {
            self.ensure_per_dss_backed_buffer()?;
        }
        if let Some(policy) = plan.thread_arbitration {
            program_thread_arbitration(&mut self.stream, family, policy)?;
        }
        preemption::program_cmd_stream(
            &mut self.stream,
            family,
            flags.preemption_mode,
            self.last.preemption_mode,
        )?;
        if plan.state_base_address {
            let general_state_base = if flags.gsba_32bit_required {
                self.memory.base()
            } else {
                0
            };
            program_state_base_address(&mut self.stream, general_state_base, plan.mocs_index)?;
        }
        let state_end = self.stream.position();
        debug_assert_eq!(state_end.segment, state_start.segment);
        debug_assert_eq!(state_end.offset - state_start.offset, plan.state_size);

        self.stream.put(payload)?;

        let task_count = self.task_count() + 1;
        if plan.tag_update {
            program_pipe_control_with_post_sync(
                &mut self.stream,
                PipeControlArgs {
                    dc_flush: plan.dc_flush,
                    tlb_invalidation: flags.memory_migration_required,
                    notify_enable: flags.blocking,
                    ..PipeControlArgs::default()
                },
                self.tag.gpu_address(),
                u64::from(task_count),
            )?;
            self.latest_flushed_task_count = task_count;
            self.task_level += 1;
            self.stats.inc_tag_updates();
        }
        if flags.epilogue_required {
            family.program_epilogue(&mut self.stream)?;
        }
        let batch_end = self.stream.position();
        program_batch_buffer_end(&mut self.stream)?;
        self.stream.align_to(CACHE_LINE_SIZE as usize)?;
        let end = self.stream.position();

        self.shared.task_count.store(task_count, Ordering::Release);
        let mut nodes = TimestampPacketContainer::new();
        for container in flags
            .csr_dependencies
            .timestamp_packet_containers
            .iter()
            .chain(&flags.barrier_timestamp_packet_nodes)
        {
            nodes.assign_and_increment_nodes_ref_counts(container);
        }
        self.in_flight.push_back(InFlight {
            task_count,
            batch_end,
            nodes,
        });

        let flush_stamp = match self.config.dispatch_mode {
            DispatchMode::Immediate => {
                let stamp = self.submit(start, end, flags.throttle, flags.low_priority, flags.slice_count)?;
                if let Some(tracker) = &flags.flush_stamp_reference {
                    tracker.set_stamp(stamp);
                }
                self.latest_sent_task_count = task_count;
                stamp
            }
            DispatchMode::Batched => {
                self.batch.start.get_or_insert(start);
                self.batch.batch_ends.push(batch_end);
                self.batch.trackers.extend(flags.flush_stamp_reference.iter().cloned());
                self.batch.throttle = flags.throttle;
                self.batch.low_priority = flags.low_priority;
                self.batch.slice_count = flags.slice_count;
                self.enqueues_since_submit += 1;
                if self.implicit_flush_required(flags) {
                    self.submit_batch()?
                } else {
                    0
                }
            }
        };
        self.set_state(CsrState::Submitted);

        self.last_report = FlushReport {
            task_count,
            size_flags: plan.size_flags,
            state_bytes: plan.state_size,
            dependency_waits: plan.wait_points.len(),
            payload_bytes: payload.len(),
            tag_update: plan.tag_update,
            estimated_bytes: plan.estimate,
            submitted: self.latest_sent_task_count >= task_count,
        };

        Ok(CompletionStamp {
            task_count,
            task_level: self.task_level,
            flush_stamp,
        })
    }

    fn commit_programmed_state(&mut self, flags: &DispatchFlags, plan: &DispatchPlan) {
        if let Some(l3_config) = plan.l3_config {
            self.last.l3_config = Some(l3_config);
        }
        self.last.requires_coherency = Some(flags.requires_coherency);
        self.last.preemption_mode = flags.preemption_mode;
        self.last.media_sampler_required = Some(flags.pipeline_select_args.media_sampler_required);
        self.last.special_pipeline_select_mode =
            flags.pipeline_select_args.special_pipeline_select_mode;
        self.last.num_grf = plan.num_grf;
        if let Some(policy) = plan.thread_arbitration {
            self.last.thread_arbitration = Some(policy);
            self.required_thread_arbitration = policy;
        }
        self.last.mocs_index = Some(plan.mocs_index);
        self.last.gsba_32bit = Some(flags.gsba_32bit_required);
        self.preamble_sent = true;
        self.has_shared_handles = false;
        self.stall_requested = false;
    }

    fn implicit_flush_required(&self, flags: &DispatchFlags) -> bool {
        let every = self.config.implicit_flush_every;
        flags.implicit_flush
            || flags.blocking
            || (every > 0 && self.enqueues_since_submit >= every)
            || (self.config.flush_on_gpu_idle && self.os.is_idle())
    }

    fn sip_address(&mut self) -> Result<u64> {
        if self.hw_info.default_preemption_mode != PreemptionMode::MidThread {
            return Ok(0);
        }
        if self.sip_allocation.is_none() {
            let allocation = self.memory.allocate(AllocationProperties::new(
                self.hw_info.sip_kernel_size.max(PAGE_SIZE),
                AllocationType::SipKernel,
            ))?;
            self.sip_allocation = Some(allocation);
        }
        Ok(self
            .sip_allocation
            .as_ref()
            .map_or(0, GraphicsAllocation::gpu_address))
    }

    fn ensure_per_dss_backed_buffer(&mut self) -> Result<()> {
        let size = self.hw_info.per_dss_backed_buffer_size * u64::from(self.hw_info.dss_count);
        if self.per_dss_buffer.is_some() || size == 0 {
            return Ok(());
        }
        let allocation = self.memory.allocate(AllocationProperties::new(
            size,
            AllocationType::PerDssBackedBuffer,
        ))?;
        debug!(engine = %self.engine, size, "per-DSS backed buffer created");
        self.per_dss_buffer = Some(allocation);
        Ok(())
    }

    fn submit(
        &mut self,
        start: StreamPosition,
        end: StreamPosition,
        throttle: QueueThrottle,
        low_priority: bool,
        slice_count: u64,
    ) -> Result<FlushStamp> {
        self.stream.commit()?;
        let ranges = self.stream.ranges(start, end)?;

        let mut residency: Vec<GraphicsAllocation> =
            ranges.iter().map(|range| range.allocation.clone()).collect();
        residency.push(self.tag_allocation.clone());
        residency.extend(self.sip_allocation.iter().cloned());
        residency.extend(self.per_dss_buffer.iter().cloned());
        residency.append(&mut self.residency);

        let batch = BatchBuffer {
            engine: self.engine,
            start_gpu_address: self.stream.gpu_address(start)?,
            ranges,
            throttle,
            low_priority,
            slice_count,
            residency,
        };
        let task_count = self.task_count();
        let stamp = self
            .os
            .submit(&batch)
            .map_err(|source| CsrError::Submit { task_count, source })?;
        self.last_flush_stamp = stamp;
        self.stats.inc_submissions();
        trace!(
            engine = %self.engine,
            task_count,
            flush_stamp = stamp,
            bytes = batch.used_bytes(),
            "submitted"
        );
        Ok(stamp)
    }

    fn submit_batch(&mut self) -> Result<FlushStamp> {
        let Some(start) = self.batch.start.take() else {
            return Ok(self.last_flush_stamp);
        };
        let batch = std::mem::take(&mut self.batch);
        if let Some((_, earlier)) = batch.batch_ends.split_last() {
            for position in earlier {
                self.stream.patch(*position, &MI_NOOP.to_le_bytes())?;
            }
        }
        let end = self.stream.position();
        let stamp = self.submit(
            start,
            end,
            batch.throttle,
            batch.low_priority,
            batch.slice_count,
        )?;
        for tracker in &batch.trackers {
            tracker.set_stamp(stamp);
        }
        debug!(
            engine = %self.engine,
            flushes = batch.batch_ends.len(),
            task_count = self.task_count(),
            "batched submissions flushed"
        );
        self.latest_sent_task_count = self.task_count();
        self.enqueues_since_submit = 0;
        Ok(stamp)
    }

    /// Submit every flush still held in the batch.
    pub fn flush_batched_submissions(&mut self) -> Result<()> {
        self.ensure_not_faulted()?;
        if let Err(err) = self.submit_batch() {
            self.fault(&err);
            return Err(err);
        }
        Ok(())
    }

    /// Submit a minimal buffer that writes the current task count to the tag.
    pub fn flush_tag_update(&mut self) -> Result<FlushStamp> {
        self.ensure_not_faulted()?;
        let result = self.submit_batch().and_then(|_| self.encode_tag_update());
        if let Err(err) = &result {
            self.fault(err);
        }
        result
    }

    fn encode_tag_update(&mut self) -> Result<FlushStamp> {
        let task_count = self.task_count();
        self.stream.ensure_space(
            pipe_control_size() + batch_buffer_end_size() + CACHE_LINE_SIZE as usize,
        )?;
        let start = self.stream.position();
        program_pipe_control_with_post_sync(
            &mut self.stream,
            PipeControlArgs {
                dc_flush: true,
                ..PipeControlArgs::default()
            },
            self.tag.gpu_address(),
            u64::from(task_count),
        )?;
        program_batch_buffer_end(&mut self.stream)?;
        self.stream.align_to(CACHE_LINE_SIZE as usize)?;
        let end = self.stream.position();

        let stamp = self.submit(start, end, QueueThrottle::Medium, false, 0)?;
        self.latest_flushed_task_count = task_count;
        self.latest_sent_task_count = task_count;
        self.stats.inc_tag_updates();
        debug!(engine = %self.engine, task_count, "tag update flushed");
        Ok(stamp)
    }

    /// Block until the tag reaches `task_count`, flushing whatever is needed for that to
    /// happen first.
    pub fn wait_for_task_count(&mut self, task_count: u32) -> Result<WaitStatus> {
        if self.state() == CsrState::Faulted {
            return Ok(WaitStatus::GpuHang);
        }
        let issued = self.task_count();
        if task_count > issued {
            return Err(CsrError::TaskCountNotIssued {
                requested: task_count,
                issued,
            });
        }
        if self.tag.is_at_least(task_count) {
            self.release_retired();
            return Ok(WaitStatus::Ready);
        }
        if self.latest_sent_task_count < task_count {
            self.flush_batched_submissions()?;
        }
        if self.latest_flushed_task_count < task_count {
            self.flush_tag_update()?;
        }

        self.stats.inc_cpu_waits();
        let status = self.poll_then_wait(task_count);
        match status {
            WaitStatus::Ready => self.release_retired(),
            WaitStatus::Timeout => {
                self.stats.inc_wait_timeouts();
                warn!(
                    engine = %self.engine,
                    task_count,
                    observed = self.tag.load(),
                    "wait for task count timed out"
                );
            }
            WaitStatus::GpuHang => self.fault(&CsrError::GpuHang { task_count }),
        }
        Ok(status)
    }

    fn poll_then_wait(&self, task_count: u32) -> WaitStatus {
        let poll_deadline = Instant::now() + self.config.wait.poll_timeout();
        let mut spins = 0u32;
        while Instant::now() < poll_deadline {
            if self.tag.is_at_least(task_count) {
                return WaitStatus::Ready;
            }
            spins += 1;
            if spins < 256 {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }

        let outcome = self
            .os
            .wait_on_completion(self.last_flush_stamp, self.config.wait.kmd_wait_timeout());
        match outcome {
            WaitOutcome::DeviceLost => WaitStatus::GpuHang,
            WaitOutcome::Completed | WaitOutcome::TimedOut if self.tag.is_at_least(task_count) => {
                WaitStatus::Ready
            }
            WaitOutcome::Completed | WaitOutcome::TimedOut => WaitStatus::Timeout,
        }
    }

    /// Drop dependency holds and command-buffer segments of retired flushes.
    fn release_retired(&mut self) {
        let observed = self.tag.load();
        let mut release_before = None;
        while self
            .in_flight
            .front()
            .is_some_and(|entry| entry.task_count <= observed)
        {
            if let Some(entry) = self.in_flight.pop_front() {
                release_before = Some(entry.batch_end);
            }
        }
        if let Some(position) = release_before {
            self.stream.release_segments_before(position);
        }
    }
}

impl Drop for CommandStreamReceiver {
    fn drop(&mut self) {
        for allocation in self
            .sip_allocation
            .take()
            .into_iter()
            .chain(self.per_dss_buffer.take())
        {
            self.memory.free(&allocation);
        }
        self.memory.free(&self.tag_allocation);
    }
}

impl std::fmt::Debug for CommandStreamReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandStreamReceiver")
            .field("engine", &self.engine)
            .field("family", &self.family.name())
            .field("state", &self.state())
            .field("task_count", &self.task_count())
            .field("tag", &self.tag.load())
            .field("latest_sent_task_count", &self.latest_sent_task_count)
            .field("latest_flushed_task_count", &self.latest_flushed_task_count)
            .field("stream", &self.stream)
            .finish()
    }
}
