//! Unified allocations driven through recorded protection and manual fault dispatch.

use std::sync::Arc;

use gfx_csr::{
    CommandStreamReceiver, CsrConfig, CsrDependencies, DispatchFlags, EngineId, EngineType,
    GrfRequirement, PayloadBuilder, QueueThrottle, SimConfig, SimulatedEngine, WaitStatus,
};
use gfx_hw::{
    GfxCoreFamily, HardwareInfo, L3CachingSettings, PipelineSelectArgs, PreemptionMode,
    ThreadArbitrationPolicy,
};
use gfx_memory::{AllocationProperties, AllocationType, GpuAddressSpace};
use gfx_migration::{MigrationContext, MultiGraphicsAllocation, UnifiedAllocation};
use gfx_pagefault::{
    dispatch_fault, AllocationDomain, ManualDispatch, PageFaultConfig, PageFaultManager,
    RecordingProtection,
};
use pretty_assertions::assert_eq;

fn flags() -> DispatchFlags {
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

fn csr(memory: &Arc<GpuAddressSpace>) -> CommandStreamReceiver {
    let id = EngineId::new(memory.root_device_index(), EngineType::Compute, 0);
    let sim = Arc::new(SimulatedEngine::new(id, Arc::clone(memory), SimConfig::default()));
    CommandStreamReceiver::new(
        id,
        HardwareInfo::for_family(GfxCoreFamily::Gen12Lp),
        Arc::clone(memory),
        sim,
        CsrConfig::default(),
    )
    .unwrap()
}

fn manager() -> (Arc<PageFaultManager>, Arc<RecordingProtection>) {
    let protection = Arc::new(RecordingProtection::new());
    let manager = PageFaultManager::new(
        PageFaultConfig {
            install_signal_handler: false,
            ..PageFaultConfig::default()
        },
        protection.clone(),
        Arc::new(ManualDispatch),
    )
    .unwrap();
    (Arc::new(manager), protection)
}

fn backing(memories: &[&Arc<GpuAddressSpace>]) -> MultiGraphicsAllocation {
    MultiGraphicsAllocation::new(memories.iter().map(|memory| {
        memory
            .allocate(AllocationProperties::new(0x1000, AllocationType::UnifiedShared))
            .unwrap()
    }))
    .unwrap()
}

fn store(
    csr: &mut CommandStreamReceiver,
    gpu_address: u64,
    value: u32,
    flags: &DispatchFlags,
) -> u32 {
    let mut payload = PayloadBuilder::new();
    payload.store_dword(gpu_address, value).unwrap();
    csr.flush_task(payload.as_bytes(), flags).unwrap().task_count
}

#[test]
fn cpu_gpu_cpu_round_trip() {
    let (manager, protection) = manager();
    let memory = Arc::new(GpuAddressSpace::new(0));
    let mut csr = csr(&memory);
    let context = Arc::new(MigrationContext::new());
    let unified =
        UnifiedAllocation::new(Arc::clone(&manager), Arc::clone(&context), backing(&[&memory]))
            .unwrap();
    let ptr = unified.host().as_ptr();
    assert!(protection.is_protected(ptr));
    assert_eq!(manager.domain(ptr), Some(AllocationDomain::None));

    // First CPU touch: no data anywhere yet, so nothing moves.
    assert!(dispatch_fault(ptr));
    unified.host().write_u32(0, 11).unwrap();
    assert_eq!(manager.domain(ptr), Some(AllocationDomain::Cpu));
    assert_eq!(context.stats().cpu_copies, 0);

    let mut dispatch = flags();
    let target = unified.prepare_for_dispatch(&mut csr, &mut dispatch).unwrap();
    assert!(dispatch.memory_migration_required);
    assert_eq!(unified.sync_data().current_location(), 0);
    assert_eq!(manager.domain(ptr), Some(AllocationDomain::Gpu));
    assert!(protection.is_protected(ptr));
    assert_eq!(target.read_u32(0).unwrap(), 11);

    let task_count = store(&mut csr, target.gpu_address() + 4, 42, &dispatch);
    assert_eq!(
        unified.sync_data().last_usage().clone().unwrap().task_count,
        task_count
    );

    // CPU read after the kernel: fault, wait for the dispatch, copy back.
    assert!(dispatch_fault(ptr + 4));
    assert_eq!(manager.domain(ptr), Some(AllocationDomain::Cpu));
    assert_eq!(unified.host().read_u32(0).unwrap(), 11);
    assert_eq!(unified.host().read_u32(4).unwrap(), 42);
    assert!(!protection.is_protected(ptr));
    assert_eq!(csr.wait_for_task_count(task_count).unwrap(), WaitStatus::Ready);
}

#[test]
fn dispatches_on_two_roots_hand_the_data_across() {
    let (manager, _) = manager();
    let memory0 = Arc::new(GpuAddressSpace::new(0));
    let memory1 = Arc::new(GpuAddressSpace::new(1));
    let mut csr0 = csr(&memory0);
    let mut csr1 = csr(&memory1);
    let context = Arc::new(MigrationContext::new());
    let unified = UnifiedAllocation::new(
        Arc::clone(&manager),
        Arc::clone(&context),
        backing(&[&memory0, &memory1]),
    )
    .unwrap();
    let ptr = unified.host().as_ptr();

    let mut dispatch = flags();
    let on0 = unified.prepare_for_dispatch(&mut csr0, &mut dispatch).unwrap();
    store(&mut csr0, on0.gpu_address(), 1, &dispatch);

    let mut dispatch = flags();
    let on1 = unified.prepare_for_dispatch(&mut csr1, &mut dispatch).unwrap();
    assert_eq!(context.stats().cpu_waits, 1);
    assert_eq!(context.stats().migrations, 1);
    assert_eq!(on1.read_u32(0).unwrap(), 1);
    store(&mut csr1, on1.gpu_address() + 4, 2, &dispatch);

    assert!(dispatch_fault(ptr));
    assert_eq!(unified.host().read_u32(0).unwrap(), 1);
    assert_eq!(unified.host().read_u32(4).unwrap(), 2);
    assert_eq!(unified.sync_data().current_location(), 1);
}

#[test]
fn dropping_the_allocation_untracks_it() {
    let (manager, protection) = manager();
    let memory = Arc::new(GpuAddressSpace::new(0));
    let unified = UnifiedAllocation::new(
        Arc::clone(&manager),
        Arc::new(MigrationContext::new()),
        backing(&[&memory]),
    )
    .unwrap();
    let ptr = unified.host().as_ptr();
    assert_eq!(manager.tracked_ranges(), 1);

    drop(unified);

    assert_eq!(manager.tracked_ranges(), 0);
    assert!(!protection.is_protected(ptr));
}

#[test]
fn host_owned_data_goes_straight_to_the_dispatching_device() {
    let (manager, _) = manager();
    let memory0 = Arc::new(GpuAddressSpace::new(0));
    let memory1 = Arc::new(GpuAddressSpace::new(1));
    let mut csr0 = csr(&memory0);
    let mut csr1 = csr(&memory1);
    let context = Arc::new(MigrationContext::new());
    let unified = UnifiedAllocation::new(
        Arc::clone(&manager),
        Arc::clone(&context),
        backing(&[&memory0, &memory1]),
    )
    .unwrap();
    let ptr = unified.host().as_ptr();

    let mut dispatch = flags();
    let on0 = unified.prepare_for_dispatch(&mut csr0, &mut dispatch).unwrap();
    let task_count = store(&mut csr0, on0.gpu_address(), 5, &dispatch);

    // Back on the CPU after the kernel, then overwritten there.
    assert!(dispatch_fault(ptr));
    assert_eq!(unified.host().read_u32(0).unwrap(), 5);
    unified.host().write_u32(0, 99).unwrap();
    let before = context.stats();

    let mut dispatch = flags();
    let on1 = unified.prepare_for_dispatch(&mut csr1, &mut dispatch).unwrap();
    let after = context.stats();

    // One host-to-device copy and nothing else: root 0's copy is stale.
    assert_eq!(after.migrations, before.migrations);
    assert_eq!(after.cpu_waits, before.cpu_waits);
    assert_eq!(after.cpu_copies, before.cpu_copies + 1);
    assert_eq!(after.gpu_copies, before.gpu_copies);
    assert_eq!(on1.read_u32(0).unwrap(), 99);
    assert_eq!(on0.read_u32(0).unwrap(), 5);

    assert_eq!(unified.sync_data().current_location(), 1);
    let usage = unified.sync_data().last_usage().clone().unwrap();
    assert_eq!(usage.root_device_index, 1);
    assert_eq!(usage.task_count, csr1.task_count() + 1);
    assert_eq!(manager.domain(ptr), Some(AllocationDomain::Gpu));
    assert_eq!(csr0.wait_for_task_count(task_count).unwrap(), WaitStatus::Ready);
}
