use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use gfx_csr::{
    CommandStreamReceiver, CsrConfig, CsrDependencies, DispatchFlags, EngineId, EngineType,
    GrfRequirement, PayloadBuilder, QueueThrottle, SimConfig, SimulatedEngine, WaitStatus,
};
use gfx_hw::{
    GfxCoreFamily, HardwareInfo, L3CachingSettings, PipelineSelectArgs, PreemptionMode,
    ThreadArbitrationPolicy,
};
use gfx_memory::{AllocationProperties, AllocationType, GpuAddressSpace, GraphicsAllocation};
use gfx_migration::{
    CsrTransferQueue, MigrationContext, MigrationController, MigrationError,
    MultiGraphicsAllocation, LOCATION_UNDEFINED,
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

struct Device {
    memory: Arc<GpuAddressSpace>,
    sim: Arc<SimulatedEngine>,
    csr: CommandStreamReceiver,
}

fn device(root: u32, engine_type: EngineType, sim: SimConfig) -> Device {
    let memory = Arc::new(GpuAddressSpace::new(root));
    device_on(&memory, engine_type, sim)
}

fn device_on(memory: &Arc<GpuAddressSpace>, engine_type: EngineType, sim: SimConfig) -> Device {
    let id = EngineId::new(memory.root_device_index(), engine_type, 0);
    let sim = Arc::new(SimulatedEngine::new(id, Arc::clone(memory), sim));
    let csr = CommandStreamReceiver::new(
        id,
        HardwareInfo::for_family(GfxCoreFamily::Gen12Lp),
        Arc::clone(memory),
        sim.clone(),
        CsrConfig::default(),
    )
    .unwrap();
    Device {
        memory: Arc::clone(memory),
        sim,
        csr,
    }
}

fn buffer(memory: &GpuAddressSpace, size: u64, lockable: bool) -> GraphicsAllocation {
    memory
        .allocate(AllocationProperties::new(size, AllocationType::Buffer).with_lockable(lockable))
        .unwrap()
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

fn contents(allocation: &GraphicsAllocation) -> Vec<u8> {
    let mut bytes = vec![0; allocation.size() as usize];
    allocation.read(0, &mut bytes).unwrap();
    bytes
}

#[test]
fn first_placement_adopts_target_without_copies() {
    let root0 = device(0, EngineType::Compute, SimConfig::default());
    let root1 = device(1, EngineType::Compute, SimConfig::default());
    let mut multi = MultiGraphicsAllocation::new([
        buffer(&root0.memory, 0x1000, true),
        buffer(&root1.memory, 0x1000, true),
    ])
    .unwrap();
    let sync = multi.register_for_migration(LOCATION_UNDEFINED);
    let context = MigrationContext::new();

    MigrationController::handle_migration(&context, &root1.csr, &multi).unwrap();

    assert_eq!(sync.current_location(), 1);
    assert_eq!(context.stats().migrations, 0);
    assert_eq!(context.stats().cpu_copies, 0);
    let usage = sync.last_usage().clone().unwrap();
    assert_eq!(usage.task_count, root1.csr.task_count() + 1);
    assert!(sync.is_used_by(root1.csr.tag()));
}

#[test]
fn repeated_handle_migration_is_a_no_op() {
    let root0 = device(0, EngineType::Compute, SimConfig::default());
    let root1 = device(1, EngineType::Compute, SimConfig::default());
    let source = buffer(&root0.memory, 0x2000, true);
    let data = pattern(0x2000, 7);
    source.write(0, &data).unwrap();
    let mut multi =
        MultiGraphicsAllocation::new([source, buffer(&root1.memory, 0x2000, true)]).unwrap();
    let sync = multi.register_for_migration(0);
    let context = MigrationContext::new();

    MigrationController::handle_migration(&context, &root1.csr, &multi).unwrap();
    assert_eq!(sync.current_location(), 1);
    assert_eq!(contents(multi.get(1).unwrap()), data);
    assert_eq!(context.stats().migrations, 1);
    assert_eq!(context.stats().cpu_copies, 2);

    let before = (
        root0.memory.stats().snapshot(),
        root1.memory.stats().snapshot(),
        context.stats(),
    );
    MigrationController::handle_migration(&context, &root1.csr, &multi).unwrap();
    let after = (
        root0.memory.stats().snapshot(),
        root1.memory.stats().snapshot(),
        context.stats(),
    );
    assert_eq!(before, after);
}

#[test]
fn cross_root_migration_waits_for_the_previous_user() {
    let mut root0 = device(
        0,
        EngineType::Compute,
        SimConfig {
            start_paused: true,
            ..SimConfig::default()
        },
    );
    let root1 = device(1, EngineType::Compute, SimConfig::default());
    let mut multi = MultiGraphicsAllocation::new([
        buffer(&root0.memory, 0x1000, true),
        buffer(&root1.memory, 0x1000, true),
    ])
    .unwrap();
    let sync = multi.register_for_migration(0);
    let context = MigrationContext::new();

    // A dispatch on root 0 writes the allocation, but its engine is gated.
    MigrationController::handle_migration(&context, &root0.csr, &multi).unwrap();
    let mut payload = PayloadBuilder::new();
    payload
        .store_dword(multi.get(0).unwrap().gpu_address(), 0x5eed)
        .unwrap();
    let stamp = root0
        .csr
        .flush_task(
            payload.as_bytes(),
            &DispatchFlags {
                memory_migration_required: true,
                ..flags()
            },
        )
        .unwrap();
    assert_eq!(sync.last_usage().clone().unwrap().task_count, stamp.task_count);

    thread::scope(|scope| {
        let migration =
            scope.spawn(|| MigrationController::handle_migration(&context, &root1.csr, &multi));
        thread::sleep(Duration::from_millis(20));
        assert!(!migration.is_finished());
        assert_eq!(sync.current_location(), 0);

        root0.sim.resume();
        migration.join().unwrap().unwrap();
    });

    assert_eq!(context.stats().cpu_waits, 1);
    assert_eq!(sync.current_location(), 1);
    assert_eq!(multi.get(1).unwrap().read_u32(0).unwrap(), 0x5eed);
    assert_eq!(
        root0.csr.wait_for_task_count(stamp.task_count).unwrap(),
        WaitStatus::Ready
    );
}

#[test]
fn same_csr_migration_never_waits() {
    let mut root1 = device(
        1,
        EngineType::Compute,
        SimConfig {
            start_paused: true,
            ..SimConfig::default()
        },
    );
    let root0 = device(0, EngineType::Compute, SimConfig::default());
    let mut multi = MultiGraphicsAllocation::new([
        buffer(&root0.memory, 0x1000, true),
        buffer(&root1.memory, 0x1000, true),
    ])
    .unwrap();
    let sync = multi.register_for_migration(1);
    let context = MigrationContext::new();

    // Outstanding, never-retiring work on root 1 is the last usage.
    MigrationController::handle_migration(&context, &root1.csr, &multi).unwrap();
    root1
        .csr
        .flush_task(
            &[],
            &DispatchFlags {
                memory_migration_required: true,
                ..flags()
            },
        )
        .unwrap();

    // Someone moved the data away without dispatching; coming back needs no wait.
    assert!(MigrationController::migrate_memory(&context, &multi, 0).unwrap());
    MigrationController::handle_migration(&context, &root1.csr, &multi).unwrap();

    assert_eq!(sync.current_location(), 1);
    assert_eq!(context.stats().cpu_waits, 0);
    assert_eq!(context.stats().migrations, 2);
    root1.sim.resume();
}

#[test]
fn migration_in_progress_is_not_repeated() {
    let root0 = device(0, EngineType::Compute, SimConfig::default());
    let root1 = device(1, EngineType::Compute, SimConfig::default());
    let mut multi = MultiGraphicsAllocation::new([
        buffer(&root0.memory, 0x1000, true),
        buffer(&root1.memory, 0x1000, true),
    ])
    .unwrap();
    let sync = multi.register_for_migration(0);
    let context = MigrationContext::new();

    let guard = sync.try_start_migration().unwrap();
    assert!(!MigrationController::migrate_memory(&context, &multi, 1).unwrap());
    assert_eq!(sync.current_location(), 0);
    assert_eq!(context.stats().skipped_in_progress, 1);
    assert_eq!(context.stats().cpu_copies, 0);
    drop(guard);

    assert!(MigrationController::migrate_memory(&context, &multi, 1).unwrap());
    assert_eq!(sync.current_location(), 1);
}

#[test]
fn unlockable_backings_move_through_gpu_copies() -> anyhow::Result<()> {
    let root0 = device(0, EngineType::Compute, SimConfig::default());
    let root1 = device(1, EngineType::Compute, SimConfig::default());
    let context = MigrationContext::new();
    for compute in [&root0, &root1] {
        let copy = device_on(&compute.memory, EngineType::Copy, SimConfig::default());
        let csr = Arc::new(Mutex::new(copy.csr));
        context.register_transfer_queue(Arc::new(CsrTransferQueue::new(csr, 0x1000)?));
    }

    let source = buffer(&root0.memory, 0x3000, false);
    let data = pattern(0x3000, 3);
    source.write(0, &data)?;
    let mut multi =
        MultiGraphicsAllocation::new([source, buffer(&root1.memory, 0x3000, false)])?;
    multi.register_for_migration(0);

    assert!(MigrationController::migrate_memory(&context, &multi, 1)?);

    assert_eq!(contents(multi.get(1).unwrap()), data);
    assert_eq!(context.stats().gpu_copies, 2);
    assert_eq!(context.stats().cpu_copies, 0);
    Ok(())
}

#[test]
fn unlockable_backing_without_queue_is_an_error() {
    let root0 = device(0, EngineType::Compute, SimConfig::default());
    let root1 = device(1, EngineType::Compute, SimConfig::default());
    let mut multi = MultiGraphicsAllocation::new([
        buffer(&root0.memory, 0x1000, false),
        buffer(&root1.memory, 0x1000, true),
    ])
    .unwrap();
    let sync = multi.register_for_migration(0);

    let err = MigrationController::migrate_memory(&MigrationContext::new(), &multi, 1).unwrap_err();
    assert!(matches!(
        err,
        MigrationError::NoTransferQueue {
            root_device_index: 0
        }
    ));
    assert_eq!(sync.current_location(), 0);
    assert!(!sync.is_migration_in_progress());
}

#[test]
fn unregistered_allocation_is_rejected() {
    let root0 = device(0, EngineType::Compute, SimConfig::default());
    let multi = MultiGraphicsAllocation::new([buffer(&root0.memory, 0x1000, true)]).unwrap();
    assert!(matches!(
        MigrationController::handle_migration(&MigrationContext::new(), &root0.csr, &multi),
        Err(MigrationError::NotRegistered)
    ));
}
