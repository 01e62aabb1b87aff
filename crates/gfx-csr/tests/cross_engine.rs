use std::sync::Arc;
use std::thread;
use std::time::Duration;

use gfx_csr::{
    CommandStreamReceiver, CsrConfig, CsrDependencies, DispatchFlags, EngineId, EngineType,
    GrfRequirement, PayloadBuilder, QueueThrottle, SimConfig, SimulatedEngine,
    TaskCountDependency, WaitStatus,
};
use gfx_hw::{
    GfxCoreFamily, HardwareInfo, L3CachingSettings, PipelineSelectArgs, PreemptionMode,
    ThreadArbitrationPolicy,
};
use gfx_memory::{AllocationProperties, AllocationType, GpuAddressSpace, GpuMemory};

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

struct Engine {
    sim: Arc<SimulatedEngine>,
    csr: CommandStreamReceiver,
}

fn engine(memory: &Arc<GpuAddressSpace>, index: u32, sim: SimConfig, config: CsrConfig) -> Engine {
    let id = EngineId::new(0, EngineType::Compute, index);
    let sim = Arc::new(SimulatedEngine::new(id, Arc::clone(memory), sim));
    let csr = CommandStreamReceiver::new(
        id,
        HardwareInfo::for_family(GfxCoreFamily::Gen12Lp),
        Arc::clone(memory),
        sim.clone(),
        config,
    )
    .unwrap();
    Engine { sim, csr }
}

#[test]
fn consumer_waits_for_gated_producer() {
    let memory = Arc::new(GpuAddressSpace::new(0));
    let scratch = memory
        .allocate(AllocationProperties::new(0x1000, AllocationType::Buffer))
        .unwrap();
    let produced = scratch.gpu_address();
    let consumed = produced + 4;

    let mut producer = engine(
        &memory,
        0,
        SimConfig {
            start_paused: true,
            ..SimConfig::default()
        },
        CsrConfig::default(),
    );
    let mut consumer = engine(&memory, 1, SimConfig::default(), CsrConfig::default());

    let mut payload = PayloadBuilder::new();
    payload.store_dword(produced, 0xAB).unwrap();
    let produced_stamp = producer
        .csr
        .flush_task(
            payload.as_bytes(),
            &DispatchFlags {
                dc_flush: true,
                ..flags()
            },
        )
        .unwrap();

    // The consumer copies whatever the producer wrote.
    let mut payload = PayloadBuilder::new();
    payload.copy_dwords(consumed, produced, 4).unwrap();
    let dependency = TaskCountDependency {
        tag: producer.csr.tag().clone(),
        task_count: produced_stamp.task_count,
    };
    let consumed_stamp = consumer
        .csr
        .flush_task(
            payload.as_bytes(),
            &DispatchFlags {
                csr_dependencies: CsrDependencies {
                    timestamp_packet_containers: Vec::new(),
                    task_count_container: vec![dependency],
                },
                dc_flush: true,
                ..flags()
            },
        )
        .unwrap();

    thread::sleep(Duration::from_millis(20));
    assert_eq!(memory.read_u32(consumed).unwrap(), 0);
    assert!(!consumer.csr.tag().is_at_least(consumed_stamp.task_count));

    producer.sim.resume();
    assert_eq!(
        consumer.csr.wait_for_task_count(consumed_stamp.task_count),
        Ok(WaitStatus::Ready)
    );
    assert_eq!(memory.read_u32(consumed).unwrap(), 0xAB);
    assert!(!consumer.sim.is_device_lost());
}

#[test]
fn small_segments_chain_under_load() {
    let memory = Arc::new(GpuAddressSpace::new(0));
    let scratch = memory
        .allocate(AllocationProperties::new(0x1000, AllocationType::Buffer))
        .unwrap();
    let mut engine = engine(
        &memory,
        0,
        SimConfig::default(),
        CsrConfig {
            command_buffer_size: 0x1000,
            ..CsrConfig::default()
        },
    );

    let mut last = 0;
    for i in 0..256u64 {
        let mut payload = PayloadBuilder::new();
        for slot in 0..8u64 {
            payload
                .store_dword(scratch.gpu_address() + slot * 4, (i * 8 + slot) as u32)
                .unwrap();
        }
        last = engine
            .csr
            .flush_task(
                payload.as_bytes(),
                &DispatchFlags {
                    dc_flush: i % 16 == 15,
                    ..flags()
                },
            )
            .unwrap()
            .task_count;
    }

    assert_eq!(engine.csr.wait_for_task_count(last), Ok(WaitStatus::Ready));
    for slot in 0..8u64 {
        assert_eq!(
            memory.read_u32(scratch.gpu_address() + slot * 4).unwrap(),
            (255 * 8 + slot) as u32
        );
    }
    assert!(!engine.sim.is_device_lost());
    assert_eq!(engine.csr.stats().snapshot().flushes, 256);
}
