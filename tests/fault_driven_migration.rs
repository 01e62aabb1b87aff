//! Unified memory through real page protection: CPU touch, GPU dispatch, CPU read back.

#![cfg(target_os = "linux")]

mod common;

use gfx_umd::csr::{EngineType, PayloadBuilder, SimConfig, WaitStatus};
use gfx_umd::hw::{GfxCoreFamily, HardwareInfo};
use gfx_umd::pagefault::AllocationDomain;
use gfx_umd::{EnvironmentConfig, ExecutionEnvironment, PageFaultBackend};
use pretty_assertions::assert_eq;

use common::flags;

fn environment() -> ExecutionEnvironment {
    ExecutionEnvironment::new(EnvironmentConfig {
        root_devices: vec![
            HardwareInfo::for_family(GfxCoreFamily::Gen12Lp),
            HardwareInfo::for_family(GfxCoreFamily::XeHpg),
        ],
        page_fault_backend: PageFaultBackend::Host,
        ..EnvironmentConfig::default()
    })
    .unwrap()
}

#[test]
fn cpu_write_gpu_dispatch_cpu_read() -> anyhow::Result<()> {
    let env = environment();
    let manager = env.page_fault_manager()?.clone();
    let mut engine = env.create_simulated_engine(0, EngineType::Compute, 0, SimConfig::default())?;
    let unified = env.allocate_unified(0x1000)?;
    let ptr = unified.host().as_ptr();
    let sync = unified.sync_data().clone();
    assert_eq!(manager.domain(ptr), Some(AllocationDomain::None));

    // (1) First CPU write: claimed fault, CPU-owned, nothing migrated.
    unified.host().write_u32(0, 7)?;
    assert_eq!(manager.domain(ptr), Some(AllocationDomain::Cpu));
    assert_eq!(sync.current_location(), gfx_umd::migration::LOCATION_UNDEFINED);
    assert_eq!(env.migration_context().stats().migrations, 0);
    assert_eq!(env.migration_context().stats().cpu_copies, 0);

    // (2) Dispatch on root 0: data lands there and the host pages are protected again.
    let mut dispatch = flags();
    let target = unified.prepare_for_dispatch(&mut engine.csr, &mut dispatch)?;
    assert_eq!(sync.current_location(), 0);
    assert_eq!(manager.domain(ptr), Some(AllocationDomain::Gpu));
    assert_eq!(target.read_u32(0)?, 7);

    let mut payload = PayloadBuilder::new();
    payload.store_dword(target.gpu_address(), 0xfeed)?;
    let stamp = engine.csr.flush_task(payload.as_bytes(), &dispatch)?;

    // (3) CPU read: faults, waits for the dispatch and sees what the GPU wrote.
    let faults_before = manager.stats().faults_claimed;
    assert_eq!(unified.host().read_u32(0)?, 0xfeed);
    assert_eq!(manager.stats().faults_claimed, faults_before + 1);
    assert_eq!(manager.domain(ptr), Some(AllocationDomain::Cpu));
    assert_eq!(engine.csr.wait_for_task_count(stamp.task_count)?, WaitStatus::Ready);
    Ok(())
}

#[test]
fn data_follows_dispatches_across_root_devices() -> anyhow::Result<()> {
    let env = environment();
    let mut on0 = env.create_simulated_engine(0, EngineType::Compute, 0, SimConfig::default())?;
    let mut on1 = env.create_simulated_engine(1, EngineType::Compute, 0, SimConfig::default())?;
    let unified = env.allocate_unified(0x2000)?;

    unified.host().write_u32(0x1000, 1)?;

    let mut dispatch = flags();
    let backing = unified.prepare_for_dispatch(&mut on0.csr, &mut dispatch)?;
    let mut payload = PayloadBuilder::new();
    payload.store_dword(backing.gpu_address() + 0x1004, 2)?;
    on0.csr.flush_task(payload.as_bytes(), &dispatch)?;

    let mut dispatch = flags();
    let backing = unified.prepare_for_dispatch(&mut on1.csr, &mut dispatch)?;
    let mut payload = PayloadBuilder::new();
    payload.store_dword(backing.gpu_address() + 0x1008, 3)?;
    on1.csr.flush_task(payload.as_bytes(), &dispatch)?;

    let mut words = [0u8; 12];
    unified.host().read(0x1000, &mut words)?;
    assert_eq!(words, [1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0]);
    assert_eq!(unified.sync_data().current_location(), 1);
    assert_eq!(env.migration_context().stats().migrations, 1);
    assert_eq!(env.migration_context().stats().cpu_waits, 1);
    Ok(())
}
