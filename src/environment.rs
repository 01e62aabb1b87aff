use std::sync::Arc;

use gfx_csr::{
    CommandStreamReceiver, CsrConfig, EngineId, EngineType, OsInterface, SimConfig,
    SimulatedEngine,
};
use gfx_hw::HardwareInfo;
use gfx_memory::{AllocationProperties, AllocationType, GpuAddressSpace};
use gfx_migration::{MigrationContext, MultiGraphicsAllocation, UnifiedAllocation};
use gfx_pagefault::{ManualDispatch, NoProtection, PageFaultManager};
use tracing::{debug, info};

use crate::{EnvironmentConfig, EnvironmentError, PageFaultBackend, Result};

/// Hardware description and address space of one root device.
#[derive(Debug)]
pub struct RootDeviceEnvironment {
    index: u32,
    hw_info: HardwareInfo,
    memory: Arc<GpuAddressSpace>,
}

impl RootDeviceEnvironment {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn hw_info(&self) -> &HardwareInfo {
        &self.hw_info
    }

    pub fn memory(&self) -> &Arc<GpuAddressSpace> {
        &self.memory
    }
}

/// A CSR together with the software engine executing its submissions.
pub struct Engine {
    pub sim: Arc<SimulatedEngine>,
    pub csr: CommandStreamReceiver,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("engine", &self.csr.engine())
            .field("task_count", &self.csr.task_count())
            .finish()
    }
}

/// Process state the driver core would otherwise keep in globals: configuration, root
/// devices, the page fault manager and the migration context.
///
/// Created once and passed by reference; [`ExecutionEnvironment::shutdown`] (or drop)
/// releases the page fault manager and with it the signal handler.
pub struct ExecutionEnvironment {
    config: EnvironmentConfig,
    root_devices: Vec<RootDeviceEnvironment>,
    page_fault_manager: Option<Arc<PageFaultManager>>,
    migration: Arc<MigrationContext>,
}

impl ExecutionEnvironment {
    pub fn new(config: EnvironmentConfig) -> Result<Self> {
        if config.root_devices.is_empty() {
            return Err(EnvironmentError::NoRootDevices);
        }
        let root_devices = config
            .root_devices
            .iter()
            .zip(0u32..)
            .map(|(hw_info, index)| RootDeviceEnvironment {
                index,
                hw_info: hw_info.clone(),
                memory: Arc::new(GpuAddressSpace::new(index)),
            })
            .collect::<Vec<_>>();
        let page_fault_manager = create_page_fault_manager(&config)?.map(Arc::new);

        info!(
            root_devices = root_devices.len(),
            page_fault_backend = ?config.page_fault_backend,
            "execution environment created"
        );
        Ok(Self {
            config,
            root_devices,
            page_fault_manager,
            migration: Arc::new(MigrationContext::new()),
        })
    }

    pub fn config(&self) -> &EnvironmentConfig {
        &self.config
    }

    pub fn root_devices(&self) -> &[RootDeviceEnvironment] {
        &self.root_devices
    }

    pub fn root_device(&self, index: u32) -> Result<&RootDeviceEnvironment> {
        self.root_devices
            .get(index as usize)
            .ok_or(EnvironmentError::NoSuchRootDevice(index))
    }

    pub fn page_fault_manager(&self) -> Result<&Arc<PageFaultManager>> {
        self.page_fault_manager
            .as_ref()
            .ok_or(EnvironmentError::PageFaultsDisabled)
    }

    pub fn migration_context(&self) -> &Arc<MigrationContext> {
        &self.migration
    }

    /// CSR for `engine` submitting through `os`, configured from the environment.
    pub fn create_csr(
        &self,
        engine: EngineId,
        os: Arc<dyn OsInterface>,
        config: Option<CsrConfig>,
    ) -> Result<CommandStreamReceiver> {
        let root = self.root_device(engine.root_device_index)?;
        let csr = CommandStreamReceiver::new(
            engine,
            root.hw_info.clone(),
            Arc::clone(&root.memory),
            os,
            config.unwrap_or_else(|| self.config.csr.clone()),
        )?;
        debug!(%engine, family = ?root.hw_info.family, "csr created");
        Ok(csr)
    }

    /// CSR backed by a [`SimulatedEngine`] on the root device's address space.
    pub fn create_simulated_engine(
        &self,
        root_device_index: u32,
        engine_type: EngineType,
        index: u32,
        sim: SimConfig,
    ) -> Result<Engine> {
        let root = self.root_device(root_device_index)?;
        let id = EngineId::new(root_device_index, engine_type, index);
        let sim = Arc::new(SimulatedEngine::new(id, Arc::clone(&root.memory), sim));
        let csr = self.create_csr(id, sim.clone(), None)?;
        Ok(Engine { sim, csr })
    }

    /// Unified allocation of `size` bytes with a backing on every root device.
    pub fn allocate_unified(&self, size: u64) -> Result<UnifiedAllocation> {
        let manager = self.page_fault_manager()?;
        let backings = self
            .root_devices
            .iter()
            .map(|root| {
                root.memory
                    .allocate(AllocationProperties::new(size, AllocationType::UnifiedShared))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let backing = MultiGraphicsAllocation::new(backings)?;
        Ok(UnifiedAllocation::new(
            Arc::clone(manager),
            Arc::clone(&self.migration),
            backing,
        )?)
    }

    /// Tear down. Unified allocations still alive keep the page fault manager (and the
    /// signal handler) until they drop.
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for ExecutionEnvironment {
    fn drop(&mut self) {
        let outstanding = self
            .page_fault_manager
            .as_ref()
            .map_or(0, |manager| manager.tracked_ranges());
        info!(outstanding_unified_allocations = outstanding, "execution environment shut down");
    }
}

impl std::fmt::Debug for ExecutionEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEnvironment")
            .field("root_devices", &self.root_devices)
            .field("page_fault_manager", &self.page_fault_manager)
            .field("migration", &self.migration)
            .finish()
    }
}

fn create_page_fault_manager(config: &EnvironmentConfig) -> Result<Option<PageFaultManager>> {
    match config.page_fault_backend {
        PageFaultBackend::Disabled => Ok(None),
        PageFaultBackend::Manual => Ok(Some(PageFaultManager::new(
            gfx_pagefault::PageFaultConfig {
                install_signal_handler: false,
                ..config.page_faults
            },
            Arc::new(NoProtection),
            Arc::new(ManualDispatch),
        )?)),
        #[cfg(target_os = "linux")]
        PageFaultBackend::Host => Ok(Some(PageFaultManager::for_host(config.page_faults)?)),
        #[cfg(not(target_os = "linux"))]
        PageFaultBackend::Host => Err(EnvironmentError::UnsupportedBackend(PageFaultBackend::Host)),
    }
}
