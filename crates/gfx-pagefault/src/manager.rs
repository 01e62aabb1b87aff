use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error};

use crate::handler::{self, FaultHandlerInstaller};
use crate::host::host_page_size;
use crate::protection::CpuMemoryProtection;
use crate::table::{AllocationDomain, DomainTransfer, RangeTable, SlotGuard};
use crate::{PageFaultConfig, PageFaultError, Result};

/// Where a newly tracked range starts out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum InitialPlacement {
    /// CPU domain, pages left accessible.
    Cpu,
    /// Untouched and protected; the first CPU access faults.
    #[default]
    Gpu,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PageFaultStatsSnapshot {
    pub faults_claimed: u64,
    pub transfers_to_cpu: u64,
    pub transfers_to_gpu: u64,
    pub protect_calls: u64,
    pub allow_calls: u64,
}

#[derive(Debug, Default)]
pub struct PageFaultStats {
    faults_claimed: AtomicU64,
    transfers_to_cpu: AtomicU64,
    transfers_to_gpu: AtomicU64,
    protect_calls: AtomicU64,
    allow_calls: AtomicU64,
}

impl PageFaultStats {
    pub fn snapshot(&self) -> PageFaultStatsSnapshot {
        PageFaultStatsSnapshot {
            faults_claimed: self.faults_claimed.load(Ordering::Relaxed),
            transfers_to_cpu: self.transfers_to_cpu.load(Ordering::Relaxed),
            transfers_to_gpu: self.transfers_to_gpu.load(Ordering::Relaxed),
            protect_calls: self.protect_calls.load(Ordering::Relaxed),
            allow_calls: self.allow_calls.load(Ordering::Relaxed),
        }
    }
}

pub(crate) struct ManagerShared {
    table: RangeTable,
    protection: Arc<dyn CpuMemoryProtection>,
    /// Serializes table writers. Never taken on the fault path.
    writer: Mutex<()>,
    stats: PageFaultStats,
}

impl ManagerShared {
    fn protect_cpu_memory_access(&self, ptr: usize, size: usize) {
        self.stats.protect_calls.fetch_add(1, Ordering::Relaxed);
        if let Err(err) = self.protection.protect(ptr, size) {
            error!(ptr = format_args!("{ptr:#x}"), size, %err, "failed to protect host range");
            std::process::abort();
        }
    }

    fn allow_cpu_memory_access(&self, ptr: usize, size: usize) {
        self.stats.allow_calls.fetch_add(1, Ordering::Relaxed);
        if let Err(err) = self.protection.allow(ptr, size) {
            error!(ptr = format_args!("{ptr:#x}"), size, %err, "failed to unprotect host range");
            std::process::abort();
        }
    }

    /// Fault-path entry. Only atomics, the range's transfer hook and the protection call.
    ///
    /// Concurrent faults on one range wait for the first to finish; only the thread that
    /// claims a GPU-owned range transfers, and the pages open only once the data is home.
    pub(crate) fn verify_page_fault(&self, address: usize) -> bool {
        let Some(range) = self.table.find(address) else {
            return false;
        };
        self.stats.faults_claimed.fetch_add(1, Ordering::Relaxed);
        let (base, size) = (range.base(), range.size());
        if range.claim() == AllocationDomain::Gpu {
            self.stats.transfers_to_cpu.fetch_add(1, Ordering::Relaxed);
            range.transfer().transfer_to_cpu(base, size);
        }
        self.allow_cpu_memory_access(base, size);
        range.release(AllocationDomain::Cpu);
        true
    }

    fn move_to_gpu(&self, range: &SlotGuard<'_>) {
        let (base, size) = (range.base(), range.size());
        // Protect before draining so no CPU write lands after the copy.
        if range.claim() == AllocationDomain::Cpu {
            self.protect_cpu_memory_access(base, size);
            self.stats.transfers_to_gpu.fetch_add(1, Ordering::Relaxed);
            range.transfer().transfer_to_gpu(base, size);
        }
        range.release(AllocationDomain::Gpu);
    }

    /// Open the range for good, ahead of untracking or teardown.
    fn release_to_cpu(&self, range: &SlotGuard<'_>) {
        if range.claim() != AllocationDomain::Cpu {
            self.allow_cpu_memory_access(range.base(), range.size());
        }
        range.release(AllocationDomain::Cpu);
    }
}

/// Tracks unified-memory host ranges and hands them between CPU and GPU by page
/// protection.
///
/// CPU access to a range the GPU owns faults; the fault handler routes it back here, the
/// range's [`DomainTransfer`] brings the data home and the access retries.
pub struct PageFaultManager {
    shared: Arc<ManagerShared>,
    registry_index: usize,
    installer: Arc<dyn FaultHandlerInstaller>,
    installed: bool,
}

impl PageFaultManager {
    pub fn new(
        config: PageFaultConfig,
        protection: Arc<dyn CpuMemoryProtection>,
        installer: Arc<dyn FaultHandlerInstaller>,
    ) -> Result<Self> {
        let shared = Arc::new(ManagerShared {
            table: RangeTable::new(config.max_tracked_ranges),
            protection,
            writer: Mutex::new(()),
            stats: PageFaultStats::default(),
        });
        let registry_index = handler::register(&shared)?;
        if config.install_signal_handler {
            if let Err(err) = installer.install() {
                handler::unregister(registry_index);
                return Err(err);
            }
        }
        debug!(
            registry_index,
            capacity = config.max_tracked_ranges,
            signal_handler = config.install_signal_handler,
            "page fault manager created"
        );
        Ok(Self {
            shared,
            registry_index,
            installer,
            installed: config.install_signal_handler,
        })
    }

    /// `mprotect` plus the `SIGSEGV` handler.
    #[cfg(target_os = "linux")]
    pub fn for_host(config: PageFaultConfig) -> Result<Self> {
        Self::new(
            config,
            Arc::new(crate::MprotectProtection),
            Arc::new(crate::SigsegvInstaller),
        )
    }

    fn writer(&self) -> MutexGuard<'_, ()> {
        self.shared
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stats(&self) -> PageFaultStatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn tracked_ranges(&self) -> usize {
        self.shared.table.len()
    }

    pub fn domain(&self, ptr: usize) -> Option<AllocationDomain> {
        self.shared.table.get(ptr).map(|range| range.domain())
    }

    /// Aborts the process if the OS refuses.
    pub fn protect_cpu_memory_access(&self, ptr: usize, size: usize) {
        self.shared.protect_cpu_memory_access(ptr, size);
    }

    /// Aborts the process if the OS refuses.
    pub fn allow_cpu_memory_access(&self, ptr: usize, size: usize) {
        self.shared.allow_cpu_memory_access(ptr, size);
    }

    pub fn track_range(
        &self,
        ptr: usize,
        size: usize,
        transfer: Arc<dyn DomainTransfer>,
    ) -> Result<()> {
        self.track_range_with_placement(ptr, size, transfer, InitialPlacement::Gpu)
    }

    pub fn track_range_with_placement(
        &self,
        ptr: usize,
        size: usize,
        transfer: Arc<dyn DomainTransfer>,
        placement: InitialPlacement,
    ) -> Result<()> {
        if size == 0 {
            return Err(PageFaultError::ZeroSize);
        }
        if ptr == 0 || ptr % host_page_size() != 0 {
            return Err(PageFaultError::Unaligned { ptr });
        }
        let domain = match placement {
            InitialPlacement::Cpu => AllocationDomain::Cpu,
            InitialPlacement::Gpu => AllocationDomain::None,
        };

        let _writer = self.writer();
        self.shared.table.insert(ptr, size, domain, transfer)?;
        if domain == AllocationDomain::None {
            self.shared.protect_cpu_memory_access(ptr, size);
        }
        debug!(ptr = format_args!("{ptr:#x}"), size, ?domain, "range tracked");
        Ok(())
    }

    /// Stop tracking the range starting at `ptr`, leaving its pages accessible.
    pub fn untrack_range(&self, ptr: usize) -> Result<()> {
        let _writer = self.writer();
        let size = {
            let range = self
                .shared
                .table
                .get(ptr)
                .ok_or(PageFaultError::NotTracked(ptr))?;
            self.shared.release_to_cpu(&range);
            range.size()
        };
        self.shared.table.remove(ptr)?;
        debug!(ptr = format_args!("{ptr:#x}"), size, "range untracked");
        Ok(())
    }

    /// Hand the range to the GPU: push CPU-side data over and protect the pages.
    pub fn move_allocation_to_gpu_domain(&self, ptr: usize) -> Result<()> {
        let _writer = self.writer();
        let range = self
            .shared
            .table
            .get(ptr)
            .ok_or(PageFaultError::NotTracked(ptr))?;
        self.shared.move_to_gpu(&range);
        Ok(())
    }

    pub fn move_all_allocations_to_gpu_domain(&self) {
        let _writer = self.writer();
        for base in self.shared.table.bases() {
            if let Some(range) = self.shared.table.get(base) {
                self.shared.move_to_gpu(&range);
            }
        }
    }

    /// Claim a fault at `address` if it lies in a tracked range.
    pub fn verify_page_fault(&self, address: usize) -> bool {
        self.shared.verify_page_fault(address)
    }
}

impl Drop for PageFaultManager {
    fn drop(&mut self) {
        handler::unregister(self.registry_index);
        if self.installed {
            self.installer.uninstall();
        }
        let _writer = self.writer();
        for base in self.shared.table.bases() {
            if let Some(range) = self.shared.table.get(base) {
                self.shared.release_to_cpu(&range);
            }
        }
    }
}

impl std::fmt::Debug for PageFaultManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageFaultManager")
            .field("registry_index", &self.registry_index)
            .field("tracked_ranges", &self.tracked_ranges())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{dispatch_fault, ManualDispatch, ProtectionCall, RecordingProtection};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, AtomicUsize};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingTransfer {
        to_cpu: AtomicUsize,
        to_gpu: AtomicUsize,
    }

    impl DomainTransfer for CountingTransfer {
        fn transfer_to_cpu(&self, _ptr: usize, _size: usize) {
            self.to_cpu.fetch_add(1, Ordering::SeqCst);
        }

        fn transfer_to_gpu(&self, _ptr: usize, _size: usize) {
            self.to_gpu.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn manager() -> (PageFaultManager, Arc<RecordingProtection>) {
        let protection = Arc::new(RecordingProtection::new());
        let manager = PageFaultManager::new(
            PageFaultConfig {
                max_tracked_ranges: 8,
                install_signal_handler: false,
            },
            protection.clone(),
            Arc::new(ManualDispatch),
        )
        .unwrap();
        (manager, protection)
    }

    // Fake addresses far from anything a real allocation could use, distinct per test.
    const PAGE: usize = 0x1000;

    #[test]
    fn untouched_range_is_protected_and_first_fault_needs_no_transfer() {
        let (manager, protection) = manager();
        let transfer = Arc::new(CountingTransfer::default());
        let base = 0x7100_0000_0000;
        manager.track_range(base, 2 * PAGE, transfer.clone()).unwrap();
        assert!(protection.is_protected(base));
        assert_eq!(manager.domain(base), Some(AllocationDomain::None));

        assert!(manager.verify_page_fault(base + PAGE + 8));
        assert_eq!(manager.domain(base), Some(AllocationDomain::Cpu));
        assert!(!protection.is_protected(base));
        assert_eq!(transfer.to_cpu.load(Ordering::SeqCst), 0);
        assert!(!manager.verify_page_fault(base + 2 * PAGE));
    }

    #[test]
    fn gpu_round_trip_rearms_the_fault() {
        let (manager, protection) = manager();
        let transfer = Arc::new(CountingTransfer::default());
        let base = 0x7200_0000_0000;
        manager
            .track_range_with_placement(base, PAGE, transfer.clone(), InitialPlacement::Cpu)
            .unwrap();
        assert!(protection.calls().is_empty());

        manager.move_allocation_to_gpu_domain(base).unwrap();
        assert_eq!(transfer.to_gpu.load(Ordering::SeqCst), 1);
        assert!(protection.is_protected(base));

        // Already on the GPU: nothing moves.
        manager.move_allocation_to_gpu_domain(base).unwrap();
        assert_eq!(transfer.to_gpu.load(Ordering::SeqCst), 1);

        assert!(dispatch_fault(base + 4));
        assert_eq!(transfer.to_cpu.load(Ordering::SeqCst), 1);
        assert_eq!(manager.domain(base), Some(AllocationDomain::Cpu));

        manager.move_all_allocations_to_gpu_domain();
        assert!(dispatch_fault(base));
        assert_eq!(transfer.to_cpu.load(Ordering::SeqCst), 2);
        assert_eq!(
            protection.calls(),
            vec![
                ProtectionCall::Protect { ptr: base, size: PAGE },
                ProtectionCall::Allow { ptr: base, size: PAGE },
                ProtectionCall::Protect { ptr: base, size: PAGE },
                ProtectionCall::Allow { ptr: base, size: PAGE },
            ]
        );
        assert_eq!(manager.stats().faults_claimed, 2);
    }

    #[test]
    fn unprotected_manager_still_tracks_domains() {
        let manager = PageFaultManager::new(
            PageFaultConfig {
                max_tracked_ranges: 2,
                install_signal_handler: false,
            },
            Arc::new(crate::NoProtection),
            Arc::new(ManualDispatch),
        )
        .unwrap();
        let transfer = Arc::new(CountingTransfer::default());
        let base = 0x7600_0000_0000;
        manager
            .track_range_with_placement(base, PAGE, transfer.clone(), InitialPlacement::Cpu)
            .unwrap();

        manager.move_allocation_to_gpu_domain(base).unwrap();
        assert_eq!(manager.domain(base), Some(AllocationDomain::Gpu));
        assert_eq!(transfer.to_gpu.load(Ordering::SeqCst), 1);

        assert!(dispatch_fault(base + 16));
        assert_eq!(manager.domain(base), Some(AllocationDomain::Cpu));
        assert_eq!(transfer.to_cpu.load(Ordering::SeqCst), 1);
    }

    /// Device-to-host copy that takes a while and lands `7` in the host word.
    #[derive(Default)]
    struct SlowTransfer {
        host: AtomicU32,
        to_cpu: AtomicUsize,
    }

    impl DomainTransfer for SlowTransfer {
        fn transfer_to_cpu(&self, _ptr: usize, _size: usize) {
            self.to_cpu.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(100));
            self.host.store(7, Ordering::SeqCst);
        }

        fn transfer_to_gpu(&self, _ptr: usize, _size: usize) {}
    }

    #[test]
    fn overlapping_faults_transfer_once_and_keep_later_cpu_writes() {
        let (manager, protection) = manager();
        let transfer = Arc::new(SlowTransfer::default());
        let base = 0x7500_0000_0000;
        manager
            .track_range_with_placement(base, PAGE, transfer.clone(), InitialPlacement::Cpu)
            .unwrap();
        manager.move_allocation_to_gpu_domain(base).unwrap();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                assert!(manager.verify_page_fault(base));
                transfer.host.store(42, Ordering::SeqCst);
            });
            scope.spawn(|| {
                std::thread::sleep(Duration::from_millis(30));
                assert!(manager.verify_page_fault(base + 8));
                // Only reachable once the first fault brought the data home.
                assert_ne!(transfer.host.load(Ordering::SeqCst), 0);
            });
        });

        assert_eq!(transfer.to_cpu.load(Ordering::SeqCst), 1);
        assert_eq!(transfer.host.load(Ordering::SeqCst), 42);
        assert_eq!(manager.domain(base), Some(AllocationDomain::Cpu));
        assert!(!protection.is_protected(base));
        assert_eq!(manager.stats().faults_claimed, 2);
    }

    #[test]
    fn untrack_lifts_protection_and_stops_claiming() {
        let (manager, protection) = manager();
        let base = 0x7300_0000_0000;
        manager
            .track_range(base, PAGE, Arc::new(CountingTransfer::default()))
            .unwrap();
        manager.untrack_range(base).unwrap();
        assert!(!protection.is_protected(base));
        assert_eq!(manager.tracked_ranges(), 0);
        assert!(!manager.verify_page_fault(base));
        assert!(matches!(
            manager.untrack_range(base),
            Err(PageFaultError::NotTracked(_))
        ));
    }

    #[test]
    fn rejects_unaligned_and_empty_ranges() {
        let (manager, _) = manager();
        let transfer: Arc<dyn DomainTransfer> = Arc::new(CountingTransfer::default());
        assert!(matches!(
            manager.track_range(0x7400_0000_0010, PAGE, transfer.clone()),
            Err(PageFaultError::Unaligned { .. })
        ));
        assert!(matches!(
            manager.track_range(0x7400_0000_0000, 0, transfer),
            Err(PageFaultError::ZeroSize)
        ));
    }

    #[test]
    fn unclaimed_faults_are_left_alone() {
        let (_manager, _) = manager();
        assert!(!dispatch_fault(0x10));
    }
}
