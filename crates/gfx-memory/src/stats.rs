use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStatsSnapshot {
    pub allocations: u64,
    pub frees: u64,
    pub locks: u64,
    pub unlocks: u64,
    pub cpu_copy_bytes: u64,
}

/// Counters shared by every allocation of an address space.
///
/// Tests use lock/copy deltas to prove that an operation performed no data movement.
#[derive(Debug, Default)]
pub struct MemoryStats {
    allocations: AtomicU64,
    frees: AtomicU64,
    locks: AtomicU64,
    unlocks: AtomicU64,
    cpu_copy_bytes: AtomicU64,
}

impl MemoryStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_allocations(&self) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_frees(&self) {
        self.frees.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_locks(&self) {
        self.locks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_unlocks(&self) {
        self.unlocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_cpu_copy_bytes(&self, bytes: u64) {
        self.cpu_copy_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MemoryStatsSnapshot {
        MemoryStatsSnapshot {
            allocations: self.allocations.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            locks: self.locks.load(Ordering::Relaxed),
            unlocks: self.unlocks.load(Ordering::Relaxed),
            cpu_copy_bytes: self.cpu_copy_bytes.load(Ordering::Relaxed),
        }
    }
}
