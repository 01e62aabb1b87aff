use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CsrStatsSnapshot {
    pub flushes: u64,
    pub submissions: u64,
    pub tag_updates: u64,
    pub state_bytes: u64,
    pub dependency_waits: u64,
    pub cpu_waits: u64,
    pub wait_timeouts: u64,
}

/// Per-CSR counters, cheap to bump on the dispatch path and readable from any thread.
#[derive(Debug, Default)]
pub struct CsrStats {
    flushes: AtomicU64,
    submissions: AtomicU64,
    tag_updates: AtomicU64,
    state_bytes: AtomicU64,
    dependency_waits: AtomicU64,
    cpu_waits: AtomicU64,
    wait_timeouts: AtomicU64,
}

impl CsrStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_flushes(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_submissions(&self) {
        self.submissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_tag_updates(&self) {
        self.tag_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_state_bytes(&self, bytes: u64) {
        self.state_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_dependency_waits(&self, waits: u64) {
        self.dependency_waits.fetch_add(waits, Ordering::Relaxed);
    }

    pub fn inc_cpu_waits(&self) {
        self.cpu_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_wait_timeouts(&self) {
        self.wait_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CsrStatsSnapshot {
        CsrStatsSnapshot {
            flushes: self.flushes.load(Ordering::Relaxed),
            submissions: self.submissions.load(Ordering::Relaxed),
            tag_updates: self.tag_updates.load(Ordering::Relaxed),
            state_bytes: self.state_bytes.load(Ordering::Relaxed),
            dependency_waits: self.dependency_waits.load(Ordering::Relaxed),
            cpu_waits: self.cpu_waits.load(Ordering::Relaxed),
            wait_timeouts: self.wait_timeouts.load(Ordering::Relaxed),
        }
    }
}
