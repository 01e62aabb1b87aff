use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageFaultConfig {
    /// Capacity of the tracked-range table. Fixed for the manager's lifetime so the fault
    /// path never reallocates.
    pub max_tracked_ranges: usize,
    /// Install the process-wide `SIGSEGV` handler. Without it faults are only resolved
    /// through explicit [`dispatch_fault`](crate::dispatch_fault) calls.
    pub install_signal_handler: bool,
}

impl Default for PageFaultConfig {
    fn default() -> Self {
        Self {
            max_tracked_ranges: 4096,
            install_signal_handler: true,
        }
    }
}
