use std::fmt;
use std::time::Duration;

use gfx_cmdbuf::SegmentRange;
use gfx_memory::GraphicsAllocation;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::QueueThrottle;

/// OS-level fence value returned by a submission. Monotonic per engine.
pub type FlushStamp = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineType {
    Render,
    Compute,
    Copy,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EngineId {
    pub root_device_index: u32,
    pub engine_type: EngineType,
    pub index: u32,
}

impl EngineId {
    pub fn new(root_device_index: u32, engine_type: EngineType, index: u32) -> Self {
        Self {
            root_device_index,
            engine_type,
            index,
        }
    }
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "root{}:{:?}{}",
            self.root_device_index, self.engine_type, self.index
        )
    }
}

/// One submission: the stream ranges to execute plus the hints and residency the KMD needs.
#[derive(Clone, Debug)]
pub struct BatchBuffer {
    pub engine: EngineId,
    pub start_gpu_address: u64,
    /// Written ranges in execution order; consecutive ranges are joined by chain commands.
    pub ranges: Vec<SegmentRange>,
    pub throttle: QueueThrottle,
    pub low_priority: bool,
    pub slice_count: u64,
    pub residency: Vec<GraphicsAllocation>,
}

impl BatchBuffer {
    pub fn used_bytes(&self) -> usize {
        self.ranges.iter().map(SegmentRange::len).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("device lost")]
    DeviceLost,

    #[error("submission rejected: {0}")]
    Rejected(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    Completed,
    TimedOut,
    DeviceLost,
}

/// The narrow KMD contract the CSR depends on, scoped to one engine context.
pub trait OsInterface: Send + Sync {
    fn submit(&self, batch: &BatchBuffer) -> Result<FlushStamp, SubmitError>;

    /// Block until the submission identified by `flush_stamp` retired. `None` waits forever.
    fn wait_on_completion(&self, flush_stamp: FlushStamp, timeout: Option<Duration>) -> WaitOutcome;

    /// Whether the engine has drained every submission.
    fn is_idle(&self) -> bool {
        false
    }
}
