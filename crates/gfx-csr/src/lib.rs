//! Command-stream receiver.
//!
//! One [`CommandStreamReceiver`] per engine turns client payloads into submitted command
//! buffers. It remembers the hardware state it last programmed and re-emits only what a
//! dispatch changes, orders work across engines with semaphore waits on tags, and tracks
//! completion through a task count the GPU writes back to memory.
//!
//! Submission goes through [`OsInterface`]; [`SimulatedEngine`] executes submitted buffers in
//! software against the root device's address space.

#![forbid(unsafe_code)]

pub mod config;
mod csr;
mod dispatch_flags;
mod error;
mod os_interface;
mod payload;
pub mod sim;
mod stats;
pub mod tags;

pub use config::{CsrConfig, DispatchMode, WaitConfig};
pub use csr::{CommandStreamReceiver, CsrObserver, CsrState, FlushReport};
pub use dispatch_flags::{
    CompletionStamp, CsrSizeRequestFlags, DispatchFlags, FlushStampTracker, GrfRequirement,
    QueueThrottle, WaitStatus,
};
pub use error::{ConfigError, CsrError, Result};
pub use os_interface::{
    BatchBuffer, EngineId, EngineType, FlushStamp, OsInterface, SubmitError, WaitOutcome,
};
pub use payload::PayloadBuilder;
pub use sim::{ExecutedCommand, SimConfig, SimulatedEngine};
pub use stats::{CsrStats, CsrStatsSnapshot};
pub use tags::{
    CsrDependencies, TagAllocator, TagNode, TaskCountDependency, TimestampPacketContainer,
    TIMESTAMP_PACKET_COMPLETED_VALUE, TIMESTAMP_PACKET_INITIAL_VALUE,
};
