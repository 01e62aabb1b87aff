//! GPU-visible memory for the command-stream core.
//!
//! - [`GpuAddressSpace`] hands out page-aligned GPU virtual addresses per root device and
//!   resolves them back to backing storage.
//! - [`GraphicsAllocation`] is a handle to one mapped range (command buffers, tag pools,
//!   unified-memory backing, staging buffers).
//! - [`TagCell`] is a 4-byte GPU-visible counter observed by the CPU with acquire loads.
//!
//! Backing storage is word-granular atomic memory so the CPU and a (software) GPU engine can
//! touch the same bytes from different threads without data races.

#![forbid(unsafe_code)]

mod address_space;
mod allocation;
mod constants;
mod error;
mod region;
mod stats;

pub use address_space::{GpuAddressSpace, GpuMemory};
pub use allocation::{AllocationProperties, AllocationType, GraphicsAllocation, LockedAllocation, TagCell};
pub use constants::{
    align_down, align_up, is_aligned, CACHE_LINE_SIZE, CS_OVERFETCH_SIZE, PAGE_SIZE, PAGE_SIZE_64K,
};
pub use error::{MemoryError, Result};
pub use region::Region;
pub use stats::{MemoryStats, MemoryStatsSnapshot};
