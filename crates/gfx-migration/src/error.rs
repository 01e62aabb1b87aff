use gfx_csr::CsrError;
use gfx_memory::MemoryError;
use gfx_pagefault::PageFaultError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MigrationError>;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("allocation is not registered for migration")]
    NotRegistered,

    #[error("allocation has no backing on root device {root_device_index}")]
    NoBacking { root_device_index: u32 },

    #[error("no transfer queue for root device {root_device_index}")]
    NoTransferQueue { root_device_index: u32 },

    #[error("backing on root device {root_device_index} is {actual:#x} bytes, expected {expected:#x}")]
    SizeMismatch {
        root_device_index: u32,
        expected: u64,
        actual: u64,
    },

    #[error("gpu copy (task {task_count}) did not complete")]
    CopyIncomplete { task_count: u32 },

    #[error("memory: {0}")]
    Memory(#[from] MemoryError),

    #[error("command stream receiver: {0}")]
    Csr(#[from] CsrError),

    #[error("page fault manager: {0}")]
    PageFault(#[from] PageFaultError),
}
