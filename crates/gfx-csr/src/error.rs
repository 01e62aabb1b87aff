use gfx_cmdbuf::CommandBufferError;
use gfx_memory::MemoryError;
use thiserror::Error;

use crate::os_interface::SubmitError;

pub type Result<T> = std::result::Result<T, CsrError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CsrError {
    #[error("memory: {0}")]
    Memory(#[from] MemoryError),

    #[error("command buffer: {0}")]
    CommandBuffer(#[from] CommandBufferError),

    #[error("submission of task {task_count} failed: {source}")]
    Submit {
        task_count: u32,
        #[source]
        source: SubmitError,
    },

    #[error("gpu hang detected while waiting for task {task_count}")]
    GpuHang { task_count: u32 },

    #[error("command stream receiver is faulted")]
    Faulted,

    #[error("task {requested} was never issued (last issued task is {issued})")]
    TaskCountNotIssued { requested: u32, issued: u32 },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
}
