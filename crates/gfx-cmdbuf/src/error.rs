use gfx_memory::MemoryError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CommandBufferError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandBufferError {
    #[error("command buffer allocation failed: {0}")]
    Memory(#[from] MemoryError),

    #[error("segment {0} is no longer owned by the stream")]
    UnknownSegment(u64),

    #[error("patch of {len} bytes at offset {offset} exceeds written bytes ({used}) of segment {segment}")]
    PatchOutOfRange {
        segment: u64,
        offset: usize,
        len: usize,
        used: usize,
    },
}
