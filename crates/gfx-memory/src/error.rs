use thiserror::Error;

use crate::AllocationType;

pub type Result<T> = std::result::Result<T, MemoryError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("out of bounds: offset={offset} len={len} size={size}")]
    OutOfBounds { offset: u64, len: u64, size: u64 },

    #[error("unaligned access at {address:#x} (expected {alignment}-byte alignment)")]
    Unaligned { address: u64, alignment: u64 },

    #[error("gpu address {0:#x} is not mapped")]
    Unmapped(u64),

    #[error("gpu address space exhausted (requested {requested} bytes)")]
    AddressSpaceExhausted { requested: u64 },

    #[error("allocation of type {0:?} is not lockable")]
    NotLockable(AllocationType),

    #[error("zero-sized allocation")]
    ZeroSize,
}
