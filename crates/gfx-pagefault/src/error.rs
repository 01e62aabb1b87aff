use thiserror::Error;

pub type Result<T> = std::result::Result<T, PageFaultError>;

#[derive(Debug, Error)]
pub enum PageFaultError {
    #[error("range at {ptr:#x} is not page aligned")]
    Unaligned { ptr: usize },

    #[error("cannot track an empty range")]
    ZeroSize,

    #[error("range {ptr:#x}+{size:#x} overlaps a tracked range")]
    Overlapping { ptr: usize, size: usize },

    #[error("tracked-range table is full ({capacity} entries)")]
    TableFull { capacity: usize },

    #[error("no tracked range starts at {0:#x}")]
    NotTracked(usize),

    #[error("fault handler registry is full")]
    RegistryFull,

    #[error("failed to install fault handler: {0}")]
    Install(#[source] std::io::Error),

    #[error("host access {offset:#x}+{len:#x} outside allocation of {size:#x} bytes")]
    OutOfBounds { offset: usize, len: usize, size: usize },

    #[error("failed to map host memory: {0}")]
    HostMapping(#[source] std::io::Error),
}
