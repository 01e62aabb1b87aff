use gfx_csr::{ConfigError, CsrError};
use gfx_memory::MemoryError;
use gfx_migration::MigrationError;
use gfx_pagefault::PageFaultError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EnvironmentError>;

#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("no root device with index {0}")]
    NoSuchRootDevice(u32),

    #[error("environment has no root devices")]
    NoRootDevices,

    #[error("page fault manager is disabled")]
    PageFaultsDisabled,

    #[error("page fault backend {0:?} is not available on this platform")]
    UnsupportedBackend(crate::PageFaultBackend),

    #[error("memory: {0}")]
    Memory(#[from] MemoryError),

    #[error("command stream receiver: {0}")]
    Csr(#[from] CsrError),

    #[error("page faults: {0}")]
    PageFault(#[from] PageFaultError),

    #[error("migration: {0}")]
    Migration(#[from] MigrationError),
}
