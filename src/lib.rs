//! User-mode GPU driver core.
//!
//! The member crates do the work: [`memory`] owns GPU-visible storage, [`cmdbuf`] the linear
//! command buffer, [`hw`] per-generation encodings, [`csr`] the command-stream receivers,
//! [`pagefault`] CPU page-fault tracking and [`migration`] multi-device coherency. This crate
//! wires them together through an [`ExecutionEnvironment`].

#![forbid(unsafe_code)]

mod config;
mod environment;
mod error;
#[cfg(feature = "logging")]
mod logging;

pub use gfx_cmdbuf as cmdbuf;
pub use gfx_csr as csr;
pub use gfx_hw as hw;
pub use gfx_memory as memory;
pub use gfx_migration as migration;
pub use gfx_pagefault as pagefault;

pub use config::{EnvironmentConfig, PageFaultBackend};
pub use environment::{Engine, ExecutionEnvironment, RootDeviceEnvironment};
pub use error::{EnvironmentError, Result};
#[cfg(feature = "logging")]
pub use logging::init_logging;
