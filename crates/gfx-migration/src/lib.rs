//! Migration of multi-root allocations between devices and the host.
//!
//! Every [`MultiGraphicsAllocation`] registered for migration carries a shared
//! [`MigrationSyncData`]: where the authoritative copy lives, which CSR touched it last and
//! a flag that keeps two migrations of it from running at once. [`MigrationController`]
//! moves the copy to the device about to use it; [`UnifiedAllocation`] extends that to a
//! host mapping kept coherent through [`gfx_pagefault`].

#![forbid(unsafe_code)]

mod controller;
mod error;
mod multi_allocation;
mod sync_data;
mod transfer;
mod unified;

pub use controller::{MigrationContext, MigrationController, MigrationStats, MigrationStatsSnapshot};
pub use error::{MigrationError, Result};
pub use multi_allocation::MultiGraphicsAllocation;
pub use sync_data::{LastUsage, MigrationGuard, MigrationSyncData, LOCATION_UNDEFINED};
pub use transfer::{CsrTransferQueue, TransferQueue};
pub use unified::UnifiedAllocation;
