//! CPU page-fault driven coherency for unified shared memory.
//!
//! A [`PageFaultManager`] protects host ranges the GPU owns. The first CPU touch raises
//! `SIGSEGV`; the handler finds the tracked range, transfers the data back and unprotects
//! the pages so the faulting instruction retries and succeeds. Handing a range back to the
//! GPU pushes CPU writes over and re-arms the protection.

mod config;
mod error;
mod handler;
mod host;
mod manager;
mod protection;
mod table;

pub use config::PageFaultConfig;
pub use error::{PageFaultError, Result};
#[cfg(target_os = "linux")]
pub use handler::SigsegvInstaller;
pub use handler::{dispatch_fault, FaultHandlerInstaller, ManualDispatch};
pub use host::{host_page_size, HostAllocation};
pub use manager::{InitialPlacement, PageFaultManager, PageFaultStats, PageFaultStatsSnapshot};
#[cfg(target_os = "linux")]
pub use protection::MprotectProtection;
pub use protection::{CpuMemoryProtection, NoProtection};
#[cfg(any(test, feature = "test-utils"))]
pub use protection::{ProtectionCall, RecordingProtection};
pub use table::{AllocationDomain, DomainTransfer};
