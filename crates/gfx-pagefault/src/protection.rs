use std::io;
#[cfg(any(test, feature = "test-utils"))]
use std::sync::atomic::{AtomicBool, Ordering};
#[cfg(any(test, feature = "test-utils"))]
use std::sync::{Mutex, PoisonError};

/// OS page-protection primitive.
pub trait CpuMemoryProtection: Send + Sync {
    /// Make `ptr..ptr + size` inaccessible to the CPU.
    fn protect(&self, ptr: usize, size: usize) -> io::Result<()>;

    /// Make `ptr..ptr + size` readable and writable.
    fn allow(&self, ptr: usize, size: usize) -> io::Result<()>;
}

/// `mprotect(2)` backend.
#[cfg(target_os = "linux")]
#[derive(Clone, Copy, Debug, Default)]
pub struct MprotectProtection;

#[cfg(target_os = "linux")]
impl MprotectProtection {
    fn set(ptr: usize, size: usize, prot: libc::c_int) -> io::Result<()> {
        // SAFETY: mprotect only changes page permissions; an invalid range is reported
        // through the return value.
        let rc = unsafe { libc::mprotect(ptr as *mut libc::c_void, size, prot) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
impl CpuMemoryProtection for MprotectProtection {
    fn protect(&self, ptr: usize, size: usize) -> io::Result<()> {
        Self::set(ptr, size, libc::PROT_NONE)
    }

    fn allow(&self, ptr: usize, size: usize) -> io::Result<()> {
        Self::set(ptr, size, libc::PROT_READ | libc::PROT_WRITE)
    }
}

/// Leaves page tables alone.
///
/// For managers fed through [`dispatch_fault`](crate::dispatch_fault): domains are tracked
/// as usual but the CPU never actually traps.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoProtection;

impl CpuMemoryProtection for NoProtection {
    fn protect(&self, _ptr: usize, _size: usize) -> io::Result<()> {
        Ok(())
    }

    fn allow(&self, _ptr: usize, _size: usize) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(any(test, feature = "test-utils"))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProtectionCall {
    Protect { ptr: usize, size: usize },
    Allow { ptr: usize, size: usize },
}

/// Records calls instead of touching page tables.
#[cfg(any(test, feature = "test-utils"))]
#[derive(Debug, Default)]
pub struct RecordingProtection {
    calls: Mutex<Vec<ProtectionCall>>,
    fail: AtomicBool,
}

#[cfg(any(test, feature = "test-utils"))]
impl RecordingProtection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<ProtectionCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether the last call touching a range starting at `ptr` protected it.
    pub fn is_protected(&self, ptr: usize) -> bool {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .find_map(|call| match *call {
                ProtectionCall::Protect { ptr: p, .. } if p == ptr => Some(true),
                ProtectionCall::Allow { ptr: p, .. } if p == ptr => Some(false),
                _ => None,
            })
            .unwrap_or(false)
    }

    pub fn fail_calls(&self, fail: bool) {
        self.fail.store(fail, Ordering::Release);
    }

    fn record(&self, call: ProtectionCall) -> io::Result<()> {
        if self.fail.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "injected failure"));
        }
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
        Ok(())
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl CpuMemoryProtection for RecordingProtection {
    fn protect(&self, ptr: usize, size: usize) -> io::Result<()> {
        self.record(ProtectionCall::Protect { ptr, size })
    }

    fn allow(&self, ptr: usize, size: usize) -> io::Result<()> {
        self.record(ProtectionCall::Allow { ptr, size })
    }
}
