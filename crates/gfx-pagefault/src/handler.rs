//! Process-wide fault routing.
//!
//! Managers register in a fixed array of slots. The single `SIGSEGV` trampoline (or a test
//! calling [`dispatch_fault`]) walks that array without locking or allocating and forwards
//! faults nobody claims to whatever handler was installed before it.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::manager::ManagerShared;
use crate::{PageFaultError, Result};

const MAX_MANAGERS: usize = 64;

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY: AtomicPtr<ManagerShared> = AtomicPtr::new(ptr::null_mut());
static MANAGERS: [AtomicPtr<ManagerShared>; MAX_MANAGERS] = [EMPTY; MAX_MANAGERS];
/// Dispatches currently walking `MANAGERS`.
static DISPATCHING: AtomicUsize = AtomicUsize::new(0);

struct DispatchGuard;

impl DispatchGuard {
    fn enter() -> Self {
        DISPATCHING.fetch_add(1, Ordering::SeqCst);
        DispatchGuard
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        DISPATCHING.fetch_sub(1, Ordering::SeqCst);
    }
}

fn wait_for_dispatchers() {
    while DISPATCHING.load(Ordering::SeqCst) != 0 {
        std::thread::yield_now();
    }
}

pub(crate) fn register(shared: &Arc<ManagerShared>) -> Result<usize> {
    let target = Arc::as_ptr(shared).cast_mut();
    MANAGERS
        .iter()
        .position(|slot| {
            slot.compare_exchange(ptr::null_mut(), target, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        })
        .ok_or(PageFaultError::RegistryFull)
}

/// Once this returns no dispatch can still observe the manager.
pub(crate) fn unregister(index: usize) {
    if let Some(slot) = MANAGERS.get(index) {
        slot.store(ptr::null_mut(), Ordering::SeqCst);
    }
    wait_for_dispatchers();
}

/// Offer a fault at `address` to every registered manager. Returns whether one claimed it.
///
/// This is what the signal trampoline runs; it is also callable directly where no real
/// page protection is in place.
pub fn dispatch_fault(address: usize) -> bool {
    let _guard = DispatchGuard::enter();
    MANAGERS.iter().any(|slot| {
        let manager = slot.load(Ordering::SeqCst);
        // SAFETY: a registered manager stays alive until `unregister` cleared its slot and
        // waited out every dispatch, including this one.
        !manager.is_null() && unsafe { &*manager }.verify_page_fault(address)
    })
}

/// Installs and removes the process-wide fault handler.
pub trait FaultHandlerInstaller: Send + Sync {
    fn install(&self) -> Result<()>;

    fn uninstall(&self);
}

/// Installs nothing; faults reach managers only through [`dispatch_fault`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ManualDispatch;

impl FaultHandlerInstaller for ManualDispatch {
    fn install(&self) -> Result<()> {
        Ok(())
    }

    fn uninstall(&self) {}
}

#[cfg(target_os = "linux")]
pub use self::sigsegv::SigsegvInstaller;

#[cfg(target_os = "linux")]
mod sigsegv {
    use std::io;
    use std::ptr;
    use std::sync::atomic::{AtomicPtr, Ordering};
    use std::sync::{Mutex, PoisonError};

    use libc::{c_int, c_void, siginfo_t};
    use tracing::debug;

    use super::{dispatch_fault, wait_for_dispatchers, DispatchGuard, FaultHandlerInstaller};
    use crate::{PageFaultError, Result};

    /// Number of live installs; the handler is in place while non-zero.
    static INSTALLS: Mutex<usize> = Mutex::new(0);
    /// Action that was installed before ours.
    static PREVIOUS: AtomicPtr<libc::sigaction> = AtomicPtr::new(ptr::null_mut());

    /// `sigaction(SIGSEGV)` based installer. Reference counted across managers.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct SigsegvInstaller;

    impl FaultHandlerInstaller for SigsegvInstaller {
        fn install(&self) -> Result<()> {
            let mut installs = INSTALLS.lock().unwrap_or_else(PoisonError::into_inner);
            if *installs == 0 {
                // SAFETY: an all-zero sigaction is a valid "no flags, empty mask" value.
                let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
                action.sa_sigaction = trampoline as usize;
                action.sa_flags = libc::SA_SIGINFO;
                // SAFETY: as above.
                let mut previous: libc::sigaction = unsafe { std::mem::zeroed() };
                // SAFETY: both pointers reference live sigaction values.
                let rc = unsafe {
                    libc::sigemptyset(&mut action.sa_mask);
                    libc::sigaction(libc::SIGSEGV, &action, &mut previous)
                };
                if rc != 0 {
                    return Err(PageFaultError::Install(io::Error::last_os_error()));
                }
                PREVIOUS.store(Box::into_raw(Box::new(previous)), Ordering::SeqCst);
                debug!("SIGSEGV handler installed");
            }
            *installs += 1;
            Ok(())
        }

        fn uninstall(&self) {
            let mut installs = INSTALLS.lock().unwrap_or_else(PoisonError::into_inner);
            if *installs == 0 {
                return;
            }
            *installs -= 1;
            if *installs > 0 {
                return;
            }
            let previous = PREVIOUS.swap(ptr::null_mut(), Ordering::SeqCst);
            if previous.is_null() {
                return;
            }
            // SAFETY: `previous` came from `Box::into_raw` in `install`.
            unsafe {
                libc::sigaction(libc::SIGSEGV, previous, ptr::null_mut());
            }
            wait_for_dispatchers();
            // SAFETY: no trampoline can load the pointer anymore.
            drop(unsafe { Box::from_raw(previous) });
            debug!("SIGSEGV handler restored");
        }
    }

    extern "C" fn trampoline(signal: c_int, info: *mut siginfo_t, context: *mut c_void) {
        // SAFETY: the kernel passes a valid siginfo for SA_SIGINFO handlers.
        let address = unsafe { (*info).si_addr() } as usize;
        if dispatch_fault(address) {
            return;
        }
        forward(signal, info, context);
    }

    fn forward(signal: c_int, info: *mut siginfo_t, context: *mut c_void) {
        let _guard = DispatchGuard::enter();
        let previous = PREVIOUS.load(Ordering::SeqCst);
        if previous.is_null() {
            restore_default(signal);
            return;
        }
        // SAFETY: kept alive by the dispatch guard; see `uninstall`.
        let previous = unsafe { &*previous };
        let handler = previous.sa_sigaction;
        if handler == libc::SIG_IGN {
            return;
        }
        if handler == libc::SIG_DFL {
            // Returning re-executes the access, which now takes the default action.
            restore_default(signal);
            return;
        }
        if previous.sa_flags & libc::SA_SIGINFO != 0 {
            // SAFETY: SA_SIGINFO handlers have this signature.
            let handler: extern "C" fn(c_int, *mut siginfo_t, *mut c_void) =
                unsafe { std::mem::transmute(handler) };
            handler(signal, info, context);
        } else {
            // SAFETY: plain handlers take only the signal number.
            let handler: extern "C" fn(c_int) = unsafe { std::mem::transmute(handler) };
            handler(signal);
        }
    }

    fn restore_default(signal: c_int) {
        // SAFETY: resetting a signal disposition has no memory-safety preconditions.
        unsafe {
            libc::signal(signal, libc::SIG_DFL);
        }
    }
}
