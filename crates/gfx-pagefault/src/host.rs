//! Page-aligned host memory that can carry CPU page protection.

use std::ptr::NonNull;

use crate::{PageFaultError, Result};

/// Host page size, as `mprotect` sees it.
pub fn host_page_size() -> usize {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: sysconf has no memory-safety preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            return size as usize;
        }
    }
    4096
}

/// Page-aligned host memory mapped twice.
///
/// The primary view is what the CPU addresses and what page protection covers: touching a
/// protected page raises a fault that a [`PageFaultManager`](crate::PageFaultManager)
/// resolves before the access retries. The alias view shares the same pages and is never
/// protected, so domain transfers can fill or drain the range while the primary view is
/// still locked.
pub struct HostAllocation {
    ptr: NonNull<u8>,
    alias: NonNull<u8>,
    size: usize,
}

// SAFETY: the mapping is plain memory owned by this value; concurrent access is byte-level
// and callers coordinate ownership through page-fault domains.
unsafe impl Send for HostAllocation {}
// SAFETY: see above.
unsafe impl Sync for HostAllocation {}

impl HostAllocation {
    /// Map at least `size` bytes, rounded up to whole pages and zero-filled.
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(PageFaultError::ZeroSize);
        }
        let page = host_page_size();
        let size = size.div_ceil(page) * page;
        let (ptr, alias) = Self::map(size, page)?;
        Ok(Self { ptr, alias, size })
    }

    /// Both views of one memfd, which is closed again once mapped.
    #[cfg(target_os = "linux")]
    fn map(size: usize, _page: usize) -> Result<(NonNull<u8>, NonNull<u8>)> {
        let last_error = || PageFaultError::HostMapping(std::io::Error::last_os_error());

        // SAFETY: the name is a NUL-terminated literal.
        let fd = unsafe { libc::memfd_create(b"gfx-host\0".as_ptr().cast(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(last_error());
        }
        let mapped = (|| {
            // SAFETY: `fd` is a memfd this function owns.
            if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
                return Err(last_error());
            }
            let ptr = Self::map_shared(fd, size)?;
            match Self::map_shared(fd, size) {
                Ok(alias) => Ok((ptr, alias)),
                Err(err) => {
                    // SAFETY: unmapping the exact range mapped just above.
                    unsafe { libc::munmap(ptr.as_ptr().cast(), size) };
                    Err(err)
                }
            }
        })();
        // SAFETY: the mappings keep the file alive; the descriptor is no longer needed.
        unsafe { libc::close(fd) };
        mapped
    }

    #[cfg(target_os = "linux")]
    fn map_shared(fd: libc::c_int, size: usize) -> Result<NonNull<u8>> {
        // SAFETY: shared file mapping with no fixed address; `fd` is sized to `size`.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(PageFaultError::HostMapping(std::io::Error::last_os_error()));
        }
        NonNull::new(ptr.cast::<u8>()).ok_or_else(|| {
            PageFaultError::HostMapping(std::io::Error::other("mmap returned null"))
        })
    }

    /// No page protection off Linux, so the alias is the allocation itself.
    #[cfg(not(target_os = "linux"))]
    fn map(size: usize, page: usize) -> Result<(NonNull<u8>, NonNull<u8>)> {
        let layout = std::alloc::Layout::from_size_align(size, page)
            .map_err(|err| PageFaultError::HostMapping(std::io::Error::other(err)))?;
        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            PageFaultError::HostMapping(std::io::Error::from(std::io::ErrorKind::OutOfMemory))
        })?;
        Ok((ptr, ptr))
    }

    pub fn as_ptr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(PageFaultError::OutOfBounds {
                offset,
                len,
                size: self.size,
            }),
        }
    }

    pub fn read(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.check(offset, dst.len())?;
        // SAFETY: bounds checked; the mapping lives as long as `self`.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    pub fn write(&self, offset: usize, src: &[u8]) -> Result<()> {
        self.check(offset, src.len())?;
        // SAFETY: bounds checked; the mapping lives as long as `self`.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.as_ptr().add(offset), src.len());
        }
        Ok(())
    }

    /// Read through the alias view. Never faults.
    pub fn read_unprotected(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.check(offset, dst.len())?;
        // SAFETY: bounds checked; the alias shares the primary view's lifetime.
        unsafe {
            std::ptr::copy_nonoverlapping(self.alias.as_ptr().add(offset), dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    /// Write through the alias view. Never faults and leaves protection untouched.
    pub fn write_unprotected(&self, offset: usize, src: &[u8]) -> Result<()> {
        self.check(offset, src.len())?;
        // SAFETY: bounds checked; the alias shares the primary view's lifetime.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.alias.as_ptr().add(offset), src.len());
        }
        Ok(())
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        self.check(offset, 4)?;
        // SAFETY: bounds checked; `[u8; 4]` has alignment 1.
        let bytes =
            unsafe { std::ptr::read_volatile(self.ptr.as_ptr().add(offset).cast::<[u8; 4]>()) };
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn write_u32(&self, offset: usize, value: u32) -> Result<()> {
        self.check(offset, 4)?;
        // SAFETY: bounds checked; `[u8; 4]` has alignment 1.
        unsafe {
            std::ptr::write_volatile(
                self.ptr.as_ptr().add(offset).cast::<[u8; 4]>(),
                value.to_le_bytes(),
            );
        }
        Ok(())
    }
}

impl HostAllocation {
    #[cfg(target_os = "linux")]
    fn unmap(&mut self) {
        // SAFETY: unmapping the exact ranges returned by mmap.
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.size);
            libc::munmap(self.alias.as_ptr().cast(), self.size);
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn unmap(&mut self) {
        // SAFETY: same size and alignment as the allocation.
        unsafe {
            let layout = std::alloc::Layout::from_size_align_unchecked(self.size, host_page_size());
            std::alloc::dealloc(self.ptr.as_ptr(), layout);
        }
    }
}

impl Drop for HostAllocation {
    fn drop(&mut self) {
        self.unmap();
    }
}

impl std::fmt::Debug for HostAllocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostAllocation")
            .field("ptr", &format_args!("{:#x}", self.as_ptr()))
            .field("size", &self.size)
            .finish()
    }
}
