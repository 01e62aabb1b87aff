use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::{MemoryError, MemoryStats, Region, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AllocationType {
    CommandBuffer,
    TagBuffer,
    TimestampPacketTagBuffer,
    Buffer,
    UnifiedShared,
    InternalHostMemory,
    SipKernel,
    PerDssBackedBuffer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocationProperties {
    pub size: u64,
    pub allocation_type: AllocationType,
    /// Whether the CPU may map the allocation directly. Non-lockable memory is only reachable
    /// through GPU copies.
    pub lockable: bool,
}

impl AllocationProperties {
    pub fn new(size: u64, allocation_type: AllocationType) -> Self {
        Self {
            size,
            allocation_type,
            lockable: true,
        }
    }

    pub fn with_lockable(mut self, lockable: bool) -> Self {
        self.lockable = lockable;
        self
    }
}

struct AllocationInner {
    id: u64,
    allocation_type: AllocationType,
    root_device_index: u32,
    lockable: bool,
    region: Arc<Region>,
    stats: Arc<MemoryStats>,
}

/// Handle to one mapped range of a [`crate::GpuAddressSpace`].
///
/// Cloning is cheap and shares the backing storage. Storage stays alive as long as any handle
/// (or [`TagCell`]) references it, even after the address space unmapped the range.
#[derive(Clone)]
pub struct GraphicsAllocation {
    inner: Arc<AllocationInner>,
}

impl GraphicsAllocation {
    pub(crate) fn new(
        id: u64,
        properties: AllocationProperties,
        root_device_index: u32,
        region: Arc<Region>,
        stats: Arc<MemoryStats>,
    ) -> Self {
        Self {
            inner: Arc::new(AllocationInner {
                id,
                allocation_type: properties.allocation_type,
                root_device_index,
                lockable: properties.lockable,
                region,
                stats,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn gpu_address(&self) -> u64 {
        self.inner.region.gpu_base()
    }

    pub fn size(&self) -> u64 {
        self.inner.region.size()
    }

    pub fn allocation_type(&self) -> AllocationType {
        self.inner.allocation_type
    }

    pub fn root_device_index(&self) -> u32 {
        self.inner.root_device_index
    }

    pub fn is_lockable(&self) -> bool {
        self.inner.lockable
    }

    pub fn region(&self) -> &Arc<Region> {
        &self.inner.region
    }

    pub fn ptr_eq(&self, other: &GraphicsAllocation) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Device-side read, used by the command streamer and GPU copy paths.
    pub fn read(&self, offset: u64, dst: &mut [u8]) -> Result<()> {
        self.inner.region.read_bytes(offset, dst)
    }

    /// Device-side write, used by the command streamer and GPU copy paths.
    pub fn write(&self, offset: u64, src: &[u8]) -> Result<()> {
        self.inner.region.write_bytes(offset, src)
    }

    pub fn read_u32(&self, offset: u64) -> Result<u32> {
        self.inner.region.load_u32(offset)
    }

    pub fn write_u32(&self, offset: u64, value: u32) -> Result<()> {
        self.inner.region.store_u32(offset, value)
    }

    /// A GPU-visible counter at `offset` (must be 4-byte aligned).
    pub fn tag_cell(&self, offset: u64) -> Result<TagCell> {
        self.inner.region.load_u32(offset)?;
        Ok(TagCell {
            region: Arc::clone(&self.inner.region),
            index: (offset / 4) as usize,
        })
    }

    /// Map the allocation for CPU access.
    pub fn lock(&self) -> Result<LockedAllocation<'_>> {
        if !self.inner.lockable {
            return Err(MemoryError::NotLockable(self.inner.allocation_type));
        }
        self.inner.stats.inc_locks();
        Ok(LockedAllocation { allocation: self })
    }
}

impl fmt::Debug for GraphicsAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphicsAllocation")
            .field("id", &self.inner.id)
            .field("type", &self.inner.allocation_type)
            .field("gpu_address", &format_args!("{:#x}", self.gpu_address()))
            .field("size", &self.size())
            .field("root_device_index", &self.inner.root_device_index)
            .field("lockable", &self.inner.lockable)
            .finish()
    }
}

/// CPU mapping of a lockable allocation; unlocks on drop.
pub struct LockedAllocation<'a> {
    allocation: &'a GraphicsAllocation,
}

impl LockedAllocation<'_> {
    pub fn read(&self, offset: u64, dst: &mut [u8]) -> Result<()> {
        self.allocation.read(offset, dst)?;
        self.allocation
            .inner
            .stats
            .add_cpu_copy_bytes(dst.len() as u64);
        Ok(())
    }

    pub fn write(&self, offset: u64, src: &[u8]) -> Result<()> {
        self.allocation.write(offset, src)?;
        self.allocation
            .inner
            .stats
            .add_cpu_copy_bytes(src.len() as u64);
        Ok(())
    }
}

impl Drop for LockedAllocation<'_> {
    fn drop(&mut self) {
        self.allocation.inner.stats.inc_unlocks();
    }
}

/// 4-byte GPU-visible counter.
///
/// Loads are `Acquire` so everything the producer wrote before its post-sync write is visible
/// once the expected value is observed.
#[derive(Clone)]
pub struct TagCell {
    region: Arc<Region>,
    index: usize,
}

impl TagCell {
    pub fn gpu_address(&self) -> u64 {
        self.region.gpu_base() + (self.index as u64) * 4
    }

    pub fn load(&self) -> u32 {
        self.region.word(self.index).load(Ordering::Acquire)
    }

    pub fn store(&self, value: u32) {
        self.region.word(self.index).store(value, Ordering::Release);
    }

    pub fn is_at_least(&self, value: u32) -> bool {
        self.load() >= value
    }
}

impl PartialEq for TagCell {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.region, &other.region) && self.index == other.index
    }
}

impl Eq for TagCell {}

impl fmt::Debug for TagCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagCell")
            .field("gpu_address", &format_args!("{:#x}", self.gpu_address()))
            .field("value", &self.load())
            .finish()
    }
}
