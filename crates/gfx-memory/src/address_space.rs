use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::trace;

use crate::{
    align_up, AllocationProperties, GraphicsAllocation, MemoryError, MemoryStats, Region, Result,
    PAGE_SIZE,
};

/// Byte-addressed access to GPU virtual memory.
///
/// Only `read_bytes`/`write_bytes` are required; implementations backed by word storage
/// override the fixed-width helpers so they stay single atomic accesses.
pub trait GpuMemory {
    fn read_bytes(&self, gpu_address: u64, dst: &mut [u8]) -> Result<()>;

    fn write_bytes(&self, gpu_address: u64, src: &[u8]) -> Result<()>;

    fn read_u32(&self, gpu_address: u64) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_bytes(gpu_address, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn write_u32(&self, gpu_address: u64, value: u32) -> Result<()> {
        self.write_bytes(gpu_address, &value.to_le_bytes())
    }

    fn read_u64(&self, gpu_address: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_bytes(gpu_address, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_u64(&self, gpu_address: u64, value: u64) -> Result<()> {
        self.write_bytes(gpu_address, &value.to_le_bytes())
    }
}

struct AddressSpaceInner {
    next_va: u64,
    next_id: u64,
    regions: BTreeMap<u64, Arc<Region>>,
}

/// GPU virtual address space of one root device.
///
/// Allocations are page aligned and separated by an unmapped guard page, so a command
/// streamer prefetching past the end of one buffer never lands in a neighbour.
pub struct GpuAddressSpace {
    root_device_index: u32,
    base: u64,
    limit: u64,
    stats: Arc<MemoryStats>,
    inner: RwLock<AddressSpaceInner>,
}

impl GpuAddressSpace {
    /// Each root device gets its own 1 TiB window so addresses from different devices never
    /// alias.
    pub const DEFAULT_SIZE: u64 = 1 << 40;

    pub fn new(root_device_index: u32) -> Self {
        let base = (u64::from(root_device_index) + 1) << 40;
        Self::with_range(root_device_index, base, Self::DEFAULT_SIZE)
    }

    pub fn with_range(root_device_index: u32, base: u64, size: u64) -> Self {
        let base = align_up(base, PAGE_SIZE);
        Self {
            root_device_index,
            base,
            limit: base.saturating_add(size),
            stats: Arc::new(MemoryStats::new()),
            inner: RwLock::new(AddressSpaceInner {
                next_va: base,
                next_id: 1,
                regions: BTreeMap::new(),
            }),
        }
    }

    pub fn root_device_index(&self) -> u32 {
        self.root_device_index
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn stats(&self) -> &Arc<MemoryStats> {
        &self.stats
    }

    pub fn allocate(&self, properties: AllocationProperties) -> Result<GraphicsAllocation> {
        if properties.size == 0 {
            return Err(MemoryError::ZeroSize);
        }
        let size = align_up(properties.size, PAGE_SIZE);

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let gpu_address = inner.next_va;
        let end = gpu_address
            .checked_add(size)
            .filter(|end| *end <= self.limit)
            .ok_or(MemoryError::AddressSpaceExhausted {
                requested: properties.size,
            })?;
        inner.next_va = end.saturating_add(PAGE_SIZE);

        let id = inner.next_id;
        inner.next_id += 1;

        let region = Arc::new(Region::new(gpu_address, size));
        inner.regions.insert(gpu_address, Arc::clone(&region));
        drop(inner);

        self.stats.inc_allocations();
        trace!(
            root_device_index = self.root_device_index,
            gpu_address,
            size,
            allocation_type = ?properties.allocation_type,
            "mapped allocation"
        );

        Ok(GraphicsAllocation::new(
            id,
            properties,
            self.root_device_index,
            region,
            Arc::clone(&self.stats),
        ))
    }

    /// Unmap the allocation's range. Outstanding handles keep the storage alive but the
    /// address no longer resolves.
    pub fn free(&self, allocation: &GraphicsAllocation) {
        let removed = self
            .inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .regions
            .remove(&allocation.gpu_address());
        if removed.is_some() {
            self.stats.inc_frees();
        }
    }

    pub fn mapped_allocations(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .regions
            .len()
    }

    /// Find the region backing `[gpu_address, gpu_address + len)`.
    pub fn resolve(&self, gpu_address: u64, len: u64) -> Result<Arc<Region>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let (_, region) = inner
            .regions
            .range(..=gpu_address)
            .next_back()
            .ok_or(MemoryError::Unmapped(gpu_address))?;
        if !region.contains(gpu_address, len) {
            return Err(MemoryError::Unmapped(gpu_address));
        }
        Ok(Arc::clone(region))
    }
}

impl GpuMemory for GpuAddressSpace {
    fn read_bytes(&self, gpu_address: u64, dst: &mut [u8]) -> Result<()> {
        let region = self.resolve(gpu_address, dst.len() as u64)?;
        region.read_bytes(gpu_address - region.gpu_base(), dst)
    }

    fn write_bytes(&self, gpu_address: u64, src: &[u8]) -> Result<()> {
        let region = self.resolve(gpu_address, src.len() as u64)?;
        region.write_bytes(gpu_address - region.gpu_base(), src)
    }

    fn read_u32(&self, gpu_address: u64) -> Result<u32> {
        let region = self.resolve(gpu_address, 4)?;
        region.load_u32(gpu_address - region.gpu_base())
    }

    fn write_u32(&self, gpu_address: u64, value: u32) -> Result<()> {
        let region = self.resolve(gpu_address, 4)?;
        region.store_u32(gpu_address - region.gpu_base(), value)
    }

    fn read_u64(&self, gpu_address: u64) -> Result<u64> {
        let region = self.resolve(gpu_address, 8)?;
        region.load_u64(gpu_address - region.gpu_base())
    }

    fn write_u64(&self, gpu_address: u64, value: u64) -> Result<()> {
        let region = self.resolve(gpu_address, 8)?;
        region.store_u64(gpu_address - region.gpu_base(), value)
    }
}

impl std::fmt::Debug for GpuAddressSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuAddressSpace")
            .field("root_device_index", &self.root_device_index)
            .field("base", &format_args!("{:#x}", self.base))
            .field("mapped", &self.mapped_allocations())
            .finish()
    }
}
