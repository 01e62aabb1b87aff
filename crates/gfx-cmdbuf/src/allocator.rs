use gfx_memory::{
    align_up, AllocationProperties, AllocationType, GpuAddressSpace, GraphicsAllocation,
    CACHE_LINE_SIZE, CS_OVERFETCH_SIZE, PAGE_SIZE_64K,
};

use crate::Result;

/// Bytes at the tail of every command buffer that are never handed out: one cache line for a
/// trailing end/start pair plus the command streamer's prefetch window.
const RESERVED_TAIL: u64 = CACHE_LINE_SIZE + CS_OVERFETCH_SIZE;

/// Allocation size for a command buffer that must expose at least `min_usable` bytes.
pub fn command_buffer_allocation_size(min_usable: u64) -> u64 {
    align_up(min_usable.saturating_add(RESERVED_TAIL), PAGE_SIZE_64K)
}

/// Bytes of `allocation_size` the stream may write.
pub fn usable_size(allocation_size: u64) -> u64 {
    allocation_size.saturating_sub(RESERVED_TAIL)
}

/// Source of command-buffer segments.
pub trait CommandBufferAllocator: Send + Sync {
    fn allocate_command_buffer(&self, min_usable: u64) -> Result<GraphicsAllocation>;

    fn release_command_buffer(&self, allocation: GraphicsAllocation);
}

impl CommandBufferAllocator for GpuAddressSpace {
    fn allocate_command_buffer(&self, min_usable: u64) -> Result<GraphicsAllocation> {
        let size = command_buffer_allocation_size(min_usable);
        Ok(self.allocate(AllocationProperties::new(size, AllocationType::CommandBuffer))?)
    }

    fn release_command_buffer(&self, allocation: GraphicsAllocation) {
        self.free(&allocation);
    }
}
