//! Timestamp-packet tags and dispatch dependencies.
//!
//! A [`TagNode`] is a 4-byte GPU-visible cell taken from a per-root-device pool. Producers
//! write the completion value with a post-sync operation; consumers embed a semaphore wait on
//! the cell. A node goes back to the pool only after its last holder dropped it *and* the cell
//! reached its completion value; nodes dropped earlier are parked on a deferred list that
//! [`TagAllocator::allocate`] re-examines.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use gfx_memory::{
    align_up, AllocationProperties, AllocationType, GpuAddressSpace, GraphicsAllocation,
    MemoryError, TagCell, PAGE_SIZE,
};
use tracing::{debug, trace};

use crate::Result;

pub const TIMESTAMP_PACKET_INITIAL_VALUE: u32 = 0;
pub const TIMESTAMP_PACKET_COMPLETED_VALUE: u32 = 1;

const TAG_SIZE: u64 = 4;

#[derive(Default)]
struct TagPools {
    pools: Vec<GraphicsAllocation>,
    free: Vec<TagCell>,
    deferred: Vec<TagCell>,
}

impl TagPools {
    fn recycle_deferred(&mut self) {
        let (done, pending): (Vec<_>, Vec<_>) = self
            .deferred
            .drain(..)
            .partition(|cell| cell.is_at_least(TIMESTAMP_PACKET_COMPLETED_VALUE));
        self.deferred = pending;
        self.free.extend(done);
    }
}

/// Per-root-device pool of timestamp-packet tags. Pools grow by at least `pool_size` tags (a
/// whole page) at a time.
pub struct TagAllocator {
    memory: Arc<GpuAddressSpace>,
    pool_size: usize,
    pools: Arc<Mutex<TagPools>>,
}

impl TagAllocator {
    pub fn new(memory: Arc<GpuAddressSpace>, pool_size: usize) -> Self {
        Self {
            memory,
            pool_size: pool_size.max(1),
            pools: Arc::new(Mutex::new(TagPools::default())),
        }
    }

    pub fn root_device_index(&self) -> u32 {
        self.memory.root_device_index()
    }

    pub fn allocate(&self) -> Result<TagNode> {
        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        if pools.free.is_empty() {
            pools.recycle_deferred();
        }
        if pools.free.is_empty() {
            self.grow(&mut pools)?;
        }
        let cell = pools
            .free
            .pop()
            .ok_or(MemoryError::AddressSpaceExhausted { requested: TAG_SIZE })?;
        drop(pools);

        cell.store(TIMESTAMP_PACKET_INITIAL_VALUE);
        trace!(gpu_address = cell.gpu_address(), "tag allocated");
        Ok(TagNode {
            inner: Arc::new(TagNodeInner {
                cell,
                completion_value: TIMESTAMP_PACKET_COMPLETED_VALUE,
                pools: Arc::downgrade(&self.pools),
            }),
        })
    }

    fn grow(&self, pools: &mut TagPools) -> Result<()> {
        let size = align_up(self.pool_size as u64 * TAG_SIZE, PAGE_SIZE);
        let allocation = self.memory.allocate(AllocationProperties::new(
            size,
            AllocationType::TimestampPacketTagBuffer,
        ))?;
        // Reverse so tags are handed out in address order.
        for index in (0..size / TAG_SIZE).rev() {
            pools.free.push(allocation.tag_cell(index * TAG_SIZE)?);
        }
        debug!(
            root_device_index = self.memory.root_device_index(),
            pools = pools.pools.len() + 1,
            gpu_address = allocation.gpu_address(),
            "timestamp packet pool grown"
        );
        pools.pools.push(allocation);
        Ok(())
    }

    pub fn pool_count(&self) -> usize {
        self.pools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pools
            .len()
    }

    pub fn free_count(&self) -> usize {
        self.pools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .free
            .len()
    }

    pub fn deferred_count(&self) -> usize {
        self.pools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .deferred
            .len()
    }
}

impl Drop for TagAllocator {
    fn drop(&mut self) {
        let pools = std::mem::take(&mut *self.pools.lock().unwrap_or_else(PoisonError::into_inner));
        for allocation in &pools.pools {
            self.memory.free(allocation);
        }
    }
}

struct TagNodeInner {
    cell: TagCell,
    completion_value: u32,
    pools: Weak<Mutex<TagPools>>,
}

impl Drop for TagNodeInner {
    fn drop(&mut self) {
        let Some(pools) = self.pools.upgrade() else {
            return;
        };
        let mut pools = pools.lock().unwrap_or_else(PoisonError::into_inner);
        if self.cell.is_at_least(self.completion_value) {
            pools.free.push(self.cell.clone());
        } else {
            trace!(
                gpu_address = self.cell.gpu_address(),
                "tag released before completion, deferring"
            );
            pools.deferred.push(self.cell.clone());
        }
    }
}

/// Shared handle to one tag. Cloning adds a holder.
#[derive(Clone)]
pub struct TagNode {
    inner: Arc<TagNodeInner>,
}

impl TagNode {
    pub fn gpu_address(&self) -> u64 {
        self.inner.cell.gpu_address()
    }

    pub fn completion_value(&self) -> u32 {
        self.inner.completion_value
    }

    pub fn cell(&self) -> &TagCell {
        &self.inner.cell
    }

    pub fn is_completed(&self) -> bool {
        self.inner.cell.is_at_least(self.inner.completion_value)
    }

    pub fn ptr_eq(&self, other: &TagNode) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for TagNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagNode")
            .field("gpu_address", &format_args!("{:#x}", self.gpu_address()))
            .field("value", &self.inner.cell.load())
            .field("completion_value", &self.inner.completion_value)
            .finish()
    }
}

#[derive(Clone, Debug, Default)]
pub struct TimestampPacketContainer {
    nodes: Vec<TagNode>,
}

impl TimestampPacketContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, node: TagNode) {
        self.nodes.push(node);
    }

    /// Append clones of every node in `other`.
    pub fn assign_and_increment_nodes_ref_counts(&mut self, other: &TimestampPacketContainer) {
        self.nodes.extend(other.nodes.iter().cloned());
    }

    pub fn nodes(&self) -> &[TagNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_completed(&self) -> bool {
        self.nodes.iter().all(TagNode::is_completed)
    }
}

/// Wait on another CSR's tag reaching `task_count`.
#[derive(Clone, Debug)]
pub struct TaskCountDependency {
    pub tag: TagCell,
    pub task_count: u32,
}

#[derive(Clone, Debug, Default)]
pub struct CsrDependencies {
    pub timestamp_packet_containers: Vec<TimestampPacketContainer>,
    pub task_count_container: Vec<TaskCountDependency>,
}

impl CsrDependencies {
    pub fn is_empty(&self) -> bool {
        self.timestamp_packet_containers
            .iter()
            .all(TimestampPacketContainer::is_empty)
            && self.task_count_container.is_empty()
    }

    /// `(gpu address, value)` pairs the dispatch must wait on.
    pub fn wait_points(&self) -> impl Iterator<Item = (u64, u32)> + '_ {
        let packets = self
            .timestamp_packet_containers
            .iter()
            .flat_map(|container| container.nodes())
            .map(|node| (node.gpu_address(), node.completion_value()));
        let task_counts = self
            .task_count_container
            .iter()
            .map(|dep| (dep.tag.gpu_address(), dep.task_count));
        packets.chain(task_counts)
    }

    /// Node handles the CSR keeps alive until the dispatch retired.
    pub fn nodes(&self) -> impl Iterator<Item = &TagNode> + '_ {
        self.timestamp_packet_containers
            .iter()
            .flat_map(|container| container.nodes())
    }
}
