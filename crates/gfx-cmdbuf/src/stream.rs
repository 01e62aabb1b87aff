use std::collections::VecDeque;
use std::sync::Arc;

use gfx_memory::{align_up, GraphicsAllocation};
use tracing::debug;

use crate::{usable_size, CommandBufferAllocator, CommandBufferError, Result};

/// Writes the command that continues execution in another segment.
pub trait ChainEncoder: Send + Sync {
    /// Bytes reserved at the end of every segment for the chain command.
    fn chain_size(&self) -> usize;

    fn encode_chain(&self, dst: &mut [u8], target_gpu_address: u64);
}

/// Streams that never continue across segments (each submission starts at its own address).
#[derive(Clone, Copy, Debug, Default)]
pub struct NoChain;

impl ChainEncoder for NoChain {
    fn chain_size(&self) -> usize {
        0
    }

    fn encode_chain(&self, _dst: &mut [u8], _target_gpu_address: u64) {}
}

/// A point in the stream: segment id plus byte offset inside that segment.
///
/// Positions are totally ordered in write order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamPosition {
    pub segment: u64,
    pub offset: usize,
}

/// Written bytes of one segment between two positions.
#[derive(Clone, Debug)]
pub struct SegmentRange {
    pub segment: u64,
    pub allocation: GraphicsAllocation,
    pub start: usize,
    pub end: usize,
}

impl SegmentRange {
    pub fn gpu_start(&self) -> u64 {
        self.allocation.gpu_address() + self.start as u64
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

struct Segment {
    id: u64,
    allocation: GraphicsAllocation,
    staged: Vec<u8>,
    used: usize,
    committed: usize,
}

impl Segment {
    fn capacity(&self) -> usize {
        self.staged.len()
    }
}

/// Append-only command stream.
///
/// Bytes are staged on the CPU and uploaded to the segment's allocation by [`commit`]
/// (the submission point). Closed segments stay owned by the stream until
/// [`release_segments_before`] says the GPU is done with them.
///
/// [`commit`]: LinearStream::commit
/// [`release_segments_before`]: LinearStream::release_segments_before
pub struct LinearStream {
    allocator: Arc<dyn CommandBufferAllocator>,
    chain: Arc<dyn ChainEncoder>,
    min_segment_size: u64,
    current: Segment,
    retired: VecDeque<Segment>,
    reusable: Vec<GraphicsAllocation>,
    next_segment_id: u64,
}

impl LinearStream {
    const MAX_REUSABLE: usize = 4;

    pub fn new(
        allocator: Arc<dyn CommandBufferAllocator>,
        chain: Arc<dyn ChainEncoder>,
        min_segment_size: u64,
    ) -> Result<Self> {
        let allocation = allocator.allocate_command_buffer(min_segment_size)?;
        let current = Self::segment_for(0, allocation);
        Ok(Self {
            allocator,
            chain,
            min_segment_size,
            current,
            retired: VecDeque::new(),
            reusable: Vec::new(),
            next_segment_id: 1,
        })
    }

    fn segment_for(id: u64, allocation: GraphicsAllocation) -> Segment {
        let capacity = usable_size(allocation.size()) as usize;
        Segment {
            id,
            allocation,
            staged: vec![0; capacity],
            used: 0,
            committed: 0,
        }
    }

    /// Bytes that can still be handed out by the current segment without chaining.
    pub fn available(&self) -> usize {
        self.current
            .capacity()
            .saturating_sub(self.current.used + self.chain.chain_size())
    }

    /// Bytes written into the current segment.
    pub fn used(&self) -> usize {
        self.current.used
    }

    pub fn capacity(&self) -> usize {
        self.current.capacity()
    }

    pub fn position(&self) -> StreamPosition {
        StreamPosition {
            segment: self.current.id,
            offset: self.current.used,
        }
    }

    pub fn current_allocation(&self) -> &GraphicsAllocation {
        &self.current.allocation
    }

    /// Number of segments still owned (current included).
    pub fn segment_count(&self) -> usize {
        self.retired.len() + 1
    }

    /// Hand out `size` zeroed bytes, chaining to a new segment when the current one cannot
    /// hold them.
    pub fn get_space(&mut self, size: usize) -> Result<&mut [u8]> {
        if size > self.available() {
            self.chain_to_new_segment(size)?;
        }
        let start = self.current.used;
        self.current.used += size;
        Ok(&mut self.current.staged[start..start + size])
    }

    pub fn put(&mut self, bytes: &[u8]) -> Result<()> {
        self.get_space(bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    /// Make sure the next `size` bytes land in one segment.
    pub fn ensure_space(&mut self, size: usize) -> Result<()> {
        if size > self.available() {
            self.chain_to_new_segment(size)?;
        }
        Ok(())
    }

    /// Pad with zero bytes (no-op commands) up to `alignment`.
    pub fn align_to(&mut self, alignment: usize) -> Result<()> {
        let used = self.current.used;
        let pad = align_up(used as u64, alignment as u64) as usize - used;
        if pad == 0 {
            return Ok(());
        }
        if pad > self.available() {
            // A fresh segment starts aligned.
            return self.chain_to_new_segment(0);
        }
        self.get_space(pad).map(|_| ())
    }

    fn chain_to_new_segment(&mut self, min_usable: usize) -> Result<()> {
        let chain_size = self.chain.chain_size();
        let request = ((min_usable + chain_size) as u64).max(self.min_segment_size);
        let allocation = self.take_allocation(request)?;

        let id = self.next_segment_id;
        self.next_segment_id += 1;
        let next = Self::segment_for(id, allocation);

        if chain_size > 0 {
            let at = self.current.used;
            self.chain.encode_chain(
                &mut self.current.staged[at..at + chain_size],
                next.allocation.gpu_address(),
            );
            self.current.used += chain_size;
        }

        debug!(
            from_segment = self.current.id,
            to_segment = id,
            to_gpu_address = next.allocation.gpu_address(),
            capacity = next.capacity(),
            "command stream chained to new segment"
        );

        let closed = std::mem::replace(&mut self.current, next);
        self.retired.push_back(closed);
        Ok(())
    }

    fn take_allocation(&mut self, min_usable: u64) -> Result<GraphicsAllocation> {
        if let Some(index) = self
            .reusable
            .iter()
            .position(|alloc| usable_size(alloc.size()) >= min_usable)
        {
            return Ok(self.reusable.swap_remove(index));
        }
        self.allocator.allocate_command_buffer(min_usable)
    }

    fn segment(&self, id: u64) -> Result<&Segment> {
        if self.current.id == id {
            return Ok(&self.current);
        }
        self.retired
            .iter()
            .find(|seg| seg.id == id)
            .ok_or(CommandBufferError::UnknownSegment(id))
    }

    fn segment_mut(&mut self, id: u64) -> Result<&mut Segment> {
        if self.current.id == id {
            return Ok(&mut self.current);
        }
        self.retired
            .iter_mut()
            .find(|seg| seg.id == id)
            .ok_or(CommandBufferError::UnknownSegment(id))
    }

    pub fn gpu_address(&self, position: StreamPosition) -> Result<u64> {
        let segment = self.segment(position.segment)?;
        Ok(segment.allocation.gpu_address() + position.offset as u64)
    }

    /// Overwrite already-written bytes. Committed bytes are re-uploaded on the next commit.
    pub fn patch(&mut self, position: StreamPosition, bytes: &[u8]) -> Result<()> {
        let segment = self.segment_mut(position.segment)?;
        let end = position.offset + bytes.len();
        if end > segment.used {
            return Err(CommandBufferError::PatchOutOfRange {
                segment: position.segment,
                offset: position.offset,
                len: bytes.len(),
                used: segment.used,
            });
        }
        segment.staged[position.offset..end].copy_from_slice(bytes);
        segment.committed = segment.committed.min(position.offset);
        Ok(())
    }

    /// Upload every staged byte not yet visible to the GPU.
    pub fn commit(&mut self) -> Result<()> {
        for segment in self
            .retired
            .iter_mut()
            .chain(std::iter::once(&mut self.current))
        {
            if segment.committed < segment.used {
                segment.allocation.write(
                    segment.committed as u64,
                    &segment.staged[segment.committed..segment.used],
                )?;
                segment.committed = segment.used;
            }
        }
        Ok(())
    }

    /// Written ranges between two positions, in execution order.
    pub fn ranges(&self, from: StreamPosition, to: StreamPosition) -> Result<Vec<SegmentRange>> {
        let mut out = Vec::new();
        for segment in self
            .retired
            .iter()
            .chain(std::iter::once(&self.current))
            .filter(|seg| seg.id >= from.segment && seg.id <= to.segment)
        {
            let start = if segment.id == from.segment { from.offset } else { 0 };
            let end = if segment.id == to.segment { to.offset } else { segment.used };
            out.push(SegmentRange {
                segment: segment.id,
                allocation: segment.allocation.clone(),
                start,
                end,
            });
        }
        if out.first().map(|r| r.segment) != Some(from.segment) {
            return Err(CommandBufferError::UnknownSegment(from.segment));
        }
        Ok(out)
    }

    /// Staged bytes between two positions, concatenated across segments.
    pub fn bytes(&self, from: StreamPosition, to: StreamPosition) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for range in self.ranges(from, to)? {
            let segment = self.segment(range.segment)?;
            out.extend_from_slice(&segment.staged[range.start..range.end]);
        }
        Ok(out)
    }

    /// Return closed segments older than `position` to the reuse pool.
    pub fn release_segments_before(&mut self, position: StreamPosition) {
        while self
            .retired
            .front()
            .is_some_and(|seg| seg.id < position.segment)
        {
            let Some(segment) = self.retired.pop_front() else {
                break;
            };
            if self.reusable.len() < Self::MAX_REUSABLE {
                self.reusable.push(segment.allocation);
            } else {
                self.allocator.release_command_buffer(segment.allocation);
            }
        }
    }
}

impl Drop for LinearStream {
    fn drop(&mut self) {
        for segment in self.retired.drain(..) {
            self.allocator.release_command_buffer(segment.allocation);
        }
        for allocation in self.reusable.drain(..) {
            self.allocator.release_command_buffer(allocation);
        }
        self.allocator
            .release_command_buffer(self.current.allocation.clone());
    }
}

impl std::fmt::Debug for LinearStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinearStream")
            .field("segment", &self.current.id)
            .field("used", &self.current.used)
            .field("capacity", &self.current.capacity())
            .field("retired", &self.retired.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gfx_memory::{GpuAddressSpace, GpuMemory, PAGE_SIZE_64K};
    use pretty_assertions::assert_eq;

    /// 12-byte marker: 0xC4A1 tag followed by the little-endian target address.
    struct MarkerChain;

    impl ChainEncoder for MarkerChain {
        fn chain_size(&self) -> usize {
            12
        }

        fn encode_chain(&self, dst: &mut [u8], target_gpu_address: u64) {
            dst[..4].copy_from_slice(&0xC4A1u32.to_le_bytes());
            dst[4..].copy_from_slice(&target_gpu_address.to_le_bytes());
        }
    }

    fn stream_with(chain: Arc<dyn ChainEncoder>) -> (Arc<GpuAddressSpace>, LinearStream) {
        let space = Arc::new(GpuAddressSpace::new(0));
        let stream = LinearStream::new(space.clone(), chain, 1).unwrap();
        (space, stream)
    }

    #[test]
    fn get_space_returns_zeroed_bytes_and_advances() {
        let (_space, mut stream) = stream_with(Arc::new(NoChain));
        let before = stream.available();
        let space = stream.get_space(16).unwrap();
        assert_eq!(space, &[0u8; 16]);
        space.fill(0xAB);
        assert_eq!(stream.used(), 16);
        assert_eq!(stream.available(), before - 16);
    }

    #[test]
    fn overflow_chains_without_losing_or_reordering_bytes() {
        let (_space, mut stream) = stream_with(Arc::new(MarkerChain));
        let start = stream.position();
        let first_len = stream.available() - 8;
        stream.put(&vec![0x11; first_len]).unwrap();

        // Does not fit next to the reserved chain slot.
        stream.put(&[0x22; 32]).unwrap();
        assert_eq!(stream.segment_count(), 2);

        let end = stream.position();
        let bytes = stream.bytes(start, end).unwrap();
        assert_eq!(bytes.len(), first_len + 12 + 32);
        assert!(bytes[..first_len].iter().all(|b| *b == 0x11));

        let target = u64::from_le_bytes(bytes[first_len + 4..first_len + 12].try_into().unwrap());
        assert_eq!(&bytes[first_len..first_len + 4], &0xC4A1u32.to_le_bytes());
        assert_eq!(target, stream.gpu_address(StreamPosition { segment: end.segment, offset: 0 }).unwrap());
        assert!(bytes[first_len + 12..].iter().all(|b| *b == 0x22));
    }

    proptest::proptest! {
        #[test]
        fn chained_writes_read_back_in_order(
            writes in proptest::collection::vec(proptest::collection::vec(proptest::num::u8::ANY, 1..20_000), 1..12)
        ) {
            let (_space, mut stream) = stream_with(Arc::new(NoChain));
            let start = stream.position();
            for write in &writes {
                stream.put(write).unwrap();
            }
            let expected: Vec<u8> = writes.concat();
            proptest::prop_assert_eq!(stream.bytes(start, stream.position()).unwrap(), expected);
        }
    }

    #[test]
    fn large_requests_get_a_segment_big_enough() {
        let (_space, mut stream) = stream_with(Arc::new(NoChain));
        let huge = 3 * PAGE_SIZE_64K as usize;
        stream.get_space(huge).unwrap();
        assert!(stream.capacity() >= huge);
        assert_eq!(stream.used(), huge);
    }

    #[test]
    fn align_pads_with_zeroes() {
        let (_space, mut stream) = stream_with(Arc::new(NoChain));
        stream.put(&[0xFF; 5]).unwrap();
        stream.align_to(64).unwrap();
        assert_eq!(stream.used(), 64);

        stream.align_to(64).unwrap();
        assert_eq!(stream.used(), 64);
    }

    #[test]
    fn commit_uploads_and_patch_reuploads() {
        let (space, mut stream) = stream_with(Arc::new(NoChain));
        let pos = stream.position();
        stream.put(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        stream.commit().unwrap();

        let base = stream.gpu_address(pos).unwrap();
        assert_eq!(space.read_u32(base).unwrap(), 0x0403_0201);

        stream
            .patch(StreamPosition { segment: pos.segment, offset: 4 }, &[9, 9, 9, 9])
            .unwrap();
        assert_eq!(space.read_u32(base + 4).unwrap(), 0x0807_0605);
        stream.commit().unwrap();
        assert_eq!(space.read_u32(base + 4).unwrap(), 0x0909_0909);
    }

    #[test]
    fn patch_past_written_bytes_is_rejected() {
        let (_space, mut stream) = stream_with(Arc::new(NoChain));
        stream.put(&[0; 4]).unwrap();
        let err = stream
            .patch(StreamPosition { segment: 0, offset: 2 }, &[0; 4])
            .unwrap_err();
        assert!(matches!(err, CommandBufferError::PatchOutOfRange { used: 4, .. }));
    }

    #[test]
    fn released_segments_are_reused() {
        let (space, mut stream) = stream_with(Arc::new(NoChain));
        let first = stream.current_allocation().gpu_address();
        let fill = stream.available();
        stream.get_space(fill).unwrap();
        stream.get_space(8).unwrap();

        let pos = stream.position();
        stream.release_segments_before(pos);
        assert_eq!(stream.segment_count(), 1);
        assert!(stream.gpu_address(StreamPosition { segment: 0, offset: 0 }).is_err());

        let fill = stream.available();
        stream.get_space(fill).unwrap();
        stream.get_space(8).unwrap();
        assert_eq!(stream.current_allocation().gpu_address(), first);
        assert_eq!(space.stats().snapshot().allocations, 2);
    }

    #[test]
    fn drop_returns_every_segment() {
        let (space, mut stream) = stream_with(Arc::new(MarkerChain));
        let fill = stream.available();
        stream.get_space(fill).unwrap();
        stream.get_space(8).unwrap();
        assert_eq!(space.mapped_allocations(), 2);
        drop(stream);
        assert_eq!(space.mapped_allocations(), 0);
    }
}
