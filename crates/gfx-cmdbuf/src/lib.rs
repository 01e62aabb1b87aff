//! Linear command buffer.
//!
//! A [`LinearStream`] is an append-only byte stream backed by one or more GPU command-buffer
//! allocations ("segments"). It owns no command semantics: when a segment runs out, the
//! hardware layer's [`ChainEncoder`] writes the jump into the next segment.

#![forbid(unsafe_code)]

mod allocator;
mod error;
mod stream;

pub use allocator::{command_buffer_allocation_size, usable_size, CommandBufferAllocator};
pub use error::{CommandBufferError, Result};
pub use stream::{ChainEncoder, LinearStream, NoChain, SegmentRange, StreamPosition};
