//! The [`RawHeap`] core and the [`SentinelMalloc`] allocator built on it.

pub mod raw_heap;
pub mod sentinel_malloc;

pub use raw_heap::{ChunkInfo, Chunks, RawHeap};
pub use sentinel_malloc::SentinelMalloc;
