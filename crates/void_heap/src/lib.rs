//! # void_heap - General-Purpose Block Allocator
//!
//! A malloc/free style heap that keeps its metadata inside the memory it
//! manages:
//! - FixedHeap: one region mapped up front, O(1) coalescing through footers
//! - ChunkedHeap: chunks mapped on demand, fenced, released when fully free
//! - global: a process-wide chunked heap behind `init` / `allocate` / `deallocate`
//!
//! Every block carries a header and a mirrored footer, so freeing a block
//! merges it with both neighbours without scanning. Chunked heaps add a
//! validity tag and a parent chunk index to every record and reject frees of
//! pointers they did not hand out.
//!
//! ```text
//!   chunk:  ┌───────┬────────────┬──────────────┬────────────┬───────┐
//!           │ fence │ used block │  free block  │ used block │ fence │
//!           └───────┴────────────┴──────────────┴────────────┴───────┘
//!   block:  [ header 16B | data (multiple of granularity) | footer 16B ]
//! ```
//!
//! Misuse is never reported to the caller: freeing null, a foreign pointer or
//! an already free block does nothing. The `try_*` methods on each heap return
//! the reason instead.

extern crate alloc;

pub mod block;
pub mod chunk_list;
pub mod chunked;
pub mod config;
pub mod error;
pub mod fixed;
pub mod global;
pub mod provider;
pub mod region;
pub mod span;
pub mod stats;

use core::ptr::NonNull;

pub use chunked::ChunkedHeap;
pub use config::{HeapConfig, PlacementPolicy};
pub use error::{AllocError, ConfigError, FreeError, HeapError, MapError};
pub use fixed::FixedHeap;
pub use provider::{Budgeted, DefaultProvider, PageProvider, SystemProvider};
pub use span::BlockInfo;
pub use stats::HeapStats;

#[cfg(unix)]
pub use provider::MmapProvider;

/// Common trait for both heap flavours
pub trait Allocator: Send + Sync {
    /// Allocate at least `size` bytes. `None` only when no block fits and the
    /// heap cannot grow.
    fn allocate(&self, size: usize) -> Option<NonNull<u8>>;

    /// Free a pointer returned by `allocate`.
    ///
    /// Null, foreign and already freed pointers are ignored.
    fn deallocate(&self, ptr: *mut u8);

    /// Bytes usable behind a live pointer
    fn usable_size(&self, ptr: *const u8) -> Option<usize>;

    /// Counter snapshot
    fn stats(&self) -> HeapStats;

    /// Drop every allocation and return the heap to its initial state
    fn reset(&mut self);

    /// Bytes managed as blocks, metadata included
    fn capacity(&self) -> usize {
        self.stats().capacity()
    }

    /// Bytes in used blocks, metadata included
    fn used(&self) -> usize {
        self.stats().allocated_bytes
    }

    /// Bytes in free blocks
    fn available(&self) -> usize {
        self.capacity() - self.used()
    }
}

/// Align a value up to the given alignment
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Align a value down to the given alignment
#[inline]
pub const fn align_down(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Check if a pointer is aligned
#[inline]
pub fn is_aligned(ptr: *const u8, align: usize) -> bool {
    (ptr as usize) & (align - 1) == 0
}

pub mod prelude {
    pub use crate::{Allocator, ChunkedHeap, FixedHeap, HeapConfig, HeapStats, PlacementPolicy};
    pub use crate::{align_down, align_up, is_aligned};
}
