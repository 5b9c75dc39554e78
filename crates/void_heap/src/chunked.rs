//! Chunked heap - grows by mapping fenced chunks, shrinks by releasing them
//!
//! Chunks are searched newest first. A chunk whose blocks have all been
//! freed is unmapped, except for the last `retain_chunks` chunks, which stay
//! mapped so an empty heap can serve the next request without a syscall.

use core::ptr::NonNull;

use alloc::vec::Vec;
use parking_lot::Mutex;

use crate::chunk_list::{ChunkId, ChunkList};
use crate::config::{HeapConfig, PlacementPolicy};
use crate::error::{AllocError, ConfigError, FreeError, HeapResult};
use crate::fixed::expect_counter;
use crate::provider::{DefaultProvider, PageProvider};
use crate::span::{block_size_for, BlockInfo, Candidate, Span, FENCE_SIZE};
use crate::stats::HeapStats;
use crate::Allocator;

#[derive(Default)]
struct ChunkedState {
    chunks: ChunkList<Span>,
    stats: HeapStats,
}

/// Heap that maps chunks on demand
pub struct ChunkedHeap<P: PageProvider = DefaultProvider> {
    provider: P,
    config: HeapConfig,
    state: Mutex<ChunkedState>,
}

impl ChunkedHeap<DefaultProvider> {
    /// Create a heap with the default configuration
    pub fn new() -> Self {
        Self {
            provider: DefaultProvider::default(),
            config: HeapConfig::default(),
            state: Mutex::new(ChunkedState::default()),
        }
    }
}

impl Default for ChunkedHeap<DefaultProvider> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: PageProvider> ChunkedHeap<P> {
    /// Create with a specific configuration and page provider.
    ///
    /// Nothing is mapped until the first allocation.
    pub fn with_config(config: HeapConfig, provider: P) -> Result<Self, ConfigError> {
        config.validate_chunked()?;
        Ok(Self {
            provider,
            config,
            state: Mutex::new(ChunkedState::default()),
        })
    }

    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Map a chunk large enough for a `needed`-byte block and link it first
    fn grow(&self, state: &mut ChunkedState, needed: usize) -> Result<ChunkId, AllocError> {
        let request = needed
            .checked_add(2 * FENCE_SIZE)
            .ok_or(AllocError::TooLarge(needed))?
            .max(self.config.chunk_size);

        let region = self.provider.map(request)?;
        let granularity = self.config.granularity;
        let id = state
            .chunks
            .push_front_with(|id| Span::fenced(region, id.index(), granularity));

        let usable = state.chunks.get(id).map_or(0, Span::capacity);
        state.stats.record_chunk_mapped(usable);

        log::debug!(
            "Mapped chunk {:?}: {} usable bytes, {} chunks live",
            id,
            usable,
            state.chunks.len()
        );
        Ok(id)
    }

    /// Pick a free block across all chunks in list order
    fn search(&self, chunks: &ChunkList<Span>, needed: usize) -> Option<(ChunkId, Candidate)> {
        let policy = self.config.policy;
        let mut best: Option<(ChunkId, Candidate)> = None;

        for (id, span) in chunks.iter() {
            let Some(candidate) = span.find(needed, policy) else {
                continue;
            };
            match policy {
                PlacementPolicy::FirstFit => return Some((id, candidate)),
                PlacementPolicy::BestFit => {
                    if best.map_or(true, |(_, b)| candidate.size < b.size) {
                        best = Some((id, candidate));
                    }
                }
            }
        }

        best
    }

    /// Allocate, reporting why a request failed
    pub fn try_allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let needed = block_size_for(size, self.config.granularity)?;
        let (id, candidate) = match self.search(&state.chunks, needed) {
            Some(hit) => hit,
            None => {
                let id = self.grow(state, needed)?;
                let span = state.chunks.get(id).ok_or(AllocError::Exhausted { needed })?;
                let candidate = span
                    .find(needed, self.config.policy)
                    .ok_or(AllocError::Exhausted { needed })?;
                (id, candidate)
            }
        };

        let span = state.chunks.get(id).ok_or(AllocError::Exhausted { needed })?;
        let taken = span.take(candidate.offset, needed);
        state.stats.record_alloc(taken.size, taken.split);

        let ptr = span.data_ptr(candidate.offset);
        log::trace!("alloc {} -> {:p} in {:?} ({} bytes taken)", size, ptr, id, taken.size);
        Ok(ptr)
    }

    /// Free, reporting why a pointer was rejected
    pub fn try_deallocate(&self, ptr: *mut u8) -> Result<(), FreeError> {
        if ptr.is_null() {
            return Err(FreeError::Null);
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;

        let (id, span) = state
            .chunks
            .find(|span| span.contains(ptr))
            .ok_or(FreeError::Foreign(ptr as usize))?;
        let offset = span.header_for(ptr)?;

        let released = span.release(offset);
        state.stats.record_free(released.size, released.merges);
        log::trace!(
            "free {:p} in {:?} ({} bytes, {} merges)",
            ptr,
            id,
            released.size,
            released.merges
        );

        if span.is_whole(released.block) && state.chunks.len() > self.config.retain_chunks {
            if let Some(span) = state.chunks.unlink(id) {
                state.stats.record_chunk_released(span.capacity());
                log::debug!(
                    "Releasing empty chunk {:?}: {} bytes, {} chunks left",
                    id,
                    span.region().len(),
                    state.chunks.len()
                );
                // Safety: the region came from this provider and holds no live blocks
                unsafe { self.provider.unmap(span.into_region()) };
            }
        }

        Ok(())
    }

    /// Snapshot every block, chunk by chunk in list order
    pub fn blocks(&self) -> Vec<BlockInfo> {
        let state = self.state.lock();
        state
            .chunks
            .iter()
            .flat_map(|(_, span)| span.walk())
            .collect()
    }

    /// Usable capacity of each chunk in list order
    pub fn chunk_capacities(&self) -> Vec<usize> {
        let state = self.state.lock();
        state.chunks.iter().map(|(_, span)| span.capacity()).collect()
    }

    /// Verify every chunk's layout and that the counters agree with it
    pub fn check(&self) -> HeapResult<()> {
        let state = self.state.lock();

        let mut used = 0;
        let mut free = 0;
        let mut blocks = 0;
        for (_, span) in state.chunks.iter() {
            let summary = span.check()?;
            used += summary.used_bytes;
            free += summary.free_bytes;
            blocks += summary.used_blocks + summary.free_blocks;
        }

        expect_counter("allocated_bytes", used, state.stats.allocated_bytes)?;
        expect_counter("free_bytes", free, state.stats.free_bytes)?;
        expect_counter("block_count", blocks, state.stats.block_count)?;
        expect_counter("chunk_count", state.chunks.len(), state.stats.chunk_count)?;
        Ok(())
    }

    fn release_all(&self, state: &mut ChunkedState) {
        while let Some(span) = state.chunks.pop_front() {
            // Safety: the region came from this provider; the heap is being torn down
            unsafe { self.provider.unmap(span.into_region()) };
        }
        state.stats = HeapStats::default();
    }
}

impl<P: PageProvider> Allocator for ChunkedHeap<P> {
    fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        match self.try_allocate(size) {
            Ok(ptr) => Some(ptr),
            Err(e) => {
                log::debug!("alloc {} failed: {}", size, e);
                None
            }
        }
    }

    fn deallocate(&self, ptr: *mut u8) {
        match self.try_deallocate(ptr) {
            Ok(()) | Err(FreeError::Null) => {}
            Err(e) => log::warn!("Ignoring free: {}", e),
        }
    }

    fn usable_size(&self, ptr: *const u8) -> Option<usize> {
        let state = self.state.lock();
        let (_, span) = state.chunks.find(|span| span.contains(ptr))?;
        span.usable_size(ptr)
    }

    fn stats(&self) -> HeapStats {
        self.state.lock().stats
    }

    /// Unmap every chunk; the next allocation maps a fresh one
    fn reset(&mut self) {
        let mut state = core::mem::take(self.state.get_mut());
        self.release_all(&mut state);
    }
}

impl<P: PageProvider> Drop for ChunkedHeap<P> {
    fn drop(&mut self) {
        let mut state = core::mem::take(self.state.get_mut());
        self.release_all(&mut state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BLOCK_MAGIC, BLOCK_OVERHEAD};
    use crate::provider::{Budgeted, SystemProvider};

    const PAGE: usize = 4096;

    fn heap(budget: usize) -> ChunkedHeap<Budgeted<SystemProvider>> {
        ChunkedHeap::with_config(
            HeapConfig::chunked(PAGE),
            Budgeted::new(SystemProvider::with_page_size(PAGE), budget),
        )
        .unwrap()
    }

    #[test]
    fn test_lazy_first_chunk() {
        let heap = heap(16 * PAGE);
        assert_eq!(heap.stats().chunk_count, 0);
        assert_eq!(heap.provider().live_regions(), 0);

        let ptr = heap.allocate(100).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 16, 0);

        let stats = heap.stats();
        assert_eq!(stats.chunk_count, 1);
        assert_eq!(stats.block_count, 2);
        assert_eq!(stats.capacity(), PAGE - 2 * FENCE_SIZE);
        heap.check().unwrap();
    }

    #[test]
    fn test_last_chunk_is_retained() {
        let heap = heap(16 * PAGE);
        let ptr = heap.allocate(100).unwrap();
        heap.deallocate(ptr.as_ptr());

        let stats = heap.stats();
        assert_eq!(stats.chunk_count, 1);
        assert_eq!(stats.block_count, 1);
        assert_eq!(stats.allocated_bytes, 0);
        assert_eq!(heap.provider().live_regions(), 1);
    }

    #[test]
    fn test_oversized_request_gets_own_chunk() {
        let heap = heap(16 * PAGE);
        let ptr = heap.allocate(3 * PAGE).unwrap();

        assert!(heap.usable_size(ptr.as_ptr()).unwrap() >= 3 * PAGE);
        assert_eq!(heap.chunk_capacities(), [4 * PAGE - 2 * FENCE_SIZE]);
        heap.check().unwrap();
    }

    #[test]
    fn test_map_failure_returns_none() {
        let heap = heap(PAGE);
        heap.allocate(100).unwrap();

        assert!(heap.allocate(2 * PAGE).is_none());
        assert!(matches!(heap.try_allocate(2 * PAGE), Err(AllocError::Map(_))));
        assert_eq!(heap.stats().chunk_count, 1);
        heap.check().unwrap();
    }

    #[test]
    fn test_foreign_pointer_rejected() {
        let mine = heap(16 * PAGE);
        let other = heap(16 * PAGE);
        let _ = mine.allocate(8).unwrap();
        let theirs = other.allocate(8).unwrap();

        assert!(matches!(mine.try_deallocate(theirs.as_ptr()), Err(FreeError::Foreign(_))));
        assert_eq!(mine.usable_size(theirs.as_ptr()), None);
        assert_eq!(other.usable_size(theirs.as_ptr()), Some(16));
    }

    #[test]
    fn test_fences_are_not_freeable() {
        let heap = heap(16 * PAGE);
        let ptr = heap.allocate(8).unwrap();

        // data pointer of the left fence sits one block before ours
        let fence_data = unsafe { ptr.as_ptr().sub(BLOCK_OVERHEAD) };
        assert!(matches!(heap.try_deallocate(fence_data), Err(FreeError::BadTag(_))));
        heap.check().unwrap();
    }

    #[test]
    fn test_forged_interior_header_is_ignored() {
        let heap = heap(16 * PAGE);
        let ptr = heap.allocate(256).unwrap();
        let parent = heap.blocks()[0].parent;

        // user data shaped like a header of this chunk with an absurd size
        unsafe {
            let forged = ptr.as_ptr().add(32);
            forged.cast::<u64>().write_unaligned(0xFFFF_FFFF_FFFF_FFF0u64.to_le());
            forged.add(8).cast::<u32>().write_unaligned(BLOCK_MAGIC.to_le());
            forged.add(12).cast::<u32>().write_unaligned(parent.to_le());
        }
        let before = heap.stats();
        let interior = unsafe { ptr.as_ptr().add(48) };

        assert!(matches!(heap.try_deallocate(interior), Err(FreeError::BadTag(_))));
        heap.deallocate(interior);
        assert_eq!(heap.usable_size(interior), None);
        assert_eq!(heap.stats(), before);
        heap.check().unwrap();

        heap.deallocate(ptr.as_ptr());
        assert_eq!(heap.stats().allocated_bytes, 0);
    }

    #[test]
    fn test_reset_unmaps_everything() {
        let mut heap = heap(16 * PAGE);
        heap.allocate(PAGE).unwrap();
        heap.allocate(PAGE).unwrap();
        heap.allocate(PAGE).unwrap();
        assert!(heap.provider().live_regions() > 1);

        heap.reset();
        assert_eq!(heap.provider().live_regions(), 0);
        assert_eq!(heap.stats(), HeapStats::default());

        heap.allocate(10).unwrap();
        assert_eq!(heap.stats().chunk_count, 1);
    }
}
