//! Heap counters
//!
//! Updated only by the heap while it holds its lock, and read back under the
//! same lock, so a snapshot always matches the layout at that instant.

/// Running totals for one heap
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes in used blocks, metadata included
    pub allocated_bytes: usize,
    /// Bytes in free blocks, metadata included
    pub free_bytes: usize,
    /// Live blocks, free and used (fences excluded)
    pub block_count: usize,
    /// High-water mark of `allocated_bytes`
    pub peak_allocated_bytes: usize,
    /// Mapped chunks (always 0 or 1 for a fixed heap)
    pub chunk_count: usize,
}

impl HeapStats {
    /// Bytes managed as blocks
    #[inline]
    pub fn capacity(&self) -> usize {
        self.allocated_bytes + self.free_bytes
    }

    pub(crate) fn record_alloc(&mut self, taken: usize, split: bool) {
        self.allocated_bytes += taken;
        self.free_bytes -= taken;
        self.peak_allocated_bytes = self.peak_allocated_bytes.max(self.allocated_bytes);
        if split {
            self.block_count += 1;
        }
    }

    pub(crate) fn record_free(&mut self, freed: usize, merges: usize) {
        self.allocated_bytes -= freed;
        self.free_bytes += freed;
        self.block_count -= merges;
    }

    pub(crate) fn record_chunk_mapped(&mut self, usable: usize) {
        self.chunk_count += 1;
        self.block_count += 1;
        self.free_bytes += usable;
    }

    pub(crate) fn record_chunk_released(&mut self, usable: usize) {
        self.chunk_count -= 1;
        self.block_count -= 1;
        self.free_bytes -= usable;
    }
}
