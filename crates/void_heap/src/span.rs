//! Block engine over one region
//!
//! A span owns a region and keeps the blocks tiling `[lo, hi)` exactly:
//! walking `offset += size` from `lo` lands on `hi`. Splitting and merging
//! only ever move a boundary, never create or drop bytes.

use core::ptr::NonNull;

use crate::block::{
    data_offset, footer_offset, BlockHeader, BLOCK_OVERHEAD, HEADER_SIZE, MIN_DATA_SIZE,
    NO_PARENT,
};
use crate::config::PlacementPolicy;
use crate::error::{AllocError, FreeError, HeapError, HeapResult};
use crate::region::Region;
use crate::align_down;

/// Size of each boundary block of a fenced span
pub const FENCE_SIZE: usize = BLOCK_OVERHEAD;

/// Total block size needed to serve a request of `size` bytes.
///
/// Zero-byte requests get one granule.
pub fn block_size_for(size: usize, granularity: usize) -> Result<usize, AllocError> {
    size.max(MIN_DATA_SIZE)
        .checked_add(granularity - 1)
        .and_then(|rounded| (rounded & !(granularity - 1)).checked_add(BLOCK_OVERHEAD))
        .ok_or(AllocError::TooLarge(size))
}

/// A free block picked by a search
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub offset: usize,
    pub size: usize,
}

/// Outcome of taking a block
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Taken {
    /// Bytes now in use (may exceed the request when the tail was absorbed)
    pub size: usize,
    /// A free remainder block was created
    pub split: bool,
}

/// Outcome of releasing a block
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Released {
    /// Bytes returned by the block itself
    pub size: usize,
    /// Neighbours absorbed (0, 1 or 2)
    pub merges: usize,
    /// The free block after coalescing
    pub block: Candidate,
}

/// Snapshot of one block
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    /// Owning chunk slot, or `NO_PARENT`
    pub parent: u32,
    /// Header offset inside the region
    pub offset: usize,
    /// Span including metadata
    pub size: usize,
    pub free: bool,
    /// First byte of the data area
    pub data: *mut u8,
}

impl BlockInfo {
    /// Bytes available to the user
    pub fn usable_size(&self) -> usize {
        self.size - BLOCK_OVERHEAD
    }
}

/// Byte totals of one span
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SpanSummary {
    pub used_bytes: usize,
    pub free_bytes: usize,
    pub used_blocks: usize,
    pub free_blocks: usize,
}

/// Blocks laid out over a region
#[derive(Debug)]
pub struct Span {
    region: Region,
    lo: usize,
    hi: usize,
    parent: u32,
    granularity: usize,
    fenced: bool,
}

impl Span {
    /// First `len` bytes of the region as one free block, no fences
    pub fn plain(region: Region, len: usize, granularity: usize) -> Self {
        let hi = align_down(len.min(region.len()), granularity);
        let span = Self {
            region,
            lo: 0,
            hi,
            parent: NO_PARENT,
            granularity,
            fenced: false,
        };
        span.format();
        span
    }

    /// Region bracketed by two permanently used fences, one free block between
    pub fn fenced(region: Region, parent: u32, granularity: usize) -> Self {
        let end = align_down(region.len(), granularity);
        let span = Self {
            region,
            lo: FENCE_SIZE,
            hi: end - FENCE_SIZE,
            parent,
            granularity,
            fenced: true,
        };
        BlockHeader::fence(parent).write(&span.region, 0);
        BlockHeader::fence(parent).write(&span.region, span.hi);
        span.format();
        span
    }

    /// Install a single free block covering the span
    pub fn format(&self) {
        BlockHeader::free(self.capacity(), self.parent).write(&self.region, self.lo);
    }

    /// Bytes managed as blocks
    #[inline]
    pub fn capacity(&self) -> usize {
        self.hi - self.lo
    }

    #[inline]
    pub fn parent(&self) -> u32 {
        self.parent
    }

    #[inline]
    pub fn region(&self) -> &Region {
        &self.region
    }

    /// Give the region back for unmapping
    pub fn into_region(self) -> Region {
        self.region
    }

    #[inline]
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.region.contains(ptr)
    }

    /// Whether `block` is the only block of the span
    #[inline]
    pub fn is_whole(&self, block: Candidate) -> bool {
        block.offset == self.lo && block.size == self.capacity()
    }

    /// Data pointer for the block at `offset`
    #[inline]
    pub fn data_ptr(&self, offset: usize) -> NonNull<u8> {
        self.region.ptr_at(data_offset(offset))
    }

    /// Search for a free block of at least `needed` bytes
    pub fn find(&self, needed: usize, policy: PlacementPolicy) -> Option<Candidate> {
        let mut best: Option<Candidate> = None;

        for block in self.walk() {
            if !block.free || block.size < needed {
                continue;
            }
            let candidate = Candidate {
                offset: block.offset,
                size: block.size,
            };
            match policy {
                PlacementPolicy::FirstFit => return Some(candidate),
                PlacementPolicy::BestFit => {
                    if block.size == needed {
                        return Some(candidate);
                    }
                    if best.map_or(true, |b| block.size < b.size) {
                        best = Some(candidate);
                    }
                }
            }
        }

        best
    }

    /// Mark the free block at `offset` used, splitting off the tail when the
    /// remainder can hold a block of its own
    pub fn take(&self, offset: usize, needed: usize) -> Taken {
        let header = BlockHeader::read(&self.region, offset);
        debug_assert!(header.free && header.size >= needed);

        let remainder = header.size - needed;
        if remainder >= BLOCK_OVERHEAD + MIN_DATA_SIZE {
            BlockHeader::used(needed, self.parent).write(&self.region, offset);
            BlockHeader::free(remainder, self.parent).write(&self.region, offset + needed);
            Taken {
                size: needed,
                split: true,
            }
        } else {
            BlockHeader::used(header.size, self.parent).write(&self.region, offset);
            Taken {
                size: header.size,
                split: false,
            }
        }
    }

    /// Mark the used block at `offset` free and coalesce it with free neighbours
    pub fn release(&self, offset: usize) -> Released {
        let header = BlockHeader::read(&self.region, offset);
        let freed = header.size;
        let mut block = Candidate {
            offset,
            size: freed,
        };
        let mut merges = 0;

        BlockHeader::free(block.size, self.parent).write(&self.region, block.offset);

        let right = block.offset + block.size;
        if right < self.hi {
            let neighbour = BlockHeader::read(&self.region, right);
            if self.is_mergeable(&neighbour) && self.ends_within(right, neighbour.size) {
                block.size += neighbour.size;
                BlockHeader::free(block.size, self.parent).write(&self.region, block.offset);
                merges += 1;
            }
        }

        if block.offset > self.lo {
            let footer = BlockHeader::read_footer_before(&self.region, block.offset);
            if self.is_mergeable(&footer) && footer.size <= block.offset - self.lo {
                let left = block.offset - footer.size;
                if BlockHeader::read(&self.region, left) == footer {
                    block = Candidate {
                        offset: left,
                        size: footer.size + block.size,
                    };
                    BlockHeader::free(block.size, self.parent).write(&self.region, block.offset);
                    merges += 1;
                }
            }
        }

        Released {
            size: freed,
            merges,
            block,
        }
    }

    /// Whether a block of `size` bytes at `offset` ends inside the span
    #[inline]
    fn ends_within(&self, offset: usize, size: usize) -> bool {
        offset.checked_add(size).is_some_and(|end| end <= self.hi)
    }

    #[inline]
    fn is_mergeable(&self, header: &BlockHeader) -> bool {
        header.free && !header.fence && header.is_valid(self.parent)
    }

    /// Header offset of the used block whose data starts at `ptr`
    pub fn header_for(&self, ptr: *const u8) -> Result<usize, FreeError> {
        let addr = ptr as usize;
        let data = self.region.offset_of(ptr).ok_or(FreeError::Foreign(addr))?;

        if data < self.lo + HEADER_SIZE || data >= self.hi {
            return Err(FreeError::BadTag(addr));
        }
        let offset = data - HEADER_SIZE;
        if (offset - self.lo) % self.granularity != 0 {
            return Err(FreeError::BadTag(addr));
        }

        let header = BlockHeader::read(&self.region, offset);
        if !header.is_valid(self.parent)
            || header.fence
            || header.size % self.granularity != 0
            || !self.ends_within(offset, header.size)
        {
            return Err(FreeError::BadTag(addr));
        }
        if BlockHeader::read(&self.region, footer_offset(offset, header.size)) != header {
            return Err(FreeError::BadTag(addr));
        }
        if header.free {
            return Err(FreeError::DoubleFree(addr));
        }

        Ok(offset)
    }

    /// Usable bytes of the used block whose data starts at `ptr`
    pub fn usable_size(&self, ptr: *const u8) -> Option<usize> {
        let offset = self.header_for(ptr).ok()?;
        Some(BlockHeader::read(&self.region, offset).usable_size())
    }

    /// Iterate blocks in address order
    pub fn walk(&self) -> Blocks<'_> {
        Blocks {
            span: self,
            offset: self.lo,
        }
    }

    /// Verify tiling, footer mirroring, tags, fences and coalescing
    pub fn check(&self) -> HeapResult<SpanSummary> {
        let mut summary = SpanSummary::default();
        let mut offset = self.lo;
        let mut previous_free: Option<usize> = None;

        if self.fenced {
            for fence in [0, self.hi] {
                let header = BlockHeader::read(&self.region, fence);
                if !header.fence || header.free || !header.is_valid(self.parent) {
                    return Err(HeapError::BadMagic { offset: fence });
                }
            }
        }

        while offset < self.hi {
            let header = BlockHeader::read(&self.region, offset);

            if header.size < BLOCK_OVERHEAD
                || header.size % self.granularity != 0
                || !self.ends_within(offset, header.size)
            {
                return Err(HeapError::BadSize {
                    offset,
                    size: header.size,
                });
            }
            if !header.is_valid(self.parent) || header.fence {
                return Err(HeapError::BadMagic { offset });
            }
            if BlockHeader::read(&self.region, footer_offset(offset, header.size)) != header {
                return Err(HeapError::FooterMismatch { offset });
            }

            if header.free {
                if let Some(left) = previous_free {
                    return Err(HeapError::Uncoalesced {
                        left,
                        right: offset,
                    });
                }
                previous_free = Some(offset);
                summary.free_bytes += header.size;
                summary.free_blocks += 1;
            } else {
                previous_free = None;
                summary.used_bytes += header.size;
                summary.used_blocks += 1;
            }

            offset += header.size;
        }

        let covered = summary.used_bytes + summary.free_bytes;
        if offset != self.hi || covered != self.capacity() {
            return Err(HeapError::Coverage {
                covered,
                capacity: self.capacity(),
            });
        }

        Ok(summary)
    }
}

/// Address-ordered block iterator.
///
/// Stops early at a malformed size instead of running off the span.
pub struct Blocks<'a> {
    span: &'a Span,
    offset: usize,
}

impl Iterator for Blocks<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        let span = self.span;
        if self.offset >= span.hi {
            return None;
        }

        let header = BlockHeader::read(&span.region, self.offset);
        if header.size < BLOCK_OVERHEAD || !span.ends_within(self.offset, header.size) {
            log::error!(
                "Corrupt block at offset {} (size {}), abandoning walk",
                self.offset,
                header.size
            );
            self.offset = span.hi;
            return None;
        }

        let info = BlockInfo {
            parent: span.parent,
            offset: self.offset,
            size: header.size,
            free: header.free,
            data: span.data_ptr(self.offset).as_ptr(),
        };
        self.offset += header.size;
        Some(info)
    }
}
