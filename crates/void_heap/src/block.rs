//! Block metadata layout
//!
//! Every block is bracketed by two identical 16-byte records:
//!
//! ```text
//!   offset ──►┌──────────────────────┐
//!             │ size | flags   (u64) │  header
//!             │ magic (u32)          │
//!             │ parent (u32)         │
//!             ├──────────────────────┤ ◄── pointer returned to the user
//!             │                      │
//!             │      user data       │
//!             │                      │
//!             ├──────────────────────┤
//!             │ size | flags   (u64) │  footer (mirror of header)
//!             │ magic (u32)          │
//!             │ parent (u32)         │
//!   offset + size ──►└──────────────────────┘ next block's header
//! ```
//!
//! `size` counts both records. Sizes are multiples of the granularity
//! (at least 8), which leaves the low bits of the size word for flags.

use crate::region::Region;

/// Header record size
pub const HEADER_SIZE: usize = 16;

/// Footer record size
pub const FOOTER_SIZE: usize = 16;

/// Metadata bytes carried by every block
pub const BLOCK_OVERHEAD: usize = HEADER_SIZE + FOOTER_SIZE;

/// Smallest data area a split remainder must be able to hold
pub const MIN_DATA_SIZE: usize = 1;

/// Validity tag written into every header and footer.
///
/// A heuristic against stray and foreign pointers, not a security boundary.
pub const BLOCK_MAGIC: u32 = 0x7A1E_B10C;

/// Parent value for blocks that do not belong to a chunk
pub const NO_PARENT: u32 = u32::MAX;

const FLAG_FREE: u64 = 0b01;
const FLAG_FENCE: u64 = 0b10;
const FLAG_MASK: u64 = 0b111;

const MAGIC_OFFSET: usize = 8;
const PARENT_OFFSET: usize = 12;

/// Decoded header (or footer) record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    /// Span of the block including both records
    pub size: usize,
    pub free: bool,
    /// Permanently used boundary block
    pub fence: bool,
    pub magic: u32,
    pub parent: u32,
}

impl BlockHeader {
    /// A used block owned by `parent`
    pub fn used(size: usize, parent: u32) -> Self {
        Self {
            size,
            free: false,
            fence: false,
            magic: BLOCK_MAGIC,
            parent,
        }
    }

    /// A free block owned by `parent`
    pub fn free(size: usize, parent: u32) -> Self {
        Self {
            free: true,
            ..Self::used(size, parent)
        }
    }

    /// A zero-data boundary block
    pub fn fence(parent: u32) -> Self {
        Self {
            fence: true,
            ..Self::used(BLOCK_OVERHEAD, parent)
        }
    }

    /// Decode the record at `offset`
    pub fn read(region: &Region, offset: usize) -> Self {
        let word = region.read_u64(offset);
        Self {
            size: (word & !FLAG_MASK) as usize,
            free: word & FLAG_FREE != 0,
            fence: word & FLAG_FENCE != 0,
            magic: region.read_u32(offset + MAGIC_OFFSET),
            parent: region.read_u32(offset + PARENT_OFFSET),
        }
    }

    /// Decode the footer that ends right before `offset`
    pub fn read_footer_before(region: &Region, offset: usize) -> Self {
        Self::read(region, offset - FOOTER_SIZE)
    }

    fn encode(&self, region: &Region, offset: usize) {
        debug_assert_eq!(self.size as u64 & FLAG_MASK, 0, "size carries flag bits");

        let mut word = self.size as u64;
        if self.free {
            word |= FLAG_FREE;
        }
        if self.fence {
            word |= FLAG_FENCE;
        }
        region.write_u64(offset, word);
        region.write_u32(offset + MAGIC_OFFSET, self.magic);
        region.write_u32(offset + PARENT_OFFSET, self.parent);
    }

    /// Write the header at `offset` and its mirrored footer at the block's end
    pub fn write(&self, region: &Region, offset: usize) {
        self.encode(region, offset);
        self.encode(region, footer_offset(offset, self.size));
    }

    /// Carries the expected tag for its owner
    #[inline]
    pub fn is_valid(&self, parent: u32) -> bool {
        self.magic == BLOCK_MAGIC && self.parent == parent && self.size >= BLOCK_OVERHEAD
    }

    /// Bytes available to the user
    #[inline]
    pub fn usable_size(&self) -> usize {
        self.size - BLOCK_OVERHEAD
    }
}

/// Offset of the footer for a block at `offset` spanning `size` bytes
#[inline]
pub fn footer_offset(offset: usize, size: usize) -> usize {
    offset + size - FOOTER_SIZE
}

/// Offset of the data area for a block at `offset`
#[inline]
pub fn data_offset(offset: usize) -> usize {
    offset + HEADER_SIZE
}
