//! Mapped memory region - the only place raw pointers are dereferenced
//!
//! Everything above this module addresses heap metadata by byte offset.
//! Reads and writes go through raw pointers so that a user writing into a
//! block it owns never races with a Rust reference covering the same bytes.

use core::ptr::NonNull;

/// One contiguous span of backing memory handed out by a [`PageProvider`].
///
/// A region is neither `Clone` nor `Copy`: it is returned to its provider
/// exactly once through [`PageProvider::unmap`].
///
/// [`PageProvider`]: crate::provider::PageProvider
/// [`PageProvider::unmap`]: crate::provider::PageProvider::unmap
#[derive(Debug)]
pub struct Region {
    base: NonNull<u8>,
    len: usize,
}

// Safety: a region is plain memory; all access is serialized by the owning heap's mutex
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Wrap a raw span.
    ///
    /// # Safety
    /// `base..base + len` must be valid for reads and writes for as long as the
    /// region lives, and must not be accessed through any other path except the
    /// data areas this crate hands out.
    pub unsafe fn from_raw_parts(base: NonNull<u8>, len: usize) -> Self {
        Self { base, len }
    }

    /// Base address
    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Length in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region is zero-length
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Translate an address into an offset, if it lies inside the region
    #[inline]
    pub fn offset_of(&self, ptr: *const u8) -> Option<usize> {
        let addr = ptr as usize;
        let start = self.base.as_ptr() as usize;
        (addr >= start && addr < start + self.len).then(|| addr - start)
    }

    /// Whether an address lies inside the region
    #[inline]
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.offset_of(ptr).is_some()
    }

    /// Pointer to the byte at `offset`
    #[inline]
    pub fn ptr_at(&self, offset: usize) -> NonNull<u8> {
        assert!(offset < self.len, "offset {} outside region of {} bytes", offset, self.len);
        // Safety: in bounds of a live allocation, so non-null
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) }
    }

    #[inline]
    fn check(&self, offset: usize, width: usize) {
        assert!(
            offset.checked_add(width).is_some_and(|end| end <= self.len),
            "access of {} bytes at offset {} outside region of {} bytes",
            width,
            offset,
            self.len
        );
    }

    /// Read a little-endian u64
    #[inline]
    pub fn read_u64(&self, offset: usize) -> u64 {
        self.check(offset, 8);
        // Safety: bounds checked above
        let raw = unsafe { self.base.as_ptr().add(offset).cast::<u64>().read_unaligned() };
        u64::from_le(raw)
    }

    /// Write a little-endian u64
    #[inline]
    pub fn write_u64(&self, offset: usize, value: u64) {
        self.check(offset, 8);
        // Safety: bounds checked above
        unsafe {
            self.base
                .as_ptr()
                .add(offset)
                .cast::<u64>()
                .write_unaligned(value.to_le())
        }
    }

    /// Read a little-endian u32
    #[inline]
    pub fn read_u32(&self, offset: usize) -> u32 {
        self.check(offset, 4);
        // Safety: bounds checked above
        let raw = unsafe { self.base.as_ptr().add(offset).cast::<u32>().read_unaligned() };
        u32::from_le(raw)
    }

    /// Write a little-endian u32
    #[inline]
    pub fn write_u32(&self, offset: usize, value: u32) {
        self.check(offset, 4);
        // Safety: bounds checked above
        unsafe {
            self.base
                .as_ptr()
                .add(offset)
                .cast::<u32>()
                .write_unaligned(value.to_le())
        }
    }
}
