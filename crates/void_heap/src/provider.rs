//! Page providers - where heaps get their backing memory
//!
//! A provider hands out zeroed, page-aligned regions and takes them back.
//! The heap never frees memory any other way.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::alloc::{self, Layout};

use crate::align_up;
use crate::error::MapError;
use crate::region::Region;

/// Page size assumed where the OS cannot be asked
pub const FALLBACK_PAGE_SIZE: usize = 4096;

/// Source of zero-initialized, page-aligned memory
pub trait PageProvider: Send + Sync {
    /// Granularity of every mapping
    fn page_size(&self) -> usize;

    /// Map at least `size` bytes. The returned region length is `size` rounded
    /// up to the page size.
    fn map(&self, size: usize) -> Result<Region, MapError>;

    /// Return a region.
    ///
    /// # Safety
    /// The region must have been produced by `map` on this same provider, and
    /// no pointer into it may be used afterwards.
    unsafe fn unmap(&self, region: Region);
}

/// Round a request to whole pages, rejecting zero and overflow
pub(crate) fn page_round(size: usize, page_size: usize) -> Result<usize, MapError> {
    if size == 0 {
        return Err(MapError::ZeroSize);
    }
    size.checked_add(page_size - 1)
        .map(|_| align_up(size, page_size))
        .ok_or(MapError::Overflow(size))
}

/// Query the platform page size
pub fn system_page_size() -> usize {
    #[cfg(unix)]
    {
        // Safety: sysconf has no preconditions
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 && (size as usize).is_power_of_two() {
            return size as usize;
        }
    }
    FALLBACK_PAGE_SIZE
}

/// Anonymous private mappings straight from the kernel
#[cfg(unix)]
#[derive(Debug, Clone, Copy)]
pub struct MmapProvider {
    page_size: usize,
}

#[cfg(unix)]
impl MmapProvider {
    pub fn new() -> Self {
        Self {
            page_size: system_page_size(),
        }
    }
}

#[cfg(unix)]
impl Default for MmapProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
impl PageProvider for MmapProvider {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn map(&self, size: usize) -> Result<Region, MapError> {
        let len = page_round(size, self.page_size)?;

        // Safety: anonymous mapping with no address hint
        let ptr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(MapError::Os(std::io::Error::last_os_error()));
        }

        let base = NonNull::new(ptr.cast::<u8>()).ok_or(MapError::Overflow(len))?;
        log::debug!("mmap {} bytes at {:p}", len, base);

        // Safety: fresh mapping of `len` bytes owned by nobody else
        Ok(unsafe { Region::from_raw_parts(base, len) })
    }

    unsafe fn unmap(&self, region: Region) {
        log::debug!("munmap {} bytes at {:p}", region.len(), region.base());
        if libc::munmap(region.base().as_ptr().cast(), region.len()) != 0 {
            log::error!(
                "munmap of {:p} failed: {}",
                region.base(),
                std::io::Error::last_os_error()
            );
        }
    }
}

/// Page-aligned zeroed memory from the Rust global allocator
#[derive(Debug, Clone, Copy)]
pub struct SystemProvider {
    page_size: usize,
}

impl SystemProvider {
    pub fn new() -> Self {
        Self::with_page_size(system_page_size())
    }

    /// Use a custom page size (must be a power of two)
    pub fn with_page_size(page_size: usize) -> Self {
        assert!(page_size.is_power_of_two(), "page size must be a power of two");
        Self { page_size }
    }

    fn layout(&self, len: usize) -> Result<Layout, MapError> {
        Layout::from_size_align(len, self.page_size).map_err(|_| MapError::Overflow(len))
    }
}

impl Default for SystemProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl PageProvider for SystemProvider {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn map(&self, size: usize) -> Result<Region, MapError> {
        let len = page_round(size, self.page_size)?;
        let layout = self.layout(len)?;

        // Safety: layout has non-zero size
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let base = NonNull::new(ptr).ok_or_else(|| {
            MapError::Os(std::io::Error::from(std::io::ErrorKind::OutOfMemory))
        })?;

        // Safety: fresh allocation of `len` bytes owned by nobody else
        Ok(unsafe { Region::from_raw_parts(base, len) })
    }

    unsafe fn unmap(&self, region: Region) {
        match self.layout(region.len()) {
            Ok(layout) => alloc::dealloc(region.base().as_ptr(), layout),
            Err(e) => log::error!("Cannot release region at {:p}: {}", region.base(), e),
        }
    }
}

/// Provider used when none is specified
#[cfg(unix)]
pub type DefaultProvider = MmapProvider;

/// Provider used when none is specified
#[cfg(not(unix))]
pub type DefaultProvider = SystemProvider;

/// Caps the total bytes another provider may have mapped at once
///
/// Lets a heap model OS exhaustion deterministically, and reports how much
/// memory is currently held.
#[derive(Debug)]
pub struct Budgeted<P> {
    inner: P,
    budget: usize,
    mapped: AtomicUsize,
    live: AtomicUsize,
    total_maps: AtomicUsize,
}

impl<P: PageProvider> Budgeted<P> {
    pub fn new(inner: P, budget: usize) -> Self {
        Self {
            inner,
            budget,
            mapped: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
            total_maps: AtomicUsize::new(0),
        }
    }

    /// Bytes currently mapped through this provider
    pub fn mapped_bytes(&self) -> usize {
        self.mapped.load(Ordering::Acquire)
    }

    /// Regions currently mapped through this provider
    pub fn live_regions(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Successful `map` calls over the provider's lifetime
    pub fn total_maps(&self) -> usize {
        self.total_maps.load(Ordering::Acquire)
    }

    /// The byte budget
    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }
}

impl<P: PageProvider> PageProvider for Budgeted<P> {
    fn page_size(&self) -> usize {
        self.inner.page_size()
    }

    fn map(&self, size: usize) -> Result<Region, MapError> {
        let len = page_round(size, self.inner.page_size())?;

        // Reserve before mapping so concurrent callers cannot overshoot
        let reserved = self.mapped.fetch_update(Ordering::AcqRel, Ordering::Acquire, |mapped| {
            mapped.checked_add(len).filter(|&total| total <= self.budget)
        });
        if let Err(mapped) = reserved {
            return Err(MapError::BudgetExceeded {
                requested: len,
                remaining: self.budget.saturating_sub(mapped),
            });
        }

        match self.inner.map(len) {
            Ok(region) => {
                self.live.fetch_add(1, Ordering::AcqRel);
                self.total_maps.fetch_add(1, Ordering::AcqRel);
                Ok(region)
            }
            Err(e) => {
                self.mapped.fetch_sub(len, Ordering::AcqRel);
                Err(e)
            }
        }
    }

    unsafe fn unmap(&self, region: Region) {
        let len = region.len();
        self.inner.unmap(region);
        self.mapped.fetch_sub(len, Ordering::AcqRel);
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<P: PageProvider> PageProvider for std::sync::Arc<P> {
    fn page_size(&self) -> usize {
        (**self).page_size()
    }

    fn map(&self, size: usize) -> Result<Region, MapError> {
        (**self).map(size)
    }

    unsafe fn unmap(&self, region: Region) {
        (**self).unmap(region)
    }
}
