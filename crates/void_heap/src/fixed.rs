//! Fixed heap - one region, mapped once, carved into blocks

use core::ptr::NonNull;

use alloc::vec::Vec;
use parking_lot::Mutex;

use crate::config::HeapConfig;
use crate::error::{AllocError, ConfigError, FreeError, HeapError, HeapResult};
use crate::provider::{DefaultProvider, PageProvider};
use crate::span::{block_size_for, BlockInfo, Span};
use crate::stats::HeapStats;
use crate::Allocator;

struct FixedState {
    /// `None` when the provider could not supply memory
    span: Option<Span>,
    stats: HeapStats,
}

/// Single-region heap
///
/// General-purpose allocator over one region obtained at construction.
/// Never grows: requests that do not fit fail with a null result.
pub struct FixedHeap<P: PageProvider = DefaultProvider> {
    provider: P,
    config: HeapConfig,
    state: Mutex<FixedState>,
}

impl FixedHeap<DefaultProvider> {
    /// Create a heap over `capacity` bytes with the default layout
    pub fn new(capacity: usize) -> Result<Self, ConfigError> {
        Self::with_config(HeapConfig::fixed(capacity), DefaultProvider::default())
    }
}

impl<P: PageProvider> FixedHeap<P> {
    /// Create with a specific configuration and page provider.
    ///
    /// A provider failure leaves the heap empty; every allocation fails until
    /// [`Allocator::reset`] manages to map a region.
    pub fn with_config(config: HeapConfig, provider: P) -> Result<Self, ConfigError> {
        config.validate_fixed()?;

        let mut state = FixedState {
            span: None,
            stats: HeapStats::default(),
        };
        Self::install(&provider, &config, &mut state);

        Ok(Self {
            provider,
            config,
            state: Mutex::new(state),
        })
    }

    fn install(provider: &P, config: &HeapConfig, state: &mut FixedState) {
        match provider.map(config.arena_capacity) {
            Ok(region) => {
                let span = Span::plain(region, config.arena_capacity, config.granularity);
                state.stats = HeapStats {
                    free_bytes: span.capacity(),
                    block_count: 1,
                    chunk_count: 1,
                    ..HeapStats::default()
                };
                log::debug!("Fixed heap ready: {} bytes", span.capacity());
                state.span = Some(span);
            }
            Err(e) => {
                log::error!("Fixed heap could not map {} bytes: {}", config.arena_capacity, e);
                state.stats = HeapStats::default();
            }
        }
    }

    fn uninstall(provider: &P, state: &mut FixedState) {
        if let Some(span) = state.span.take() {
            // Safety: the region came from this provider and the heap is being reset
            unsafe { provider.unmap(span.into_region()) };
        }
        state.stats = HeapStats::default();
    }

    /// Whether backing memory is present
    pub fn is_initialized(&self) -> bool {
        self.state.lock().span.is_some()
    }

    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Allocate, reporting why a request failed
    pub fn try_allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let mut state = self.state.lock();
        let FixedState { span, stats } = &mut *state;

        let needed = block_size_for(size, self.config.granularity)?;
        let span = span.as_ref().ok_or(AllocError::Uninitialized)?;
        let candidate = span
            .find(needed, self.config.policy)
            .ok_or(AllocError::Exhausted { needed })?;

        let taken = span.take(candidate.offset, needed);
        stats.record_alloc(taken.size, taken.split);

        let ptr = span.data_ptr(candidate.offset);
        log::trace!("alloc {} -> {:p} ({} bytes taken)", size, ptr, taken.size);
        Ok(ptr)
    }

    /// Free, reporting why a pointer was rejected
    pub fn try_deallocate(&self, ptr: *mut u8) -> Result<(), FreeError> {
        if ptr.is_null() {
            return Err(FreeError::Null);
        }

        let mut state = self.state.lock();
        let FixedState { span, stats } = &mut *state;

        let span = span
            .as_ref()
            .filter(|span| span.contains(ptr))
            .ok_or(FreeError::Foreign(ptr as usize))?;
        let offset = span.header_for(ptr)?;

        let released = span.release(offset);
        stats.record_free(released.size, released.merges);

        log::trace!("free {:p} ({} bytes, {} merges)", ptr, released.size, released.merges);
        Ok(())
    }

    /// Snapshot every block in address order
    pub fn blocks(&self) -> Vec<BlockInfo> {
        let state = self.state.lock();
        state
            .span
            .as_ref()
            .map(|span| span.walk().collect())
            .unwrap_or_default()
    }

    /// Verify the block layout and that the counters agree with it
    pub fn check(&self) -> HeapResult<()> {
        let state = self.state.lock();
        let Some(span) = state.span.as_ref() else {
            return Ok(());
        };

        let summary = span.check()?;
        expect_counter("allocated_bytes", summary.used_bytes, state.stats.allocated_bytes)?;
        expect_counter("free_bytes", summary.free_bytes, state.stats.free_bytes)?;
        expect_counter(
            "block_count",
            summary.used_blocks + summary.free_blocks,
            state.stats.block_count,
        )?;
        Ok(())
    }

    /// Largest request that would currently succeed
    pub fn largest_free_block(&self) -> usize {
        let state = self.state.lock();
        state
            .span
            .as_ref()
            .and_then(|span| span.walk().filter(|b| b.free).map(|b| b.usable_size()).max())
            .unwrap_or(0)
    }
}

pub(crate) fn expect_counter(name: &'static str, expected: usize, actual: usize) -> HeapResult<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(HeapError::Counter {
            name,
            expected,
            actual,
        })
    }
}

impl<P: PageProvider> Allocator for FixedHeap<P> {
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
        state.span.as_ref()?.usable_size(ptr)
    }

    fn stats(&self) -> HeapStats {
        self.state.lock().stats
    }

    fn reset(&mut self) {
        let state = self.state.get_mut();
        Self::uninstall(&self.provider, state);
        Self::install(&self.provider, &self.config, state);
    }
}

impl<P: PageProvider> Drop for FixedHeap<P> {
    fn drop(&mut self) {
        Self::uninstall(&self.provider, self.state.get_mut());
    }
}
