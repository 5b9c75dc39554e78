//! Process-wide heap
//!
//! A single lazily built [`ChunkedHeap`] behind free functions, for callers
//! that want a malloc/free pair rather than a heap object. Nothing is mapped
//! until the first allocation.

use std::sync::OnceLock;

use crate::chunked::ChunkedHeap;
use crate::config::HeapConfig;
use crate::provider::DefaultProvider;
use crate::stats::HeapStats;
use crate::Allocator;

static HEAP: OnceLock<ChunkedHeap<DefaultProvider>> = OnceLock::new();

/// Build the process heap from [`HeapConfig::load`].
///
/// Returns `false` if the heap already existed; the existing heap is kept.
pub fn init() -> bool {
    init_with(HeapConfig::load())
}

/// Build the process heap from an explicit configuration
pub fn init_with(config: HeapConfig) -> bool {
    if HEAP.get().is_some() {
        return false;
    }

    let heap = match ChunkedHeap::with_config(config, DefaultProvider::default()) {
        Ok(heap) => heap,
        Err(e) => {
            log::error!("Process heap not initialized: {}", e);
            return false;
        }
    };

    // A racing initializer wins; ours has mapped nothing and is dropped
    let installed = HEAP.set(heap).is_ok();
    if installed {
        log::info!("Process heap initialized");
    }
    installed
}

/// The process heap, if initialized
pub fn heap() -> Option<&'static ChunkedHeap<DefaultProvider>> {
    HEAP.get()
}

/// Allocate from the process heap; null before `init` or on exhaustion
pub fn allocate(size: usize) -> *mut u8 {
    heap()
        .and_then(|heap| heap.allocate(size))
        .map_or(core::ptr::null_mut(), |ptr| ptr.as_ptr())
}

/// Free into the process heap; null and foreign pointers are ignored
pub fn deallocate(ptr: *mut u8) {
    if let Some(heap) = heap() {
        heap.deallocate(ptr);
    }
}

/// Counters of the process heap
pub fn stats() -> Option<HeapStats> {
    heap().map(|heap| heap.stats())
}
