//! Scenario tests for void_heap

use void_heap::block::BLOCK_OVERHEAD;
use void_heap::span::FENCE_SIZE;
use void_heap::*;

const PAGE: usize = 4096;
const CAPACITY: usize = 64 * 1024;

fn fixed(policy: PlacementPolicy) -> FixedHeap<SystemProvider> {
    let config = HeapConfig::fixed(CAPACITY).with_policy(policy);
    FixedHeap::with_config(config, SystemProvider::with_page_size(PAGE)).unwrap()
}

fn chunked(chunk_size: usize, budget: usize) -> ChunkedHeap<Budgeted<SystemProvider>> {
    ChunkedHeap::with_config(
        HeapConfig::chunked(chunk_size),
        Budgeted::new(SystemProvider::with_page_size(PAGE), budget),
    )
    .unwrap()
}

#[test]
fn fixed_allocate_then_free_restores_empty_arena() {
    let heap = fixed(PlacementPolicy::FirstFit);
    let before = heap.stats();
    assert_eq!(before.free_bytes, CAPACITY);
    assert_eq!(before.block_count, 1);

    let ptr = heap.allocate(100).unwrap();
    let stats = heap.stats();
    assert_eq!(stats.block_count, 2);
    assert_eq!(stats.free_bytes, CAPACITY - (104 + BLOCK_OVERHEAD));
    assert_eq!(stats.allocated_bytes, 104 + BLOCK_OVERHEAD);

    heap.deallocate(ptr.as_ptr());
    let after = heap.stats();
    assert_eq!(after.free_bytes, CAPACITY);
    assert_eq!(after.block_count, 1);
    assert_eq!(after.peak_allocated_bytes, 104 + BLOCK_OVERHEAD);
    heap.check().unwrap();
}

#[test]
fn fixed_memory_is_usable_and_isolated() {
    let heap = fixed(PlacementPolicy::FirstFit);

    let a = heap.allocate(64).unwrap();
    let b = heap.allocate(64).unwrap();
    unsafe {
        core::ptr::write_bytes(a.as_ptr(), 0xAA, 64);
        core::ptr::write_bytes(b.as_ptr(), 0xBB, 64);
        assert!((0..64).all(|i| *a.as_ptr().add(i) == 0xAA));
        assert!((0..64).all(|i| *b.as_ptr().add(i) == 0xBB));
    }

    // writing the full usable area must not disturb the metadata
    heap.check().unwrap();
    heap.deallocate(a.as_ptr());
    heap.deallocate(b.as_ptr());
    heap.check().unwrap();
}

#[test]
fn fixed_exhaustion_leaves_live_blocks_intact() {
    let heap = fixed(PlacementPolicy::FirstFit);
    let ptr = heap.allocate(256).unwrap();
    unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0x5A, 256) };
    let before = heap.stats();

    assert!(heap.allocate(CAPACITY + 1).is_none());
    assert!(matches!(
        heap.try_allocate(CAPACITY),
        Err(AllocError::Exhausted { .. })
    ));
    assert!(heap.allocate(usize::MAX).is_none());
    assert!(matches!(heap.try_allocate(usize::MAX), Err(AllocError::TooLarge(_))));

    assert_eq!(heap.stats(), before);
    unsafe { assert!((0..256).all(|i| *ptr.as_ptr().add(i) == 0x5A)) };
    heap.check().unwrap();
}

#[test]
fn fixed_fill_to_capacity_then_drain() {
    let heap = fixed(PlacementPolicy::FirstFit);
    let mut live = Vec::new();
    while let Some(ptr) = heap.allocate(200) {
        live.push(ptr);
    }

    assert!(!live.is_empty());
    assert!(heap.largest_free_block() < 200);
    heap.check().unwrap();

    for ptr in live.drain(..).rev() {
        heap.deallocate(ptr.as_ptr());
    }
    let stats = heap.stats();
    assert_eq!(stats.block_count, 1);
    assert_eq!(stats.free_bytes, CAPACITY);
}

#[test]
fn fixed_zero_size_gets_a_unique_block() {
    let heap = fixed(PlacementPolicy::FirstFit);
    let a = heap.allocate(0).unwrap();
    let b = heap.allocate(0).unwrap();

    assert_ne!(a, b);
    assert_eq!(heap.usable_size(a.as_ptr()), Some(8));
    heap.deallocate(a.as_ptr());
    heap.deallocate(b.as_ptr());
    assert_eq!(heap.stats().block_count, 1);
}

#[test]
fn fixed_heap_without_memory_fails_every_request() {
    let provider = Budgeted::new(SystemProvider::with_page_size(PAGE), 0);
    let mut heap = FixedHeap::with_config(HeapConfig::fixed(CAPACITY), provider).unwrap();

    assert!(!heap.is_initialized());
    assert!(heap.allocate(8).is_none());
    assert!(matches!(heap.try_allocate(8), Err(AllocError::Uninitialized)));
    heap.deallocate(0x1000 as *mut u8);
    assert_eq!(heap.stats(), HeapStats::default());

    // still no budget, still empty
    heap.reset();
    assert!(!heap.is_initialized());
}

#[test]
fn fixed_heap_returns_its_region_on_drop() {
    let provider = std::sync::Arc::new(Budgeted::new(
        SystemProvider::with_page_size(PAGE),
        CAPACITY,
    ));
    {
        let heap = FixedHeap::with_config(HeapConfig::fixed(CAPACITY), provider.clone()).unwrap();
        heap.allocate(10).unwrap();
        assert_eq!(provider.live_regions(), 1);
    }
    assert_eq!(provider.live_regions(), 0);
    assert_eq!(provider.mapped_bytes(), 0);
}

#[test]
fn chunked_second_chunk_is_released_when_empty() {
    let heap = chunked(PAGE, 64 * PAGE);
    let usable = PAGE - 2 * FENCE_SIZE;

    // fill the first chunk exactly: 63 blocks of 64 bytes
    let block = 32 + BLOCK_OVERHEAD;
    let mut first = Vec::new();
    for _ in 0..usable / block {
        first.push(heap.allocate(32).unwrap());
    }
    assert_eq!(heap.stats().chunk_count, 1);
    assert_eq!(heap.stats().free_bytes, 0);

    // next request needs a new chunk
    let a = heap.allocate(32).unwrap();
    let b = heap.allocate(500).unwrap();
    let stats = heap.stats();
    assert_eq!(stats.chunk_count, 2);
    assert_eq!(heap.provider().live_regions(), 2);
    heap.check().unwrap();

    heap.deallocate(a.as_ptr());
    assert_eq!(heap.stats().chunk_count, 2);
    heap.deallocate(b.as_ptr());

    let stats = heap.stats();
    assert_eq!(stats.chunk_count, 1);
    assert_eq!(heap.provider().live_regions(), 1);
    assert_eq!(stats.capacity(), usable);
    assert_eq!(stats.free_bytes, 0);
    heap.check().unwrap();

    // the first chunk's blocks are untouched and still freeable
    for ptr in first {
        heap.deallocate(ptr.as_ptr());
    }
    let stats = heap.stats();
    assert_eq!(stats.chunk_count, 1);
    assert_eq!(stats.block_count, 1);
    assert_eq!(stats.free_bytes, usable);
}

#[test]
fn chunked_new_chunk_is_searched_first() {
    let heap = chunked(PAGE, 64 * PAGE);
    let a = heap.allocate(PAGE / 2).unwrap();
    let big = heap.allocate(PAGE).unwrap();
    let c = heap.allocate(16).unwrap();

    assert_eq!(heap.stats().chunk_count, 2);
    let chunks = heap.chunk_capacities();
    assert_eq!(chunks.len(), 2);

    // `c` landed next to `big` in the newest chunk
    let big_usable = heap.usable_size(big.as_ptr()).unwrap();
    assert_eq!(
        c.as_ptr() as usize,
        big.as_ptr() as usize + big_usable + BLOCK_OVERHEAD
    );
    assert!(heap.usable_size(a.as_ptr()).is_some());
    heap.check().unwrap();
}

#[test]
fn chunked_exhaustion_returns_null() {
    let heap = chunked(PAGE, 2 * PAGE);
    let a = heap.allocate(3000).unwrap();
    let b = heap.allocate(3000).unwrap();

    assert!(heap.allocate(3000).is_none());
    assert!(matches!(
        heap.try_allocate(3000),
        Err(AllocError::Map(MapError::BudgetExceeded { .. }))
    ));
    assert_eq!(heap.stats().chunk_count, 2);

    heap.deallocate(a.as_ptr());
    assert_eq!(heap.stats().chunk_count, 1);
    assert!(heap.allocate(3000).is_some());
    heap.deallocate(b.as_ptr());
    heap.check().unwrap();
}

#[test]
fn chunked_retention_keeps_extra_empty_chunks() {
    let config = HeapConfig::chunked(PAGE).with_retain_chunks(2);
    let heap = ChunkedHeap::with_config(
        config,
        Budgeted::new(SystemProvider::with_page_size(PAGE), 64 * PAGE),
    )
    .unwrap();

    let ptrs: Vec<_> = (0..3).map(|_| heap.allocate(3000).unwrap()).collect();
    assert_eq!(heap.stats().chunk_count, 3);

    for ptr in ptrs {
        heap.deallocate(ptr.as_ptr());
    }
    assert_eq!(heap.stats().chunk_count, 2);
    assert_eq!(heap.provider().live_regions(), 2);
    heap.check().unwrap();
}

#[test]
fn chunked_double_free_is_ignored() {
    let heap = chunked(PAGE, 8 * PAGE);
    let a = heap.allocate(40).unwrap();
    let _b = heap.allocate(40).unwrap();

    heap.deallocate(a.as_ptr());
    let once = heap.stats();
    let layout = heap.blocks();

    heap.deallocate(a.as_ptr());
    assert!(matches!(heap.try_deallocate(a.as_ptr()), Err(FreeError::DoubleFree(_))));
    assert_eq!(heap.stats(), once);
    assert_eq!(heap.blocks(), layout);
}

#[test]
fn chunked_rejects_interior_and_foreign_pointers() {
    let heap = chunked(PAGE, 8 * PAGE);
    let a = heap.allocate(128).unwrap();
    let before = heap.stats();

    let boxed = Box::new([0u8; 64]);
    heap.deallocate(boxed.as_ptr() as *mut u8);
    for offset in [1, 8, 16, 64] {
        heap.deallocate(unsafe { a.as_ptr().add(offset) });
    }

    assert_eq!(heap.stats(), before);
    heap.check().unwrap();
    heap.deallocate(a.as_ptr());
    assert_eq!(heap.stats().allocated_bytes, 0);
}

#[test]
fn heap_config_from_toml_drives_heap() {
    let config = HeapConfig::from_toml_str(
        r#"
        [heap]
        policy = "best_fit"
        granularity = 8
        chunk_size = 8192
        "#,
    )
    .unwrap();

    let heap = ChunkedHeap::with_config(config, SystemProvider::with_page_size(PAGE)).unwrap();
    let ptr = heap.allocate(1).unwrap();
    assert_eq!(heap.usable_size(ptr.as_ptr()), Some(8));
    assert_eq!(heap.stats().capacity(), 8192 - 2 * FENCE_SIZE);
}
