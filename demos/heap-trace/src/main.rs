//! Heap trace
//!
//! Drives a chunked heap through a fill / fragment / drain cycle and prints
//! the counters after each phase.
//!
//! Configuration comes from `void_heap.toml` and `VOID_HEAP_*` variables.
//!
//! Usage: cargo run -p heap-trace [allocations]

use std::ptr::NonNull;

use void_heap::prelude::*;
use void_heap::DefaultProvider;

const DEFAULT_ALLOCATIONS: usize = 4096;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let allocations = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(DEFAULT_ALLOCATIONS);

    let config = HeapConfig::load();
    log::info!(
        "Heap config: policy={}, granularity={}, chunk_size={}, retain_chunks={}",
        config.policy,
        config.granularity,
        config.chunk_size,
        config.retain_chunks
    );

    let heap = match ChunkedHeap::with_config(config, DefaultProvider::default()) {
        Ok(heap) => heap,
        Err(e) => {
            log::error!("Invalid heap configuration: {}", e);
            std::process::exit(1);
        }
    };

    let mut live: Vec<Option<NonNull<u8>>> = Vec::with_capacity(allocations);
    let mut seed = 0x9E37_79B9_7F4A_7C15u64;
    for _ in 0..allocations {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        let size = (seed % 2048) as usize;
        live.push(heap.allocate(size));
    }
    report(&heap, "fill");

    for slot in live.iter_mut().step_by(2) {
        if let Some(ptr) = slot.take() {
            heap.deallocate(ptr.as_ptr());
        }
    }
    report(&heap, "fragment");

    for ptr in live.into_iter().flatten() {
        heap.deallocate(ptr.as_ptr());
    }
    report(&heap, "drain");

    if let Err(e) = heap.check() {
        log::error!("Heap inconsistent after drain: {}", e);
        std::process::exit(1);
    }
}

fn report(heap: &ChunkedHeap, phase: &str) {
    let stats = heap.stats();
    let free_blocks = heap.blocks().iter().filter(|b| b.free).count();

    println!(
        "{:<9} chunks={:<4} blocks={:<6} free_blocks={:<6} allocated={:<10} free={:<10} peak={}",
        phase,
        stats.chunk_count,
        stats.block_count,
        free_blocks,
        stats.allocated_bytes,
        stats.free_bytes,
        stats.peak_allocated_bytes
    );
    log::debug!("Chunk capacities after {}: {:?}", phase, heap.chunk_capacities());
}
