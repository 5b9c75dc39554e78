//! Error types
//!
//! The public `allocate` / `deallocate` entry points never surface these: they
//! log and return null or do nothing. The `try_*` variants hand them back.

use thiserror::Error;

/// Failure to obtain or size a region from a page provider
#[derive(Debug, Error)]
pub enum MapError {
    #[error("Zero-sized mapping requested")]
    ZeroSize,

    #[error("Mapping of {0} bytes overflows the address space")]
    Overflow(usize),

    #[error("Mapping budget exceeded: requested {requested} bytes, {remaining} remaining")]
    BudgetExceeded { requested: usize, remaining: usize },

    #[error("OS mapping failed: {0}")]
    Os(#[from] std::io::Error),
}

/// Reasons an allocation request could not be served
#[derive(Debug, Error)]
pub enum AllocError {
    #[error("Request of {0} bytes overflows the block size")]
    TooLarge(usize),

    #[error("No free block of {needed} bytes and no room to grow")]
    Exhausted { needed: usize },

    #[error("Heap has no backing memory")]
    Uninitialized,

    #[error("Chunk mapping failed: {0}")]
    Map(#[from] MapError),
}

/// Reasons a pointer was rejected by `deallocate`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FreeError {
    #[error("Null pointer")]
    Null,

    #[error("Pointer {0:#x} is not inside any region owned by this heap")]
    Foreign(usize),

    #[error("Pointer {0:#x} does not point at the data of a block")]
    BadTag(usize),

    #[error("Pointer {0:#x} was already freed")]
    DoubleFree(usize),
}

/// Layout inconsistency found by a heap walk
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeapError {
    #[error("Block at offset {offset} has invalid size {size}")]
    BadSize { offset: usize, size: usize },

    #[error("Block at offset {offset} has an invalid validity tag")]
    BadMagic { offset: usize },

    #[error("Footer of block at offset {offset} does not mirror its header")]
    FooterMismatch { offset: usize },

    #[error("Adjacent free blocks at offsets {left} and {right} were not coalesced")]
    Uncoalesced { left: usize, right: usize },

    #[error("Blocks cover {covered} bytes of a {capacity}-byte span")]
    Coverage { covered: usize, capacity: usize },

    #[error("Counter {name} is {actual}, layout says {expected}")]
    Counter {
        name: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// Configuration loading and validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Result type for heap walks
pub type HeapResult<T> = Result<T, HeapError>;
