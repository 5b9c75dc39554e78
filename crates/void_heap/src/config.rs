//! Heap configuration
//!
//! # Configuration Sources (in priority order)
//!
//! 1. Environment variables: `VOID_HEAP_POLICY`, `VOID_HEAP_GRANULARITY`,
//!    `VOID_HEAP_ARENA_CAPACITY`, `VOID_HEAP_CHUNK_SIZE`, `VOID_HEAP_RETAIN_CHUNKS`
//! 2. Config file: path in `VOID_HEAP_CONFIG`, else `void_heap.toml`
//! 3. Built-in defaults
//!
//! # Example Config File
//!
//! ```toml
//! [heap]
//! policy = "best_fit"    # first_fit, best_fit
//! granularity = 16       # 8 or 16
//! chunk_size = 262144    # minimum bytes per mapped chunk
//! retain_chunks = 1      # fully free chunks kept mapped
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::block::{BLOCK_OVERHEAD, MIN_DATA_SIZE};
use crate::error::ConfigError;
use crate::span::FENCE_SIZE;

/// Default config file name
pub const CONFIG_FILE: &str = "void_heap.toml";

/// Placement policy for choosing free blocks
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementPolicy {
    /// First block that fits, in address order
    #[default]
    FirstFit,
    /// Smallest block that fits; ties go to the lowest address
    BestFit,
}

impl std::fmt::Display for PlacementPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FirstFit => write!(f, "first_fit"),
            Self::BestFit => write!(f, "best_fit"),
        }
    }
}

impl std::str::FromStr for PlacementPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "first_fit" | "first-fit" | "first" => Ok(Self::FirstFit),
            "best_fit" | "best-fit" | "best" => Ok(Self::BestFit),
            _ => Err(ConfigError::Invalid {
                field: "policy",
                reason: format!("unknown policy '{}'", s),
            }),
        }
    }
}

/// Tunables shared by both heap flavours
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeapConfig {
    /// Request sizes are rounded up to a multiple of this (8 or 16)
    pub granularity: usize,
    /// Free block search strategy
    pub policy: PlacementPolicy,
    /// Bytes mapped by a fixed heap
    pub arena_capacity: usize,
    /// Minimum bytes mapped per chunk by a chunked heap
    pub chunk_size: usize,
    /// Fully free chunks that are kept mapped instead of released
    pub retain_chunks: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            granularity: 16,
            policy: PlacementPolicy::FirstFit,
            arena_capacity: 1024 * 1024, // 1 MB
            chunk_size: 256 * 1024,
            retain_chunks: 1,
        }
    }
}

#[derive(Deserialize)]
struct ConfigFile {
    #[serde(default)]
    heap: HeapConfig,
}

impl HeapConfig {
    /// Single-region layout: 8-byte granularity over `arena_capacity` bytes
    pub fn fixed(arena_capacity: usize) -> Self {
        Self {
            granularity: 8,
            arena_capacity,
            ..Self::default()
        }
    }

    /// Defaults for a chunked heap with the given minimum chunk size
    pub fn chunked(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            ..Self::default()
        }
    }

    pub fn with_policy(mut self, policy: PlacementPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_granularity(mut self, granularity: usize) -> Self {
        self.granularity = granularity;
        self
    }

    pub fn with_retain_chunks(mut self, retain_chunks: usize) -> Self {
        self.retain_chunks = retain_chunks;
        self
    }

    /// Smallest block the heap can hand out
    pub fn min_block_size(&self) -> usize {
        crate::align_up(MIN_DATA_SIZE, self.granularity) + BLOCK_OVERHEAD
    }

    /// Parse a `[heap]` table
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(content)?;
        file.heap.validate()?;
        Ok(file.heap)
    }

    /// Read and parse a config file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Build a config from file and environment, falling back to defaults
    pub fn load() -> Self {
        let path = std::env::var("VOID_HEAP_CONFIG").unwrap_or_else(|_| CONFIG_FILE.to_string());

        let mut config = if Path::new(&path).exists() {
            match Self::load_from_file(&path) {
                Ok(config) => {
                    log::info!("Heap config loaded from {}", path);
                    config
                }
                Err(e) => {
                    log::warn!("Ignoring heap config {}: {}", path, e);
                    Self::default()
                }
            }
        } else {
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok());
        if let Err(e) = config.validate() {
            log::warn!("Heap config from environment rejected ({}), using defaults", e);
            return Self::default();
        }
        config
    }

    /// Apply `VOID_HEAP_*` overrides read through `var`
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(policy) = var("VOID_HEAP_POLICY") {
            match policy.parse() {
                Ok(p) => {
                    self.policy = p;
                    log::info!("Heap policy from env: {}", self.policy);
                }
                Err(e) => log::warn!("{}", e),
            }
        }

        let numeric = |key: &str, target: &mut usize| {
            if let Some(value) = var(key) {
                match value.trim().parse() {
                    Ok(v) => {
                        *target = v;
                        log::info!("{} from env: {}", key, v);
                    }
                    Err(_) => log::warn!("Ignoring non-numeric {}={}", key, value),
                }
            }
        };

        numeric("VOID_HEAP_GRANULARITY", &mut self.granularity);
        numeric("VOID_HEAP_ARENA_CAPACITY", &mut self.arena_capacity);
        numeric("VOID_HEAP_CHUNK_SIZE", &mut self.chunk_size);
        numeric("VOID_HEAP_RETAIN_CHUNKS", &mut self.retain_chunks);
    }

    /// Smallest chunk that holds two fences and one minimal block
    pub fn min_chunk_size(&self) -> usize {
        self.min_block_size() + 2 * FENCE_SIZE
    }

    /// Reject values either heap flavour cannot honour
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_fixed()?;
        self.validate_chunked()
    }

    /// Checks for the fields a [`FixedHeap`](crate::FixedHeap) reads
    pub fn validate_fixed(&self) -> Result<(), ConfigError> {
        self.validate_granularity()?;
        if self.arena_capacity < self.min_block_size() {
            return Err(ConfigError::Invalid {
                field: "arena_capacity",
                reason: format!(
                    "{} bytes cannot hold a {}-byte block",
                    self.arena_capacity,
                    self.min_block_size()
                ),
            });
        }
        Ok(())
    }

    /// Checks for the fields a [`ChunkedHeap`](crate::ChunkedHeap) reads
    pub fn validate_chunked(&self) -> Result<(), ConfigError> {
        self.validate_granularity()?;
        if self.chunk_size < self.min_chunk_size() {
            return Err(ConfigError::Invalid {
                field: "chunk_size",
                reason: format!(
                    "{} bytes cannot hold fences and a {}-byte block",
                    self.chunk_size,
                    self.min_block_size()
                ),
            });
        }
        if self.retain_chunks == 0 {
            return Err(ConfigError::Invalid {
                field: "retain_chunks",
                reason: "at least one chunk must stay mapped".to_string(),
            });
        }
        Ok(())
    }

    fn validate_granularity(&self) -> Result<(), ConfigError> {
        if self.granularity != 8 && self.granularity != 16 {
            return Err(ConfigError::Invalid {
                field: "granularity",
                reason: format!("{} is not 8 or 16", self.granularity),
            });
        }
        Ok(())
    }
}
