//! Cache configuration options

use query_core::QueryType;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the in-memory segment cache store
#[derive(Debug, Clone)]
pub struct MemoryCacheConfig {
    /// Maximum number of entries in the cache
    pub max_entries: usize,
    /// Maximum memory usage in bytes (approximate)
    pub max_memory_bytes: usize,
    /// Time-to-live for cache entries
    pub ttl: Duration,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_memory_bytes: 100 * 1024 * 1024, // 100 MB
            ttl: Duration::from_secs(3600),
        }
    }
}

impl MemoryCacheConfig {
    /// Create a new store configuration with custom settings
    pub fn new(max_entries: usize, max_memory_bytes: usize, ttl_secs: u64) -> Self {
        Self {
            max_entries,
            max_memory_bytes,
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    /// Set the maximum number of entries
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Set the maximum memory usage
    pub fn with_max_memory(mut self, max_memory_bytes: usize) -> Self {
        self.max_memory_bytes = max_memory_bytes;
        self
    }

    /// Set the TTL duration
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

/// Where cache writes run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PopulateMode {
    /// Inline on the fetch task
    Foreground,
    /// On a bounded set of spawned tasks
    Background,
}

/// How the broker uses the per-segment cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Read cached per-segment results
    pub use_cache: bool,
    /// Write fetched per-segment results
    pub populate_cache: bool,
    /// Encoded results larger than this are not cached
    pub max_entry_size: usize,
    pub populate_mode: PopulateMode,
    /// Background writes in flight before new ones are dropped
    pub background_max_pending: usize,
    /// Query types never cached, regardless of their toolchest
    pub uncacheable: Vec<QueryType>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            use_cache: true,
            populate_cache: true,
            max_entry_size: 1024 * 1024, // 1 MB
            populate_mode: PopulateMode::Foreground,
            background_max_pending: 64,
            uncacheable: vec![QueryType::Scan],
        }
    }
}

impl CacheConfig {
    /// Create a configuration with reads and writes turned off
    pub fn disabled() -> Self {
        Self {
            use_cache: false,
            populate_cache: false,
            ..Default::default()
        }
    }

    pub fn with_use_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    pub fn with_populate_cache(mut self, populate_cache: bool) -> Self {
        self.populate_cache = populate_cache;
        self
    }

    /// Set the largest cacheable encoded result
    pub fn with_max_entry_size(mut self, max_entry_size: usize) -> Self {
        self.max_entry_size = max_entry_size;
        self
    }

    pub fn with_populate_mode(mut self, populate_mode: PopulateMode) -> Self {
        self.populate_mode = populate_mode;
        self
    }

    pub fn with_background_max_pending(mut self, max_pending: usize) -> Self {
        self.background_max_pending = max_pending;
        self
    }

    pub fn is_cacheable_type(&self, query_type: QueryType) -> bool {
        !self.uncacheable.contains(&query_type)
    }
}
