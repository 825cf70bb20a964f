//! Per-segment result cache for the query broker
//!
//! Results are cached per segment and per query signature, so a query only
//! fetches the segments nobody has computed for it yet.
//!
//! # Features
//!
//! - **Store contract**: [`Cache`] with an in-memory LRU implementation, [`MemoryCache`]
//! - **Hit/miss split**: [`CacheCoordinator`] partitions a query's segments
//! - **Population**: foreground or bounded background writes, once per key per query
//! - **Invalidation**: dropped segments close their cache namespace
//! - **Statistics**: hits, misses, evictions, errors and write outcomes
//!
//! # Example
//!
//! ```ignore
//! use query_cache::{CacheCoordinator, MemoryCache, decode_rows};
//! use std::sync::Arc;
//!
//! let coordinator = CacheCoordinator::new(Arc::new(MemoryCache::with_defaults()));
//! let partition = coordinator.partition(segments, &signature, decode_rows::<ResultRow>);
//!
//! // Only partition.misses need to be fetched from data servers
//! ```

pub mod cache;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod invalidation;
pub mod populator;
pub mod stats;

pub use cache::{Cache, CacheKey, MemoryCache};
pub use codec::{decode_rows, encode_rows};
pub use config::{CacheConfig, MemoryCacheConfig, PopulateMode};
pub use coordinator::{segment_cache_key, CacheCoordinator, CachePartition};
pub use error::{CacheError, Result};
pub use invalidation::{CacheInvalidator, InvalidationEvent, NamespaceInvalidator, NoOpInvalidator};
pub use populator::{
    populator_for, BackgroundCachePopulator, CachePopulator, ForegroundCachePopulator,
    QueryScopedPopulator,
};
pub use stats::{CacheStats, PopulatorStats};
