//! Splits a query's segments into cache hits and misses

use crate::cache::{Cache, CacheKey};
use crate::error::{CacheError, Result};
use crate::stats::CacheStats;
use query_core::{CacheKeyBuilder, QuerySegment};
use std::sync::Arc;
use tracing::{debug, warn};

const SEGMENT_KEY_VERSION: u8 = 1;

/// Key under which one segment's result for one query signature is cached
///
/// The namespace is the whole segment's id; the key bytes cover the read
/// slice, version, partition and the query signature, unhashed.
pub fn segment_cache_key(segment: &QuerySegment, signature: &[u8]) -> CacheKey {
    let descriptor = &segment.descriptor;
    let key = CacheKeyBuilder::new(SEGMENT_KEY_VERSION)
        .append_i64(descriptor.interval.start)
        .append_i64(descriptor.interval.end)
        .append_string(&descriptor.version)
        .append_i64(descriptor.partition as i64)
        .append_bytes(signature)
        .build();
    CacheKey::new(segment.id.to_string(), key)
}

/// Result of splitting segments by cache presence
///
/// Both lists keep the order segments were given in.
#[derive(Debug, Clone)]
pub struct CachePartition<T> {
    pub hits: Vec<(QuerySegment, T)>,
    pub misses: Vec<QuerySegment>,
}

impl<T> CachePartition<T> {
    /// Every segment is a miss
    pub fn all_misses(segments: Vec<QuerySegment>) -> Self {
        Self {
            hits: Vec::new(),
            misses: segments,
        }
    }
}

/// Looks segments up in the cache store
pub struct CacheCoordinator {
    cache: Arc<dyn Cache>,
    stats: Arc<CacheStats>,
}

impl CacheCoordinator {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self {
            cache,
            stats: Arc::new(CacheStats::new()),
        }
    }

    /// Partition `segments` into decoded hits and misses
    ///
    /// A store failure or an entry `decode` rejects turns into a miss; cache
    /// trouble never fails a query.
    pub fn partition<T, F>(
        &self,
        segments: Vec<QuerySegment>,
        signature: &[u8],
        decode: F,
    ) -> CachePartition<T>
    where
        F: Fn(&[u8]) -> Result<T>,
    {
        let keys: Vec<CacheKey> = segments
            .iter()
            .map(|segment| segment_cache_key(segment, signature))
            .collect();
        let mut found = self.cache.get_bulk(&keys);

        let mut partition = CachePartition {
            hits: Vec::new(),
            misses: Vec::new(),
        };
        for (segment, key) in segments.into_iter().zip(keys) {
            let decoded = found.remove(&key).map(|bytes| {
                decode(&bytes).map_err(|e| CacheError::Corrupt {
                    namespace: key.namespace.clone(),
                    message: e.to_string(),
                })
            });

            match decoded {
                Some(Ok(value)) => {
                    self.stats.record_hit();
                    partition.hits.push((segment, value));
                }
                Some(Err(e)) => {
                    warn!("Ignoring cache entry: {}", e);
                    self.stats.record_error();
                    self.stats.record_miss();
                    partition.misses.push(segment);
                }
                None => {
                    self.stats.record_miss();
                    partition.misses.push(segment);
                }
            }
        }

        debug!(
            "Cache partition: {} hits, {} misses",
            partition.hits.len(),
            partition.misses.len()
        );
        partition
    }

    pub fn stats(&self) -> Arc<CacheStats> {
        Arc::clone(&self.stats)
    }
}
