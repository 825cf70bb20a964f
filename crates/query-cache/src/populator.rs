//! Writing fetched per-segment results into the cache

use crate::cache::{Cache, CacheKey};
use crate::codec::encode_rows;
use crate::config::{CacheConfig, PopulateMode};
use crate::stats::PopulatorStats;
use parking_lot::Mutex;
use query_core::ResultRow;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Sink for freshly computed per-segment results
///
/// Population is best effort: failures are counted and logged, never
/// returned to the query.
pub trait CachePopulator: Send + Sync {
    fn populate(&self, key: CacheKey, rows: Vec<ResultRow>);

    fn stats(&self) -> Arc<PopulatorStats>;
}

/// Build the populator selected by `config`
pub fn populator_for(config: &CacheConfig, cache: Arc<dyn Cache>) -> Arc<dyn CachePopulator> {
    match config.populate_mode {
        PopulateMode::Foreground => {
            Arc::new(ForegroundCachePopulator::new(cache, config.max_entry_size))
        }
        PopulateMode::Background => Arc::new(BackgroundCachePopulator::new(
            cache,
            config.max_entry_size,
            config.background_max_pending,
        )),
    }
}

fn write_entry(
    cache: &dyn Cache,
    stats: &PopulatorStats,
    max_entry_size: usize,
    key: CacheKey,
    rows: &[ResultRow],
) {
    let bytes = match encode_rows(rows) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Failed to encode cache entry {}: {}", key, e);
            stats.record_error();
            return;
        }
    };

    if bytes.len() > max_entry_size {
        debug!(
            "Skipping cache entry {}: {} bytes over limit {}",
            key,
            bytes.len(),
            max_entry_size
        );
        stats.record_oversized();
        return;
    }

    match cache.put(key, bytes) {
        Ok(()) => stats.record_ok(),
        Err(e) => {
            warn!("Cache put failed: {}", e);
            stats.record_error();
        }
    }
}

/// Encodes and writes inline on the caller's task
pub struct ForegroundCachePopulator {
    cache: Arc<dyn Cache>,
    max_entry_size: usize,
    stats: Arc<PopulatorStats>,
}

impl ForegroundCachePopulator {
    pub fn new(cache: Arc<dyn Cache>, max_entry_size: usize) -> Self {
        Self {
            cache,
            max_entry_size,
            stats: Arc::new(PopulatorStats::new()),
        }
    }
}

impl CachePopulator for ForegroundCachePopulator {
    fn populate(&self, key: CacheKey, rows: Vec<ResultRow>) {
        write_entry(self.cache.as_ref(), &self.stats, self.max_entry_size, key, &rows);
    }

    fn stats(&self) -> Arc<PopulatorStats> {
        Arc::clone(&self.stats)
    }
}

/// Encodes and writes on spawned tasks, at most `max_pending` at a time
///
/// A write arriving while `max_pending` are in flight is dropped. Outside a
/// tokio runtime writes run inline.
pub struct BackgroundCachePopulator {
    cache: Arc<dyn Cache>,
    max_entry_size: usize,
    max_pending: usize,
    permits: Arc<Semaphore>,
    stats: Arc<PopulatorStats>,
}

impl BackgroundCachePopulator {
    pub fn new(cache: Arc<dyn Cache>, max_entry_size: usize, max_pending: usize) -> Self {
        Self {
            cache,
            max_entry_size,
            max_pending,
            permits: Arc::new(Semaphore::new(max_pending)),
            stats: Arc::new(PopulatorStats::new()),
        }
    }

    /// Number of writes currently in flight
    pub fn pending(&self) -> usize {
        self.max_pending - self.permits.available_permits()
    }
}

impl CachePopulator for BackgroundCachePopulator {
    fn populate(&self, key: CacheKey, rows: Vec<ResultRow>) {
        let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            debug!("Dropping cache write for {}: too many pending", key);
            self.stats.record_dropped();
            return;
        };

        let cache = Arc::clone(&self.cache);
        let stats = Arc::clone(&self.stats);
        let max_entry_size = self.max_entry_size;

        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    write_entry(cache.as_ref(), &stats, max_entry_size, key, &rows);
                    drop(permit);
                });
            }
            Err(_) => {
                write_entry(cache.as_ref(), &stats, max_entry_size, key, &rows);
                drop(permit);
            }
        }
    }

    fn stats(&self) -> Arc<PopulatorStats> {
        Arc::clone(&self.stats)
    }
}

/// Per-query wrapper that writes each key at most once
pub struct QueryScopedPopulator {
    inner: Arc<dyn CachePopulator>,
    seen: Mutex<HashSet<CacheKey>>,
}

impl QueryScopedPopulator {
    pub fn new(inner: Arc<dyn CachePopulator>) -> Self {
        Self {
            inner,
            seen: Mutex::new(HashSet::new()),
        }
    }
}

impl CachePopulator for QueryScopedPopulator {
    fn populate(&self, key: CacheKey, rows: Vec<ResultRow>) {
        if !self.seen.lock().insert(key.clone()) {
            return;
        }
        self.inner.populate(key, rows);
    }

    fn stats(&self) -> Arc<PopulatorStats> {
        self.inner.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::codec::decode_rows;
    use std::time::Duration;

    fn rows() -> Vec<ResultRow> {
        vec![ResultRow::new(0).with("count", 7)]
    }

    #[test]
    fn test_foreground_writes_inline() {
        let store = Arc::new(MemoryCache::with_defaults());
        let populator = ForegroundCachePopulator::new(store.clone(), 1024);
        let key = CacheKey::new("seg", vec![1]);

        populator.populate(key.clone(), rows());

        let bytes = store.get(&key).unwrap().unwrap();
        assert_eq!(decode_rows::<ResultRow>(&bytes).unwrap(), rows());
        assert_eq!(populator.stats().ok(), 1);
    }

    #[test]
    fn test_oversized_entry_is_skipped() {
        let store = Arc::new(MemoryCache::with_defaults());
        let populator = ForegroundCachePopulator::new(store.clone(), 4);

        populator.populate(CacheKey::new("seg", vec![1]), rows());

        assert!(store.is_empty());
        assert_eq!(populator.stats().oversized(), 1);
        assert_eq!(populator.stats().ok(), 0);
    }

    #[tokio::test]
    async fn test_background_writes_eventually() {
        let store = Arc::new(MemoryCache::with_defaults());
        let populator = BackgroundCachePopulator::new(store.clone(), 1024, 4);

        populator.populate(CacheKey::new("seg", vec![1]), rows());
        populator.populate(CacheKey::new("seg", vec![2]), rows());

        for _ in 0..100 {
            if store.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.len(), 2);
        assert_eq!(populator.pending(), 0);
    }

    #[test]
    fn test_background_drops_when_saturated() {
        let store = Arc::new(MemoryCache::with_defaults());
        let populator = BackgroundCachePopulator::new(store.clone(), 1024, 0);

        populator.populate(CacheKey::new("seg", vec![1]), rows());

        assert!(store.is_empty());
        assert_eq!(populator.stats().dropped(), 1);
    }

    #[test]
    fn test_background_outside_runtime_writes_inline() {
        let store = Arc::new(MemoryCache::with_defaults());
        let populator = BackgroundCachePopulator::new(store.clone(), 1024, 2);

        populator.populate(CacheKey::new("seg", vec![1]), rows());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_query_scoped_populates_once() {
        let store = Arc::new(MemoryCache::with_defaults());
        let inner = Arc::new(ForegroundCachePopulator::new(store.clone(), 1024));
        let scoped = QueryScopedPopulator::new(inner);
        let key = CacheKey::new("seg", vec![1]);

        scoped.populate(key.clone(), rows());
        scoped.populate(key, rows());

        assert_eq!(scoped.stats().ok(), 1);
    }
}
