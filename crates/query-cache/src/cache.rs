//! Cache store contract and the in-memory LRU store

use crate::config::MemoryCacheConfig;
use crate::error::Result;
use crate::stats::CacheStats;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Key of one cached per-segment result
///
/// `namespace` groups every entry of one segment so they can be dropped
/// together; `key` is the raw, unhashed key bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub namespace: String,
    pub key: Vec<u8>,
}

impl CacheKey {
    pub fn new(namespace: impl Into<String>, key: Vec<u8>) -> Self {
        Self {
            namespace: namespace.into(),
            key,
        }
    }

    fn size_bytes(&self) -> usize {
        self.namespace.len() + self.key.len()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} bytes", self.namespace, self.key.len())
    }
}

/// Best-effort byte store shared by every query
///
/// No transactional guarantees: a `get` may miss an entry another query is
/// writing, and a stale entry is as good as an absent one.
pub trait Cache: Send + Sync {
    fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: CacheKey, value: Vec<u8>) -> Result<()>;

    /// Look up many keys at once; failed lookups are left out
    fn get_bulk(&self, keys: &[CacheKey]) -> HashMap<CacheKey, Vec<u8>> {
        keys.iter()
            .filter_map(|key| match self.get(key) {
                Ok(Some(value)) => Some((key.clone(), value)),
                Ok(None) => None,
                Err(e) => {
                    debug!("Cache get failed for {}: {}", key, e);
                    None
                }
            })
            .collect()
    }

    /// Drop every entry in `namespace`
    fn close(&self, namespace: &str);
}

struct CacheEntry {
    value: Vec<u8>,
    created_at: Instant,
    size_bytes: usize,
}

impl CacheEntry {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() > ttl
    }
}

/// LRU entries plus the bytes they account for
struct Store {
    entries: LruCache<CacheKey, CacheEntry>,
    memory_used: usize,
}

impl Store {
    fn remove(&mut self, key: &CacheKey) -> bool {
        match self.entries.pop(key) {
            Some(entry) => {
                self.memory_used = self.memory_used.saturating_sub(entry.size_bytes);
                true
            }
            None => false,
        }
    }

    fn remove_where(&mut self, predicate: impl Fn(&CacheKey, &CacheEntry) -> bool) -> usize {
        let doomed: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|(key, entry)| predicate(key, entry))
            .map(|(key, _)| key.clone())
            .collect();
        doomed.iter().filter(|key| self.remove(key)).count()
    }
}

/// Thread-safe LRU byte store bounded by entry count and memory
pub struct MemoryCache {
    store: Mutex<Store>,
    config: MemoryCacheConfig,
    stats: Arc<CacheStats>,
}

impl MemoryCache {
    pub fn new(config: MemoryCacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            store: Mutex::new(Store {
                entries: LruCache::new(capacity),
                memory_used: 0,
            }),
            config,
            stats: Arc::new(CacheStats::new()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(MemoryCacheConfig::default())
    }

    /// Remove every entry in `namespace`, returning how many were removed
    pub fn invalidate_namespace(&self, namespace: &str) -> usize {
        let mut store = self.store.lock();
        let removed = store.remove_where(|key, _| key.namespace == namespace);
        self.record_footprint(&store);
        removed
    }

    /// Drop entries older than the configured TTL
    pub fn expire_stale(&self) -> usize {
        let ttl = self.config.ttl;
        let mut store = self.store.lock();
        let expired = store.remove_where(|_, entry| entry.is_expired(ttl));
        for _ in 0..expired {
            self.stats.record_expiration();
        }
        self.record_footprint(&store);
        expired
    }

    pub fn stats(&self) -> Arc<CacheStats> {
        Arc::clone(&self.stats)
    }

    pub fn len(&self) -> usize {
        self.store.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes held by keys and values
    pub fn memory_used(&self) -> usize {
        self.store.lock().memory_used
    }

    fn record_footprint(&self, store: &Store) {
        self.stats.set_entry_count(store.entries.len() as u64);
        self.stats.set_memory_bytes(store.memory_used as u64);
    }
}

impl Cache for MemoryCache {
    fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>> {
        let mut store = self.store.lock();

        let expired = match store.entries.get(key) {
            Some(entry) if !entry.is_expired(self.config.ttl) => {
                self.stats.record_hit();
                return Ok(Some(entry.value.clone()));
            }
            Some(_) => true,
            None => false,
        };

        if expired && store.remove(key) {
            self.stats.record_expiration();
            self.record_footprint(&store);
        }
        self.stats.record_miss();
        Ok(None)
    }

    fn put(&self, key: CacheKey, value: Vec<u8>) -> Result<()> {
        let size_bytes = key.size_bytes() + value.len();
        // Never kept: larger than the whole store
        if size_bytes > self.config.max_memory_bytes {
            return Ok(());
        }

        let mut store = self.store.lock();
        store.remove(&key);

        while store.memory_used + size_bytes > self.config.max_memory_bytes {
            let Some((_, evicted)) = store.entries.pop_lru() else {
                break;
            };
            store.memory_used = store.memory_used.saturating_sub(evicted.size_bytes);
            self.stats.record_eviction();
        }

        let entry = CacheEntry {
            value,
            created_at: Instant::now(),
            size_bytes,
        };
        if let Some((_, evicted)) = store.entries.push(key, entry) {
            store.memory_used = store.memory_used.saturating_sub(evicted.size_bytes);
            self.stats.record_eviction();
        }
        store.memory_used += size_bytes;

        self.record_footprint(&store);
        Ok(())
    }

    fn close(&self, namespace: &str) {
        let removed = self.invalidate_namespace(namespace);
        if removed > 0 {
            debug!("Closed cache namespace {} ({} entries)", namespace, removed);
        }
    }
}

impl fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let store = self.store.lock();
        f.debug_struct("MemoryCache")
            .field("config", &self.config)
            .field("entries", &store.entries.len())
            .field("memory_used", &store.memory_used)
            .finish()
    }
}
