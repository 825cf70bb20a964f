//! Broker configuration

use crate::error::{BrokerError, Result};
use crate::selector::SelectionStrategy;
use query_cache::CacheConfig;
use query_core::QueryContext;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for merging results on the merge pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelMergeConfig {
    /// Whether queries merge in parallel by default
    pub enabled: bool,
    /// Merge tasks one query may use
    pub parallelism: usize,
    /// Merge tasks all queries together may use
    pub pool_size: usize,
    /// Row batches a merge task may queue before it waits
    pub max_queued_batches: usize,
    /// Rows per batch handed between merge tasks
    pub batch_size: usize,
}

impl Default for ParallelMergeConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            enabled: true,
            parallelism: cores,
            pool_size: cores,
            max_queued_batches: 16,
            batch_size: 4096,
        }
    }
}

impl ParallelMergeConfig {
    /// Create a configuration that always merges sequentially
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_queued_batches(mut self, max_queued_batches: usize) -> Self {
        self.max_queued_batches = max_queued_batches;
        self
    }
}

/// Configuration for the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Per-segment cache usage
    pub cache: CacheConfig,
    /// Parallel merge settings
    pub merge: ParallelMergeConfig,
    /// Server selection strategy
    pub selection: SelectionStrategy,
    /// Query timeout in milliseconds
    pub query_timeout_ms: u64,
    /// Drop failed servers' segments instead of failing the query
    pub allow_partial_results: bool,
    /// Bytes one query may gather from data servers; 0 means unlimited
    pub max_scatter_gather_bytes: u64,
    /// Uncovered intervals reported per query; 0 disables reporting
    pub uncovered_intervals_limit: usize,
    /// Longest serialized response context header
    pub max_response_context_chars: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            merge: ParallelMergeConfig::default(),
            selection: SelectionStrategy::default(),
            query_timeout_ms: 300_000, // 5 minutes
            allow_partial_results: false,
            max_scatter_gather_bytes: 0,
            uncovered_intervals_limit: 0,
            max_response_context_chars: 7 * 1024,
        }
    }
}

impl BrokerConfig {
    /// Parse a JSON configuration; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| BrokerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| BrokerError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&json)
    }

    /// Check that the values are usable
    pub fn validate(&self) -> Result<()> {
        if self.query_timeout_ms == 0 {
            return Err(BrokerError::Config("query_timeout_ms must be positive".to_string()));
        }
        if self.merge.batch_size == 0 || self.merge.max_queued_batches == 0 {
            return Err(BrokerError::Config(
                "merge batch_size and max_queued_batches must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_merge(mut self, merge: ParallelMergeConfig) -> Self {
        self.merge = merge;
        self
    }

    pub fn with_selection(mut self, selection: SelectionStrategy) -> Self {
        self.selection = selection;
        self
    }

    pub fn with_query_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.query_timeout_ms = timeout_ms;
        self
    }

    pub fn with_allow_partial_results(mut self, allow: bool) -> Self {
        self.allow_partial_results = allow;
        self
    }

    pub fn with_uncovered_intervals_limit(mut self, limit: usize) -> Self {
        self.uncovered_intervals_limit = limit;
        self
    }

    pub fn with_max_scatter_gather_bytes(mut self, max_bytes: u64) -> Self {
        self.max_scatter_gather_bytes = max_bytes;
        self
    }

    /// Effective settings for one query after its context overrides
    pub fn settings_for(&self, context: &QueryContext) -> QuerySettings {
        let parallel = context.parallel_merge.unwrap_or(self.merge.enabled);
        let parallelism = if parallel {
            context.parallelism.unwrap_or(self.merge.parallelism)
        } else {
            0
        };

        // A query may tighten the byte budget but never lift it
        let max_scatter_gather_bytes = match context.max_scatter_gather_bytes {
            Some(limit) if self.max_scatter_gather_bytes == 0 => limit,
            Some(limit) => limit.min(self.max_scatter_gather_bytes),
            None => self.max_scatter_gather_bytes,
        };

        QuerySettings {
            use_cache: context.use_cache.unwrap_or(self.cache.use_cache),
            populate_cache: context.populate_cache.unwrap_or(self.cache.populate_cache),
            timeout: Duration::from_millis(context.timeout.unwrap_or(self.query_timeout_ms)),
            parallelism,
            allow_partial_results: context
                .allow_partial_results
                .unwrap_or(self.allow_partial_results),
            uncovered_intervals_limit: context
                .uncovered_intervals_limit
                .unwrap_or(self.uncovered_intervals_limit),
            batch_size: self.merge.batch_size,
            max_queued_batches: self.merge.max_queued_batches,
            max_scatter_gather_bytes,
        }
    }
}

/// Settings in effect for one query
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySettings {
    pub use_cache: bool,
    pub populate_cache: bool,
    pub timeout: Duration,
    /// Merge tasks to use; 0 merges sequentially
    pub parallelism: usize,
    pub allow_partial_results: bool,
    pub uncovered_intervals_limit: usize,
    pub batch_size: usize,
    pub max_queued_batches: usize,
    /// 0 means unlimited
    pub max_scatter_gather_bytes: u64,
}
