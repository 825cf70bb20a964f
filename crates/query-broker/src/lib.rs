//! Query broker for a segment cluster
//!
//! Sits between clients and the data servers that hold time-partitioned
//! segments. A query is resolved onto the visible segments of its
//! datasource, served from the per-segment cache where possible, fanned out
//! to one data server per remaining segment group, and merged back into a
//! single ordered stream.
//!
//! # Features
//!
//! - **Topology**: [`BrokerServerView`] tracks servers, segments and timelines
//! - **Server selection**: tier priority plus a load-balancing strategy
//! - **Scatter/gather**: one sub-query per server, bounded by the query deadline
//! - **Merging**: deterministic k-way merge, optionally parallel on a [`MergePool`]
//! - **Partial results**: failed or unavailable segments reported in the [`ResponseContext`]
//!
//! # Example
//!
//! ```ignore
//! use query_broker::{BrokerConfig, BrokerServerView, ClusterClient, ResponseContext};
//! use query_cache::MemoryCache;
//! use std::sync::Arc;
//!
//! let config = BrokerConfig::default();
//! let view = Arc::new(BrokerServerView::from_config(&config));
//! let client = ClusterClient::new(view, Arc::new(MemoryCache::with_defaults()), config)?;
//!
//! let context = ResponseContext::new();
//! let rows = client.run(query, context.clone())?.collect_rows().await?;
//! println!("{} rows, {} cache hits", rows.len(), context.cache_hits());
//! ```

pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod local;
pub mod merge;
pub mod parallel;
pub mod scatter;
pub mod selector;
pub mod server;
pub mod stream;
pub mod view;

#[cfg(test)]
mod test_util;

pub use client::ClusterClient;
pub use config::{BrokerConfig, ParallelMergeConfig, QuerySettings};
pub use context::{ResponseContext, ResponseState};
pub use error::{BrokerError, Result};
pub use local::LocalDataServer;
pub use merge::{RowMerger, TaggedRow, TaggedRowStream};
pub use parallel::{parallel_merge, MergePool, MergeSettings};
pub use scatter::{group_by_server, ServerGroup};
pub use selector::{BalancerStrategy, SelectionStrategy, ServerSelector, TierSelectorStrategy};
pub use server::{
    QueryableServer, SegmentQueryRunner, SegmentResult, SegmentResultStream, ServerMetadata,
    SubQuery,
};
pub use stream::QueryResultStream;
pub use view::{BrokerServerView, ServerView};
