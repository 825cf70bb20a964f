//! Data servers as seen by the broker

use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use query_core::{Query, ResultRow, SegmentDescriptor};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Static description of a data server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMetadata {
    /// Unique server name
    pub name: String,
    /// Network address
    pub host: String,
    /// Tier the server belongs to
    pub tier: String,
    /// Serving priority of the tier
    pub priority: i32,
}

impl ServerMetadata {
    /// Create new server metadata
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        tier: impl Into<String>,
        priority: i32,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            tier: tier.into(),
            priority,
        }
    }
}

/// Request sent to one server: a query restricted to some segments
#[derive(Debug, Clone)]
pub struct SubQuery {
    pub query: Arc<Query>,
    pub segments: Vec<SegmentDescriptor>,
}

/// All rows one segment produced for a sub-query
///
/// Rows are in the query's result order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentResult {
    pub descriptor: SegmentDescriptor,
    pub rows: Vec<ResultRow>,
}

pub type SegmentResultStream = BoxStream<'static, Result<SegmentResult>>;

/// Transport to a data server
///
/// Implementations send the sub-query and stream back one [`SegmentResult`]
/// per segment as it completes.
#[async_trait]
pub trait SegmentQueryRunner: Send + Sync {
    async fn run(&self, query: SubQuery) -> Result<SegmentResultStream>;
}

/// A server the broker can route sub-queries to
pub struct QueryableServer {
    metadata: ServerMetadata,
    runner: Arc<dyn SegmentQueryRunner>,
    in_flight: Arc<AtomicUsize>,
}

impl QueryableServer {
    pub fn new(metadata: ServerMetadata, runner: Arc<dyn SegmentQueryRunner>) -> Self {
        Self {
            metadata,
            runner,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn metadata(&self) -> &ServerMetadata {
        &self.metadata
    }

    pub fn runner(&self) -> Arc<dyn SegmentQueryRunner> {
        Arc::clone(&self.runner)
    }

    /// Number of sub-queries currently running against this server
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Count a sub-query as in flight until the guard drops
    pub fn begin_query(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            counter: Arc::clone(&self.in_flight),
        }
    }
}

impl fmt::Debug for QueryableServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryableServer")
            .field("metadata", &self.metadata)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

pub struct InFlightGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}
