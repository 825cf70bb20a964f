//! Shared types for the segment query broker
//!
//! Intervals, segment identities, result rows, the query model and the
//! per-query-type toolchests that every other crate builds on.

pub mod cache_key;
pub mod error;
pub mod query;
pub mod row;
pub mod toolchest;
pub mod types;

pub use cache_key::{CacheKeyBuilder, Cacheable};
pub use error::{QueryError, Result};
pub use query::{
    Aggregator, AggregatorKind, ArithmeticOp, DimFilter, Granularity, PostAggregator, Query,
    QueryContext, QueryId, QueryKind, QueryType, ScanOrder,
};
pub use row::{ResultRow, Value};
pub use toolchest::{
    GroupByToolChest, QueryToolChest, ScanToolChest, TimeseriesToolChest, ToolChestRegistry,
};
pub use types::*;
