//! Per-query-type policy: cacheability, ordering, combining and finalizing

use crate::cache_key::CacheKeyBuilder;
use crate::error::{QueryError, Result};
use crate::query::{Aggregator, Granularity, PostAggregator, Query, QueryKind, QueryType, ScanOrder};
use crate::row::ResultRow;
use crate::types::Interval;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

/// Policy object for one query type
///
/// The broker never looks inside rows itself; every ordering, combining and
/// finalizing decision goes through the toolchest of the query's type.
pub trait QueryToolChest: Send + Sync {
    fn query_type(&self) -> QueryType;

    /// Whether per-segment results of this query may be cached
    fn is_cacheable(&self, query: &Query) -> bool;

    /// Bytes identifying everything that shapes a raw per-segment result
    ///
    /// Merge-time operations (limit, post-aggregators) and the query id and
    /// context are left out so that they share cache entries.
    fn cache_signature(&self, query: &Query) -> Vec<u8>;

    /// Result ordering; `Equal` means the rows share an ordering key
    fn compare(&self, query: &Query, a: &ResultRow, b: &ResultRow) -> Ordering;

    /// Whether rows with equal ordering keys are merged into one
    fn combines(&self, query: &Query) -> bool;

    /// Whether rows are ordered by segment position alone
    ///
    /// Such results can be read one segment after another instead of
    /// interleaved.
    fn orders_by_segment(&self, _query: &Query) -> bool {
        false
    }

    fn combine(&self, query: &Query, a: ResultRow, b: ResultRow) -> Result<ResultRow>;

    /// Turn a merged row into its client-facing form
    fn finalize(&self, query: &Query, row: ResultRow) -> Result<ResultRow>;
}

fn combine_aggregates(aggregators: &[Aggregator], mut a: ResultRow, b: &ResultRow) -> Result<ResultRow> {
    for aggregator in aggregators {
        let merged = aggregator.combine(a.value(&aggregator.name), b.value(&aggregator.name))?;
        a.set(aggregator.name.clone(), merged);
    }
    Ok(a)
}

fn apply_post_aggregators(post_aggregators: &[PostAggregator], mut row: ResultRow) -> ResultRow {
    for post in post_aggregators {
        let value = post.compute(&row);
        row.set(post.name.clone(), value);
    }
    row
}

/// Compare bucket timestamps; under `All` every row shares one bucket
fn compare_buckets(granularity: Granularity, a: &ResultRow, b: &ResultRow) -> Ordering {
    match granularity {
        Granularity::All => Ordering::Equal,
        _ => a.timestamp.cmp(&b.timestamp),
    }
}

/// Stamp an `All` bucket with the start of the query range
fn stamp_bucket(granularity: Granularity, query: &Query, mut row: ResultRow) -> ResultRow {
    if granularity == Granularity::All {
        if let Some(first) = Interval::condense(&query.intervals).first() {
            row.timestamp = first.start;
        }
    }
    row
}

fn wrong_kind(expected: QueryType, query: &Query) -> QueryError {
    QueryError::UnsupportedQueryType(format!(
        "{} toolchest cannot handle {} query",
        expected,
        query.query_type()
    ))
}

#[derive(Debug, Default)]
pub struct TimeseriesToolChest;

impl QueryToolChest for TimeseriesToolChest {
    fn query_type(&self) -> QueryType {
        QueryType::Timeseries
    }

    fn is_cacheable(&self, _query: &Query) -> bool {
        true
    }

    fn cache_signature(&self, query: &Query) -> Vec<u8> {
        let builder = CacheKeyBuilder::new(QueryType::Timeseries.cache_type_id())
            .append_bool(query.filter.is_some());
        let builder = match &query.filter {
            Some(filter) => builder.append_cacheable(filter),
            None => builder,
        };
        match &query.kind {
            QueryKind::Timeseries {
                granularity,
                aggregators,
                descending,
                ..
            } => builder
                .append_bool(*descending)
                .append_cacheable(granularity)
                .append_cacheables(aggregators.as_slice())
                .build(),
            _ => builder.build(),
        }
    }

    fn compare(&self, query: &Query, a: &ResultRow, b: &ResultRow) -> Ordering {
        match query.kind {
            QueryKind::Timeseries {
                granularity,
                descending,
                ..
            } => {
                let ordering = compare_buckets(granularity, a, b);
                if descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            }
            _ => a.timestamp.cmp(&b.timestamp),
        }
    }

    fn combines(&self, _query: &Query) -> bool {
        true
    }

    fn combine(&self, query: &Query, a: ResultRow, b: ResultRow) -> Result<ResultRow> {
        match &query.kind {
            QueryKind::Timeseries { aggregators, .. } => combine_aggregates(aggregators, a, &b),
            _ => Err(wrong_kind(QueryType::Timeseries, query)),
        }
    }

    fn finalize(&self, query: &Query, row: ResultRow) -> Result<ResultRow> {
        match &query.kind {
            QueryKind::Timeseries {
                granularity,
                post_aggregators,
                ..
            } => Ok(apply_post_aggregators(
                post_aggregators,
                stamp_bucket(*granularity, query, row),
            )),
            _ => Err(wrong_kind(QueryType::Timeseries, query)),
        }
    }
}

#[derive(Debug, Default)]
pub struct GroupByToolChest;

impl QueryToolChest for GroupByToolChest {
    fn query_type(&self) -> QueryType {
        QueryType::GroupBy
    }

    fn is_cacheable(&self, _query: &Query) -> bool {
        true
    }

    fn cache_signature(&self, query: &Query) -> Vec<u8> {
        let builder = CacheKeyBuilder::new(QueryType::GroupBy.cache_type_id())
            .append_bool(query.filter.is_some());
        let builder = match &query.filter {
            Some(filter) => builder.append_cacheable(filter),
            None => builder,
        };
        match &query.kind {
            QueryKind::GroupBy {
                granularity,
                dimensions,
                aggregators,
                ..
            } => builder
                .append_cacheable(granularity)
                .append_strings(dimensions.as_slice())
                .append_cacheables(aggregators.as_slice())
                .build(),
            _ => builder.build(),
        }
    }

    fn compare(&self, query: &Query, a: &ResultRow, b: &ResultRow) -> Ordering {
        let QueryKind::GroupBy {
            granularity,
            dimensions,
            ..
        } = &query.kind
        else {
            return a.timestamp.cmp(&b.timestamp);
        };
        let ordering = compare_buckets(*granularity, a, b);
        dimensions.iter().fold(ordering, |acc, dim| {
            acc.then_with(|| a.value(dim).compare(b.value(dim)))
        })
    }

    fn combines(&self, _query: &Query) -> bool {
        true
    }

    fn combine(&self, query: &Query, a: ResultRow, b: ResultRow) -> Result<ResultRow> {
        match &query.kind {
            QueryKind::GroupBy { aggregators, .. } => combine_aggregates(aggregators, a, &b),
            _ => Err(wrong_kind(QueryType::GroupBy, query)),
        }
    }

    fn finalize(&self, query: &Query, row: ResultRow) -> Result<ResultRow> {
        match &query.kind {
            QueryKind::GroupBy {
                granularity,
                post_aggregators,
                ..
            } => Ok(apply_post_aggregators(
                post_aggregators,
                stamp_bucket(*granularity, query, row),
            )),
            _ => Err(wrong_kind(QueryType::GroupBy, query)),
        }
    }
}

/// Scans return raw rows and are never cached or combined
#[derive(Debug, Default)]
pub struct ScanToolChest;

impl QueryToolChest for ScanToolChest {
    fn query_type(&self) -> QueryType {
        QueryType::Scan
    }

    fn is_cacheable(&self, _query: &Query) -> bool {
        false
    }

    fn cache_signature(&self, query: &Query) -> Vec<u8> {
        let builder = CacheKeyBuilder::new(QueryType::Scan.cache_type_id())
            .append_bool(query.filter.is_some());
        let builder = match &query.filter {
            Some(filter) => builder.append_cacheable(filter),
            None => builder,
        };
        match &query.kind {
            QueryKind::Scan { columns, order } => builder
                .append_strings(columns.as_slice())
                .append_i64(*order as i64)
                .build(),
            _ => builder.build(),
        }
    }

    fn compare(&self, query: &Query, a: &ResultRow, b: &ResultRow) -> Ordering {
        match query.kind {
            QueryKind::Scan {
                order: ScanOrder::Ascending,
                ..
            } => a.timestamp.cmp(&b.timestamp),
            QueryKind::Scan {
                order: ScanOrder::Descending,
                ..
            } => b.timestamp.cmp(&a.timestamp),
            _ => Ordering::Equal,
        }
    }

    fn combines(&self, _query: &Query) -> bool {
        false
    }

    fn orders_by_segment(&self, query: &Query) -> bool {
        matches!(
            query.kind,
            QueryKind::Scan {
                order: ScanOrder::None,
                ..
            }
        )
    }

    fn combine(&self, _query: &Query, _a: ResultRow, _b: ResultRow) -> Result<ResultRow> {
        Err(QueryError::InvalidQuery(
            "scan rows cannot be combined".to_string(),
        ))
    }

    fn finalize(&self, query: &Query, mut row: ResultRow) -> Result<ResultRow> {
        match &query.kind {
            QueryKind::Scan { columns, .. } => {
                if !columns.is_empty() {
                    row.columns.retain(|name, _| columns.contains(name));
                }
                Ok(row)
            }
            _ => Err(wrong_kind(QueryType::Scan, query)),
        }
    }
}

/// Lookup table from query type to toolchest
#[derive(Clone)]
pub struct ToolChestRegistry {
    toolchests: HashMap<QueryType, Arc<dyn QueryToolChest>>,
}

impl ToolChestRegistry {
    /// Create an empty registry
    pub fn empty() -> Self {
        Self {
            toolchests: HashMap::new(),
        }
    }

    pub fn register(&mut self, toolchest: Arc<dyn QueryToolChest>) {
        self.toolchests.insert(toolchest.query_type(), toolchest);
    }

    pub fn get(&self, query_type: QueryType) -> Result<Arc<dyn QueryToolChest>> {
        self.toolchests
            .get(&query_type)
            .cloned()
            .ok_or_else(|| QueryError::UnsupportedQueryType(query_type.to_string()))
    }

    pub fn for_query(&self, query: &Query) -> Result<Arc<dyn QueryToolChest>> {
        self.get(query.query_type())
    }
}

impl Default for ToolChestRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(TimeseriesToolChest));
        registry.register(Arc::new(GroupByToolChest));
        registry.register(Arc::new(ScanToolChest));
        registry
    }
}

impl std::fmt::Debug for ToolChestRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolChestRegistry")
            .field("query_types", &self.toolchests.keys().collect::<Vec<_>>())
            .finish()
    }
}
