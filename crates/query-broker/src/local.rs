//! In-process data server
//!
//! [`LocalDataServer`] holds raw rows per segment and answers sub-queries the
//! way a historical node would: it filters each requested slice, buckets and
//! aggregates rows for aggregating queries, and returns one sorted
//! [`SegmentResult`] per segment it holds. Segments it does not hold are left
//! out of the response.

use crate::error::Result;
use crate::server::{SegmentQueryRunner, SegmentResult, SegmentResultStream, SubQuery};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use query_core::{
    Aggregator, AggregatorKind, Granularity, Interval, Query, QueryKind, QueryToolChest, ResultRow,
    SegmentDescriptor, SegmentId, ToolChestRegistry, Value,
};
use std::cmp::Ordering;

/// Segment data served from memory
#[derive(Default)]
pub struct LocalDataServer {
    segments: RwLock<Vec<(SegmentId, Vec<ResultRow>)>>,
    toolchests: ToolChestRegistry,
}

impl LocalDataServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a segment's raw rows, replacing any earlier load of it
    pub fn add_segment(&self, id: SegmentId, rows: Vec<ResultRow>) {
        let mut segments = self.segments.write();
        segments.retain(|(existing, _)| *existing != id);
        segments.push((id, rows));
    }

    pub fn remove_segment(&self, id: &SegmentId) -> bool {
        let mut segments = self.segments.write();
        let before = segments.len();
        segments.retain(|(existing, _)| existing != id);
        segments.len() != before
    }

    pub fn segments(&self) -> Vec<SegmentId> {
        self.segments.read().iter().map(|(id, _)| id.clone()).collect()
    }

    /// Rows of the segment a descriptor points into
    fn rows_for(&self, descriptor: &SegmentDescriptor) -> Option<Vec<ResultRow>> {
        self.segments
            .read()
            .iter()
            .find(|(id, _)| {
                id.datasource == descriptor.datasource
                    && id.version == descriptor.version
                    && id.partition == descriptor.partition
                    && id.interval.encloses(&descriptor.interval)
            })
            .map(|(_, rows)| rows.clone())
    }

    fn evaluate(
        &self,
        query: &Query,
        toolchest: &dyn QueryToolChest,
        slice: &Interval,
        rows: Vec<ResultRow>,
    ) -> Result<Vec<ResultRow>> {
        let matching = rows.into_iter().filter(|row| {
            slice.contains(row.timestamp) && query.filter.as_ref().map_or(true, |f| f.matches(row))
        });

        let partials: Vec<ResultRow> = match &query.kind {
            QueryKind::Timeseries {
                granularity,
                aggregators,
                ..
            } => matching
                .map(|row| initial_row(&row, *granularity, slice, &[], aggregators))
                .collect(),
            QueryKind::GroupBy {
                granularity,
                dimensions,
                aggregators,
                ..
            } => matching
                .map(|row| initial_row(&row, *granularity, slice, dimensions, aggregators))
                .collect(),
            QueryKind::Scan { .. } => {
                let mut scanned: Vec<ResultRow> = matching.collect();
                scanned.sort_by(|a, b| toolchest.compare(query, a, b));
                return Ok(scanned);
            }
        };

        let mut partials = partials;
        partials.sort_by(|a, b| toolchest.compare(query, a, b));

        let mut combined: Vec<ResultRow> = Vec::with_capacity(partials.len());
        for row in partials {
            match combined.pop() {
                Some(last) if toolchest.compare(query, &last, &row) == Ordering::Equal => {
                    combined.push(toolchest.combine(query, last, row)?);
                }
                Some(last) => {
                    combined.push(last);
                    combined.push(row);
                }
                None => combined.push(row),
            }
        }
        Ok(combined)
    }
}

/// One raw row turned into a single-row partial aggregate
fn initial_row(
    row: &ResultRow,
    granularity: Granularity,
    slice: &Interval,
    dimensions: &[String],
    aggregators: &[Aggregator],
) -> ResultRow {
    let mut partial = ResultRow::new(granularity.bucket_start(row.timestamp, slice));
    for dim in dimensions {
        partial.set(dim.clone(), row.value(dim).clone());
    }
    for aggregator in aggregators {
        partial.set(aggregator.name.clone(), initial_value(aggregator, row));
    }
    partial
}

fn initial_value(aggregator: &Aggregator, row: &ResultRow) -> Value {
    let input = aggregator
        .field
        .as_deref()
        .map(|field| row.value(field))
        .unwrap_or(&Value::Null);
    match aggregator.kind {
        AggregatorKind::Count => Value::Long(1),
        AggregatorKind::DoubleSum => input.as_double().map_or(Value::Null, Value::Double),
        AggregatorKind::LongSum | AggregatorKind::LongMin | AggregatorKind::LongMax => {
            input.as_long().map_or(Value::Null, Value::Long)
        }
    }
}

#[async_trait]
impl SegmentQueryRunner for LocalDataServer {
    async fn run(&self, sub_query: SubQuery) -> Result<SegmentResultStream> {
        let query = sub_query.query.as_ref();
        let toolchest = self.toolchests.for_query(query)?;

        let mut results = Vec::with_capacity(sub_query.segments.len());
        for descriptor in sub_query.segments {
            let Some(rows) = self.rows_for(&descriptor) else {
                tracing::debug!("Segment {} is not loaded here", descriptor);
                continue;
            };
            let rows = self.evaluate(query, toolchest.as_ref(), &descriptor.interval, rows)?;
            results.push(Ok(SegmentResult { descriptor, rows }));
        }
        Ok(stream::iter(results).boxed())
    }
}
