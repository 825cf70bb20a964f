//! Resolution of a query's intervals into the segments to read

use crate::timeline::{uncovered_intervals, TimelineObjectHolder};
use query_core::{Interval, QuerySegment, SegmentId};
use tracing::debug;

/// Read access to per-datasource timelines
pub trait TimelineView: Send + Sync {
    /// Visible entries of `datasource` over `interval`, or `None` if the
    /// datasource is unknown
    fn lookup(&self, datasource: &str, interval: &Interval)
        -> Option<Vec<TimelineObjectHolder<SegmentId>>>;
}

/// Segments covering a query plus the parts of it nothing covers
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedSegments {
    pub segments: Vec<QuerySegment>,
    pub uncovered: Vec<Interval>,
}

/// Resolve `intervals` of `datasource` into an ordered list of query segments
///
/// The intervals are condensed first, so overlapping query intervals never
/// produce the same slice twice. An unknown datasource resolves to nothing,
/// with every interval reported as uncovered.
pub fn resolve<V>(view: &V, datasource: &str, intervals: &[Interval]) -> ResolvedSegments
where
    V: TimelineView + ?Sized,
{
    let mut resolved = ResolvedSegments::default();

    for interval in Interval::condense(intervals) {
        let Some(holders) = view.lookup(datasource, &interval) else {
            resolved.uncovered.push(interval);
            continue;
        };

        let covered: Vec<Interval> = holders.iter().map(|h| h.interval).collect();
        resolved
            .uncovered
            .extend(uncovered_intervals(&interval, &covered));

        for holder in holders {
            for chunk in holder.chunks {
                resolved
                    .segments
                    .push(QuerySegment::new(chunk.object, holder.interval));
            }
        }
    }

    debug!(
        "Resolved {} segments for {} ({} uncovered intervals)",
        resolved.segments.len(),
        datasource,
        resolved.uncovered.len()
    );
    resolved
}
