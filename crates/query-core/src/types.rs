use crate::error::{QueryError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Half-open time range `[start, end)` in epoch milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Interval {
    pub start: i64,
    pub end: i64,
}

impl Interval {
    /// Create a new interval
    ///
    /// # Panics
    ///
    /// Panics if `start > end`. Use [`Interval::try_new`] for untrusted input.
    pub fn new(start: i64, end: i64) -> Self {
        assert!(start <= end, "interval start {} after end {}", start, end);
        Self { start, end }
    }

    /// Create a new interval, rejecting `start > end`
    pub fn try_new(start: i64, end: i64) -> Result<Self> {
        if start > end {
            return Err(QueryError::InvalidInterval { start, end });
        }
        Ok(Self { start, end })
    }

    /// The interval covering every representable instant
    pub fn eternity() -> Self {
        Self {
            start: i64::MIN,
            end: i64::MAX,
        }
    }

    pub fn duration_millis(&self) -> i64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Check if the instant falls inside this interval
    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp < self.end
    }

    /// Check if `other` lies entirely inside this interval
    pub fn encloses(&self, other: &Interval) -> bool {
        other.start >= self.start && other.end <= self.end
    }

    /// Check if the two intervals share at least one instant
    pub fn overlaps(&self, other: &Interval) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Check if the two intervals touch end-to-start without overlapping
    pub fn abuts(&self, other: &Interval) -> bool {
        self.end == other.start || other.end == self.start
    }

    /// The overlapping part of two intervals, if any
    pub fn intersect(&self, other: &Interval) -> Option<Interval> {
        if !self.overlaps(other) {
            return None;
        }
        Some(Interval {
            start: self.start.max(other.start),
            end: self.end.min(other.end),
        })
    }

    /// Sort intervals and fuse overlapping or abutting ones.
    ///
    /// Empty intervals are dropped.
    pub fn condense(intervals: &[Interval]) -> Vec<Interval> {
        let mut sorted: Vec<Interval> = intervals.iter().filter(|i| !i.is_empty()).copied().collect();
        sorted.sort();

        let mut condensed: Vec<Interval> = Vec::with_capacity(sorted.len());
        for interval in sorted {
            match condensed.last_mut() {
                Some(last) if interval.start <= last.end => {
                    last.end = last.end.max(interval.end);
                }
                _ => condensed.push(interval),
            }
        }
        condensed
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.start, self.end)
    }
}

/// Identity of one physical segment
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SegmentId {
    pub datasource: String,
    pub interval: Interval,
    pub version: String,
    pub partition: u32,
}

impl SegmentId {
    pub fn new(
        datasource: impl Into<String>,
        interval: Interval,
        version: impl Into<String>,
        partition: u32,
    ) -> Self {
        Self {
            datasource: datasource.into(),
            interval,
            version: version.into(),
            partition,
        }
    }

    /// Describe the part of this segment bounded by `slice`
    pub fn descriptor(&self, slice: Interval) -> SegmentDescriptor {
        SegmentDescriptor {
            datasource: self.datasource.clone(),
            interval: slice,
            version: self.version.clone(),
            partition: self.partition,
        }
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}_{}",
            self.datasource, self.interval.start, self.interval.end, self.version, self.partition
        )
    }
}

/// The slice of a segment a query reads
///
/// `interval` is the visible, query-clipped part of the segment, which may be
/// narrower than the segment's own interval.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SegmentDescriptor {
    pub datasource: String,
    pub interval: Interval,
    pub version: String,
    pub partition: u32,
}

impl fmt::Display for SegmentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}, v{}, p{}]",
            self.datasource, self.interval, self.version, self.partition
        )
    }
}

/// A resolved segment: the whole segment's id plus the slice to read
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QuerySegment {
    pub id: SegmentId,
    pub descriptor: SegmentDescriptor,
}

impl QuerySegment {
    pub fn new(id: SegmentId, slice: Interval) -> Self {
        let descriptor = id.descriptor(slice);
        Self { id, descriptor }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_overlap_and_intersect() {
        let a = Interval::new(0, 10);
        let b = Interval::new(5, 15);
        let c = Interval::new(10, 20);

        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!(a.abuts(&c));
        assert_eq!(a.intersect(&b), Some(Interval::new(5, 10)));
        assert_eq!(a.intersect(&c), None);
    }

    #[test]
    fn test_interval_try_new_rejects_inverted() {
        assert!(Interval::try_new(10, 0).is_err());
        assert!(Interval::try_new(0, 0).unwrap().is_empty());
    }

    #[test]
    fn test_condense_merges_overlapping_and_abutting() {
        let condensed = Interval::condense(&[
            Interval::new(20, 30),
            Interval::new(0, 10),
            Interval::new(10, 15),
            Interval::new(25, 40),
            Interval::new(50, 50),
        ]);
        assert_eq!(condensed, vec![Interval::new(0, 15), Interval::new(20, 40)]);
    }

    #[test]
    fn test_segment_descriptor_carries_slice() {
        let id = SegmentId::new("wiki", Interval::new(0, 100), "v1", 3);
        let segment = QuerySegment::new(id.clone(), Interval::new(20, 40));

        assert_eq!(segment.descriptor.interval, Interval::new(20, 40));
        assert_eq!(segment.descriptor.version, "v1");
        assert_eq!(segment.descriptor.partition, 3);
        assert_eq!(segment.id.interval, Interval::new(0, 100));
        assert_eq!(id.to_string(), "wiki_0_100_v1_3");
    }
}
