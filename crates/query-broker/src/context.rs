//! Response context: per-query metadata gathered alongside results
//!
//! Every component of a query records into the same [`ResponseContext`]
//! handle. Branches that run with their own handle fold it back in with
//! [`ResponseContext::merge`].

use parking_lot::Mutex;
use query_core::{Interval, SegmentDescriptor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Accumulated metadata of one query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseState {
    /// Segments a server failed to deliver
    pub missing_segments: BTreeSet<SegmentDescriptor>,
    /// Segments no server was available for
    pub unavailable_segments: BTreeSet<SegmentDescriptor>,
    /// Parts of the query range no segment covers
    pub uncovered_intervals: Vec<Interval>,
    pub uncovered_intervals_overflowed: bool,
    /// Sub-queries sent to data servers
    pub rpc_count: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Rows received from data servers
    pub rows_gathered: u64,
    /// Set when the header form had to drop fields
    pub truncated: bool,
    pub etag: Option<String>,
}

/// Shared, cloneable handle to a query's [`ResponseState`]
#[derive(Debug, Clone, Default)]
pub struct ResponseContext {
    state: Arc<Mutex<ResponseState>>,
}

impl ResponseContext {
    /// Create a new empty context
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_missing_segment(&self, descriptor: SegmentDescriptor) {
        self.state.lock().missing_segments.insert(descriptor);
    }

    pub fn add_missing_segments(&self, descriptors: impl IntoIterator<Item = SegmentDescriptor>) {
        self.state.lock().missing_segments.extend(descriptors);
    }

    pub fn add_unavailable_segment(&self, descriptor: SegmentDescriptor) {
        self.state.lock().unavailable_segments.insert(descriptor);
    }

    /// Record uncovered intervals, keeping at most `limit` of them
    pub fn add_uncovered_intervals(&self, intervals: &[Interval], limit: usize) {
        let mut state = self.state.lock();
        let mut all = state.uncovered_intervals.clone();
        all.extend_from_slice(intervals);
        let mut condensed = Interval::condense(&all);
        if condensed.len() > limit {
            condensed.truncate(limit);
            state.uncovered_intervals_overflowed = true;
        }
        state.uncovered_intervals = condensed;
    }

    pub fn increment_rpc_count(&self) {
        self.state.lock().rpc_count += 1;
    }

    pub fn add_cache_hits(&self, count: u64) {
        self.state.lock().cache_hits += count;
    }

    pub fn add_cache_misses(&self, count: u64) {
        self.state.lock().cache_misses += count;
    }

    pub fn add_rows_gathered(&self, count: u64) {
        self.state.lock().rows_gathered += count;
    }

    pub fn set_etag(&self, etag: impl Into<String>) {
        self.state.lock().etag = Some(etag.into());
    }

    pub fn missing_segments(&self) -> Vec<SegmentDescriptor> {
        self.state.lock().missing_segments.iter().cloned().collect()
    }

    pub fn unavailable_segments(&self) -> Vec<SegmentDescriptor> {
        self.state.lock().unavailable_segments.iter().cloned().collect()
    }

    pub fn uncovered_intervals(&self) -> Vec<Interval> {
        self.state.lock().uncovered_intervals.clone()
    }

    pub fn rpc_count(&self) -> u64 {
        self.state.lock().rpc_count
    }

    pub fn cache_hits(&self) -> u64 {
        self.state.lock().cache_hits
    }

    pub fn cache_misses(&self) -> u64 {
        self.state.lock().cache_misses
    }

    pub fn rows_gathered(&self) -> u64 {
        self.state.lock().rows_gathered
    }

    pub fn etag(&self) -> Option<String> {
        self.state.lock().etag.clone()
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> ResponseState {
        self.state.lock().clone()
    }

    /// Fold `other` into this context
    ///
    /// Counts add up, segment sets and intervals are unioned, flags are
    /// or-ed, and an existing etag is kept over the other one.
    pub fn merge(&self, other: &ResponseContext) {
        if Arc::ptr_eq(&self.state, &other.state) {
            return;
        }
        let other = other.snapshot();
        let mut state = self.state.lock();

        state.missing_segments.extend(other.missing_segments);
        state.unavailable_segments.extend(other.unavailable_segments);

        let mut intervals = state.uncovered_intervals.clone();
        intervals.extend(other.uncovered_intervals);
        state.uncovered_intervals = Interval::condense(&intervals);
        state.uncovered_intervals_overflowed |= other.uncovered_intervals_overflowed;

        state.rpc_count += other.rpc_count;
        state.cache_hits += other.cache_hits;
        state.cache_misses += other.cache_misses;
        state.rows_gathered += other.rows_gathered;
        state.truncated |= other.truncated;
        if state.etag.is_none() {
            state.etag = other.etag;
        }
    }

    /// Serialize for a response header of at most `max_chars`
    ///
    /// When too long, uncovered intervals, then missing segments, then
    /// unavailable segments are dropped and `truncated` is set. The result
    /// may still exceed `max_chars` once nothing droppable is left.
    pub fn to_header(&self, max_chars: usize) -> String {
        let mut state = self.snapshot();
        let mut header = serialize(&state);

        let droppers: [fn(&mut ResponseState); 3] = [
            |s| s.uncovered_intervals.clear(),
            |s| s.missing_segments.clear(),
            |s| s.unavailable_segments.clear(),
        ];
        for drop_field in droppers {
            if header.len() <= max_chars {
                break;
            }
            drop_field(&mut state);
            state.truncated = true;
            header = serialize(&state);
        }
        header
    }
}

fn serialize(state: &ResponseState) -> String {
    serde_json::to_string(state).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use query_core::SegmentId;

    fn descriptor(partition: u32) -> SegmentDescriptor {
        SegmentId::new("wiki", Interval::new(0, 10), "v1", partition).descriptor(Interval::new(0, 10))
    }

    #[test]
    fn test_merge_rules() {
        let a = ResponseContext::new();
        a.add_missing_segment(descriptor(0));
        a.increment_rpc_count();
        a.add_cache_hits(2);
        a.set_etag("first");
        a.add_uncovered_intervals(&[Interval::new(0, 5)], 10);

        let b = ResponseContext::new();
        b.add_missing_segment(descriptor(0));
        b.add_missing_segment(descriptor(1));
        b.increment_rpc_count();
        b.add_cache_misses(3);
        b.set_etag("second");
        b.add_uncovered_intervals(&[Interval::new(5, 8)], 10);

        a.merge(&b);

        assert_eq!(a.missing_segments(), vec![descriptor(0), descriptor(1)]);
        assert_eq!(a.rpc_count(), 2);
        assert_eq!(a.cache_hits(), 2);
        assert_eq!(a.cache_misses(), 3);
        assert_eq!(a.etag(), Some("first".to_string()));
        assert_eq!(a.uncovered_intervals(), vec![Interval::new(0, 8)]);
    }

    #[test]
    fn test_merge_with_self_is_noop() {
        let a = ResponseContext::new();
        a.increment_rpc_count();
        let alias = a.clone();
        a.merge(&alias);
        assert_eq!(a.rpc_count(), 1);
    }

    #[test]
    fn test_empty_context_reads_as_zero() {
        let ctx = ResponseContext::new();
        assert_eq!(ctx.rpc_count(), 0);
        assert!(ctx.missing_segments().is_empty());
        assert_eq!(ctx.etag(), None);
    }

    #[test]
    fn test_uncovered_limit_sets_overflow() {
        let ctx = ResponseContext::new();
        ctx.add_uncovered_intervals(
            &[Interval::new(0, 1), Interval::new(2, 3), Interval::new(4, 5)],
            2,
        );
        let state = ctx.snapshot();
        assert_eq!(state.uncovered_intervals.len(), 2);
        assert!(state.uncovered_intervals_overflowed);
    }

    #[test]
    fn test_header_truncation() {
        let ctx = ResponseContext::new();
        for p in 0..20 {
            ctx.add_missing_segment(descriptor(p));
        }
        ctx.add_unavailable_segment(descriptor(99));
        ctx.add_uncovered_intervals(&[Interval::new(100, 200)], 10);

        let full = ctx.to_header(usize::MAX);
        assert!(full.contains("missing_segments"));

        let limit = full.len() / 2;
        let header = ctx.to_header(limit);
        let parsed: ResponseState = serde_json::from_str(&header).unwrap();

        assert!(parsed.truncated);
        assert!(parsed.uncovered_intervals.is_empty());
        assert!(parsed.missing_segments.is_empty());
        assert_eq!(parsed.unavailable_segments.len(), 1);
        assert!(header.len() <= limit);
    }
}
