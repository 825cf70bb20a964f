//! Versioned interval timeline
//!
//! Holds every known (interval, version) entry for one datasource and answers
//! which entries are visible for a time range. Where entries overlap, the
//! highest version wins; a lower version stays visible wherever nothing newer
//! covers it.

use query_core::Interval;
use std::collections::BTreeMap;

/// One partition of a timeline entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionChunk<T> {
    pub partition_num: u32,
    /// Number of partitions that make the entry complete; 0 means any
    /// non-empty set of partitions is complete
    pub num_core_partitions: u32,
    pub object: T,
}

impl<T> PartitionChunk<T> {
    pub fn new(partition_num: u32, num_core_partitions: u32, object: T) -> Self {
        Self {
            partition_num,
            num_core_partitions,
            object,
        }
    }

    /// A chunk whose entry is complete as soon as it has any partition
    pub fn single(partition_num: u32, object: T) -> Self {
        Self::new(partition_num, 0, object)
    }
}

/// A visible slice of the timeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineObjectHolder<T> {
    /// The visible part of the entry
    pub interval: Interval,
    /// The entry's full interval
    pub true_interval: Interval,
    pub version: String,
    pub chunks: Vec<PartitionChunk<T>>,
}

type EntryKey = (Interval, String);

#[derive(Debug, Clone)]
struct TimelineEntry<T> {
    interval: Interval,
    version: String,
    chunks: BTreeMap<u32, PartitionChunk<T>>,
}

impl<T> TimelineEntry<T> {
    fn is_complete(&self) -> bool {
        let core = self
            .chunks
            .values()
            .map(|c| c.num_core_partitions)
            .max()
            .unwrap_or(0);

        if core == 0 {
            return !self.chunks.is_empty();
        }
        (0..core).all(|p| self.chunks.contains_key(&p))
    }

    fn key(&self) -> EntryKey {
        (self.interval, self.version.clone())
    }
}

/// Timeline of versioned, partitioned entries for a single datasource
#[derive(Debug, Clone)]
pub struct VersionedIntervalTimeline<T> {
    entries: BTreeMap<EntryKey, TimelineEntry<T>>,
}

impl<T> Default for VersionedIntervalTimeline<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> VersionedIntervalTimeline<T> {
    /// Create a new empty timeline
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Add a partition chunk, replacing any chunk with the same number
    pub fn add(&mut self, interval: Interval, version: impl Into<String>, chunk: PartitionChunk<T>) {
        let version = version.into();
        let entry = self
            .entries
            .entry((interval, version.clone()))
            .or_insert_with(|| TimelineEntry {
                interval,
                version,
                chunks: BTreeMap::new(),
            });
        entry.chunks.insert(chunk.partition_num, chunk);
    }

    /// Remove a partition chunk, dropping the entry once it is empty
    pub fn remove(
        &mut self,
        interval: Interval,
        version: &str,
        partition_num: u32,
    ) -> Option<PartitionChunk<T>> {
        let key = (interval, version.to_string());
        let entry = self.entries.get_mut(&key)?;
        let removed = entry.chunks.remove(&partition_num);
        if entry.chunks.is_empty() {
            self.entries.remove(&key);
        }
        removed
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of partition chunks across all entries
    pub fn num_chunks(&self) -> usize {
        self.entries.values().map(|e| e.chunks.len()).sum()
    }

    /// Check whether every instant of `interval` is covered by a complete
    /// entry with a version higher than `version`
    pub fn is_overshadowed(&self, interval: &Interval, version: &str) -> bool {
        if interval.is_empty() {
            return false;
        }
        let newer: Vec<&TimelineEntry<T>> = self
            .entries
            .values()
            .filter(|e| e.version.as_str() > version && e.is_complete() && e.interval.overlaps(interval))
            .collect();

        slice_boundaries(interval, newer.iter().map(|e| &e.interval))
            .windows(2)
            .all(|w| {
                let slice = Interval { start: w[0], end: w[1] };
                newer.iter().any(|e| e.interval.encloses(&slice))
            })
    }

    fn winner(&self, candidates: &[&TimelineEntry<T>], slice: &Interval) -> Option<EntryKey> {
        candidates
            .iter()
            .filter(|e| e.interval.encloses(slice))
            .max_by(|a, b| a.version.cmp(&b.version).then(a.interval.cmp(&b.interval)))
            .map(|e| e.key())
    }
}

impl<T: Clone> VersionedIntervalTimeline<T> {
    /// Visible entries for `interval`, in time order
    ///
    /// The range is cut at every entry boundary; each slice shows the highest
    /// complete version covering it, and adjacent slices won by the same entry
    /// are joined back together. Parts of `interval` nothing covers are absent.
    pub fn lookup(&self, interval: &Interval) -> Vec<TimelineObjectHolder<T>> {
        if interval.is_empty() {
            return Vec::new();
        }

        let candidates: Vec<&TimelineEntry<T>> = self
            .entries
            .values()
            .filter(|e| e.is_complete() && e.interval.overlaps(interval))
            .collect();

        let mut visible: Vec<(Interval, EntryKey)> = Vec::new();
        for w in slice_boundaries(interval, candidates.iter().map(|e| &e.interval)).windows(2) {
            let slice = Interval { start: w[0], end: w[1] };
            let Some(key) = self.winner(&candidates, &slice) else {
                continue;
            };
            match visible.last_mut() {
                Some((last, last_key)) if *last_key == key && last.end == slice.start => {
                    last.end = slice.end;
                }
                _ => visible.push((slice, key)),
            }
        }

        visible
            .into_iter()
            .filter_map(|(slice, key)| {
                let entry = self.entries.get(&key)?;
                Some(TimelineObjectHolder {
                    interval: slice,
                    true_interval: entry.interval,
                    version: entry.version.clone(),
                    chunks: entry.chunks.values().cloned().collect(),
                })
            })
            .collect()
    }
}

/// Sorted, distinct cut points of `interval` by the given entry intervals
fn slice_boundaries<'a>(interval: &Interval, entries: impl Iterator<Item = &'a Interval>) -> Vec<i64> {
    let mut points = vec![interval.start, interval.end];
    for e in entries {
        for p in [e.start, e.end] {
            if p > interval.start && p < interval.end {
                points.push(p);
            }
        }
    }
    points.sort_unstable();
    points.dedup();
    points
}

/// Parts of `interval` not covered by any of the sorted, disjoint `covered`
pub fn uncovered_intervals(interval: &Interval, covered: &[Interval]) -> Vec<Interval> {
    let mut gaps = Vec::new();
    let mut cursor = interval.start;
    for c in covered {
        if c.end <= cursor || c.start >= interval.end {
            continue;
        }
        if c.start > cursor {
            gaps.push(Interval {
                start: cursor,
                end: c.start,
            });
        }
        cursor = cursor.max(c.end);
    }
    if cursor < interval.end {
        gaps.push(Interval {
            start: cursor,
            end: interval.end,
        });
    }
    gaps
}
