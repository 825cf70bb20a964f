//! Segment timeline for the query broker
//!
//! - [`timeline`]: versioned interval timeline with overshadowing
//! - [`resolver`]: turns query intervals into the segment slices to read

pub mod resolver;
pub mod timeline;

pub use resolver::{resolve, ResolvedSegments, TimelineView};
pub use timeline::{
    uncovered_intervals, PartitionChunk, TimelineObjectHolder, VersionedIntervalTimeline,
};
