//! Cache invalidation on topology changes
//!
//! Segments are immutable, so cached results only go stale when a segment
//! leaves the cluster. The topology view reports that as an event.

use crate::cache::Cache;
use query_core::SegmentId;
use std::sync::Arc;

/// Events that can trigger cache invalidation
#[derive(Debug, Clone, PartialEq)]
pub enum InvalidationEvent {
    /// The last replica of a segment was removed
    SegmentDropped { segment: SegmentId },
}

impl InvalidationEvent {
    pub fn segment_dropped(segment: SegmentId) -> Self {
        Self::SegmentDropped { segment }
    }
}

/// Trait for components that react to invalidation events
pub trait CacheInvalidator: Send + Sync {
    fn invalidate(&self, event: &InvalidationEvent);
}

/// Invalidator that closes the dropped segment's namespace in a cache store
pub struct NamespaceInvalidator {
    cache: Arc<dyn Cache>,
}

impl NamespaceInvalidator {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self { cache }
    }
}

impl CacheInvalidator for NamespaceInvalidator {
    fn invalidate(&self, event: &InvalidationEvent) {
        match event {
            InvalidationEvent::SegmentDropped { segment } => {
                self.cache.close(&segment.to_string());
            }
        }
    }
}

/// Invalidator that ignores every event
#[derive(Debug, Default, Clone)]
pub struct NoOpInvalidator;

impl CacheInvalidator for NoOpInvalidator {
    fn invalidate(&self, _event: &InvalidationEvent) {}
}
