//! The broker's view of the cluster
//!
//! Tracks which servers are registered, which segments each serves, and the
//! per-datasource timelines built from the served segments. A segment enters
//! the timeline when its first server announces it and leaves when its last
//! server drops it; leaving also invalidates its cache namespace.

use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::selector::{SelectionStrategy, ServerSelector};
use crate::server::QueryableServer;
use dashmap::DashMap;
use parking_lot::RwLock;
use query_cache::{CacheInvalidator, InvalidationEvent, NoOpInvalidator};
use query_core::{Interval, SegmentId};
use query_timeline::{PartitionChunk, TimelineObjectHolder, TimelineView, VersionedIntervalTimeline};
use std::collections::HashMap;
use std::sync::Arc;

/// Timeline lookups plus server selection
pub trait ServerView: TimelineView {
    /// Server to send a segment's sub-query to, if any holds it
    fn select_server(&self, segment: &SegmentId) -> Option<Arc<QueryableServer>>;

    /// Registered server by name
    fn server(&self, name: &str) -> Option<Arc<QueryableServer>>;
}

#[derive(Default)]
struct Inventory {
    selectors: HashMap<SegmentId, ServerSelector>,
    timelines: HashMap<String, VersionedIntervalTimeline<SegmentId>>,
}

impl Inventory {
    /// Drop a segment with no servers left; returns whether it was dropped
    fn drop_if_unserved(&mut self, segment: &SegmentId) -> bool {
        if !self.selectors.get(segment).is_some_and(|s| s.is_empty()) {
            return false;
        }
        self.selectors.remove(segment);
        if let Some(timeline) = self.timelines.get_mut(&segment.datasource) {
            timeline.remove(segment.interval, &segment.version, segment.partition);
            if timeline.is_empty() {
                self.timelines.remove(&segment.datasource);
            }
        }
        true
    }
}

/// In-memory [`ServerView`] fed by server and segment announcements
pub struct BrokerServerView {
    servers: DashMap<String, Arc<QueryableServer>>,
    inventory: RwLock<Inventory>,
    strategy: SelectionStrategy,
    invalidator: Arc<dyn CacheInvalidator>,
}

impl BrokerServerView {
    pub fn new(strategy: SelectionStrategy) -> Self {
        Self::with_invalidator(strategy, Arc::new(NoOpInvalidator))
    }

    /// Create a view that selects servers the way `config` says
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self::new(config.selection.clone())
    }

    /// Create a view that reports dropped segments to `invalidator`
    pub fn with_invalidator(strategy: SelectionStrategy, invalidator: Arc<dyn CacheInvalidator>) -> Self {
        Self {
            servers: DashMap::new(),
            inventory: RwLock::new(Inventory::default()),
            strategy,
            invalidator,
        }
    }

    pub fn add_server(&self, server: Arc<QueryableServer>) -> Result<()> {
        let name = server.name().to_string();
        if self.servers.contains_key(&name) {
            return Err(BrokerError::ServerAlreadyRegistered(name));
        }
        tracing::info!(
            "Registered server {} at {} (tier {}, priority {})",
            name,
            server.metadata().host,
            server.metadata().tier,
            server.metadata().priority
        );
        self.servers.insert(name, server);
        Ok(())
    }

    /// Unregister a server along with every segment it announced
    pub fn remove_server(&self, name: &str) -> Result<()> {
        if self.servers.remove(name).is_none() {
            return Err(BrokerError::ServerNotFound(name.to_string()));
        }

        let dropped: Vec<SegmentId> = {
            let mut inventory = self.inventory.write();
            let served: Vec<SegmentId> = inventory
                .selectors
                .iter_mut()
                .filter_map(|(segment, selector)| selector.remove_server(name).then(|| segment.clone()))
                .collect();
            served
                .into_iter()
                .filter(|segment| inventory.drop_if_unserved(segment))
                .collect()
        };

        tracing::info!("Unregistered server {} ({} segments dropped)", name, dropped.len());
        for segment in dropped {
            self.invalidator.invalidate(&InvalidationEvent::segment_dropped(segment));
        }
        Ok(())
    }

    /// Announce that `server` serves a single-partition segment
    pub fn add_segment(&self, server: &str, segment: SegmentId) -> Result<()> {
        self.add_partitioned_segment(server, segment, 0)
    }

    /// Announce that `server` serves one partition of a segment set with
    /// `core_partitions` partitions; 0 means the set is always complete
    pub fn add_partitioned_segment(&self, server: &str, segment: SegmentId, core_partitions: u32) -> Result<()> {
        let queryable = self
            .server(server)
            .ok_or_else(|| BrokerError::ServerNotFound(server.to_string()))?;

        let mut inventory = self.inventory.write();
        let selector = inventory
            .selectors
            .entry(segment.clone())
            .or_insert_with(|| ServerSelector::new(segment.clone()));
        let first = selector.is_empty();
        selector.add_server(queryable);

        if first {
            tracing::debug!("Segment {} added to timeline", segment);
            inventory
                .timelines
                .entry(segment.datasource.clone())
                .or_default()
                .add(
                    segment.interval,
                    segment.version.clone(),
                    PartitionChunk::new(segment.partition, core_partitions, segment),
                );
        }
        Ok(())
    }

    /// Withdraw `server`'s announcement of a segment
    pub fn remove_segment(&self, server: &str, segment: &SegmentId) -> Result<()> {
        let dropped = {
            let mut inventory = self.inventory.write();
            let Some(selector) = inventory.selectors.get_mut(segment) else {
                return Ok(());
            };
            selector.remove_server(server);
            inventory.drop_if_unserved(segment)
        };

        if dropped {
            tracing::debug!("Segment {} dropped from timeline", segment);
            self.invalidator
                .invalidate(&InvalidationEvent::segment_dropped(segment.clone()));
        }
        Ok(())
    }

    pub fn num_servers(&self) -> usize {
        self.servers.len()
    }

    /// Number of segments with at least one server
    pub fn num_segments(&self) -> usize {
        self.inventory.read().selectors.len()
    }

    /// Names of the servers holding a segment
    pub fn servers_for(&self, segment: &SegmentId) -> Vec<String> {
        self.inventory
            .read()
            .selectors
            .get(segment)
            .map(|selector| {
                selector
                    .candidates(&self.strategy.tier)
                    .iter()
                    .map(|s| s.name().to_string())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl TimelineView for BrokerServerView {
    fn lookup(&self, datasource: &str, interval: &Interval) -> Option<Vec<TimelineObjectHolder<SegmentId>>> {
        let inventory = self.inventory.read();
        inventory
            .timelines
            .get(datasource)
            .map(|timeline| timeline.lookup(interval))
    }
}

impl ServerView for BrokerServerView {
    fn select_server(&self, segment: &SegmentId) -> Option<Arc<QueryableServer>> {
        let inventory = self.inventory.read();
        inventory.selectors.get(segment)?.pick(&self.strategy)
    }

    fn server(&self, name: &str) -> Option<Arc<QueryableServer>> {
        self.servers.get(name).map(|entry| Arc::clone(entry.value()))
    }
}
