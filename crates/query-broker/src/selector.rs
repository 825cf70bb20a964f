//! Server selection for segments
//!
//! Each segment keeps a [`ServerSelector`] listing the servers that hold it,
//! grouped by tier priority. Picking a server first chooses a tier with a
//! [`TierSelectorStrategy`], then a replica within it with a
//! [`BalancerStrategy`].

use crate::server::QueryableServer;
use query_core::{CacheKeyBuilder, SegmentId};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use xxhash_rust::xxh3::xxh3_64;

/// Which tier serves a segment held by several tiers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TierSelectorStrategy {
    /// Tier with the highest priority value
    HighestPriority,
    /// Tier with the lowest priority value
    LowestPriority,
    /// Listed priorities first, in list order, then the rest highest-first
    Custom { priorities: Vec<i32> },
}

impl TierSelectorStrategy {
    /// Order the given tier priorities by preference
    fn rank(&self, mut tiers: Vec<i32>) -> Vec<i32> {
        match self {
            TierSelectorStrategy::HighestPriority => {
                tiers.sort_unstable_by(|a, b| b.cmp(a));
                tiers
            }
            TierSelectorStrategy::LowestPriority => {
                tiers.sort_unstable();
                tiers
            }
            TierSelectorStrategy::Custom { priorities } => {
                tiers.sort_by_key(|p| {
                    let position = priorities.iter().position(|c| c == p).unwrap_or(usize::MAX);
                    (position, std::cmp::Reverse(*p))
                });
                tiers
            }
        }
    }
}

/// Which replica within a tier serves a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BalancerStrategy {
    /// Uniformly random replica
    Random,
    /// Replica with the fewest sub-queries in flight
    ConnectionCount,
    /// Replica chosen by rendezvous hashing, stable per segment
    ConsistentHash,
}

/// Tier strategy plus balancer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionStrategy {
    pub tier: TierSelectorStrategy,
    pub balancer: BalancerStrategy,
}

impl Default for SelectionStrategy {
    fn default() -> Self {
        Self {
            tier: TierSelectorStrategy::HighestPriority,
            balancer: BalancerStrategy::Random,
        }
    }
}

impl SelectionStrategy {
    pub fn new(tier: TierSelectorStrategy, balancer: BalancerStrategy) -> Self {
        Self { tier, balancer }
    }
}

/// Same value on every broker and every build
fn rendezvous_hash(segment: &SegmentId, server: &str) -> u64 {
    let key = CacheKeyBuilder::new(0)
        .append_string(&segment.datasource)
        .append_i64(segment.interval.start)
        .append_i64(segment.interval.end)
        .append_string(&segment.version)
        .append_i64(i64::from(segment.partition))
        .append_string(server)
        .build();
    xxh3_64(&key)
}

/// Servers holding one segment, by tier priority
#[derive(Debug, Clone)]
pub struct ServerSelector {
    segment: SegmentId,
    tiers: BTreeMap<i32, Vec<Arc<QueryableServer>>>,
}

impl ServerSelector {
    /// Create a new selector with no servers
    pub fn new(segment: SegmentId) -> Self {
        Self {
            segment,
            tiers: BTreeMap::new(),
        }
    }

    pub fn segment(&self) -> &SegmentId {
        &self.segment
    }

    /// Add a replica; a server already present is replaced
    pub fn add_server(&mut self, server: Arc<QueryableServer>) {
        self.remove_server(server.name());
        let replicas = self.tiers.entry(server.metadata().priority).or_default();
        replicas.push(server);
        replicas.sort_by(|a, b| a.name().cmp(b.name()));
    }

    /// Remove a replica by server name
    pub fn remove_server(&mut self, name: &str) -> bool {
        let mut removed = false;
        self.tiers.retain(|_, replicas| {
            let before = replicas.len();
            replicas.retain(|s| s.name() != name);
            removed |= replicas.len() != before;
            !replicas.is_empty()
        });
        removed
    }

    pub fn has_server(&self, name: &str) -> bool {
        self.tiers
            .values()
            .any(|replicas| replicas.iter().any(|s| s.name() == name))
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    /// Every replica, in tier preference order
    pub fn candidates(&self, tier_strategy: &TierSelectorStrategy) -> Vec<Arc<QueryableServer>> {
        tier_strategy
            .rank(self.tiers.keys().copied().collect())
            .into_iter()
            .filter_map(|p| self.tiers.get(&p))
            .flat_map(|replicas| replicas.iter().cloned())
            .collect()
    }

    /// Pick the server to query, or `None` if no server holds the segment
    pub fn pick(&self, strategy: &SelectionStrategy) -> Option<Arc<QueryableServer>> {
        let tier = strategy.tier.rank(self.tiers.keys().copied().collect()).into_iter().next()?;
        let replicas = self.tiers.get(&tier)?;

        let picked = match strategy.balancer {
            BalancerStrategy::Random => replicas.choose(&mut rand::thread_rng()),
            BalancerStrategy::ConnectionCount => replicas.iter().min_by_key(|s| s.in_flight()),
            BalancerStrategy::ConsistentHash => replicas
                .iter()
                .max_by_key(|s| rendezvous_hash(&self.segment, s.name())),
        };
        picked.cloned()
    }
}
