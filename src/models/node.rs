//! `NodeCacheItem`, per spec §3: suppresses unchanged node events for up to
//! a configurable TTL.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
pub struct NodeConditionSnapshot {
    pub condition_type: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeCacheItem {
    pub available: bool,
    pub allocatable: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub taints: Vec<String>,
    pub conditions: Vec<NodeConditionSnapshot>,
}

#[derive(Debug)]
struct Entry {
    item: NodeCacheItem,
    recorded_at: Instant,
}

/// Per-node suppression cache: skip emitting a `resource` message when the
/// node's observable state is unchanged and the prior entry is still within
/// `ttl`.
#[derive(Debug, Default)]
pub struct NodeCache {
    entries: std::collections::HashMap<String, Entry>,
    ttl: Option<Duration>,
}

impl NodeCache {
    pub fn new(ttl: Duration) -> Self {
        NodeCache {
            entries: std::collections::HashMap::new(),
            ttl: Some(ttl),
        }
    }

    /// Records `item` for `hostname` and returns `true` if it should be sent
    /// (i.e. it differs from the cached value, or the cached value has
    /// expired).
    pub fn observe(&mut self, hostname: &str, item: NodeCacheItem) -> bool {
        let now = Instant::now();
        let should_send = match self.entries.get(hostname) {
            Some(entry) => {
                let expired = self.ttl.is_some_and(|ttl| now.duration_since(entry.recorded_at) >= ttl);
                expired || entry.item != item
            }
            None => true,
        };
        self.entries.insert(hostname.to_string(), Entry { item, recorded_at: now });
        should_send
    }
}
