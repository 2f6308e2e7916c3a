//! Pod status/conditions suppression cache (§4.7.6): `LRUCacheTTL(capacity,
//! minutes)`. A cache hit within the TTL suppresses the outbound
//! `update_pod`/`pod_conditions` message; `ttl == 0` disables expiry
//! entirely (every observation is sent).
//!
//! Grounded on `models::node::NodeCache`'s observe-and-compare shape,
//! generalized to an arbitrary hashable key and given real LRU eviction
//! since this cache is sized by entry count, not by one entry per node.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    recorded_at: Instant,
}

/// Bounded least-recently-observed cache with an optional TTL. `observe`
/// records `value` for `key` and returns whether the caller should emit a
/// message: `true` if this is a new key, the value changed, or the prior
/// entry expired.
pub struct LruCacheTtl<K, V> {
    capacity: usize,
    ttl: Option<Duration>,
    entries: HashMap<K, Entry<V>>,
    /// Recency order, most-recently-touched last.
    order: Vec<K>,
}

impl<K, V> LruCacheTtl<K, V>
where
    K: Eq + Hash + Clone,
    V: PartialEq,
{
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        LruCacheTtl {
            capacity,
            ttl: if ttl.is_zero() { None } else { Some(ttl) },
            entries: HashMap::new(),
            order: Vec::new(),
        }
    }

    fn touch(&mut self, key: &K) {
        self.order.retain(|k| k != key);
        self.order.push(key.clone());
    }

    fn evict_if_needed(&mut self) {
        while self.capacity > 0 && self.entries.len() > self.capacity {
            if self.order.is_empty() {
                break;
            }
            let oldest = self.order.remove(0);
            self.entries.remove(&oldest);
        }
    }

    pub fn observe(&mut self, key: K, value: V) -> bool {
        let now = Instant::now();
        let should_emit = match self.entries.get(&key) {
            Some(entry) => {
                let expired = self.ttl.is_some_and(|ttl| now.duration_since(entry.recorded_at) >= ttl);
                expired || entry.value != value
            }
            None => true,
        };
        self.entries.insert(key.clone(), Entry { value, recorded_at: now });
        self.touch(&key);
        self.evict_if_needed();
        should_emit
    }
}

/// The pod-status suppression key (§4.7.6): `(workflow_uuid, task_uuid,
/// retry_id, status_value)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PodStatusKey {
    pub workflow_uuid: String,
    pub task_uuid: String,
    pub retry_id: u32,
    pub status: String,
}

/// The pod-conditions suppression key: `(task_uuid, conditions)` — the
/// condition tuple is carried as the cached *value*, not the key, since
/// conditions change is exactly what must be detected.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PodConditionsKey {
    pub task_uuid: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_key_is_always_emitted() {
        let mut cache: LruCacheTtl<&str, u32> = LruCacheTtl::new(8, Duration::from_secs(60));
        assert!(cache.observe("a", 1));
    }

    #[test]
    fn unchanged_value_within_ttl_is_suppressed() {
        let mut cache: LruCacheTtl<&str, u32> = LruCacheTtl::new(8, Duration::from_secs(60));
        cache.observe("a", 1);
        assert!(!cache.observe("a", 1));
    }

    #[test]
    fn changed_value_is_always_emitted() {
        let mut cache: LruCacheTtl<&str, u32> = LruCacheTtl::new(8, Duration::from_secs(60));
        cache.observe("a", 1);
        assert!(cache.observe("a", 2));
    }

    #[test]
    fn zero_ttl_disables_suppression() {
        let mut cache: LruCacheTtl<&str, u32> = LruCacheTtl::new(8, Duration::ZERO);
        cache.observe("a", 1);
        assert!(cache.observe("a", 1));
    }

    #[test]
    fn capacity_evicts_the_least_recently_touched_entry() {
        let mut cache: LruCacheTtl<&str, u32> = LruCacheTtl::new(2, Duration::from_secs(60));
        cache.observe("a", 1);
        cache.observe("b", 1);
        cache.observe("a", 2); // touches "a" again, "b" is now least-recent
        cache.observe("c", 1); // evicts "b"
        // "b" was evicted, so re-observing the same value is treated as new.
        assert!(cache.observe("b", 1));
    }

    #[test]
    fn pod_status_key_distinguishes_by_full_tuple() {
        let mut cache: LruCacheTtl<PodStatusKey, ()> = LruCacheTtl::new(16, Duration::from_secs(60));
        let key_a = PodStatusKey {
            workflow_uuid: "wf-1".into(),
            task_uuid: "t-1".into(),
            retry_id: 0,
            status: "RUNNING".into(),
        };
        let key_b = PodStatusKey { retry_id: 1, ..key_a.clone() };
        assert!(cache.observe(key_a, ()));
        assert!(cache.observe(key_b, ()));
    }
}
