//! Event-watch dedup and kai-scheduler preemption parsing (§4.7.3).

use once_cell::sync::Lazy;
use regex::Regex;

use crate::agent::listener::pod_cache::LruCacheTtl;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub event_type: String,
    pub reason: String,
    pub involved_object_name: String,
}

/// Bounded LRU keyed on `(type, reason, involved_object_name)`, valued on
/// the event's last-timestamp string: a repeat of the same timestamp for the
/// same key is a duplicate delivery and is suppressed.
pub struct EventDedup {
    seen: LruCacheTtl<EventKey, String>,
}

impl EventDedup {
    pub fn new(capacity: usize) -> Self {
        EventDedup { seen: LruCacheTtl::new(capacity, std::time::Duration::ZERO) }
    }

    /// Returns `true` if this `(key, last_timestamp)` pair has not been seen
    /// before and should be emitted as a `pod_event`.
    pub fn observe(&mut self, key: EventKey, last_timestamp: &str) -> bool {
        self.seen.observe(key, last_timestamp.to_string())
    }
}

static PREEMPTED_BY_KAI: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Pod\s+\S+/([^\s]+)\s+was preempted").expect("valid regex"));

/// Extracts the preempted pod's name from a kai-scheduler
/// `PodGroup/Evict` event message, if the message matches the documented
/// shape.
pub fn parse_kai_preempted_pod(message: &str) -> Option<&str> {
    PREEMPTED_BY_KAI.captures(message).and_then(|c| c.get(1)).map(|m| m.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_key_and_timestamp_is_deduplicated() {
        let mut dedup = EventDedup::new(16);
        let key = EventKey { event_type: "Warning".into(), reason: "Evicted".into(), involved_object_name: "pod-a".into() };
        assert!(dedup.observe(key.clone(), "t1"));
        assert!(!dedup.observe(key, "t1"));
    }

    #[test]
    fn same_key_with_new_timestamp_is_not_deduplicated() {
        let mut dedup = EventDedup::new(16);
        let key = EventKey { event_type: "Warning".into(), reason: "Evicted".into(), involved_object_name: "pod-a".into() };
        assert!(dedup.observe(key.clone(), "t1"));
        assert!(dedup.observe(key, "t2"));
    }

    #[test]
    fn parses_preempted_pod_name_from_kai_scheduler_message() {
        let message = "Pod default/train-worker-3 was preempted by a higher-priority pod group";
        assert_eq!(parse_kai_preempted_pod(message), Some("train-worker-3"));
    }

    #[test]
    fn non_matching_message_returns_none() {
        assert_eq!(parse_kai_preempted_pod("Successfully assigned default/train-worker-3 to node-a"), None);
    }
}
