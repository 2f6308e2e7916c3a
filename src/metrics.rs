//! In-process metrics registry.
//!
//! Grounded on the teacher's `metrics_registry::MetricsRegistry` trait
//! (start/stop record handles, `Clone`-able trait object registered once per
//! process), simplified from step-duration tracking to the counter/histogram
//! primitives OSMO's job workers and operator message worker need
//! (`osmo_backend_event_count`, `osmo_backend_event_processing_time`, retry
//! histograms). A full OpenTelemetry exporter is the per-language metrics SDK
//! binding named out of scope in spec §1; this registry is the internal
//! instrumentation point such a binding would later drain.

use std::collections::HashMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;

#[derive(Debug, Default, Clone)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum: f64,
}

#[derive(Default)]
struct Registry {
    counters: HashMap<String, u64>,
    histograms: HashMap<String, HistogramSnapshot>,
}

static REGISTRY: Lazy<Mutex<Registry>> = Lazy::new(|| Mutex::new(Registry::default()));

fn key(name: &str, tags: &[(&str, &str)]) -> String {
    if tags.is_empty() {
        return name.to_string();
    }
    let mut tag_str = tags.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>();
    tag_str.sort();
    format!("{name}{{{}}}", tag_str.join(","))
}

/// Increment a named counter by `value`, tagged by an arbitrary key/value set.
pub fn send_counter(name: &str, value: u64, tags: &[(&str, &str)]) {
    let mut registry = REGISTRY.lock().unwrap();
    *registry.counters.entry(key(name, tags)).or_insert(0) += value;
}

/// Record an observation into a named histogram.
pub fn send_histogram(name: &str, value: f64, tags: &[(&str, &str)]) {
    let mut registry = REGISTRY.lock().unwrap();
    let entry = registry.histograms.entry(key(name, tags)).or_default();
    entry.count += 1;
    entry.sum += value;
}

pub fn counter_value(name: &str, tags: &[(&str, &str)]) -> u64 {
    REGISTRY.lock().unwrap().counters.get(&key(name, tags)).copied().unwrap_or(0)
}

pub fn histogram_snapshot(name: &str, tags: &[(&str, &str)]) -> HistogramSnapshot {
    REGISTRY
        .lock()
        .unwrap()
        .histograms
        .get(&key(name, tags))
        .cloned()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_accumulates_per_tag_set() {
        send_counter("osmo_backend_event_count", 1, &[("type", "update_pod")]);
        send_counter("osmo_backend_event_count", 2, &[("type", "update_pod")]);
        send_counter("osmo_backend_event_count", 1, &[("type", "resource")]);

        assert_eq!(counter_value("osmo_backend_event_count", &[("type", "update_pod")]), 3);
        assert_eq!(counter_value("osmo_backend_event_count", &[("type", "resource")]), 1);
    }

    #[test]
    fn histogram_tracks_count_and_sum() {
        send_histogram("osmo_backend_event_processing_time", 1.5, &[("type", "node_hash")]);
        send_histogram("osmo_backend_event_processing_time", 2.5, &[("type", "node_hash")]);
        let snap = histogram_snapshot("osmo_backend_event_processing_time", &[("type", "node_hash")]);
        assert_eq!(snap.count, 2);
        assert_eq!(snap.sum, 4.0);
    }
}
