//! Progress tracker (C14): byte-denominated progress reporting for the
//! executor, with three backends behind one interface.
//!
//! Grounded on spec §4.13: no-op, single-thread, multi-thread (same state,
//! mutex-guarded), and multi-process (batches updates and flushes a snapshot
//! to a channel every `flush_interval`, drained by a dedicated thread in the
//! parent process).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub bytes_done: u64,
    pub bytes_total: u64,
}

pub trait ProgressTracker: Send + Sync {
    fn advance(&self, bytes: u64);
    fn set_total(&self, total: u64);
    fn snapshot(&self) -> ProgressSnapshot;
}

/// Discards all updates; used when progress reporting is disabled.
#[derive(Default)]
pub struct NoOpTracker;

impl ProgressTracker for NoOpTracker {
    fn advance(&self, _bytes: u64) {}
    fn set_total(&self, _total: u64) {}
    fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot::default()
    }
}

/// Single-thread tracker: plain atomics, no lock needed since only one
/// thread ever calls `advance`.
#[derive(Default)]
pub struct SingleThreadTracker {
    bytes_done: AtomicU64,
    bytes_total: AtomicU64,
}

impl ProgressTracker for SingleThreadTracker {
    fn advance(&self, bytes: u64) {
        self.bytes_done.fetch_add(bytes, Ordering::Relaxed);
    }
    fn set_total(&self, total: u64) {
        self.bytes_total.store(total, Ordering::Relaxed);
    }
    fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            bytes_done: self.bytes_done.load(Ordering::Relaxed),
            bytes_total: self.bytes_total.load(Ordering::Relaxed),
        }
    }
}

/// Multi-thread tracker: same state as `SingleThreadTracker`, guarded by a
/// mutex so concurrent worker threads can call `advance` safely.
#[derive(Default)]
pub struct MultiThreadTracker {
    state: Mutex<ProgressSnapshot>,
}

impl ProgressTracker for MultiThreadTracker {
    fn advance(&self, bytes: u64) {
        self.state.lock().unwrap().bytes_done += bytes;
    }
    fn set_total(&self, total: u64) {
        self.state.lock().unwrap().bytes_total = total;
    }
    fn snapshot(&self) -> ProgressSnapshot {
        *self.state.lock().unwrap()
    }
}

/// Multi-process tracker: aggregates in-process updates locally and pushes a
/// snapshot onto an mpsc channel every `flush_interval`, drained by a
/// dedicated thread in the parent process (e.g. to render a TTY progress
/// bar or periodic textual updates).
pub struct MultiProcessTracker {
    local: Arc<MultiThreadTracker>,
}

impl MultiProcessTracker {
    pub fn new(flush_interval: Duration) -> (Self, mpsc::UnboundedReceiver<ProgressSnapshot>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let local = Arc::new(MultiThreadTracker::default());
        let tracker = MultiProcessTracker { local: local.clone() };
        spawn_flusher(local, sender, flush_interval);
        (tracker, receiver)
    }
}

fn spawn_flusher(
    local: Arc<MultiThreadTracker>,
    sender: mpsc::UnboundedSender<ProgressSnapshot>,
    flush_interval: Duration,
) {
    std::thread::spawn(move || {
        let mut last = ProgressSnapshot::default();
        loop {
            std::thread::sleep(flush_interval);
            let current = local.snapshot();
            if current == last {
                continue;
            }
            last = current;
            if sender.send(current).is_err() {
                return;
            }
        }
    });
}

impl ProgressTracker for MultiProcessTracker {
    fn advance(&self, bytes: u64) {
        self.local.advance(bytes);
    }
    fn set_total(&self, total: u64) {
        self.local.set_total(total);
    }
    fn snapshot(&self) -> ProgressSnapshot {
        self.local.snapshot()
    }
}

/// Renders either an interactive TTY progress bar or periodic textual
/// updates, whichever fits the current stream.
pub fn render_line(snapshot: ProgressSnapshot, is_tty: bool) -> String {
    if snapshot.bytes_total == 0 {
        return format!("{} bytes", snapshot.bytes_done);
    }
    let pct = (snapshot.bytes_done as f64 / snapshot.bytes_total as f64 * 100.0).min(100.0);
    if is_tty {
        let filled = (pct / 5.0) as usize;
        format!("[{}{}] {:.1}%", "#".repeat(filled), "-".repeat(20 - filled), pct)
    } else {
        format!("{}/{} bytes ({:.1}%)", snapshot.bytes_done, snapshot.bytes_total, pct)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_tracker_reports_zero() {
        let tracker = NoOpTracker;
        tracker.advance(100);
        tracker.set_total(200);
        assert_eq!(tracker.snapshot(), ProgressSnapshot::default());
    }

    #[test]
    fn single_thread_tracker_accumulates() {
        let tracker = SingleThreadTracker::default();
        tracker.set_total(100);
        tracker.advance(30);
        tracker.advance(20);
        let snap = tracker.snapshot();
        assert_eq!(snap.bytes_done, 50);
        assert_eq!(snap.bytes_total, 100);
    }

    #[test]
    fn multi_thread_tracker_is_safe_across_threads() {
        let tracker = Arc::new(MultiThreadTracker::default());
        tracker.set_total(1000);
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        tracker.advance(1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(tracker.snapshot().bytes_done, 1000);
    }

    #[test]
    fn render_line_formats_non_tty_with_percentage() {
        let snapshot = ProgressSnapshot { bytes_done: 50, bytes_total: 200 };
        assert_eq!(render_line(snapshot, false), "50/200 bytes (25.0%)");
    }

    #[test]
    fn render_line_handles_zero_total() {
        let snapshot = ProgressSnapshot { bytes_done: 10, bytes_total: 0 };
        assert_eq!(render_line(snapshot, false), "10 bytes");
    }

    #[tokio::test]
    async fn multi_process_tracker_flushes_snapshots() {
        let (tracker, mut receiver) = MultiProcessTracker::new(Duration::from_millis(20));
        tracker.set_total(10);
        tracker.advance(10);
        let snapshot = tokio::time::timeout(Duration::from_secs(1), receiver.recv())
            .await
            .expect("flusher should emit within timeout")
            .expect("channel should stay open");
        assert_eq!(snapshot.bytes_done, 10);
    }
}
