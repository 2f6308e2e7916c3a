//! Delayed-job monitor (C12, §4.12): periodically promotes jobs whose
//! release time has passed from the delayed sorted set onto the live queue.
//!
//! Grounded on the original source's `delayed_job_monitor.py` poll loop and
//! on this crate's `ProgressWriter` liveness pattern (C1).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::store::KeyValueStore;
use crate::errors::OsmoResult;
use crate::jobs::DELAYED_JOB_QUEUE_KEY;
use crate::progress::ProgressWriter;

/// One sweep: moves every delayed job whose score is `<= now` onto
/// `release_key` (the serialized job is pushed verbatim — it was captured at
/// schedule time by `JobQueue::schedule_delayed`), then removes it from the
/// delayed set. Returns the number of jobs released.
pub fn release_ready_jobs(store: &dyn KeyValueStore, now: SystemTime, release: &mut dyn FnMut(&str) -> OsmoResult<()>) -> OsmoResult<usize> {
    let now_score = now.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64();
    let ready = store.zrangebyscore(DELAYED_JOB_QUEUE_KEY, now_score)?;
    for job in &ready {
        release(job)?;
        store.zrem(DELAYED_JOB_QUEUE_KEY, job)?;
    }
    Ok(ready.len())
}

/// Polls `release_ready_jobs` every `poll_interval`, touching `progress`
/// after each sweep so an external liveness check can detect a stuck loop.
/// Runs until `shutdown` resolves.
pub async fn run(
    store: &dyn KeyValueStore,
    progress: &ProgressWriter,
    poll_interval: Duration,
    release: &mut dyn FnMut(&str) -> OsmoResult<()>,
    mut shutdown: tokio::sync::oneshot::Receiver<()>,
) -> OsmoResult<()> {
    loop {
        let released = release_ready_jobs(store, SystemTime::now(), release)?;
        if released > 0 {
            debug!(released, "delayed-job monitor released jobs onto live queue");
        }
        progress.touch()?;

        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = &mut shutdown => return Ok(()),
        }
    }
}
