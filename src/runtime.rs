//! Helper for calling into async code from the synchronous parts of the
//! executor and job workers.
//!
//! Grounded on the teacher's `runtime::block_on`, modernized to the current
//! `tokio::runtime::Runtime` builder API (the teacher's `basic_scheduler()` /
//! `max_threads()` calls predate the `tokio` version this crate depends on).

use std::future::Future;
use std::sync::OnceLock;
use tokio::runtime::Runtime;

static BLOCKING_RUNTIME: OnceLock<Runtime> = OnceLock::new();

fn runtime() -> &'static Runtime {
    BLOCKING_RUNTIME.get_or_init(|| {
        tokio::runtime::Builder::new_current_thread()
            .thread_name("osmo-blocking")
            .enable_all()
            .build()
            .expect("failed to build blocking tokio runtime")
    })
}

/// Run an async future to completion from synchronous code (job workers,
/// the executor's worker threads, storage backends).
pub fn block_on<F: Future>(future: F) -> F::Output {
    runtime().block_on(future)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_on_runs_future_to_completion() {
        let result = block_on(async { 1 + 1 });
        assert_eq!(result, 2);
    }
}
