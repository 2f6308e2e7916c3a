//! Structured logging setup, grounded on the teacher's `logger.rs` `Logger`
//! abstraction but backed by `tracing`/`tracing-subscriber` directly: the
//! per-language logging SDK bindings are an out-of-scope external
//! collaborator (spec §1), but the crate's own internal logging still needs
//! to be structured, leveled, and attributable to a `workflow_uuid`.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Initialize the global tracing subscriber for a binary named `component`.
///
/// Honors `RUST_LOG` if set, otherwise defaults to `info`. JSON output is used
/// so log lines are machine-parseable by the log aggregator, matching the
/// original source's `init_logger(component, config)` convention.
pub fn init_logger(component: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer().json().with_target(true).with_current_span(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .ok();

    tracing::info!(component, "logger initialized");
}
