//! Environment-driven configuration, per SPEC_FULL §4.16.
//!
//! Grounded on the original source's `pydantic.BaseSettings`-style config
//! objects (`ExecutorParameters`, `DelayedJobMonitorConfig`,
//! `MessageWorkerConfig`) and the teacher's plain struct + `std::env::var`
//! pattern (see `services::kube_client` construction helpers).

pub mod store;

use std::time::Duration;

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_var(name).and_then(|v| v.parse().ok())
}

pub const MAX_MULTIPLIER: u32 = 8;
pub const DEFAULT_NUM_THREADS: u32 = 20;
pub const DEFAULT_LOG_QUEUE_SIZE: u32 = 10_000;

/// Overridable via `OSMO_EXECUTOR_*` environment variables.
#[derive(Debug, Clone)]
pub struct ExecutorParameters {
    pub num_processes: Option<u32>,
    pub num_threads: Option<u32>,
    pub num_threads_inflight_multiplier: u32,
    pub chunk_queue_size_multiplier: u32,
    pub log_queue_size: u32,
}

impl Default for ExecutorParameters {
    fn default() -> Self {
        ExecutorParameters {
            num_processes: None,
            num_threads: None,
            num_threads_inflight_multiplier: 4,
            chunk_queue_size_multiplier: 4,
            log_queue_size: DEFAULT_LOG_QUEUE_SIZE,
        }
    }
}

impl ExecutorParameters {
    pub fn from_env() -> Self {
        let defaults = ExecutorParameters::default();
        ExecutorParameters {
            num_processes: env_parsed("OSMO_EXECUTOR_NUM_PROCESSES").or(defaults.num_processes),
            num_threads: env_parsed("OSMO_EXECUTOR_NUM_THREADS").or(defaults.num_threads),
            num_threads_inflight_multiplier: env_parsed("OSMO_EXECUTOR_NUM_THREADS_INFLIGHT_MULTIPLIER")
                .unwrap_or(defaults.num_threads_inflight_multiplier),
            chunk_queue_size_multiplier: env_parsed("OSMO_EXECUTOR_CHUNK_QUEUE_SIZE_MULTIPLIER")
                .unwrap_or(defaults.chunk_queue_size_multiplier),
            log_queue_size: env_parsed("OSMO_EXECUTOR_LOG_QUEUE_SIZE").unwrap_or(defaults.log_queue_size),
        }
    }

    /// Validates multipliers do not exceed `MAX_MULTIPLIER`, matching the
    /// original source's pydantic validator.
    pub fn validate(&self) -> Result<(), String> {
        if self.num_threads_inflight_multiplier > MAX_MULTIPLIER
            || self.chunk_queue_size_multiplier > MAX_MULTIPLIER
        {
            return Err("multiplier too large; will exhaust system resources".to_string());
        }
        Ok(())
    }
}

/// Tunables for C14's progress tracker and flush cadence.
#[derive(Debug, Clone)]
pub struct ProgressConfig {
    pub flush_interval: Duration,
    pub min_update_interval: Duration,
    pub iter_frequency: Duration,
    pub disable_task_metrics: bool,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        ProgressConfig {
            flush_interval: Duration::from_secs(1),
            min_update_interval: Duration::from_millis(250),
            iter_frequency: Duration::from_secs(15),
            disable_task_metrics: false,
        }
    }
}

impl ProgressConfig {
    pub fn from_env() -> Self {
        let defaults = ProgressConfig::default();
        ProgressConfig {
            flush_interval: env_parsed::<u64>("OSMO_PROGRESS_FLUSH_INTERVAL")
                .map(Duration::from_millis)
                .unwrap_or(defaults.flush_interval),
            min_update_interval: env_parsed::<u64>("OSMO_PROGRESS_MIN_UPDATE_INTERVAL")
                .map(Duration::from_millis)
                .unwrap_or(defaults.min_update_interval),
            iter_frequency: env_parsed::<u64>("OSMO_PROGRESS_ITER_FREQUENCY")
                .map(Duration::from_secs)
                .unwrap_or(defaults.iter_frequency),
            disable_task_metrics: env_var("OSMO_DISABLE_TASK_METRICS").is_some(),
        }
    }
}

/// Connection settings for the relational store (Postgres) and key/value
/// store (Redis), plus job-processing tunables not covered above.
#[derive(Debug, Clone)]
pub struct OsmoConfig {
    pub executor: ExecutorParameters,
    pub progress: ProgressConfig,
    pub database_url: String,
    pub redis_url: String,
}

impl OsmoConfig {
    pub fn from_env() -> Self {
        OsmoConfig {
            executor: ExecutorParameters::from_env(),
            progress: ProgressConfig::from_env(),
            database_url: env_var("OSMO_DATABASE_URL")
                .unwrap_or_else(|| "postgres://localhost/osmo".to_string()),
            redis_url: env_var("OSMO_REDIS_URL").unwrap_or_else(|| "redis://localhost".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_match_spec_values() {
        let progress = ProgressConfig::default();
        assert_eq!(progress.flush_interval, Duration::from_secs(1));
        assert_eq!(progress.min_update_interval, Duration::from_millis(250));
        assert_eq!(progress.iter_frequency, Duration::from_secs(15));
    }

    #[test]
    fn executor_params_reject_oversized_multiplier() {
        let mut params = ExecutorParameters::default();
        params.num_threads_inflight_multiplier = 9;
        assert!(params.validate().is_err());
    }

    #[test]
    fn env_override_applies_to_executor_threads() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("OSMO_EXECUTOR_NUM_THREADS", "7");
        let params = ExecutorParameters::from_env();
        std::env::remove_var("OSMO_EXECUTOR_NUM_THREADS");
        assert_eq!(params.num_threads, Some(7));
    }
}
