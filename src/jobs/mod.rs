//! Job/queue data model (§3), shared by the frontend job queue (C4/C5) and
//! the backend job queue (C6), plus the delayed-job monitor (C12).
//! Backend-specific job handlers live under `jobs::backend_jobs`; the worker
//! that drains a backend queue and dispatches to them lives under
//! `jobs::worker`.
//!
//! Grounded on spec §4.5/§4.6 and the original source's `delayed_job_monitor.py`.

pub mod backend_jobs;
pub mod delayed_monitor;
pub mod worker;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::store::KeyValueStore;
use crate::errors::OsmoResult;
use crate::metrics;

pub const DELAYED_JOB_QUEUE_KEY: &str = "osmo:delayed_jobs";
const DEDUPE_TTL: Duration = Duration::from_secs(5 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuperType {
    Frontend,
    Backend,
}

/// What's actually pushed onto a job-type's list: the identity fields plus
/// the job-specific payload, so a worker popping the list can recover both.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct JobEnvelope {
    super_type: SuperType,
    job_type: String,
    job_id: String,
    job_uuid: String,
    payload: serde_json::Value,
}

/// Base job identity: `job_id` dedupes intended effect, `job_uuid` identifies
/// one specific attempt.
#[derive(Debug, Clone)]
pub struct JobIdentity {
    pub super_type: SuperType,
    pub job_type: String,
    pub job_id: String,
    pub job_uuid: String,
}

impl JobIdentity {
    pub fn new(super_type: SuperType, job_type: impl Into<String>, job_id: impl Into<String>) -> Self {
        JobIdentity {
            super_type,
            job_type: job_type.into(),
            job_id: job_id.into(),
            job_uuid: Uuid::new_v4().to_string(),
        }
    }

    fn dedupe_key(&self) -> String {
        format!("dedupe:{}", self.job_id)
    }

    fn retry_key(&self) -> String {
        format!("retry:{}", self.job_id)
    }
}

/// Adds `workflow_uuid`; every log line produced during execution of a
/// `WorkflowJob` carries this field (see `crate::logger::workflow_span`).
#[derive(Debug, Clone)]
pub struct WorkflowJob {
    pub identity: JobIdentity,
    pub workflow_uuid: String,
    pub payload: serde_json::Value,
}

/// `BackendWorkflowJob` additionally carries the routing `backend` name.
#[derive(Debug, Clone)]
pub struct BackendWorkflowJob {
    pub job: WorkflowJob,
    pub backend: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobResultStatus {
    Success,
    FailedRetry,
    FailedNoRetry,
}

#[derive(Debug, Clone)]
pub struct JobResult {
    pub status: JobResultStatus,
    pub message: Option<String>,
}

impl JobResult {
    pub fn success() -> Self {
        JobResult { status: JobResultStatus::Success, message: None }
    }

    pub fn failed_retry(message: impl Into<String>) -> Self {
        JobResult { status: JobResultStatus::FailedRetry, message: Some(message.into()) }
    }

    pub fn failed_no_retry(message: impl Into<String>) -> Self {
        JobResult { status: JobResultStatus::FailedNoRetry, message: Some(message.into()) }
    }

    /// Only `FAILED_RETRY` causes the queue to requeue the message.
    pub fn should_requeue(&self) -> bool {
        self.status == JobResultStatus::FailedRetry
    }
}

/// Durable FIFO job queue with per-job deduplication, per-job retry counter,
/// and a separate delayed-job sorted set. `namespace` partitions the queue —
/// empty for the frontend queue, `backend:{name}` for a backend queue (C6).
pub struct JobQueue<'a> {
    store: &'a dyn KeyValueStore,
    namespace: String,
    max_retry_per_job: u32,
}

impl<'a> JobQueue<'a> {
    pub fn frontend(store: &'a dyn KeyValueStore, max_retry_per_job: u32) -> Self {
        JobQueue { store, namespace: String::new(), max_retry_per_job }
    }

    pub fn backend(store: &'a dyn KeyValueStore, backend: &str, max_retry_per_job: u32) -> Self {
        JobQueue { store, namespace: format!("backend:{backend}"), max_retry_per_job }
    }

    fn routing_key(&self, job_type: &str) -> String {
        if self.namespace.is_empty() {
            format!("queue:{job_type}")
        } else {
            format!("queue:{}:{job_type}", self.namespace)
        }
    }

    /// Publishes a job onto its job-type's queue unless `job_id` is already a
    /// known duplicate. Mirrors the original's `send_job_to_queue`: the
    /// dedupe check is a plain read against the dedupe key, the publish is an
    /// unconditional append to the queue (so every non-duplicate enqueue of
    /// the same `job_type` actually lands its own entry), and only after a
    /// successful publish is the dedupe key reserved with its TTL. Returns
    /// `true` if the job was actually enqueued.
    pub fn enqueue(&self, identity: &JobIdentity, payload: &str) -> OsmoResult<bool> {
        if self.store.get(&identity.dedupe_key())?.is_some() {
            return Ok(false);
        }

        let envelope = JobEnvelope {
            super_type: identity.super_type,
            job_type: identity.job_type.clone(),
            job_id: identity.job_id.clone(),
            job_uuid: identity.job_uuid.clone(),
            payload: serde_json::from_str(payload)?,
        };
        self.store.list_push(&self.routing_key(&identity.job_type), &serde_json::to_string(&envelope)?)?;
        self.store.set_nx(&identity.dedupe_key(), &identity.job_uuid, Some(DEDUPE_TTL))?;
        Ok(true)
    }

    /// Pops the next job of `job_type` off its queue, recovering the
    /// identity and payload a worker needs to dispatch it (C5/C6).
    pub fn dequeue(&self, job_type: &str) -> OsmoResult<Option<(JobIdentity, serde_json::Value)>> {
        let Some(raw) = self.store.list_pop(&self.routing_key(job_type))? else { return Ok(None) };
        let envelope: JobEnvelope = serde_json::from_str(&raw)?;
        let identity = JobIdentity {
            super_type: envelope.super_type,
            job_type: envelope.job_type,
            job_id: envelope.job_id,
            job_uuid: envelope.job_uuid,
        };
        Ok(Some((identity, envelope.payload)))
    }

    /// Re-appends a job already past the dedupe check (a `FAILED_RETRY`
    /// result) back onto its queue, without touching the dedupe key.
    pub fn requeue(&self, identity: &JobIdentity, payload: serde_json::Value) -> OsmoResult<()> {
        let envelope = JobEnvelope {
            super_type: identity.super_type,
            job_type: identity.job_type.clone(),
            job_id: identity.job_id.clone(),
            job_uuid: identity.job_uuid.clone(),
            payload,
        };
        self.store.list_push(&self.routing_key(&identity.job_type), &serde_json::to_string(&envelope)?)
    }

    /// Resolves whether the current attempt is the winning one for its
    /// `job_id`: writes `job_id -> job_uuid` only if absent, then reads back
    /// the winner. A mismatch means this attempt is a duplicate.
    pub fn is_winning_attempt(&self, identity: &JobIdentity) -> OsmoResult<bool> {
        let key = identity.dedupe_key();
        self.store.set_nx(&key, &identity.job_uuid, Some(DEDUPE_TTL))?;
        let winner = self.store.get(&key)?;
        Ok(winner.as_deref() == Some(identity.job_uuid.as_str()))
    }

    /// Increments the retry counter; returns `Err` semantics are left to the
    /// caller (spec: exceeding `max_retry_per_job` fails with `FAILED_NO_RETRY`).
    pub fn record_attempt(&self, identity: &JobIdentity) -> OsmoResult<u32> {
        let count = self.store.incr(&identity.retry_key())? as u32;
        Ok(count)
    }

    pub fn retry_limit_exceeded(&self, attempt_count: u32) -> bool {
        attempt_count > self.max_retry_per_job
    }

    pub fn clear_retry_counter(&self, identity: &JobIdentity) -> OsmoResult<()> {
        self.store.delete(&identity.retry_key())
    }

    /// Applies the result policy from spec §4.5: ack unless `FAILED_RETRY`.
    pub fn apply_result(&self, identity: &JobIdentity, result: &JobResult) -> OsmoResult<()> {
        metrics::send_counter(
            "osmo_job_result_count",
            1,
            &[("job_type", identity.job_type.as_str()), ("status", result_tag(result.status))],
        );
        if result.status == JobResultStatus::Success {
            self.clear_retry_counter(identity)?;
        }
        Ok(())
    }

    pub fn schedule_delayed(&self, serialized_job: &str, release_at: SystemTime) -> OsmoResult<()> {
        let score = release_at.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64();
        self.store.zadd(DELAYED_JOB_QUEUE_KEY, serialized_job, score)
    }
}

fn result_tag(status: JobResultStatus) -> &'static str {
    match status {
        JobResultStatus::Success => "success",
        JobResultStatus::FailedRetry => "failed_retry",
        JobResultStatus::FailedNoRetry => "failed_no_retry",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::store::InMemoryKeyValueStore;

    #[test]
    fn enqueue_skips_when_dedupe_key_already_reserved() {
        let store = InMemoryKeyValueStore::new();
        let queue = JobQueue::frontend(&store, 3);
        let identity = JobIdentity::new(SuperType::Frontend, "create_group", "job-1");
        assert!(queue.enqueue(&identity, "{}").unwrap());
        let second_attempt = JobIdentity { job_uuid: Uuid::new_v4().to_string(), ..identity.clone() };
        assert!(!queue.enqueue(&second_attempt, "{}").unwrap());
    }

    #[test]
    fn enqueue_publishes_every_distinct_job_of_the_same_type() {
        let store = InMemoryKeyValueStore::new();
        let queue = JobQueue::frontend(&store, 3);
        let first = JobIdentity::new(SuperType::Frontend, "create_group", "job-1");
        let second = JobIdentity::new(SuperType::Frontend, "create_group", "job-2");
        assert!(queue.enqueue(&first, r#"{"n":1}"#).unwrap());
        assert!(queue.enqueue(&second, r#"{"n":2}"#).unwrap());

        let (identity, payload) = queue.dequeue("create_group").unwrap().unwrap();
        assert_eq!(identity.job_id, "job-1");
        assert_eq!(payload, serde_json::json!({"n": 1}));
        let (identity, payload) = queue.dequeue("create_group").unwrap().unwrap();
        assert_eq!(identity.job_id, "job-2");
        assert_eq!(payload, serde_json::json!({"n": 2}));
        assert!(queue.dequeue("create_group").unwrap().is_none());
    }

    #[test]
    fn requeue_reappends_without_touching_the_dedupe_key() {
        let store = InMemoryKeyValueStore::new();
        let queue = JobQueue::frontend(&store, 3);
        let identity = JobIdentity::new(SuperType::Frontend, "create_group", "job-1");
        assert!(queue.enqueue(&identity, "{}").unwrap());
        let (identity, payload) = queue.dequeue("create_group").unwrap().unwrap();

        queue.requeue(&identity, payload).unwrap();
        let (requeued, _) = queue.dequeue("create_group").unwrap().unwrap();
        assert_eq!(requeued.job_id, "job-1");

        let retry = JobIdentity { job_uuid: Uuid::new_v4().to_string(), ..identity };
        assert!(!queue.enqueue(&retry, "{}").unwrap());
    }

    #[test]
    fn duplicate_attempt_is_detected_via_winning_uuid_mismatch() {
        let store = InMemoryKeyValueStore::new();
        let queue = JobQueue::frontend(&store, 3);
        let identity = JobIdentity::new(SuperType::Frontend, "create_group", "job-1");
        assert!(queue.is_winning_attempt(&identity).unwrap());
        let duplicate = JobIdentity { job_uuid: Uuid::new_v4().to_string(), ..identity.clone() };
        assert!(!queue.is_winning_attempt(&duplicate).unwrap());
    }

    #[test]
    fn retry_limit_is_exceeded_past_max_retry_per_job() {
        let store = InMemoryKeyValueStore::new();
        let queue = JobQueue::frontend(&store, 2);
        let identity = JobIdentity::new(SuperType::Frontend, "create_group", "job-1");
        assert_eq!(queue.record_attempt(&identity).unwrap(), 1);
        assert_eq!(queue.record_attempt(&identity).unwrap(), 2);
        assert!(!queue.retry_limit_exceeded(2));
        assert_eq!(queue.record_attempt(&identity).unwrap(), 3);
        assert!(queue.retry_limit_exceeded(3));
    }

    #[test]
    fn backend_queue_is_namespaced_per_backend() {
        let store = InMemoryKeyValueStore::new();
        let queue_a = JobQueue::backend(&store, "cluster-a", 3);
        let queue_b = JobQueue::backend(&store, "cluster-b", 3);
        assert_ne!(queue_a.routing_key("create_group"), queue_b.routing_key("create_group"));
    }

    #[test]
    fn job_result_requeues_only_on_failed_retry() {
        assert!(JobResult::failed_retry("transient").should_requeue());
        assert!(!JobResult::failed_no_retry("bad input").should_requeue());
        assert!(!JobResult::success().should_requeue());
    }
}
