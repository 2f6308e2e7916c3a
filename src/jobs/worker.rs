//! Backend job worker (C6): drains a backend `JobQueue` and dispatches each
//! popped job to the handler registered for its `job_type`.
//!
//! Grounded on `jobs::delayed_monitor::run`'s poll-loop shape (a pure
//! per-sweep function plus a `tokio::select!`-gated sleep/shutdown loop),
//! generalized from "release ready delayed jobs" to "drain and dispatch
//! ready queue entries". Each concrete handler below wraps one
//! `jobs::backend_jobs` job type, closing over the `KubeClient`/
//! `MessageSink`/`ProgressWriter`/`tera::Tera` context its `execute()`
//! needs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::OsmoResult;
use crate::jobs::backend_jobs::{
    BackendSynchronizeBackendTestJob, BackendSynchronizeQueuesJob, CleanupGroupJob, CreateGroupJob, LabelNodeJob,
    RescheduleTaskJob,
};
use crate::jobs::{JobQueue, JobResult};
use crate::k8s::KubeClient;
use crate::messages::MessageSink;
use crate::progress::ProgressWriter;

/// One registered job type's dispatch target. `job_type()` must match the
/// string a `JobIdentity` was constructed with at enqueue time.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> &'static str;
    async fn handle(&self, payload: Value) -> JobResult;
}

/// Lookup table from `job_type` to its `JobHandler`, consulted once per
/// dequeued entry.
#[derive(Default)]
pub struct JobDispatcher {
    handlers: Vec<Arc<dyn JobHandler>>,
}

impl JobDispatcher {
    pub fn new() -> Self {
        JobDispatcher::default()
    }

    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        self.handlers.push(handler);
    }
}

/// One sweep: for every registered job type, drains its queue until empty,
/// dispatching each entry per §4.5's result policy (dedupe via
/// `is_winning_attempt`, retry-count via `record_attempt`/
/// `retry_limit_exceeded`, requeue only on `FAILED_RETRY`). Returns the
/// number of jobs dispatched.
pub async fn drain_once(queue: &JobQueue<'_>, dispatcher: &JobDispatcher) -> OsmoResult<usize> {
    let mut processed = 0usize;
    for handler in &dispatcher.handlers {
        while let Some((identity, payload)) = queue.dequeue(handler.job_type())? {
            if !queue.is_winning_attempt(&identity)? {
                // Another in-flight attempt already owns this job_id; drop ours.
                continue;
            }

            let attempt = queue.record_attempt(&identity)?;
            let result = if queue.retry_limit_exceeded(attempt) {
                JobResult::failed_no_retry(format!("exceeded max retries for job {}", identity.job_id))
            } else {
                handler.handle(payload.clone()).await
            };

            queue.apply_result(&identity, &result)?;
            if result.should_requeue() {
                queue.requeue(&identity, payload)?;
            }
            processed += 1;
        }
    }
    Ok(processed)
}

/// Sweeps `drain_once` every `poll_interval`, touching `progress` after each
/// sweep. Runs until `shutdown` resolves. Mirrors
/// `jobs::delayed_monitor::run`'s loop shape.
pub async fn run(
    queue: &JobQueue<'_>,
    dispatcher: &JobDispatcher,
    progress: &ProgressWriter,
    poll_interval: Duration,
    mut shutdown: tokio::sync::oneshot::Receiver<()>,
) -> OsmoResult<()> {
    loop {
        let processed = drain_once(queue, dispatcher).await?;
        if processed > 0 {
            debug!(processed, "backend job worker dispatched queued jobs");
        }
        progress.touch()?;

        if processed > 0 && shutdown.try_recv().is_ok() {
            return Ok(());
        }
        if processed == 0 {
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = &mut shutdown => return Ok(()),
            }
        }
    }
}

/// Shared execution context every backend job handler below closes over.
pub struct BackendJobContext {
    pub kube: Arc<KubeClient>,
    pub sink: Arc<dyn MessageSink>,
    pub progress: Arc<ProgressWriter>,
    pub progress_iter_freq: Duration,
    pub tera: Arc<tera::Tera>,
}

pub struct CreateGroupHandler {
    pub context: Arc<BackendJobContext>,
}

#[async_trait]
impl JobHandler for CreateGroupHandler {
    fn job_type(&self) -> &'static str {
        "CreateGroup"
    }

    async fn handle(&self, payload: Value) -> JobResult {
        let job: CreateGroupJob = match serde_json::from_value(payload) {
            Ok(job) => job,
            Err(err) => return JobResult::failed_no_retry(format!("malformed CreateGroup payload: {err}")),
        };
        job.execute(&self.context.kube, &self.context.progress, self.context.progress_iter_freq).await
    }
}

pub struct CleanupGroupHandler {
    pub context: Arc<BackendJobContext>,
}

#[async_trait]
impl JobHandler for CleanupGroupHandler {
    fn job_type(&self) -> &'static str {
        "CleanupGroup"
    }

    async fn handle(&self, payload: Value) -> JobResult {
        let job: CleanupGroupJob = match serde_json::from_value(payload) {
            Ok(job) => job,
            Err(err) => return JobResult::failed_no_retry(format!("malformed CleanupGroup payload: {err}")),
        };
        job.execute(&self.context.kube, self.context.sink.as_ref()).await
    }
}

pub struct RescheduleTaskHandler {
    pub context: Arc<BackendJobContext>,
}

#[async_trait]
impl JobHandler for RescheduleTaskHandler {
    fn job_type(&self) -> &'static str {
        "RescheduleTask"
    }

    async fn handle(&self, payload: Value) -> JobResult {
        let mut job: RescheduleTaskJob = match serde_json::from_value(payload) {
            Ok(job) => job,
            Err(err) => return JobResult::failed_no_retry(format!("malformed RescheduleTask payload: {err}")),
        };
        job.execute(&self.context.kube, self.context.sink.as_ref(), &self.context.progress, self.context.progress_iter_freq).await
    }
}

pub struct BackendSynchronizeQueuesHandler {
    pub context: Arc<BackendJobContext>,
}

#[async_trait]
impl JobHandler for BackendSynchronizeQueuesHandler {
    fn job_type(&self) -> &'static str {
        "BackendSynchronizeQueues"
    }

    async fn handle(&self, payload: Value) -> JobResult {
        let job: BackendSynchronizeQueuesJob = match serde_json::from_value(payload) {
            Ok(job) => job,
            Err(err) => return JobResult::failed_no_retry(format!("malformed BackendSynchronizeQueues payload: {err}")),
        };
        job.execute(&self.context.kube).await
    }
}

pub struct BackendSynchronizeBackendTestHandler {
    pub context: Arc<BackendJobContext>,
}

#[async_trait]
impl JobHandler for BackendSynchronizeBackendTestHandler {
    fn job_type(&self) -> &'static str {
        "BackendSynchronizeBackendTest"
    }

    async fn handle(&self, payload: Value) -> JobResult {
        let job: BackendSynchronizeBackendTestJob = match serde_json::from_value(payload) {
            Ok(job) => job,
            Err(err) => return JobResult::failed_no_retry(format!("malformed BackendSynchronizeBackendTest payload: {err}")),
        };
        job.execute(&self.context.kube, &self.context.tera).await
    }
}

pub struct LabelNodeHandler {
    pub context: Arc<BackendJobContext>,
}

#[async_trait]
impl JobHandler for LabelNodeHandler {
    fn job_type(&self) -> &'static str {
        "LabelNode"
    }

    async fn handle(&self, payload: Value) -> JobResult {
        let job: LabelNodeJob = match serde_json::from_value(payload) {
            Ok(job) => job,
            Err(err) => return JobResult::failed_no_retry(format!("malformed LabelNode payload: {err}")),
        };
        job.execute(&self.context.kube).await
    }
}

/// Builds a dispatcher wired with every backend job handler (§4.6), sharing
/// one `BackendJobContext`.
pub fn default_dispatcher(context: Arc<BackendJobContext>) -> JobDispatcher {
    let mut dispatcher = JobDispatcher::new();
    dispatcher.register(Arc::new(CreateGroupHandler { context: context.clone() }));
    dispatcher.register(Arc::new(CleanupGroupHandler { context: context.clone() }));
    dispatcher.register(Arc::new(RescheduleTaskHandler { context: context.clone() }));
    dispatcher.register(Arc::new(BackendSynchronizeQueuesHandler { context: context.clone() }));
    dispatcher.register(Arc::new(BackendSynchronizeBackendTestHandler { context: context.clone() }));
    dispatcher.register(Arc::new(LabelNodeHandler { context }));
    dispatcher
}
