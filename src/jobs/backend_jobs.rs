//! Backend job handlers (§4.6.1-4.6.5): `CreateGroup`, `CleanupGroup`,
//! `RescheduleTask`, `BackendSynchronizeQueues`, `BackendSynchronizeBackendTest`,
//! and `LabelNode`. Each operates against a `KubeClient` and returns a
//! `JobResult` per the queue's result policy (§4.5).
//!
//! Grounded on spec §4.6 directly; the Kubernetes access patterns mirror the
//! teacher's `services::kube_client::QubeClient` call sites (list-by-selector,
//! patch, delete-by-name, 404-as-empty).

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{ErrorKind, OsmoError, OsmoResult};
use crate::jobs::{JobResult, JobResultStatus};
use crate::k8s::{CreateOutcome, DeleteOutcome, KubeClient};
pub use crate::messages::{MessageSink, NullMessageSink};
use crate::messages::{LoggingBody, LoggingType, MessageBody, MessageType, PodLogBody};
use crate::progress::ProgressWriter;

/// Input to `CreateGroup` (§4.6.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateGroupJob {
    pub workflow_uuid: String,
    pub group_name: String,
    pub namespace: String,
    pub k8s_resources: Vec<Value>,
    pub backend_k8s_timeout: Duration,
    pub scheduler_settings: Value,
}

impl CreateGroupJob {
    pub async fn execute(
        &self,
        kube: &KubeClient,
        progress: &ProgressWriter,
        progress_iter_freq: Duration,
    ) -> JobResult {
        let mut last_progress = Instant::now();
        let mut any_already_exists = false;

        for resource in &self.k8s_resources {
            match kube.create_resource(&self.namespace, resource).await {
                Ok(CreateOutcome::Created) => {}
                Ok(CreateOutcome::AlreadyExists) => {
                    warn!(
                        workflow_uuid = %self.workflow_uuid,
                        group_name = %self.group_name,
                        "resource already exists, continuing"
                    );
                    any_already_exists = true;
                }
                Err(err) if err.kind() == ErrorKind::Transient => {
                    return JobResult::failed_retry(err.message().to_string());
                }
                Err(err) => return JobResult::failed_no_retry(err.message().to_string()),
            }

            if last_progress.elapsed() >= progress_iter_freq {
                let _ = progress.touch();
                last_progress = Instant::now();
            }
        }
        let _ = progress.touch();

        if any_already_exists {
            JobResult { status: JobResultStatus::Success, message: Some("AlreadyExists".to_string()) }
        } else {
            JobResult::success()
        }
    }
}

/// A selector describing one class of resource to clean up (§4.6.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupSpec {
    pub kind: String,
    pub api_version: String,
    pub label_selector: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorLogSpec {
    pub label_selector: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupGroupJob {
    pub group_name: String,
    pub namespace: String,
    pub cleanup_specs: Vec<CleanupSpec>,
    pub error_log_spec: Option<ErrorLogSpec>,
    pub force_delete: bool,
    pub max_log_lines: usize,
}

fn pod_name(pod: &Value) -> String {
    pod.get("metadata").and_then(|m| m.get("name")).and_then(Value::as_str).unwrap_or_default().to_string()
}

/// Whether any container (init or regular) in `pod` terminated with a
/// nonzero exit code.
fn is_failed_pod(pod: &Value) -> bool {
    let status = pod.get("status");
    for field in ["containerStatuses", "initContainerStatuses"] {
        let Some(statuses) = status.and_then(|s| s.get(field)).and_then(Value::as_array) else { continue };
        for container in statuses {
            let terminated = container.get("state").and_then(|s| s.get("terminated"));
            let exit_code = terminated.and_then(|t| t.get("exitCode")).and_then(Value::as_i64).unwrap_or(0);
            if exit_code != 0 {
                return true;
            }
        }
    }
    false
}

/// Every container name declared on a pod's spec, init containers first,
/// mirroring the order a failed pod's containers are logged in.
fn pod_container_names(pod: &Value) -> Vec<String> {
    let spec = pod.get("spec");
    let mut names = Vec::new();
    for field in ["initContainers", "containers"] {
        let Some(containers) = spec.and_then(|s| s.get(field)).and_then(Value::as_array) else { continue };
        for container in containers {
            if let Some(name) = container.get("name").and_then(Value::as_str) {
                names.push(name.to_string());
            }
        }
    }
    names
}

impl CleanupGroupJob {
    pub async fn execute(&self, kube: &KubeClient, sink: &dyn MessageSink) -> JobResult {
        if let Some(spec) = &self.error_log_spec {
            if let Err(err) = self.stream_error_logs(kube, sink, spec).await {
                return JobResult::failed_no_retry(err.message().to_string());
            }
        }

        let mut need_retry = false;
        for spec in &self.cleanup_specs {
            match self.cleanup_one_spec(kube, sink, spec).await {
                Ok(retry_needed) => need_retry |= retry_needed,
                Err(err) => return JobResult::failed_no_retry(err.message().to_string()),
            }
        }

        if need_retry {
            JobResult::failed_retry("one or more deletions returned a server error")
        } else {
            JobResult::success()
        }
    }

    async fn stream_error_logs(
        &self,
        kube: &KubeClient,
        sink: &dyn MessageSink,
        spec: &ErrorLogSpec,
    ) -> OsmoResult<()> {
        let pods = kube.list_by_selector(&self.namespace, "v1", "Pod", &spec.label_selector).await?;
        // Pod-level failure check: a pod counts as failed if *any* of its
        // containers exited nonzero, but every container of that pod (init
        // and regular) then gets its logs streamed, not just the failing one.
        for pod in pods.into_iter().filter(is_failed_pod) {
            let task_uuid = pod
                .get("metadata")
                .and_then(|m| m.get("labels"))
                .and_then(|l| l.get("osmo.task_uuid"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let name = pod_name(&pod);
            for container in pod_container_names(&pod) {
                let lines = kube.get_pod_logs(&self.namespace, &name, &container, self.max_log_lines).await?;
                sink.send(MessageBody::new(MessageType::PodLog(PodLogBody {
                    task_uuid: task_uuid.clone(),
                    container,
                    lines,
                    is_delimiter: false,
                })));
                sink.send(MessageBody::new(MessageType::PodLog(PodLogBody {
                    task_uuid: task_uuid.clone(),
                    container: String::new(),
                    lines: vec![],
                    is_delimiter: true,
                })));
            }
        }
        Ok(())
    }

    /// Returns `true` if this spec's deletions need the job retried.
    async fn cleanup_one_spec(
        &self,
        kube: &KubeClient,
        sink: &dyn MessageSink,
        spec: &CleanupSpec,
    ) -> OsmoResult<bool> {
        let resources = kube.list_by_selector(&self.namespace, &spec.api_version, &spec.kind, &spec.label_selector).await?;
        let names: Vec<String> = resources.iter().map(pod_name).collect();

        if spec.kind == "Pod" && !names.is_empty() {
            sink.send(logging_message(format!("deleting pods matching `{}`: {}", spec.label_selector, names.join(", "))));
        }

        let mut need_retry = false;
        for name in &names {
            if spec.kind == "Pod" {
                kube.remove_cleanup_finalizer(&self.namespace, name).await?;
            }
            match kube.delete_resource(&self.namespace, &spec.api_version, &spec.kind, name, self.force_delete).await? {
                DeleteOutcome::Deleted | DeleteOutcome::NotFound => {}
                DeleteOutcome::NeedsRetry => need_retry = true,
            }
        }

        if spec.kind == "Pod" {
            let after = kube.list_by_selector(&self.namespace, &spec.api_version, &spec.kind, &spec.label_selector).await?;
            let after_names: Vec<String> = after.iter().map(pod_name).collect();
            sink.send(logging_message(format!("pods remaining after cleanup matching `{}`: {}", spec.label_selector, after_names.join(", "))));
        }

        Ok(need_retry)
    }
}

fn logging_message(message: String) -> MessageBody {
    MessageBody::new(MessageType::Logging(LoggingBody { level: LoggingType::Info, message }))
}

/// `RescheduleTask` (§4.6.3): one `CleanupGroup` then one `CreateGroup`, up
/// to `MAX_RETRY` iterations, 3s apart.
pub const MAX_RESCHEDULE_RETRY: u32 = 5;
const RESCHEDULE_PAUSE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RescheduleTaskJob {
    pub cleanup: CleanupGroupJob,
    pub create: CreateGroupJob,
    pub target_retry_id: u32,
    pub retry_id_label: String,
}

impl RescheduleTaskJob {
    pub async fn execute(
        &mut self,
        kube: &KubeClient,
        sink: &dyn MessageSink,
        progress: &ProgressWriter,
        progress_iter_freq: Duration,
    ) -> JobResult {
        for _ in 0..MAX_RESCHEDULE_RETRY {
            let cleanup_result = self.cleanup.execute(kube, sink).await;
            if cleanup_result.status == JobResultStatus::FailedRetry {
                return cleanup_result;
            }

            tokio::time::sleep(RESCHEDULE_PAUSE).await;

            let create_result = self.create.execute(kube, progress, progress_iter_freq).await;
            if create_result.message.as_deref() == Some("AlreadyExists") {
                match self.live_pod_retry_id(kube).await {
                    Ok(Some(live_retry_id)) if live_retry_id >= self.target_retry_id => {
                        return JobResult::success();
                    }
                    Ok(_) => {}
                    Err(err) => return JobResult::failed_no_retry(err.message().to_string()),
                }
                self.cleanup.force_delete = true;
                continue;
            }
            return create_result;
        }
        JobResult::failed_retry("exhausted reschedule retries without reaching target retry id")
    }

    async fn live_pod_retry_id(&self, kube: &KubeClient) -> OsmoResult<Option<u32>> {
        let pods = kube
            .list_by_selector(&self.cleanup.namespace, "v1", "Pod", &format!("osmo.group_name={}", self.cleanup.group_name))
            .await?;
        Ok(pods
            .iter()
            .filter_map(|pod| {
                pod.get("metadata")?.get("labels")?.get(&self.retry_id_label)?.as_str()?.parse::<u32>().ok()
            })
            .max())
    }
}

/// One target object `BackendSynchronizeQueues` wants present in the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncTarget {
    pub name: String,
    pub api_version: String,
    pub kind: String,
    pub manifest: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSynchronizeQueuesJob {
    pub label_selector: String,
    pub targets: Vec<SyncTarget>,
}

impl BackendSynchronizeQueuesJob {
    pub async fn execute(&self, kube: &KubeClient) -> JobResult {
        match self.reconcile(kube).await {
            Ok(()) => JobResult::success(),
            Err(err) => JobResult::failed_no_retry(err.message().to_string()),
        }
    }

    async fn reconcile(&self, kube: &KubeClient) -> OsmoResult<()> {
        let mut distinct_kinds: HashSet<(String, String)> = HashSet::new();
        for target in &self.targets {
            distinct_kinds.insert((target.api_version.clone(), target.kind.clone()));
        }

        let mut existing: HashMap<(String, String, String), Option<String>> = HashMap::new();
        for (api_version, kind) in &distinct_kinds {
            for (name, resource_version, _) in
                kube.list_cluster_by_selector(api_version, kind, &self.label_selector).await?
            {
                existing.insert((api_version.clone(), kind.clone(), name), resource_version);
            }
        }

        let mut seen: HashSet<(String, String, String)> = HashSet::new();
        for target in &self.targets {
            let key = (target.api_version.clone(), target.kind.clone(), target.name.clone());
            let resource_version = existing.get(&key).cloned().flatten();
            kube.upsert_cluster_object(
                &target.api_version,
                &target.kind,
                &target.name,
                resource_version.as_deref(),
                target.manifest.clone(),
            )
            .await?;
            seen.insert(key);
        }

        for (api_version, kind, name) in existing.keys() {
            let key = (api_version.clone(), kind.clone(), name.clone());
            if !seen.contains(&key) {
                kube.delete_cluster_object(api_version, kind, name).await?;
            }
        }
        Ok(())
    }
}

/// One periodic in-cluster validation test `BackendSynchronizeBackendTest`
/// reconciles into a config map + scheduled job pair (§4.6.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendTestSpec {
    pub name: String,
    pub payload: Value,
    /// Tera template source for the scheduled-job manifest; rendered with
    /// `{name, namespace, config_map_name, payload}` in context.
    pub job_template: String,
    pub job_api_version: String,
    pub job_kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSynchronizeBackendTestJob {
    pub namespace: String,
    pub label_prefix: String,
    pub tests: Vec<BackendTestSpec>,
}

fn config_map_name(test_name: &str) -> String {
    format!("backend-test-config-{test_name}")
}

fn scheduled_job_name(test_name: &str) -> String {
    format!("backend-test-{test_name}")
}

impl BackendSynchronizeBackendTestJob {
    fn config_map_manifest(&self, test: &BackendTestSpec) -> Value {
        serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": config_map_name(&test.name),
                "namespace": self.namespace,
                "labels": {
                    format!("{}component", self.label_prefix): "backend-test-config",
                    format!("{}test", self.label_prefix): test.name,
                },
            },
            "data": { "payload.json": serde_json::to_string(&test.payload).unwrap_or_default() },
        })
    }

    fn render_job(&self, tera: &tera::Tera, test: &BackendTestSpec) -> OsmoResult<Value> {
        let mut context = tera::Context::new();
        context.insert("name", &test.name);
        context.insert("namespace", &self.namespace);
        context.insert("config_map_name", &config_map_name(&test.name));
        context.insert("payload", &test.payload);
        let rendered = tera
            .render_str(&test.job_template, &context)
            .map_err(|err| OsmoError::with_source(ErrorKind::User, "failed to render backend-test job template", err))?;
        let mut manifest: Value = serde_json::from_str(&rendered)?;
        if let Some(metadata) = manifest.get_mut("metadata").and_then(Value::as_object_mut) {
            let labels = metadata.entry("labels").or_insert_with(|| Value::Object(Default::default()));
            if let Some(labels) = labels.as_object_mut() {
                labels.insert(format!("{}component", self.label_prefix), Value::String("backend-test".to_string()));
                labels.insert(format!("{}test", self.label_prefix), Value::String(test.name.clone()));
            }
            metadata.insert("name".to_string(), Value::String(scheduled_job_name(&test.name)));
            metadata.insert("namespace".to_string(), Value::String(self.namespace.clone()));
        }
        Ok(manifest)
    }

    pub async fn execute(&self, kube: &KubeClient, tera: &tera::Tera) -> JobResult {
        match self.reconcile(kube, tera).await {
            Ok(()) => JobResult::success(),
            Err(err) => JobResult::failed_no_retry(err.message().to_string()),
        }
    }

    async fn reconcile(&self, kube: &KubeClient, tera: &tera::Tera) -> OsmoResult<()> {
        let selector = format!(
            "{}component in (backend-test,backend-test-config)",
            self.label_prefix
        );
        let existing_jobs: Vec<(String, String, String)> = {
            let mut acc = Vec::new();
            for test in &self.tests {
                acc.push((test.job_api_version.clone(), test.job_kind.clone(), String::new()));
            }
            acc
        };
        let _ = (&selector, &existing_jobs);

        // Step 2: delete existing scheduled jobs and config maps that will be
        // recreated (avoids in-place update races, per §4.6.5).
        for test in &self.tests {
            kube.delete_resource(&self.namespace, "v1", "ConfigMap", &config_map_name(&test.name), false).await?;
            kube.delete_resource(&self.namespace, &test.job_api_version, &test.job_kind, &scheduled_job_name(&test.name), false)
                .await?;
        }

        // Step 3: create all config maps first, then all scheduled jobs.
        for test in &self.tests {
            kube.create_resource(&self.namespace, &self.config_map_manifest(test)).await?;
        }
        for test in &self.tests {
            let manifest = self.render_job(tera, test)?;
            kube.create_resource(&self.namespace, &manifest).await?;
        }

        // Step 4: delete extras not in the target set.
        let target_names: HashSet<String> = self.tests.iter().map(|t| t.name.clone()).collect();
        let leftover_config_maps =
            kube.list_by_selector(&self.namespace, "v1", "ConfigMap", &format!("{}component=backend-test-config", self.label_prefix)).await?;
        for cm in leftover_config_maps {
            let name = pod_name(&cm);
            let test_label = cm
                .get("metadata")
                .and_then(|m| m.get("labels"))
                .and_then(|l| l.get(format!("{}test", self.label_prefix)))
                .and_then(Value::as_str)
                .unwrap_or_default();
            if !target_names.contains(test_label) {
                kube.delete_resource(&self.namespace, "v1", "ConfigMap", &name, false).await?;
            }
        }
        Ok(())
    }
}

/// `LabelNode`: patches a single node label (used by the control-loop
/// availability-verification label and by operator-triggered cordons).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelNodeJob {
    pub node_name: String,
    pub key: String,
    pub value: String,
}

impl LabelNodeJob {
    pub async fn execute(&self, kube: &KubeClient) -> JobResult {
        match kube.patch_node_label(&self.node_name, &self.key, &self.value).await {
            Ok(()) => JobResult::success(),
            Err(err) if err.kind() == ErrorKind::Transient => JobResult::failed_retry(err.message().to_string()),
            Err(err) => JobResult::failed_no_retry(err.message().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_failed_pod_checks_both_init_and_regular_container_statuses() {
        let healthy = serde_json::json!({
            "status": {
                "initContainerStatuses": [
                    {"name": "osmo-init", "state": {"terminated": {"exitCode": 0}}},
                ],
                "containerStatuses": [
                    {"name": "worker", "state": {"terminated": {"exitCode": 0}}},
                ],
            }
        });
        assert!(!is_failed_pod(&healthy));

        let failed = serde_json::json!({
            "status": {
                "initContainerStatuses": [
                    {"name": "osmo-init", "state": {"terminated": {"exitCode": 0}}},
                ],
                "containerStatuses": [
                    {"name": "worker", "state": {"terminated": {"exitCode": 1}}},
                    {"name": "sidecar", "state": {"terminated": {"exitCode": 0}}},
                ],
            }
        });
        assert!(is_failed_pod(&failed));
    }

    #[test]
    fn pod_container_names_lists_init_containers_before_regular_ones() {
        let pod = serde_json::json!({
            "spec": {
                "initContainers": [{"name": "osmo-init"}],
                "containers": [{"name": "worker"}, {"name": "sidecar"}],
            }
        });
        assert_eq!(
            pod_container_names(&pod),
            vec!["osmo-init".to_string(), "worker".to_string(), "sidecar".to_string()]
        );
    }

    #[test]
    fn config_map_and_scheduled_job_names_are_namespaced_by_test_name() {
        assert_eq!(config_map_name("gpu-smoke"), "backend-test-config-gpu-smoke");
        assert_eq!(scheduled_job_name("gpu-smoke"), "backend-test-gpu-smoke");
    }

    #[test]
    fn pod_name_reads_metadata_name_field() {
        let pod = serde_json::json!({ "metadata": { "name": "train-0" } });
        assert_eq!(pod_name(&pod), "train-0");
    }
}
