//! Pod-watch loop (§4.7.1): classifies each observed pod and decides which
//! messages, if any, to emit. The decision itself is a pure function so the
//! watch-stream plumbing around it can stay thin and untested; the decision
//! logic is exhaustively tested here.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;

use crate::agent::listener::pod_cache::{LruCacheTtl, PodStatusKey};
use crate::classifier::calculate_pod_status;
use crate::messages::{MonitorPodBody, UpdatePodBody};

const TASK_UUID_LABEL: &str = "osmo.task_uuid";
const WORKFLOW_UUID_LABEL: &str = "osmo.workflow_uuid";
const RETRY_ID_LABEL: &str = "osmo.retry_id";

pub struct PodEventOutcome {
    pub monitor_pod: Option<MonitorPodBody>,
    pub update_pod: Option<UpdatePodBody>,
}

/// Decides what to emit for one observed (non-`DELETED`) pod event. Returns
/// `None` if the pod isn't managed by OSMO (no task label) or its phase is
/// `Unknown` (§4.7.1c).
pub fn handle_pod_event(
    pod: &Pod,
    now: DateTime<Utc>,
    status_cache: &mut LruCacheTtl<PodStatusKey, ()>,
) -> Option<PodEventOutcome> {
    let labels = pod.metadata.labels.as_ref()?;
    let task_uuid = labels.get(TASK_UUID_LABEL)?.clone();
    let workflow_uuid = labels.get(WORKFLOW_UUID_LABEL).cloned().unwrap_or_default();
    let retry_id: u32 = labels.get(RETRY_ID_LABEL).and_then(|v| v.parse().ok()).unwrap_or(0);

    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref()).unwrap_or("");
    if phase == "Unknown" {
        return None;
    }

    let (status, message, exit_code) = calculate_pod_status(pod, now);

    let monitor_pod = (status.failed() && phase == "Pending").then(|| MonitorPodBody {
        workflow_uuid: workflow_uuid.clone(),
        task_uuid: task_uuid.clone(),
        retry_id,
    });

    let key = PodStatusKey { workflow_uuid: workflow_uuid.clone(), task_uuid: task_uuid.clone(), retry_id, status: status.wire_name().to_string() };
    let update_pod = status_cache.observe(key, ()).then(|| UpdatePodBody {
        workflow_uuid,
        task_uuid,
        retry_id,
        status: status.wire_name().to_string(),
        message,
        exit_code,
    });

    Some(PodEventOutcome { monitor_pod, update_pod })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn managed_pod(phase: &str) -> Pod {
        let mut labels = BTreeMap::new();
        labels.insert(TASK_UUID_LABEL.to_string(), "task-1".to_string());
        labels.insert(WORKFLOW_UUID_LABEL.to_string(), "wf-1".to_string());
        labels.insert(RETRY_ID_LABEL.to_string(), "0".to_string());
        Pod {
            metadata: ObjectMeta { labels: Some(labels), ..Default::default() },
            spec: None,
            status: Some(PodStatus { phase: Some(phase.to_string()), ..Default::default() }),
        }
    }

    #[test]
    fn unmanaged_pod_without_task_label_is_ignored() {
        let pod = Pod { metadata: ObjectMeta::default(), spec: None, status: None };
        let mut cache = LruCacheTtl::new(16, Duration::from_secs(60));
        assert!(handle_pod_event(&pod, Utc::now(), &mut cache).is_none());
    }

    #[test]
    fn unknown_phase_is_ignored() {
        let pod = managed_pod("Unknown");
        let mut cache = LruCacheTtl::new(16, Duration::from_secs(60));
        assert!(handle_pod_event(&pod, Utc::now(), &mut cache).is_none());
    }

    #[test]
    fn pending_phase_emits_update_pod_but_not_monitor_pod() {
        let pod = managed_pod("Pending");
        let mut cache = LruCacheTtl::new(16, Duration::from_secs(60));
        let outcome = handle_pod_event(&pod, Utc::now(), &mut cache).unwrap();
        assert!(outcome.update_pod.is_some());
        assert!(outcome.monitor_pod.is_none());
    }

    #[test]
    fn failed_pod_still_pending_emits_monitor_pod() {
        let mut pod = managed_pod("Pending");
        pod.status.as_mut().unwrap().reason = Some("Evicted".to_string());
        let mut cache = LruCacheTtl::new(16, Duration::from_secs(60));
        let outcome = handle_pod_event(&pod, Utc::now(), &mut cache).unwrap();
        assert!(outcome.monitor_pod.is_some());
    }

    #[test]
    fn repeat_observation_with_unchanged_status_suppresses_update_pod() {
        let pod = managed_pod("Running");
        let mut cache = LruCacheTtl::new(16, Duration::from_secs(60));
        let first = handle_pod_event(&pod, Utc::now(), &mut cache).unwrap();
        assert!(first.update_pod.is_some());
        let second = handle_pod_event(&pod, Utc::now(), &mut cache).unwrap();
        assert!(second.update_pod.is_none());
    }

    #[test]
    fn preempted_pod_condition_is_still_reported_through_update_pod() {
        let mut pod = managed_pod("Running");
        pod.status.as_mut().unwrap().conditions = Some(vec![PodCondition {
            type_: "DisruptionTarget".to_string(),
            status: "True".to_string(),
            reason: Some("PreemptionByScheduler".to_string()),
            last_transition_time: None,
            ..Default::default()
        }]);
        let mut cache = LruCacheTtl::new(16, Duration::from_secs(60));
        let outcome = handle_pod_event(&pod, Utc::now(), &mut cache).unwrap();
        assert_eq!(outcome.update_pod.unwrap().status, "FAILED_PREEMPTED");
    }
}
