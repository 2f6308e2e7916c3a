//! Pod-status classifier (C8): derives a `TaskGroupStatus` and optional
//! exit code from a pod's live Kubernetes status.
//!
//! Grounded on `calculate_pod_status` and its helpers in the original
//! backend listener: the step order below (preemption, waiting-container
//! errors, phase mapping, init-container check, running-container errors,
//! failed-phase errors, waiting-status overrides, pod.status.reason
//! overrides, pod condition checks) is preserved exactly.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};

use crate::models::{ExitCode, PodErrorInfo, PodWaitingStatus, TaskGroupStatus};

const WAITING_REASONS: &[&str] =
    &["Failed", "BackOff", "Error", "ErrImagePull", "ImagePullBackOff", "ContainerStatusUnknown"];

fn error_msg_container_name(container_status_name: &str) -> String {
    match container_status_name {
        "osmo-ctrl" => "OSMO Control".to_string(),
        "preflight-test" => "OSMO Preflight Test".to_string(),
        other => format!("Task {other}"),
    }
}

/// Determines if a pod has a container stuck waiting on a terminal error.
fn get_container_waiting_error_info(pod: &Pod) -> PodWaitingStatus {
    let Some(status) = &pod.status else {
        return PodWaitingStatus::default();
    };
    let container_statuses = status.container_statuses.iter().flatten();
    let init_container_statuses = status.init_container_statuses.iter().flatten();
    for container_status in container_statuses.chain(init_container_statuses) {
        let Some(state) = &container_status.state else { continue };
        let Some(waiting) = &state.waiting else { continue };
        let reason = waiting.reason.as_deref().unwrap_or("");
        if WAITING_REASONS.iter().any(|r| reason.contains(r)) {
            let container_name = error_msg_container_name(&container_status.name);
            let exit_code = ExitCode::for_waiting_reason(reason);
            let mut error_info = PodErrorInfo::default();
            error_info.exit_codes.insert(container_status.name.clone(), exit_code);
            let message = format!(
                "Failure reason: Exit code {} due to {container_name} failed with {}: {}.",
                error_info.exit_code().unwrap_or(exit_code),
                waiting.reason.clone().unwrap_or_default(),
                waiting.message.clone().unwrap_or_default(),
            );
            error_info.error_message = message;
            return PodWaitingStatus {
                waiting_on_error: true,
                waiting_reason: waiting.reason.clone(),
                error_info,
            };
        }
    }
    PodWaitingStatus::default()
}

/// Pod status phase is `Running`, but a container has already terminated for
/// a reason that demands immediate cleanup (OSMO control container exits, or
/// a `StartError`).
fn check_running_pod_containers(pod: &Pod) -> PodErrorInfo {
    const CLEANUP_REASONS: &[&str] = &["StartError"];
    let Some(statuses) = pod.status.as_ref().and_then(|s| s.container_statuses.as_ref()) else {
        return PodErrorInfo::default();
    };
    for container_status in statuses {
        let Some(terminated) = container_status.state.as_ref().and_then(|s| s.terminated.as_ref()) else {
            continue;
        };
        let reason = terminated.reason.as_deref().unwrap_or("");
        if container_status.name == "osmo-ctrl" || CLEANUP_REASONS.contains(&reason) {
            return get_container_failure_message(pod);
        }
    }
    PodErrorInfo::default()
}

fn container_exit_code(container_status: &ContainerStatus) -> i64 {
    let Some(terminated) = container_status.state.as_ref().and_then(|s| s.terminated.as_ref()) else {
        return 0;
    };
    let mut exit_code = terminated.exit_code as i64;
    if container_status.name == "osmo-ctrl" {
        if let Some(message) = &terminated.message {
            if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(message) {
                if let Some(code) = parsed.get("code").and_then(|v| v.as_i64()) {
                    exit_code = code;
                }
            }
        }
    }
    exit_code
}

/// Fetch the failure reason and message from a failed pod's containers.
fn get_container_failure_message(pod: &Pod) -> PodErrorInfo {
    let Some(status) = &pod.status else {
        return PodErrorInfo::default();
    };
    let mut error_msg = String::new();
    let mut exit_codes = std::collections::HashMap::new();
    let mut error_reasons = std::collections::HashMap::new();

    let init_statuses = status.init_container_statuses.iter().flatten();
    let container_statuses = status.container_statuses.iter().flatten();
    for container_status in init_statuses.chain(container_statuses) {
        let Some(terminated) = container_status.state.as_ref().and_then(|s| s.terminated.as_ref()) else {
            continue;
        };
        let reason = terminated.reason.clone().unwrap_or_default();
        if reason == "Completed" {
            continue;
        }
        let container_name = error_msg_container_name(&container_status.name);
        let exit_code = container_exit_code(container_status);
        let offset_code = ExitCode::offset_for_container(&container_status.name, exit_code);
        error_msg.push_str(&format!("\n- Exit code {offset_code} due to {container_name} failure. "));
        exit_codes.insert(container_status.name.clone(), exit_code);
        error_reasons.insert(container_status.name.clone(), reason);
    }

    let mut error_info = PodErrorInfo { exit_codes, error_reasons, error_message: String::new() };
    if !error_msg.is_empty() {
        error_info.error_message = format!("Failure reason:{error_msg}");
    }
    error_info
}

fn check_preemption_by_scheduler(pod: &Pod) -> (bool, String) {
    let Some(conditions) = pod.status.as_ref().and_then(|s| s.conditions.as_ref()) else {
        return (false, String::new());
    };
    for condition in conditions {
        if condition.status == "True" && condition.reason.as_deref() == Some("PreemptionByScheduler") {
            return (
                true,
                format!("Pod was preempted at {}. ", condition.last_transition_time.as_ref().map(|t| t.0.to_rfc3339()).unwrap_or_default()),
            );
        }
    }
    (false, String::new())
}

fn check_failure_pod_conditions(pod: &Pod) -> Option<(TaskGroupStatus, i64)> {
    let conditions = pod.status.as_ref().and_then(|s| s.conditions.as_ref())?;
    for condition in conditions {
        if condition.type_ == "DisruptionTarget" && condition.status == "True" {
            return Some((TaskGroupStatus::FailedBackendError, ExitCode::FailedBackendError.value()));
        }
    }
    None
}

fn ready_condition_stale(pod: &Pod, threshold: chrono::Duration, now: DateTime<Utc>) -> bool {
    let Some(conditions) = pod.status.as_ref().and_then(|s| s.conditions.as_ref()) else {
        return false;
    };
    for condition in conditions {
        if condition.type_ == "Ready" && condition.status == "False" {
            if let Some(last_transition) = &condition.last_transition_time {
                return now.signed_duration_since(last_transition.0) > threshold;
            }
        }
    }
    false
}

/// Classify a pod into `(status, message, exit_code)`. `now` is injected so
/// the 10/30-minute staleness checks are deterministic in tests.
pub fn calculate_pod_status(pod: &Pod, now: DateTime<Utc>) -> (TaskGroupStatus, String, Option<i64>) {
    let (is_preempted, preemption_message) = check_preemption_by_scheduler(pod);
    if is_preempted {
        return (TaskGroupStatus::FailedPreempted, preemption_message, Some(ExitCode::FailedPreempted.value()));
    }

    let pod_waiting_status = get_container_waiting_error_info(pod);
    let mut message = pod_waiting_status.error_info.error_message.clone();

    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref()).unwrap_or("Pending");
    let mut status = match phase {
        "Pending" => TaskGroupStatus::Scheduling,
        "Running" => TaskGroupStatus::Running,
        "Succeeded" => TaskGroupStatus::Completed,
        "Failed" => TaskGroupStatus::Failed,
        "StartError" => TaskGroupStatus::FailedStartError,
        _ => TaskGroupStatus::Scheduling,
    };

    if let Some(init_statuses) = pod.status.as_ref().and_then(|s| s.init_container_statuses.as_ref()) {
        for init_status in init_statuses {
            if let Some(waiting) = init_status.state.as_ref().and_then(|s| s.waiting.as_ref()) {
                if matches!(waiting.reason.as_deref(), Some("ContainerCreating") | Some("PodInitializing")) {
                    status = TaskGroupStatus::Initializing;
                    break;
                }
            }
        }
    }

    let mut exit_code: Option<i64> = None;

    if status == TaskGroupStatus::Running {
        let error_info = check_running_pod_containers(pod);
        if !error_info.exit_codes.is_empty() {
            exit_code = error_info.exit_code();
            message = error_info.error_message.clone();
            status = TaskGroupStatus::Failed;
        }
    } else if status.failed() {
        let error_info = get_container_failure_message(pod);
        message = error_info.error_message.clone();
        if let Some(pod_message) = pod.status.as_ref().and_then(|s| s.message.as_deref()) {
            let pod_name = pod.metadata.name.as_deref().unwrap_or("");
            message = format!("Pod {pod_name} error message: {pod_message}\n{message}");
        }
        exit_code = error_info.exit_code().or(Some(ExitCode::FailedUnknown.value()));
        if error_info.has_reason("OOMKilled") {
            status = TaskGroupStatus::FailedEvicted;
            exit_code = Some(ExitCode::FailedEvicted.value());
        }
    } else if status == TaskGroupStatus::Completed {
        exit_code = Some(0);
    }

    if pod_waiting_status.waiting_on_error {
        let error_info = &pod_waiting_status.error_info;
        exit_code = error_info.exit_code();
        match pod_waiting_status.waiting_reason.as_deref() {
            Some("ErrImagePull") | Some("ImagePullBackOff") => {
                status = TaskGroupStatus::FailedImagePull;
            }
            Some("CreateContainerConfigError") => {
                status = TaskGroupStatus::Scheduling;
                exit_code = None;
                if ready_condition_stale(pod, chrono::Duration::minutes(10), now) {
                    status = TaskGroupStatus::FailedBackendError;
                    exit_code = Some(ExitCode::FailedBackendError.value());
                }
            }
            Some("ContainerStatusUnknown") => {
                status = TaskGroupStatus::Scheduling;
                exit_code = None;
                if ready_condition_stale(pod, chrono::Duration::minutes(30), now) {
                    status = TaskGroupStatus::FailedBackendError;
                    exit_code = Some(ExitCode::FailedBackendError.value());
                }
            }
            _ => {
                status = TaskGroupStatus::Failed;
            }
        }
    }

    let pod_reason = pod.status.as_ref().and_then(|s| s.reason.as_deref());
    match pod_reason {
        Some("Evicted") => {
            status = TaskGroupStatus::FailedEvicted;
            exit_code = Some(ExitCode::FailedEvicted.value());
        }
        Some("StartError") => {
            status = TaskGroupStatus::FailedStartError;
            exit_code = Some(ExitCode::FailedStartError.value());
        }
        Some("UnexpectedAdmissionError") => {
            status = TaskGroupStatus::FailedBackendError;
            exit_code = Some(ExitCode::FailedBackendError.value());
        }
        _ => {
            if let Some((failure_status, failure_exit_code)) = check_failure_pod_conditions(pod) {
                status = failure_status;
                exit_code = Some(failure_exit_code);
            }
        }
    }

    if status.terminal() && exit_code.is_none() {
        exit_code = Some(ExitCode::FailedUnknown.value());
    }

    (status, message, exit_code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ContainerState, ContainerStateTerminated, ContainerStateWaiting, ContainerStatus, PodCondition, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn base_pod(phase: &str) -> Pod {
        Pod {
            status: Some(PodStatus { phase: Some(phase.to_string()), ..Default::default() }),
            ..Default::default()
        }
    }

    #[test]
    fn pending_pod_is_scheduling() {
        let pod = base_pod("Pending");
        let (status, _, exit_code) = calculate_pod_status(&pod, Utc::now());
        assert_eq!(status, TaskGroupStatus::Scheduling);
        assert_eq!(exit_code, None);
    }

    #[test]
    fn succeeded_pod_has_zero_exit_code() {
        let pod = base_pod("Succeeded");
        let (status, _, exit_code) = calculate_pod_status(&pod, Utc::now());
        assert_eq!(status, TaskGroupStatus::Completed);
        assert_eq!(exit_code, Some(0));
    }

    #[test]
    fn evicted_status_reason_overrides_phase() {
        let mut pod = base_pod("Failed");
        pod.status.as_mut().unwrap().reason = Some("Evicted".to_string());
        let (status, _, exit_code) = calculate_pod_status(&pod, Utc::now());
        assert_eq!(status, TaskGroupStatus::FailedEvicted);
        assert_eq!(exit_code, Some(137));
    }

    #[test]
    fn oom_killed_container_marks_evicted() {
        let mut pod = base_pod("Failed");
        pod.status.as_mut().unwrap().container_statuses = Some(vec![ContainerStatus {
            name: "worker".to_string(),
            state: Some(ContainerState {
                terminated: Some(ContainerStateTerminated {
                    exit_code: 137,
                    reason: Some("OOMKilled".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]);
        let (status, _, exit_code) = calculate_pod_status(&pod, Utc::now());
        assert_eq!(status, TaskGroupStatus::FailedEvicted);
        assert_eq!(exit_code, Some(137));
    }

    #[test]
    fn image_pull_waiting_reason_marks_failed_image_pull() {
        let mut pod = base_pod("Pending");
        pod.status.as_mut().unwrap().container_statuses = Some(vec![ContainerStatus {
            name: "worker".to_string(),
            state: Some(ContainerState {
                waiting: Some(ContainerStateWaiting {
                    reason: Some("ImagePullBackOff".to_string()),
                    message: Some("pull failed".to_string()),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]);
        let (status, message, exit_code) = calculate_pod_status(&pod, Utc::now());
        assert_eq!(status, TaskGroupStatus::FailedImagePull);
        assert_eq!(exit_code, Some(301));
        assert!(message.contains("ImagePullBackOff"));
    }

    #[test]
    fn stale_create_container_config_error_escalates_after_ten_minutes() {
        let mut pod = base_pod("Pending");
        pod.status.as_mut().unwrap().container_statuses = Some(vec![ContainerStatus {
            name: "worker".to_string(),
            state: Some(ContainerState {
                waiting: Some(ContainerStateWaiting {
                    reason: Some("CreateContainerConfigError".to_string()),
                    message: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]);
        let now = Utc::now();
        let stale_transition = now - chrono::Duration::minutes(11);
        pod.status.as_mut().unwrap().conditions = Some(vec![PodCondition {
            type_: "Ready".to_string(),
            status: "False".to_string(),
            last_transition_time: Some(Time(stale_transition)),
            ..Default::default()
        }]);
        let (status, _, exit_code) = calculate_pod_status(&pod, now);
        assert_eq!(status, TaskGroupStatus::FailedBackendError);
        assert_eq!(exit_code, Some(901));
    }

    #[test]
    fn fresh_create_container_config_error_stays_scheduling() {
        let mut pod = base_pod("Pending");
        pod.status.as_mut().unwrap().container_statuses = Some(vec![ContainerStatus {
            name: "worker".to_string(),
            state: Some(ContainerState {
                waiting: Some(ContainerStateWaiting {
                    reason: Some("CreateContainerConfigError".to_string()),
                    message: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]);
        let now = Utc::now();
        pod.status.as_mut().unwrap().conditions = Some(vec![PodCondition {
            type_: "Ready".to_string(),
            status: "False".to_string(),
            last_transition_time: Some(Time(now)),
            ..Default::default()
        }]);
        let (status, _, exit_code) = calculate_pod_status(&pod, now);
        assert_eq!(status, TaskGroupStatus::Scheduling);
        assert_eq!(exit_code, None);
    }

    #[test]
    fn disruption_target_condition_marks_backend_error() {
        let mut pod = base_pod("Running");
        pod.status.as_mut().unwrap().conditions = Some(vec![PodCondition {
            type_: "DisruptionTarget".to_string(),
            status: "True".to_string(),
            ..Default::default()
        }]);
        let (status, _, exit_code) = calculate_pod_status(&pod, Utc::now());
        assert_eq!(status, TaskGroupStatus::FailedBackendError);
        assert_eq!(exit_code, Some(901));
    }

    #[test]
    fn preemption_condition_short_circuits_everything_else() {
        let mut pod = base_pod("Running");
        pod.status.as_mut().unwrap().conditions = Some(vec![PodCondition {
            type_: "DisruptionTarget".to_string(),
            status: "True".to_string(),
            reason: Some("PreemptionByScheduler".to_string()),
            ..Default::default()
        }]);
        let (status, message, exit_code) = calculate_pod_status(&pod, Utc::now());
        assert_eq!(status, TaskGroupStatus::FailedPreempted);
        assert_eq!(exit_code, Some(143));
        assert!(message.contains("preempted"));
    }
}
