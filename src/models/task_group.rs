//! `TaskGroupStatus` and `ExitCode`, per spec §3.
//!
//! The numeric assignment of the `FAILED_*` exit codes is a supplement
//! decision recorded in DESIGN.md: the source `task.py` module that defines
//! them was not present in the retrieval pack.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskGroupStatus {
    Processing,
    Scheduling,
    Initializing,
    Running,
    Completed,
    Failed,
    FailedImagePull,
    FailedStartError,
    FailedEvicted,
    FailedPreempted,
    FailedBackendError,
    FailedUnknown,
}

impl TaskGroupStatus {
    /// Whether this status is one of the terminal `FAILED*` variants.
    pub fn failed(self) -> bool {
        matches!(
            self,
            TaskGroupStatus::Failed
                | TaskGroupStatus::FailedImagePull
                | TaskGroupStatus::FailedStartError
                | TaskGroupStatus::FailedEvicted
                | TaskGroupStatus::FailedPreempted
                | TaskGroupStatus::FailedBackendError
                | TaskGroupStatus::FailedUnknown
        )
    }

    /// Whether this status represents a workflow that has reached a final,
    /// non-retryable state (failed or completed).
    pub fn terminal(self) -> bool {
        self.failed() || self == TaskGroupStatus::Completed
    }

    /// The `SCREAMING_SNAKE_CASE` wire name used in `update_pod` messages and
    /// the relational store's status column (spec §3).
    pub fn wire_name(self) -> &'static str {
        match self {
            TaskGroupStatus::Processing => "PROCESSING",
            TaskGroupStatus::Scheduling => "SCHEDULING",
            TaskGroupStatus::Initializing => "INITIALIZING",
            TaskGroupStatus::Running => "RUNNING",
            TaskGroupStatus::Completed => "COMPLETED",
            TaskGroupStatus::Failed => "FAILED",
            TaskGroupStatus::FailedImagePull => "FAILED_IMAGE_PULL",
            TaskGroupStatus::FailedStartError => "FAILED_START_ERROR",
            TaskGroupStatus::FailedEvicted => "FAILED_EVICTED",
            TaskGroupStatus::FailedPreempted => "FAILED_PREEMPTED",
            TaskGroupStatus::FailedBackendError => "FAILED_BACKEND_ERROR",
            TaskGroupStatus::FailedUnknown => "FAILED_UNKNOWN",
        }
    }

    /// The exit code reserved for this status, if it maps to one unconditionally.
    /// `Failed` itself carries no fixed code: its exit code is derived from the
    /// classifier's per-container inspection (see `classifier`).
    pub fn reserved_exit_code(self) -> Option<ExitCode> {
        match self {
            TaskGroupStatus::FailedEvicted => Some(ExitCode::FailedEvicted),
            TaskGroupStatus::FailedPreempted => Some(ExitCode::FailedPreempted),
            TaskGroupStatus::FailedStartError => Some(ExitCode::FailedStartError),
            TaskGroupStatus::FailedBackendError => Some(ExitCode::FailedBackendError),
            TaskGroupStatus::FailedUnknown => Some(ExitCode::FailedUnknown),
            _ => None,
        }
    }
}

/// Reserved exit codes for `FAILED_*` statuses, plus the offsets applied to
/// container-reported exit codes when the failing container is a framework
/// container (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    FailedEvicted,
    FailedPreempted,
    FailedStartError,
    FailedBackendError,
    FailedUnknown,
    Value(i64),
}

impl ExitCode {
    pub const OFFSET_INIT: i64 = 255;
    pub const OFFSET_PREFLIGHT: i64 = 1000;
    pub const OFFSET_CTRL: i64 = 2000;

    pub fn value(self) -> i64 {
        match self {
            ExitCode::FailedEvicted => 137,
            ExitCode::FailedPreempted => 143,
            ExitCode::FailedStartError => 900,
            ExitCode::FailedBackendError => 901,
            ExitCode::FailedUnknown => 999,
            ExitCode::Value(v) => v,
        }
    }

    /// Waiting-reason exit codes (301-305), default 999 when the reason is
    /// not one of the five recognized waiting reasons.
    pub fn for_waiting_reason(reason: &str) -> i64 {
        match reason {
            "ImagePullBackOff" => 301,
            "ErrImagePull" => 302,
            "ContainerCreateConfigError" => 303,
            "CrashLoopBackOff" => 304,
            "ContainerStatusUnknown" => 305,
            _ => 999,
        }
    }

    /// Add the framework-container offset for the named container, if any.
    pub fn offset_for_container(container_name: &str, exit_code: i64) -> i64 {
        match container_name {
            "osmo-init" => Self::OFFSET_INIT + exit_code,
            "preflight-test" => Self::OFFSET_PREFLIGHT + exit_code,
            "osmo-ctrl" => Self::OFFSET_CTRL + exit_code,
            _ => exit_code,
        }
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}
