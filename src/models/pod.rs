//! `PodErrorInfo` / `PodWaitingStatus`, per spec §3.

use std::collections::HashMap;

use super::task_group::ExitCode;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodErrorInfo {
    pub error_message: String,
    pub exit_codes: HashMap<String, i64>,
    pub error_reasons: HashMap<String, String>,
}

impl PodErrorInfo {
    /// The effective exit code: the maximum of the offset-adjusted
    /// per-container codes, or `None` if no container reported one.
    pub fn exit_code(&self) -> Option<i64> {
        self.exit_codes
            .iter()
            .map(|(container, code)| ExitCode::offset_for_container(container, *code))
            .max()
    }

    pub fn has_reason(&self, reason: &str) -> bool {
        self.error_reasons.values().any(|r| r == reason)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodWaitingStatus {
    pub waiting_on_error: bool,
    pub waiting_reason: Option<String>,
    pub error_info: PodErrorInfo,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_is_max_of_offset_adjusted_codes() {
        let mut info = PodErrorInfo::default();
        info.exit_codes.insert("osmo-ctrl".to_string(), 2);
        info.exit_codes.insert("worker".to_string(), 5000);
        // osmo-ctrl offset-adjusted is 2002, worker has no offset so stays 5000.
        assert_eq!(info.exit_code(), Some(5000));
    }

    #[test]
    fn no_containers_yields_no_exit_code() {
        assert_eq!(PodErrorInfo::default().exit_code(), None);
    }

    #[test]
    fn has_reason_checks_any_container() {
        let mut info = PodErrorInfo::default();
        info.error_reasons.insert("main".to_string(), "OOMKilled".to_string());
        assert!(info.has_reason("OOMKilled"));
        assert!(!info.has_reason("StartError"));
    }
}
