//! Node-availability rule engine (C9).
//!
//! Grounded on `ConditionsController` / `is_node_available` in the original
//! backend listener. Rules map a condition-type regex to a status regex
//! (`True|False|Unknown`, possibly OR-ed); the default `Ready -> True` rule
//! cannot be overridden to anything but `True`.

use std::collections::HashMap;
use std::sync::RwLock;

use regex::Regex;

use crate::errors::{ErrorKind, OsmoError, OsmoResult};

const READY_CONDITION: &str = "Ready";

/// Compiles `pattern` anchored to the start of the string only, mirroring
/// Python's `re.match` (prefix match, not full match) rather than `Regex`'s
/// own unanchored substring search.
fn condition_type_regex(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{pattern})"))
}

/// Thread-safe, shared node-condition rule set. One instance per backend.
#[derive(Default)]
pub struct ConditionsController {
    rules: RwLock<HashMap<String, String>>,
}

impl ConditionsController {
    pub fn new(initial_rules: HashMap<String, String>) -> OsmoResult<Self> {
        let controller = ConditionsController { rules: RwLock::new(HashMap::new()) };
        controller.set_rules(initial_rules)?;
        Ok(controller)
    }

    pub fn get_rules(&self) -> HashMap<String, String> {
        self.rules.read().unwrap().clone()
    }

    /// Replace the entire rule set. Rejects any rule that would allow
    /// `Ready` to resolve to anything other than `True`.
    pub fn set_rules(&self, rules: HashMap<String, String>) -> OsmoResult<()> {
        for (pattern, status_regex) in &rules {
            let Ok(re) = condition_type_regex(pattern) else { continue };
            if re.is_match(READY_CONDITION) && status_regex != "True" {
                return Err(OsmoError::new(
                    ErrorKind::User,
                    "overriding 'Ready' rule is not allowed; only 'True' is permitted",
                ));
            }
        }
        *self.rules.write().unwrap() = rules;
        Ok(())
    }

    /// Builds the ordered `(pattern, status_regex)` list: provided rules
    /// first, then any default whose condition type isn't already matched.
    pub fn effective_rules(&self, defaults: &[(&str, &str)]) -> Vec<(String, String)> {
        let rules = self.rules.read().unwrap();
        let mut effective: Vec<(String, String)> =
            rules.iter().map(|(p, s)| (p.clone(), s.clone())).collect();

        for (cond_type, status_regex) in defaults {
            let has_override = effective
                .iter()
                .any(|(pattern, _)| condition_type_regex(pattern).is_ok_and(|re| re.is_match(cond_type)));
            if !has_override {
                effective.push((format!("^{}$", regex::escape(cond_type)), status_regex.to_string()));
            }
        }
        effective
    }

    pub fn default_available_rules() -> Vec<(&'static str, &'static str)> {
        vec![(READY_CONDITION, "True")]
    }
}

/// A minimal view of a node's conditions needed for availability checks.
pub struct NodeConditionView<'a> {
    pub condition_type: &'a str,
    pub status: &'a str,
}

/// Whether the node is available given its conditions and `unschedulable`
/// flag, under the controller's effective rule set.
pub fn is_node_available(
    conditions: &[NodeConditionView<'_>],
    unschedulable: bool,
    controller: &ConditionsController,
) -> bool {
    let effective = controller.effective_rules(&ConditionsController::default_available_rules());
    for condition in conditions {
        let mut matched_any_rule = false;
        let mut allowed_by_any_rule = false;
        for (pattern, status_regex) in &effective {
            let Ok(type_re) = condition_type_regex(pattern) else { continue };
            if type_re.is_match(condition.condition_type) {
                matched_any_rule = true;
                let Ok(status_re) = Regex::new(&format!("^(?:{status_regex})$")) else { continue };
                if status_re.is_match(condition.status) {
                    allowed_by_any_rule = true;
                    break;
                }
            }
        }
        if matched_any_rule && !allowed_by_any_rule {
            return false;
        }
    }
    !unschedulable
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_default_rule_requires_true() {
        let controller = ConditionsController::new(HashMap::new()).unwrap();
        let conditions = vec![NodeConditionView { condition_type: "Ready", status: "False" }];
        assert!(!is_node_available(&conditions, false, &controller));
    }

    #[test]
    fn unmatched_condition_types_do_not_block_availability() {
        let controller = ConditionsController::new(HashMap::new()).unwrap();
        let conditions = vec![
            NodeConditionView { condition_type: "Ready", status: "True" },
            NodeConditionView { condition_type: "MemoryPressure", status: "True" },
        ];
        assert!(is_node_available(&conditions, false, &controller));
    }

    #[test]
    fn unschedulable_node_is_unavailable_even_if_ready() {
        let controller = ConditionsController::new(HashMap::new()).unwrap();
        let conditions = vec![NodeConditionView { condition_type: "Ready", status: "True" }];
        assert!(!is_node_available(&conditions, true, &controller));
    }

    #[test]
    fn overriding_ready_to_non_true_is_rejected() {
        let mut rules = HashMap::new();
        rules.insert("^Ready$".to_string(), "False".to_string());
        let err = ConditionsController::new(rules).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::User);
    }

    #[test]
    fn custom_rule_overrides_default_for_matching_type() {
        let mut rules = HashMap::new();
        rules.insert("^DiskPressure$".to_string(), "True|Unknown".to_string());
        let controller = ConditionsController::new(rules).unwrap();
        let conditions = vec![
            NodeConditionView { condition_type: "Ready", status: "True" },
            NodeConditionView { condition_type: "DiskPressure", status: "Unknown" },
        ];
        assert!(is_node_available(&conditions, false, &controller));
    }

    #[test]
    fn condition_type_pattern_is_anchored_to_the_start_like_re_match() {
        let mut rules = HashMap::new();
        rules.insert("eady".to_string(), "False".to_string());
        let controller = ConditionsController::new(rules).unwrap();
        let conditions = vec![NodeConditionView { condition_type: "Ready", status: "True" }];
        // "eady" does not match "Ready" from the start, so the default `Ready -> True`
        // rule still applies and the node remains available.
        assert!(is_node_available(&conditions, false, &controller));
    }
}
