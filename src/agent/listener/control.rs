//! Control loop (§4.7.7): applies `node_conditions` updates from the
//! service to the shared `ConditionsController`, then triggers a full
//! resource-database refresh so availability is re-evaluated under the new
//! rules.

use std::collections::HashMap;

use regex::Regex;

use crate::errors::OsmoResult;
use crate::messages::NodeConditionsBody;
use crate::node_rules::ConditionsController;

const READY_CONDITION: &str = "Ready";

/// Adds the default `^Ready$ -> True` rule if the incoming rule set doesn't
/// already match `Ready`, then atomically replaces the controller's rules.
pub fn apply_node_conditions(controller: &ConditionsController, body: NodeConditionsBody) -> OsmoResult<()> {
    let mut rules: HashMap<String, String> = body.rules.into_iter().collect();
    let has_ready_rule = rules.keys().any(|pattern| Regex::new(pattern).is_ok_and(|re| re.is_match(READY_CONDITION)));
    if !has_ready_rule {
        rules.insert(format!("^{READY_CONDITION}$"), "True".to_string());
    }
    controller.set_rules(rules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn adds_default_ready_rule_when_absent() {
        let controller = ConditionsController::new(HashMap::new()).unwrap();
        let mut rules = BTreeMap::new();
        rules.insert("^DiskPressure$".to_string(), "True|Unknown".to_string());
        apply_node_conditions(&controller, NodeConditionsBody { rules }).unwrap();

        let effective = controller.get_rules();
        assert_eq!(effective.get("^Ready$"), Some(&"True".to_string()));
        assert_eq!(effective.get("^DiskPressure$"), Some(&"True|Unknown".to_string()));
    }

    #[test]
    fn does_not_duplicate_an_existing_ready_rule() {
        let controller = ConditionsController::new(HashMap::new()).unwrap();
        let mut rules = BTreeMap::new();
        rules.insert("^Ready$".to_string(), "True".to_string());
        apply_node_conditions(&controller, NodeConditionsBody { rules }).unwrap();
        assert_eq!(controller.get_rules().len(), 1);
    }
}
