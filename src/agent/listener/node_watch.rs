//! Node-watch loop (§4.7.2): computes a `NodeCacheItem` for each observed
//! node, suppresses unchanged observations, and builds the `resource`
//! message body. `feature.node.kubernetes.io/*` labels are filtered out of
//! the emitted label set.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Node;

use crate::messages::ResourceBody;
use crate::models::node::{NodeCacheItem, NodeConditionSnapshot};
use crate::node_rules::{ConditionsController, NodeConditionView};

const FILTERED_LABEL_PREFIX: &str = "feature.node.kubernetes.io/";

fn filtered_labels(labels: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    labels.iter().filter(|(k, _)| !k.starts_with(FILTERED_LABEL_PREFIX)).map(|(k, v)| (k.clone(), v.clone())).collect()
}

/// Builds the `NodeCacheItem` for one node, for comparison against the
/// suppression cache.
pub fn node_cache_item(node: &Node, controller: &ConditionsController) -> NodeCacheItem {
    let conditions: Vec<NodeConditionSnapshot> = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .into_iter()
        .flatten()
        .map(|c| NodeConditionSnapshot { condition_type: c.type_.clone(), status: c.status.clone() })
        .collect();

    let condition_views: Vec<NodeConditionView<'_>> =
        conditions.iter().map(|c| NodeConditionView { condition_type: &c.condition_type, status: &c.status }).collect();
    let unschedulable = node.spec.as_ref().and_then(|s| s.unschedulable).unwrap_or(false);
    let available = crate::node_rules::is_node_available(&condition_views, unschedulable, controller);

    let allocatable: BTreeMap<String, String> = node
        .status
        .as_ref()
        .and_then(|s| s.allocatable.as_ref())
        .map(|a| a.iter().map(|(k, v)| (k.clone(), v.0.clone())).collect())
        .unwrap_or_default();

    let labels = node.metadata.labels.as_ref().map(filtered_labels).unwrap_or_default();

    let taints: Vec<String> = node
        .spec
        .as_ref()
        .and_then(|s| s.taints.as_ref())
        .into_iter()
        .flatten()
        .map(|t| format!("{}={}:{}", t.key, t.value.clone().unwrap_or_default(), t.effect))
        .collect();

    NodeCacheItem { available, allocatable, labels, taints, conditions }
}

pub fn resource_body(hostname: &str, item: &NodeCacheItem) -> ResourceBody {
    ResourceBody {
        hostname: hostname.to_string(),
        available: item.available,
        conditions: item.conditions.iter().map(|c| format!("{}={}", c.condition_type, c.status)).collect(),
        allocatable_fields: item.allocatable.clone(),
        label_fields: item.labels.clone(),
        taints: item.taints.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_node_labels_are_filtered_out() {
        let mut labels = BTreeMap::new();
        labels.insert("feature.node.kubernetes.io/gpu".to_string(), "true".to_string());
        labels.insert("topology.kubernetes.io/zone".to_string(), "us-east-1a".to_string());
        let filtered = filtered_labels(&labels);
        assert_eq!(filtered.len(), 1);
        assert!(filtered.contains_key("topology.kubernetes.io/zone"));
    }

    #[test]
    fn resource_body_carries_through_cache_item_fields() {
        let item = NodeCacheItem {
            available: true,
            allocatable: BTreeMap::from([("cpu".to_string(), "8".to_string())]),
            labels: BTreeMap::new(),
            taints: vec![],
            conditions: vec![NodeConditionSnapshot { condition_type: "Ready".to_string(), status: "True".to_string() }],
        };
        let body = resource_body("node-a", &item);
        assert_eq!(body.hostname, "node-a");
        assert!(body.available);
        assert_eq!(body.conditions, vec!["Ready=True".to_string()]);
    }
}
