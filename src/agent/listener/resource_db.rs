//! Resource-database refresh (§4.7.4): pages through every pod, lists every
//! node, recomputes each node's usage, and sends one `node_hash` message so
//! the service can garbage-collect stale entries.

use std::collections::HashMap;

use k8s_openapi::api::core::v1::Pod;

use crate::agent::listener::node_usage::{self, PodRequest};
use crate::errors::OsmoResult;
use crate::k8s::watch::{list_all_nodes, list_all_pods};
use crate::k8s::KubeClient;
use crate::messages::{MessageBody, MessageSink, MessageType, NodeHashBody};

pub const DEFAULT_LIST_PODS_PAGE_SIZE: u32 = 1000;

fn pod_key(pod: &Pod) -> String {
    let meta = &pod.metadata;
    format!("{}/{}", meta.namespace.as_deref().unwrap_or(""), meta.name.as_deref().unwrap_or(""))
}

/// Single-writer pod index (§5: "mutated only by the pod-watch thread").
#[derive(Default)]
pub struct PodList {
    pods: HashMap<String, Pod>,
}

impl PodList {
    pub fn new() -> Self {
        PodList::default()
    }

    pub fn upsert(&mut self, pod: Pod) {
        self.pods.insert(pod_key(&pod), pod);
    }

    pub fn remove(&mut self, pod: &Pod) {
        self.pods.remove(&pod_key(pod));
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pod> {
        self.pods.values()
    }

    pub fn pods_on_node(&self, node_name: &str) -> Vec<&Pod> {
        self.pods
            .values()
            .filter(|pod| pod.spec.as_ref().and_then(|s| s.node_name.as_deref()) == Some(node_name))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }
}

/// Extracts the summed resource requests for one pod, for node-usage
/// aggregation (§4.7.5). Only pods that are `Running`, or `Pending` with a
/// node already assigned, count.
pub fn pod_request(pod: &Pod) -> Option<PodRequest> {
    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref()).unwrap_or("");
    let has_node = pod.spec.as_ref().and_then(|s| s.node_name.as_deref()).is_some();
    if !(phase == "Running" || (phase == "Pending" && has_node)) {
        return None;
    }

    let mut cpu_millicores = 0i64;
    let mut memory_bytes = 0.0;
    let mut ephemeral_storage_bytes = 0.0;
    let mut gpu = 0.0;

    for container in pod.spec.iter().flat_map(|s| s.containers.iter()) {
        let Some(resources) = &container.resources else { continue };
        let Some(requests) = &resources.requests else { continue };
        for (key, quantity) in requests {
            let raw = quantity.0.as_str();
            match key.as_str() {
                "cpu" => cpu_millicores += node_usage::cpu_quantity_to_millicores(raw),
                "memory" => memory_bytes += node_usage::quantity_to_bytes(raw),
                "ephemeral-storage" => ephemeral_storage_bytes += node_usage::quantity_to_bytes(raw),
                "nvidia.com/gpu" => gpu += raw.parse::<f64>().unwrap_or(0.0),
                _ => {}
            }
        }
    }

    Some(PodRequest {
        namespace: pod.metadata.namespace.clone().unwrap_or_default(),
        cpu_millicores,
        memory_bytes,
        ephemeral_storage_bytes,
        gpu,
    })
}

/// Full refresh: rebuilds `pod_list` from a paginated listing, returns the
/// last-observed pod `resourceVersion` to resume watching from, and the
/// current set of node hostnames (for the caller to send `node_hash` plus
/// drive per-node usage updates).
pub async fn full_refresh(
    kube: &KubeClient,
    pod_list: &mut PodList,
    sink: &dyn MessageSink,
    page_size: u32,
) -> OsmoResult<Option<String>> {
    let (pods, resource_version) = list_all_pods(&kube.all_pods_api(), page_size).await?;
    *pod_list = PodList::new();
    for pod in pods {
        pod_list.upsert(pod);
    }

    let (nodes, _) = list_all_nodes(&kube.all_nodes_api()).await?;
    let hostnames: Vec<String> = nodes.iter().filter_map(|n| n.metadata.name.clone()).collect();
    sink.send(MessageBody::new(MessageType::NodeHash(NodeHashBody { hostnames })));

    Ok(resource_version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodStatus, ResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod(namespace: &str, name: &str, node_name: Option<&str>, phase: &str) -> Pod {
        Pod {
            metadata: ObjectMeta { namespace: Some(namespace.to_string()), name: Some(name.to_string()), ..Default::default() },
            spec: Some(PodSpec { node_name: node_name.map(str::to_string), ..Default::default() }),
            status: Some(PodStatus { phase: Some(phase.to_string()), ..Default::default() }),
        }
    }

    #[test]
    fn pod_list_upserts_and_removes_by_namespace_and_name() {
        let mut list = PodList::new();
        list.upsert(pod("ns", "p1", Some("node-a"), "Running"));
        assert_eq!(list.len(), 1);
        let removed = pod("ns", "p1", Some("node-a"), "Running");
        list.remove(&removed);
        assert!(list.is_empty());
    }

    #[test]
    fn pods_on_node_filters_by_assigned_node() {
        let mut list = PodList::new();
        list.upsert(pod("ns", "p1", Some("node-a"), "Running"));
        list.upsert(pod("ns", "p2", Some("node-b"), "Running"));
        assert_eq!(list.pods_on_node("node-a").len(), 1);
    }

    #[test]
    fn pod_request_excludes_pending_pods_without_an_assigned_node() {
        let unscheduled = pod("ns", "p1", None, "Pending");
        assert!(pod_request(&unscheduled).is_none());
    }

    #[test]
    fn pod_request_sums_container_requests() {
        let mut p = pod("ns", "p1", Some("node-a"), "Running");
        p.spec.as_mut().unwrap().containers = vec![Container {
            name: "main".to_string(),
            resources: Some(ResourceRequirements {
                requests: Some(std::collections::BTreeMap::from([
                    ("cpu".to_string(), Quantity("500m".to_string())),
                    ("memory".to_string(), Quantity("1Gi".to_string())),
                ])),
                ..Default::default()
            }),
            ..Default::default()
        }];
        let request = pod_request(&p).unwrap();
        assert_eq!(request.cpu_millicores, 500);
        assert_eq!(request.memory_bytes, 1024.0 * 1024.0 * 1024.0);
    }
}
