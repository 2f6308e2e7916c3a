//! Backend listener (C7, §4.7): the per-backend process that watches pods,
//! nodes, and events in a managed cluster and reports state changes over
//! the agent websocket plane (C10). Runs one cooperative scheduler plus
//! four dedicated OS threads (pod, node, event, control), per §5.

pub mod control;
pub mod event_dedup;
pub mod event_watch;
pub mod node_usage;
pub mod node_watch;
pub mod pod_cache;
pub mod pod_watch;
pub mod resource_db;

use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::StreamExt;

use crate::errors::OsmoResult;
use crate::k8s::watch::{events_watch_stream, is_resource_version_too_old, nodes_watch_stream, pods_watch_stream};
use crate::k8s::KubeClient;
use crate::messages::{DeleteResourceBody, MessageBody, MessageSink, MessageType};
use crate::models::node::NodeCache;
use crate::node_rules::ConditionsController;
use crate::progress::ProgressWriter;
use kube::api::WatchEvent;

use event_dedup::EventDedup;
use pod_cache::{LruCacheTtl, PodStatusKey};
use resource_db::PodList;

#[derive(Clone)]
pub struct ListenerConfig {
    pub list_pods_page_size: u32,
    pub refresh_resource_state_interval: Duration,
    pub node_cache_ttl: Duration,
    pub pod_status_cache_capacity: usize,
    pub pod_status_cache_ttl: Duration,
    pub event_dedup_capacity: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        ListenerConfig {
            list_pods_page_size: resource_db::DEFAULT_LIST_PODS_PAGE_SIZE,
            refresh_resource_state_interval: Duration::from_secs(300),
            node_cache_ttl: Duration::from_secs(300),
            pod_status_cache_capacity: 10_000,
            pod_status_cache_ttl: Duration::from_secs(600),
            event_dedup_capacity: 10_000,
        }
    }
}

/// Shared state the pod-watch, node-watch, and control threads all touch.
/// `pod_list` is single-writer (the pod-watch thread); `conditions` is
/// reader-many/writer-one via `ConditionsController`'s own lock (§5).
pub struct ListenerState {
    pub pod_list: RwLock<PodList>,
    pub conditions: ConditionsController,
}

impl ListenerState {
    pub fn new(conditions: ConditionsController) -> Self {
        ListenerState { pod_list: RwLock::new(PodList::new()), conditions }
    }
}

async fn wait_or_shutdown(shutdown: &mut tokio::sync::oneshot::Receiver<()>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(3)) => false,
        _ = shutdown => true,
    }
}

/// Pod-watch loop (§4.7.1): full refresh on startup and on staleness, then a
/// watch stream restarted on 410/read-timeout. Runs until `shutdown`
/// resolves.
pub async fn run_pod_watch(
    kube: Arc<KubeClient>,
    state: Arc<ListenerState>,
    sink: Arc<dyn MessageSink>,
    progress: Arc<ProgressWriter>,
    config: ListenerConfig,
    mut shutdown: tokio::sync::oneshot::Receiver<()>,
) -> OsmoResult<()> {
    let mut status_cache: LruCacheTtl<PodStatusKey, ()> = LruCacheTtl::new(config.pod_status_cache_capacity, config.pod_status_cache_ttl);

    let mut resource_version = {
        let mut pod_list = state.pod_list.write().unwrap();
        resource_db::full_refresh(&kube, &mut pod_list, sink.as_ref(), config.list_pods_page_size).await?
    };
    let mut last_refresh_at = std::time::Instant::now();

    loop {
        if last_refresh_at.elapsed() >= config.refresh_resource_state_interval {
            let mut pod_list = state.pod_list.write().unwrap();
            resource_version = resource_db::full_refresh(&kube, &mut pod_list, sink.as_ref(), config.list_pods_page_size).await?;
            last_refresh_at = std::time::Instant::now();
        }

        let api = kube.all_pods_api();
        let version = resource_version.clone().unwrap_or_default();
        let mut stream = match pods_watch_stream(&api, &version).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = %err, "failed to open pod watch stream, retrying");
                if wait_or_shutdown(&mut shutdown).await {
                    return Ok(());
                }
                continue;
            }
        };

        loop {
            tokio::select! {
                event = stream.next() => {
                    match event {
                        Some(Ok(WatchEvent::Added(pod))) | Some(Ok(WatchEvent::Modified(pod))) => {
                            state.pod_list.write().unwrap().upsert(pod.clone());
                            if let Some(outcome) = pod_watch::handle_pod_event(&pod, chrono::Utc::now(), &mut status_cache) {
                                if let Some(monitor_pod) = outcome.monitor_pod {
                                    sink.send(MessageBody::new(MessageType::MonitorPod(monitor_pod)));
                                }
                                if let Some(update_pod) = outcome.update_pod {
                                    sink.send(MessageBody::new(MessageType::UpdatePod(update_pod)));
                                }
                            }
                        }
                        Some(Ok(WatchEvent::Deleted(pod))) => {
                            state.pod_list.write().unwrap().remove(&pod);
                        }
                        Some(Ok(WatchEvent::Bookmark(bookmark))) => {
                            resource_version = Some(bookmark.metadata.resource_version);
                        }
                        Some(Ok(WatchEvent::Error(err))) => {
                            if is_resource_version_too_old(&kube::Error::Api(err.clone())) {
                                resource_version = None;
                            }
                            warn!(error = %err.message, "pod watch error event, reopening stream");
                            break;
                        }
                        Some(Err(err)) => {
                            warn!(error = %err, "pod watch stream error, reopening");
                            break;
                        }
                        None => break,
                    }
                    progress.touch()?;
                }
                _ = &mut shutdown => return Ok(()),
            }
        }
    }
}

/// Node-watch loop (§4.7.2): same outer restart structure as pod-watch, but
/// sends `resource`/`delete_resource` messages driven by `NodeCache`.
pub async fn run_node_watch(
    kube: Arc<KubeClient>,
    state: Arc<ListenerState>,
    sink: Arc<dyn MessageSink>,
    config: ListenerConfig,
    mut shutdown: tokio::sync::oneshot::Receiver<()>,
) -> OsmoResult<()> {
    let mut node_cache = NodeCache::new(config.node_cache_ttl);
    let mut resource_version: Option<String> = None;

    loop {
        let api = kube.all_nodes_api();
        let version = resource_version.clone().unwrap_or_default();
        let mut stream = match nodes_watch_stream(&api, &version).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = %err, "failed to open node watch stream, retrying");
                if wait_or_shutdown(&mut shutdown).await {
                    return Ok(());
                }
                continue;
            }
        };

        loop {
            tokio::select! {
                event = stream.next() => {
                    match event {
                        Some(Ok(WatchEvent::Added(node))) | Some(Ok(WatchEvent::Modified(node))) => {
                            let hostname = node.metadata.name.clone().unwrap_or_default();
                            let item = node_watch::node_cache_item(&node, &state.conditions);
                            if node_cache.observe(&hostname, item.clone()) {
                                sink.send(MessageBody::new(MessageType::Resource(node_watch::resource_body(&hostname, &item))));
                            }
                        }
                        Some(Ok(WatchEvent::Deleted(node))) => {
                            let hostname = node.metadata.name.clone().unwrap_or_default();
                            sink.send(MessageBody::new(MessageType::DeleteResource(DeleteResourceBody { hostname })));
                        }
                        Some(Ok(WatchEvent::Bookmark(bookmark))) => {
                            resource_version = Some(bookmark.metadata.resource_version);
                        }
                        Some(Ok(WatchEvent::Error(err))) => {
                            if is_resource_version_too_old(&kube::Error::Api(err.clone())) {
                                resource_version = None;
                            }
                            break;
                        }
                        Some(Err(_)) | None => break,
                    }
                }
                _ = &mut shutdown => return Ok(()),
            }
        }
    }
}

/// Event-watch loop (§4.7.3): dedups observed events and emits `pod_event`.
pub async fn run_event_watch(
    kube: Arc<KubeClient>,
    namespace: String,
    sink: Arc<dyn MessageSink>,
    config: ListenerConfig,
    mut shutdown: tokio::sync::oneshot::Receiver<()>,
) -> OsmoResult<()> {
    let mut dedup = EventDedup::new(config.event_dedup_capacity);
    let mut resource_version: Option<String> = None;

    loop {
        let api = kube.namespaced_events_api(&namespace);
        let version = resource_version.clone().unwrap_or_default();
        let mut stream = match events_watch_stream(&api, &version).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = %err, "failed to open event watch stream, retrying");
                if wait_or_shutdown(&mut shutdown).await {
                    return Ok(());
                }
                continue;
            }
        };

        loop {
            tokio::select! {
                event = stream.next() => {
                    match event {
                        Some(Ok(WatchEvent::Added(ev))) | Some(Ok(WatchEvent::Modified(ev))) => {
                            if let Some(body) = event_watch::handle_event(&ev, &mut dedup) {
                                sink.send(MessageBody::new(MessageType::PodEvent(body)));
                            }
                        }
                        Some(Ok(WatchEvent::Bookmark(bookmark))) => {
                            resource_version = Some(bookmark.metadata.resource_version);
                        }
                        Some(Ok(WatchEvent::Error(err))) => {
                            if is_resource_version_too_old(&kube::Error::Api(err.clone())) {
                                resource_version = None;
                            }
                            break;
                        }
                        Some(Ok(WatchEvent::Deleted(_))) => {}
                        Some(Err(_)) | None => break,
                    }
                }
                _ = &mut shutdown => return Ok(()),
            }
        }
    }
}
