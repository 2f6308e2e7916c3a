//! The agent process (C10/C7, §4.7/§4.10): one `run_agent` call per backend
//! cluster, spawning the five websocket connections, the four listener
//! watch loops, and the 20s heartbeat producer.
//!
//! Grounded on the teacher's `services::kube_client` + worker-orchestration
//! pattern: a plain `from_env()` config struct, a handful of OS threads each
//! driving their own blocking-on-async loop via [`crate::runtime::block_on`],
//! and cooperative tokio tasks for everything that's inherently I/O-bound.

pub mod connection;
pub mod listener;
pub mod unacked;

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::MaybeTlsStream;

use crate::errors::{ErrorKind, OsmoError, OsmoResult};
use crate::k8s::KubeClient;
use crate::messages::{InitBody, MessageBody, MessageSink};
use crate::node_rules::ConditionsController;
use crate::progress::ProgressWriter;

use connection::{run_connection, AuthProvider, StreamKind, WebSocketTransport};
use listener::{ListenerConfig, ListenerState};
use unacked::UnackedMessages;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);
const UNACKED_CAPACITY: usize = 1_000;

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Overridable via `OSMO_AGENT_*` environment variables.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub scheme: String,
    pub host: String,
    pub backend: String,
    pub k8s_uid: String,
    pub k8s_namespace: String,
    pub version: String,
    pub node_condition_prefix: String,
}

impl AgentConfig {
    pub fn from_env() -> Self {
        AgentConfig {
            scheme: env_var("OSMO_AGENT_SCHEME").unwrap_or_else(|| "wss".to_string()),
            host: env_var("OSMO_AGENT_HOST").unwrap_or_else(|| "localhost".to_string()),
            backend: env_var("OSMO_AGENT_BACKEND").unwrap_or_default(),
            k8s_uid: env_var("OSMO_AGENT_K8S_UID").unwrap_or_default(),
            k8s_namespace: env_var("OSMO_AGENT_K8S_NAMESPACE").unwrap_or_else(|| "default".to_string()),
            version: env!("CARGO_PKG_VERSION").to_string(),
            node_condition_prefix: env_var("OSMO_AGENT_NODE_CONDITION_PREFIX").unwrap_or_default(),
        }
    }

    fn init_body(&self) -> InitBody {
        InitBody {
            k8s_uid: self.k8s_uid.clone(),
            k8s_namespace: self.k8s_namespace.clone(),
            version: self.version.clone(),
            node_condition_prefix: self.node_condition_prefix.clone(),
        }
    }
}

struct ChannelSink(mpsc::UnboundedSender<MessageBody>);

impl MessageSink for ChannelSink {
    fn send(&self, message: MessageBody) {
        let _ = self.0.send(message);
    }
}

async fn connect_stream(
    config: &AgentConfig,
    stream: StreamKind,
    auth: &dyn AuthProvider,
) -> OsmoResult<WebSocketTransport<MaybeTlsStream<TcpStream>>> {
    let url = connection::stream_url(&config.scheme, &config.host, stream, &config.backend);
    let mut request = url
        .into_client_request()
        .map_err(|err| OsmoError::with_source(ErrorKind::Transient, "invalid websocket url", err))?;

    for (key, value) in auth.headers().await? {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|err| OsmoError::with_source(ErrorKind::Transient, "invalid auth header name", err))?;
        let value = HeaderValue::from_str(&value)
            .map_err(|err| OsmoError::with_source(ErrorKind::Transient, "invalid auth header value", err))?;
        request.headers_mut().insert(name, value);
    }

    let (stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|err| OsmoError::with_source(ErrorKind::Transient, "websocket connect failed", err))?;
    Ok(WebSocketTransport::new(stream))
}

/// Spawns one reconnecting connection task per stream, wiring `outbound` and
/// `control_inbound` channels through to [`connection::run_connection`].
#[allow(clippy::too_many_arguments)]
fn spawn_connection(
    config: Arc<AgentConfig>,
    auth: Arc<dyn AuthProvider>,
    unacked: Arc<UnackedMessages>,
    stream: StreamKind,
    outbound: mpsc::UnboundedReceiver<MessageBody>,
    control_inbound: mpsc::UnboundedSender<MessageBody>,
    shutdown: oneshot::Receiver<()>,
) -> tokio::task::JoinHandle<OsmoResult<()>> {
    let init = config.init_body();
    tokio::spawn(async move {
        run_connection(
            stream,
            init,
            unacked,
            outbound,
            control_inbound,
            move || {
                let config = config.clone();
                let auth = auth.clone();
                async move { connect_stream(&config, stream, auth.as_ref()).await }
            },
            shutdown,
        )
        .await
    })
}

/// Emits one `heartbeat` message every [`HEARTBEAT_INTERVAL`] until
/// `shutdown` resolves (§4.10).
async fn run_heartbeat_producer(outbound: mpsc::UnboundedSender<MessageBody>, mut shutdown: oneshot::Receiver<()>) {
    let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let _ = outbound.send(MessageBody::heartbeat());
            }
            _ = &mut shutdown => return,
        }
    }
}

/// Applies incoming `node_conditions` updates from the control stream, per
/// §4.7.7.
async fn run_control_consumer(mut control_inbound: mpsc::UnboundedReceiver<MessageBody>, state: Arc<ListenerState>) {
    use crate::messages::MessageType;

    while let Some(body) = control_inbound.recv().await {
        if let MessageType::NodeConditions(rules) = body.message {
            if let Err(err) = listener::control::apply_node_conditions(&state.conditions, rules) {
                warn!(error = %err, "failed to apply node_conditions update");
            }
        }
    }
}

/// One group of handles for a running agent; dropping the sender halves of
/// `shutdown` tells every task/thread to wind down.
pub struct AgentHandle {
    shutdown_senders: Vec<oneshot::Sender<()>>,
}

impl AgentHandle {
    pub fn shutdown(self) {
        for sender in self.shutdown_senders {
            let _ = sender.send(());
        }
    }
}

/// Wires up the full per-backend agent: five websocket connections, three
/// listener watch loops plus the control consumer, and the heartbeat
/// producer. The watch loops run on dedicated OS threads (§5); everything
/// else is a cooperative tokio task on the caller's runtime.
pub fn run_agent(kube: Arc<KubeClient>, config: AgentConfig, auth: Arc<dyn AuthProvider>, progress: Arc<ProgressWriter>) -> AgentHandle {
    let config = Arc::new(config);
    let unacked = Arc::new(UnackedMessages::new(UNACKED_CAPACITY));
    let state = Arc::new(ListenerState::new(ConditionsController::new(Default::default()).expect("default node-condition rules are valid")));

    let (pod_tx, pod_rx) = mpsc::unbounded_channel();
    let (node_tx, node_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (heartbeat_tx, heartbeat_rx) = mpsc::unbounded_channel();
    let (control_out_tx, control_out_rx) = mpsc::unbounded_channel();
    let (control_in_tx, control_in_rx) = mpsc::unbounded_channel();

    let mut shutdown_senders = Vec::new();

    macro_rules! spawn_stream {
        ($stream:expr, $outbound_rx:expr) => {{
            let (tx, rx) = oneshot::channel();
            shutdown_senders.push(tx);
            spawn_connection(config.clone(), auth.clone(), unacked.clone(), $stream, $outbound_rx, control_in_tx.clone(), rx);
        }};
    }

    spawn_stream!(StreamKind::Pod, pod_rx);
    spawn_stream!(StreamKind::Node, node_rx);
    spawn_stream!(StreamKind::Event, event_rx);
    spawn_stream!(StreamKind::Heartbeat, heartbeat_rx);
    spawn_stream!(StreamKind::Control, control_out_rx);
    drop(control_out_tx);

    {
        let (tx, rx) = oneshot::channel();
        shutdown_senders.push(tx);
        tokio::spawn(run_heartbeat_producer(heartbeat_tx, rx));
    }

    tokio::spawn(run_control_consumer(control_in_rx, state.clone()));

    let listener_config = ListenerConfig::default();
    let namespace = config.k8s_namespace.clone();

    {
        let (tx, rx) = oneshot::channel();
        shutdown_senders.push(tx);
        spawn_listener_thread({
            let kube = kube.clone();
            let state = state.clone();
            let sink: Arc<dyn MessageSink> = Arc::new(ChannelSink(pod_tx));
            let progress = progress.clone();
            let config = listener_config.clone();
            move || listener::run_pod_watch(kube, state, sink, progress, config, rx)
        });
    }

    {
        let (tx, rx) = oneshot::channel();
        shutdown_senders.push(tx);
        spawn_listener_thread({
            let kube = kube.clone();
            let state = state.clone();
            let sink: Arc<dyn MessageSink> = Arc::new(ChannelSink(node_tx));
            let config = listener_config.clone();
            move || listener::run_node_watch(kube, state, sink, config, rx)
        });
    }

    {
        let (tx, rx) = oneshot::channel();
        shutdown_senders.push(tx);
        spawn_listener_thread({
            let kube = kube.clone();
            let sink: Arc<dyn MessageSink> = Arc::new(ChannelSink(event_tx));
            let config = listener_config.clone();
            move || listener::run_event_watch(kube, namespace, sink, config, rx)
        });
    }

    AgentHandle { shutdown_senders }
}

/// Runs one listener watch loop on a dedicated OS thread, driving it to
/// completion with [`crate::runtime::block_on`] (§5: "one cooperative
/// scheduler plus four dedicated OS threads").
fn spawn_listener_thread<F>(make_future: impl FnOnce() -> F + Send + 'static) -> std::thread::JoinHandle<()>
where
    F: std::future::Future<Output = OsmoResult<()>>,
{
    std::thread::spawn(move || {
        if let Err(err) = crate::runtime::block_on(make_future()) {
            warn!(error = %err, "listener watch loop exited with an error");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_config_from_env_uses_documented_defaults_when_unset() {
        let config = AgentConfig {
            scheme: "wss".to_string(),
            host: "localhost".to_string(),
            backend: String::new(),
            k8s_uid: String::new(),
            k8s_namespace: "default".to_string(),
            version: "0.0.0".to_string(),
            node_condition_prefix: String::new(),
        };
        assert_eq!(config.scheme, "wss");
        assert_eq!(config.k8s_namespace, "default");
    }

    #[test]
    fn init_body_mirrors_config_fields() {
        let config = AgentConfig {
            scheme: "wss".to_string(),
            host: "svc.example".to_string(),
            backend: "cluster-a".to_string(),
            k8s_uid: "uid-1".to_string(),
            k8s_namespace: "osmo".to_string(),
            version: "1.2.3".to_string(),
            node_condition_prefix: "feature.node.kubernetes.io/".to_string(),
        };
        let init = config.init_body();
        assert_eq!(init.k8s_uid, "uid-1");
        assert_eq!(init.k8s_namespace, "osmo");
        assert_eq!(init.version, "1.2.3");
    }
}
