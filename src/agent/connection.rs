//! Per-stream websocket connection lifecycle (C10, §4.10): open, init
//! handshake, unacked replay, steady-state send/recv, disconnect/backoff/
//! reconnect. Five of these run concurrently per backend (`control`, `pod`,
//! `node`, `event`, `heartbeat`); `control` is receive-only.
//!
//! The wire transport is abstracted behind [`MessageTransport`] so the
//! reconnect/replay/ack state machine is unit-testable without a real
//! socket — grounded on the teacher's pattern of wrapping transport clients
//! behind a narrow trait at the call site instead of threading concrete
//! client types through business logic.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::agent::unacked::UnackedMessages;
use crate::errors::{ErrorKind, OsmoError, OsmoResult};
use crate::messages::{InitBody, MessageBody, MessageType};
use crate::metrics;

pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(3);
pub const SEND_POLL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Control,
    Pod,
    Node,
    Event,
    Heartbeat,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Control => "control",
            StreamKind::Pod => "pod",
            StreamKind::Node => "node",
            StreamKind::Event => "event",
            StreamKind::Heartbeat => "heartbeat",
        }
    }

    /// Only `control` is receive-only; every other stream carries a send
    /// queue from the listener back to the service.
    pub fn is_receive_only(self) -> bool {
        matches!(self, StreamKind::Control)
    }
}

pub fn stream_url(scheme: &str, host: &str, stream: StreamKind, backend: &str) -> String {
    format!("{scheme}://{host}/api/agent/listener/{}/backend/{backend}", stream.as_str())
}

/// Narrow transport seam: one send, one receive, both fallible. A real
/// connection wraps `tokio_tungstenite`; tests supply an in-memory fake.
#[async_trait]
pub trait MessageTransport: Send {
    async fn send_text(&mut self, text: String) -> OsmoResult<()>;
    /// `Ok(None)` signals a clean close.
    async fn recv_text(&mut self) -> OsmoResult<Option<String>>;
}

pub struct WebSocketTransport<S> {
    stream: tokio_tungstenite::WebSocketStream<S>,
}

impl<S> WebSocketTransport<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
{
    pub fn new(stream: tokio_tungstenite::WebSocketStream<S>) -> Self {
        WebSocketTransport { stream }
    }
}

#[async_trait]
impl<S> MessageTransport for WebSocketTransport<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
{
    async fn send_text(&mut self, text: String) -> OsmoResult<()> {
        self.stream
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|err| OsmoError::with_source(ErrorKind::Transient, "websocket send failed", err))
    }

    async fn recv_text(&mut self) -> OsmoResult<Option<String>> {
        match self.stream.next().await {
            None => Ok(None),
            Some(Ok(WsMessage::Text(text))) => Ok(Some(text.to_string())),
            Some(Ok(WsMessage::Close(_))) => Ok(None),
            Some(Ok(_other)) => Ok(Some(String::new())),
            Some(Err(err)) => Err(OsmoError::with_source(ErrorKind::Transient, "websocket recv failed", err)),
        }
    }
}

/// Resolves the headers to attach to a new connection; refreshes the
/// underlying token when needed. A real implementation wraps OSMO's login
/// subsystem (§5: "retries on transient network errors with 5s backoff,
/// indefinitely").
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn headers(&self) -> OsmoResult<Vec<(String, String)>>;
}

/// Runs one stream's full connect → handshake → replay → steady-state
/// lifecycle, reconnecting with backoff on any transport error, until
/// `shutdown` resolves. `connect` is called fresh on every (re)connection
/// attempt so it can pick up refreshed auth headers.
pub async fn run_connection<T, C, F>(
    kind: StreamKind,
    init: InitBody,
    unacked: Arc<UnackedMessages>,
    mut outbound: mpsc::UnboundedReceiver<MessageBody>,
    control_inbound: mpsc::UnboundedSender<MessageBody>,
    mut connect: C,
    mut shutdown: tokio::sync::oneshot::Receiver<()>,
) -> OsmoResult<()>
where
    T: MessageTransport,
    C: FnMut() -> F,
    F: std::future::Future<Output = OsmoResult<T>>,
{
    loop {
        let mut transport = match connect().await {
            Ok(t) => t,
            Err(err) => {
                warn!(stream = kind.as_str(), error = %err, "connect failed, backing off");
                if sleep_or_shutdown(&mut shutdown).await {
                    return Ok(());
                }
                continue;
            }
        };

        let handshake = MessageBody::new(MessageType::Init(init.clone()));
        if transport.send_text(serde_json::to_string(&handshake)?).await.is_err() {
            if sleep_or_shutdown(&mut shutdown).await {
                return Ok(());
            }
            continue;
        }

        for message in unacked.replay_snapshot().await {
            if transport.send_text(serde_json::to_string(&message)?).await.is_err() {
                break;
            }
        }

        let result = if kind.is_receive_only() {
            recv_only_loop(&mut transport, &control_inbound, &mut shutdown).await
        } else {
            duplex_loop(&mut transport, &unacked, &mut outbound, &control_inbound, &mut shutdown).await
        };

        match result {
            Ok(ConnectionExit::Shutdown) => return Ok(()),
            Ok(ConnectionExit::Disconnected) | Err(_) => {
                metrics::send_counter("osmo_agent_disconnect_count", 1, &[("stream", kind.as_str())]);
                if sleep_or_shutdown(&mut shutdown).await {
                    return Ok(());
                }
            }
        }
    }
}

enum ConnectionExit {
    Disconnected,
    Shutdown,
}

async fn sleep_or_shutdown(shutdown: &mut tokio::sync::oneshot::Receiver<()>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(RECONNECT_BACKOFF) => false,
        _ = shutdown => true,
    }
}

async fn recv_only_loop<T: MessageTransport>(
    transport: &mut T,
    control_inbound: &mpsc::UnboundedSender<MessageBody>,
    shutdown: &mut tokio::sync::oneshot::Receiver<()>,
) -> OsmoResult<ConnectionExit> {
    loop {
        tokio::select! {
            received = transport.recv_text() => {
                match received? {
                    None => return Ok(ConnectionExit::Disconnected),
                    Some(text) if text.is_empty() => {}
                    Some(text) => {
                        let body: MessageBody = serde_json::from_str(&text)?;
                        let _ = control_inbound.send(body);
                    }
                }
            }
            _ = &mut *shutdown => return Ok(ConnectionExit::Shutdown),
        }
    }
}

async fn duplex_loop<T: MessageTransport>(
    transport: &mut T,
    unacked: &Arc<UnackedMessages>,
    outbound: &mut mpsc::UnboundedReceiver<MessageBody>,
    control_inbound: &mpsc::UnboundedSender<MessageBody>,
    shutdown: &mut tokio::sync::oneshot::Receiver<()>,
) -> OsmoResult<ConnectionExit> {
    loop {
        tokio::select! {
            outgoing = tokio::time::timeout(SEND_POLL_TIMEOUT, outbound.recv()) => {
                match outgoing {
                    Ok(Some(message)) => {
                        unacked.push(message.clone()).await;
                        transport.send_text(serde_json::to_string(&message)?).await?;
                    }
                    Ok(None) => return Ok(ConnectionExit::Shutdown),
                    Err(_timeout) => {}
                }
            }
            received = transport.recv_text() => {
                match received? {
                    None => return Ok(ConnectionExit::Disconnected),
                    Some(text) if text.is_empty() => {}
                    Some(text) => handle_inbound(&text, unacked, control_inbound).await?,
                }
            }
            _ = &mut *shutdown => return Ok(ConnectionExit::Shutdown),
        }
    }
}

async fn handle_inbound(
    text: &str,
    unacked: &Arc<UnackedMessages>,
    control_inbound: &mpsc::UnboundedSender<MessageBody>,
) -> OsmoResult<()> {
    let body: MessageBody = serde_json::from_str(text)?;
    match &body.message {
        MessageType::Ack(ack) => {
            unacked.ack(&ack.uuid).await;
        }
        MessageType::NodeConditions(_) => {
            let _ = control_inbound.send(body);
        }
        other => {
            warn!(kind = other.kind(), "unexpected message on non-control stream, ignoring");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tokio::sync::Mutex;

    #[test]
    fn stream_url_matches_the_documented_path_shape() {
        assert_eq!(
            stream_url("wss", "svc.example", StreamKind::Pod, "cluster-a"),
            "wss://svc.example/api/agent/listener/pod/backend/cluster-a"
        );
    }

    #[test]
    fn only_control_is_receive_only() {
        assert!(StreamKind::Control.is_receive_only());
        assert!(!StreamKind::Pod.is_receive_only());
        assert!(!StreamKind::Heartbeat.is_receive_only());
    }

    struct FakeTransport {
        inbound: Mutex<VecDeque<String>>,
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MessageTransport for FakeTransport {
        async fn send_text(&mut self, text: String) -> OsmoResult<()> {
            self.sent.lock().await.push(text);
            Ok(())
        }

        async fn recv_text(&mut self) -> OsmoResult<Option<String>> {
            Ok(self.inbound.lock().await.pop_front())
        }
    }

    #[tokio::test]
    async fn ack_on_duplex_stream_releases_the_unacked_entry() {
        let unacked = Arc::new(UnackedMessages::new(0));
        let body = MessageBody::heartbeat();
        let uuid = body.uuid.clone();
        unacked.push(body).await;
        assert_eq!(unacked.len().await, 1);

        let ack = MessageBody::ack_for(uuid);
        let (control_tx, _control_rx) = mpsc::unbounded_channel();
        handle_inbound(&serde_json::to_string(&ack).unwrap(), &unacked, &control_tx).await.unwrap();

        assert_eq!(unacked.len().await, 0);
    }

    #[tokio::test]
    async fn node_conditions_on_duplex_stream_are_routed_to_control_channel() {
        let unacked = Arc::new(UnackedMessages::new(0));
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        let node_conditions = MessageBody::new(MessageType::NodeConditions(crate::messages::NodeConditionsBody {
            rules: Default::default(),
        }));
        handle_inbound(&serde_json::to_string(&node_conditions).unwrap(), &unacked, &control_tx).await.unwrap();
        let routed = control_rx.try_recv().unwrap();
        assert!(matches!(routed.message, MessageType::NodeConditions(_)));
    }
}
