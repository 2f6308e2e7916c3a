//! Operator message worker (C11, §4.11): a Redis Stream consumer-group
//! worker that drains agent-originated messages into the relational store.
//!
//! Grounded on the delayed-job monitor's poll-loop shape
//! ([`crate::jobs::delayed_monitor`]) and the crate's established
//! trait-plus-in-memory-fake split ([`crate::config::store`]):
//! [`OperatorMessageStream`] models the Redis Stream consumer-group
//! primitives (`XREADGROUP`/`XACK`/`XAUTOCLAIM`) this worker needs, so the
//! dispatch and ack/no-ack decision logic is unit-testable without a live
//! Redis instance. A production binding maps this trait directly onto the
//! `redis` crate's `streams` module.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::config::store::JobStore;
use crate::errors::{ErrorKind, OsmoResult};
use crate::messages::{MessageBody, MessageType, ResourceBody, ResourceUsageBody, UpdatePodBody};
use crate::metrics;

pub const STREAM_KEY: &str = "{osmo}:{message-queue}:operator_messages";
pub const GROUP: &str = "message_workers";
pub const MESSAGE_CLAIM_IDLE_TIME: Duration = Duration::from_millis(300_000);
pub const AUTOCLAIM_COUNT: usize = 10;
pub const AUTOCLAIM_START: &str = "0-0";
pub const READ_COUNT: usize = 1;
pub const READ_BLOCK: Duration = Duration::from_secs(1);
const AUTOCLAIM_EVERY_N_ITERATIONS: u64 = 10;

pub fn consumer_name(host: &str, pid: u32) -> String {
    format!("worker-{host}-{pid}")
}

/// One stream entry: the spec's `message` (JSON body) and `backend` fields,
/// plus the stream-assigned id needed to `XACK`/`XAUTOCLAIM` it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub message: String,
    pub backend: String,
}

/// Redis Stream consumer-group primitives, narrowed to what this worker
/// needs. `read_group`/`autoclaim` return already-decoded entries rather
/// than raw Redis reply types, keeping this trait transport-agnostic.
pub trait OperatorMessageStream: Send + Sync {
    /// Creates `group` on `stream` with `MKSTREAM` semantics; a group that
    /// already exists (Redis `BUSYGROUP`) is not an error.
    fn ensure_group(&self, stream: &str, group: &str) -> OsmoResult<()>;
    fn read_group(&self, stream: &str, group: &str, consumer: &str, count: usize, block: Duration) -> OsmoResult<Vec<StreamEntry>>;
    fn ack(&self, stream: &str, group: &str, id: &str) -> OsmoResult<()>;
    /// Reclaims entries idle for at least `min_idle`, starting the scan at
    /// `start`, for further processing by `consumer`.
    fn autoclaim(&self, stream: &str, group: &str, consumer: &str, min_idle: Duration, start: &str, count: usize) -> OsmoResult<Vec<StreamEntry>>;
}

/// Whether to `XACK` a processed entry, per §4.11's ack/no-ack policy:
/// success, deserialization failure, and unrecognized message types are all
/// acked (poison-pill safety and a genuine no-op respectively); any other
/// handler failure is left unacked so another worker can reclaim it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Ack,
    NoAck,
}

/// Handlers for the three message types the operator worker recognizes.
/// Implemented against the relational store; a fake records calls for tests.
pub trait OperatorHandlers: Send + Sync {
    fn handle_update_pod(&self, backend: &str, body: UpdatePodBody) -> OsmoResult<()>;
    fn handle_resource(&self, backend: &str, body: ResourceBody) -> OsmoResult<()>;
    fn handle_resource_usage(&self, backend: &str, body: ResourceUsageBody) -> OsmoResult<()>;
}

/// Writes each recognized message as a JSON blob keyed by `{backend}:{id}`,
/// one table per message type. Grounded on the frontend/backend job queue's
/// own use of [`JobStore`] as a plain keyed-row store (`jobs::JobQueue`).
pub struct JobStoreOperatorHandlers<'a> {
    store: &'a dyn JobStore,
}

impl<'a> JobStoreOperatorHandlers<'a> {
    pub fn new(store: &'a dyn JobStore) -> Self {
        JobStoreOperatorHandlers { store }
    }
}

impl OperatorHandlers for JobStoreOperatorHandlers<'_> {
    fn handle_update_pod(&self, backend: &str, body: UpdatePodBody) -> OsmoResult<()> {
        let key = format!("{backend}:{}:{}:{}", body.workflow_uuid, body.task_uuid, body.retry_id);
        self.store.upsert("pod_status", &key, &serde_json::to_string(&body)?)
    }

    fn handle_resource(&self, backend: &str, body: ResourceBody) -> OsmoResult<()> {
        let key = format!("{backend}:{}", body.hostname);
        self.store.upsert("node_resource", &key, &serde_json::to_string(&body)?)
    }

    fn handle_resource_usage(&self, backend: &str, body: ResourceUsageBody) -> OsmoResult<()> {
        let key = format!("{backend}:{}", body.hostname);
        self.store.upsert("node_resource_usage", &key, &serde_json::to_string(&body)?)
    }
}

/// Decodes one entry's `message` field and dispatches to the matching
/// handler, recording the §4.11 metrics pair. Pure aside from the handler
/// call and metrics emission, so the ack/no-ack decision is directly
/// testable against a fake [`OperatorHandlers`].
pub fn process_entry(handlers: &dyn OperatorHandlers, entry: &StreamEntry) -> ProcessOutcome {
    let body: MessageBody = match deserialize_body(&entry.message) {
        Ok(body) => body,
        Err(_) => return ProcessOutcome::Ack,
    };

    let type_tag = body.message.kind();
    let started = Instant::now();
    let result = match body.message {
        MessageType::UpdatePod(update_pod) => handlers.handle_update_pod(&entry.backend, update_pod),
        MessageType::Resource(resource) => handlers.handle_resource(&entry.backend, resource),
        MessageType::ResourceUsage(usage) => handlers.handle_resource_usage(&entry.backend, usage),
        _ => return ProcessOutcome::Ack,
    };

    metrics::send_histogram("osmo_backend_event_processing_time", started.elapsed().as_secs_f64(), &[("type", type_tag)]);
    metrics::send_counter("osmo_backend_event_count", 1, &[("type", type_tag)]);

    match result {
        Ok(()) => ProcessOutcome::Ack,
        Err(err) if err.kind() == ErrorKind::Poison => ProcessOutcome::Ack,
        Err(_) => ProcessOutcome::NoAck,
    }
}

fn deserialize_body<'de, T: Deserialize<'de>>(raw: &'de str) -> OsmoResult<T> {
    Ok(serde_json::from_str(raw)?)
}

fn process_and_ack(stream: &dyn OperatorMessageStream, handlers: &dyn OperatorHandlers, entry: &StreamEntry) -> OsmoResult<()> {
    if process_entry(handlers, entry) == ProcessOutcome::Ack {
        stream.ack(STREAM_KEY, GROUP, &entry.id)?;
    }
    Ok(())
}

/// Runs the consumer-group main loop described in §4.11 until `shutdown`
/// resolves: blocking-read one entry at a time, every 10th iteration first
/// reclaiming entries abandoned by a crashed consumer.
pub async fn run(
    stream: Arc<dyn OperatorMessageStream>,
    handlers: Arc<dyn OperatorHandlers>,
    consumer: String,
    mut shutdown: tokio::sync::oneshot::Receiver<()>,
) -> OsmoResult<()> {
    match stream.ensure_group(STREAM_KEY, GROUP) {
        Ok(()) | Err(_) => {}
    }

    let mut iteration: u64 = 0;
    loop {
        if shutdown.try_recv().is_ok() {
            return Ok(());
        }

        if iteration > 0 && iteration % AUTOCLAIM_EVERY_N_ITERATIONS == 0 {
            let claimed = stream.autoclaim(STREAM_KEY, GROUP, &consumer, MESSAGE_CLAIM_IDLE_TIME, AUTOCLAIM_START, AUTOCLAIM_COUNT)?;
            for entry in &claimed {
                process_and_ack(stream.as_ref(), handlers.as_ref(), entry)?;
            }
        }

        let entries = stream.read_group(STREAM_KEY, GROUP, &consumer, READ_COUNT, READ_BLOCK)?;
        for entry in &entries {
            process_and_ack(stream.as_ref(), handlers.as_ref(), entry)?;
        }

        iteration += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeHandlers {
        update_pod_calls: Mutex<Vec<(String, UpdatePodBody)>>,
        fail_update_pod_with: Mutex<Option<ErrorKind>>,
    }

    impl OperatorHandlers for FakeHandlers {
        fn handle_update_pod(&self, backend: &str, body: UpdatePodBody) -> OsmoResult<()> {
            if let Some(kind) = *self.fail_update_pod_with.lock().unwrap() {
                return Err(crate::errors::OsmoError::new(kind, "forced failure"));
            }
            self.update_pod_calls.lock().unwrap().push((backend.to_string(), body));
            Ok(())
        }

        fn handle_resource(&self, _backend: &str, _body: ResourceBody) -> OsmoResult<()> {
            Ok(())
        }

        fn handle_resource_usage(&self, _backend: &str, _body: ResourceUsageBody) -> OsmoResult<()> {
            Ok(())
        }
    }

    fn update_pod_entry() -> StreamEntry {
        let body = MessageBody::new(MessageType::UpdatePod(UpdatePodBody {
            workflow_uuid: "wf-1".to_string(),
            task_uuid: "task-1".to_string(),
            retry_id: 0,
            status: "RUNNING".to_string(),
            message: "".to_string(),
            exit_code: None,
        }));
        StreamEntry { id: "1-0".to_string(), message: serde_json::to_string(&body).unwrap(), backend: "cluster-a".to_string() }
    }

    #[test]
    fn recognized_message_dispatches_to_its_handler_and_acks() {
        let handlers = FakeHandlers::default();
        let entry = update_pod_entry();
        assert_eq!(process_entry(&handlers, &entry), ProcessOutcome::Ack);
        assert_eq!(handlers.update_pod_calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn malformed_json_is_acked_and_dropped() {
        let handlers = FakeHandlers::default();
        let entry = StreamEntry { id: "1-0".to_string(), message: "not json".to_string(), backend: "cluster-a".to_string() };
        assert_eq!(process_entry(&handlers, &entry), ProcessOutcome::Ack);
    }

    #[test]
    fn unrecognized_message_type_is_acked_and_dropped() {
        let handlers = FakeHandlers::default();
        let body = MessageBody::heartbeat();
        let entry = StreamEntry { id: "1-0".to_string(), message: serde_json::to_string(&body).unwrap(), backend: "cluster-a".to_string() };
        assert_eq!(process_entry(&handlers, &entry), ProcessOutcome::Ack);
    }

    #[test]
    fn transient_handler_failure_is_left_unacked_for_reclaim() {
        let handlers = FakeHandlers::default();
        *handlers.fail_update_pod_with.lock().unwrap() = Some(ErrorKind::Server);
        let entry = update_pod_entry();
        assert_eq!(process_entry(&handlers, &entry), ProcessOutcome::NoAck);
    }

    #[test]
    fn poison_handler_failure_is_acked_and_dropped() {
        let handlers = FakeHandlers::default();
        *handlers.fail_update_pod_with.lock().unwrap() = Some(ErrorKind::Poison);
        let entry = update_pod_entry();
        assert_eq!(process_entry(&handlers, &entry), ProcessOutcome::Ack);
    }

    #[test]
    fn consumer_name_embeds_host_and_pid() {
        assert_eq!(consumer_name("host-a", 42), "worker-host-a-42");
    }

    struct FakeStream {
        pending: Mutex<Vec<StreamEntry>>,
        acked: Mutex<Vec<String>>,
    }

    impl OperatorMessageStream for FakeStream {
        fn ensure_group(&self, _stream: &str, _group: &str) -> OsmoResult<()> {
            Ok(())
        }

        fn read_group(&self, _stream: &str, _group: &str, _consumer: &str, count: usize, _block: Duration) -> OsmoResult<Vec<StreamEntry>> {
            let mut pending = self.pending.lock().unwrap();
            let drained: Vec<StreamEntry> = pending.drain(..pending.len().min(count)).collect();
            Ok(drained)
        }

        fn ack(&self, _stream: &str, _group: &str, id: &str) -> OsmoResult<()> {
            self.acked.lock().unwrap().push(id.to_string());
            Ok(())
        }

        fn autoclaim(&self, _stream: &str, _group: &str, _consumer: &str, _min_idle: Duration, _start: &str, _count: usize) -> OsmoResult<Vec<StreamEntry>> {
            Ok(vec![])
        }
    }

    #[test]
    fn process_and_ack_only_acks_when_processing_decides_to() {
        let stream = FakeStream { pending: Mutex::new(vec![]), acked: Mutex::new(vec![]) };
        let handlers = FakeHandlers::default();
        let entry = update_pod_entry();
        process_and_ack(&stream, &handlers, &entry).unwrap();
        assert_eq!(stream.acked.lock().unwrap().as_slice(), &["1-0".to_string()]);
    }
}
