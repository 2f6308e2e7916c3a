//! Integration test for spec §8 scenario 7: a crashed consumer's unacked
//! entry is reclaimed and completed by the next `autoclaim` sweep.

use std::sync::Mutex;
use std::time::Duration;

use osmo_core::config::store::{InMemoryJobStore, JobStore};
use osmo_core::errors::OsmoResult;
use osmo_core::messages::{MessageBody, MessageType, UpdatePodBody};
use osmo_core::operator_worker::{
    JobStoreOperatorHandlers, OperatorMessageStream, ProcessOutcome, StreamEntry,
};

/// Models one Redis Stream + consumer group: entries move from `pending`
/// (read but unacked) to `acked` on ack; `autoclaim` reclaims anything still
/// in `pending`, simulating a crashed consumer's idle entry past its claim
/// window.
struct FakeStream {
    unread: Mutex<Vec<StreamEntry>>,
    pending: Mutex<Vec<StreamEntry>>,
    acked: Mutex<Vec<String>>,
}

impl OperatorMessageStream for FakeStream {
    fn ensure_group(&self, _stream: &str, _group: &str) -> OsmoResult<()> {
        Ok(())
    }

    fn read_group(
        &self,
        _stream: &str,
        _group: &str,
        _consumer: &str,
        count: usize,
        _block: Duration,
    ) -> OsmoResult<Vec<StreamEntry>> {
        let mut unread = self.unread.lock().unwrap();
        let drained: Vec<StreamEntry> = unread.drain(..unread.len().min(count)).collect();
        self.pending.lock().unwrap().extend(drained.iter().cloned());
        Ok(drained)
    }

    fn ack(&self, _stream: &str, _group: &str, id: &str) -> OsmoResult<()> {
        self.pending.lock().unwrap().retain(|e| e.id != id);
        self.acked.lock().unwrap().push(id.to_string());
        Ok(())
    }

    fn autoclaim(
        &self,
        _stream: &str,
        _group: &str,
        _consumer: &str,
        _min_idle: Duration,
        _start: &str,
        count: usize,
    ) -> OsmoResult<Vec<StreamEntry>> {
        let pending = self.pending.lock().unwrap();
        Ok(pending.iter().take(count).cloned().collect())
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
fn crashed_consumers_entry_is_reclaimed_and_completed_by_the_next_autoclaim() {
    let stream = FakeStream {
        unread: Mutex::new(vec![update_pod_entry()]),
        pending: Mutex::new(vec![]),
        acked: Mutex::new(vec![]),
    };
    let job_store = InMemoryJobStore::new();
    let handlers = JobStoreOperatorHandlers::new(&job_store);

    // Consumer A: reads the entry but crashes before acking it.
    let entries = stream
        .read_group(osmo_core::operator_worker::STREAM_KEY, osmo_core::operator_worker::GROUP, "consumer-a", 1, Duration::from_secs(1))
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(stream.pending.lock().unwrap().len(), 1);
    assert!(stream.acked.lock().unwrap().is_empty());

    // Consumer B: the idle-entry claim window has passed, autoclaim hands it
    // back, and this time it's processed and acked.
    let claimed = stream
        .autoclaim(
            osmo_core::operator_worker::STREAM_KEY,
            osmo_core::operator_worker::GROUP,
            "consumer-b",
            osmo_core::operator_worker::MESSAGE_CLAIM_IDLE_TIME,
            osmo_core::operator_worker::AUTOCLAIM_START,
            osmo_core::operator_worker::AUTOCLAIM_COUNT,
        )
        .unwrap();
    assert_eq!(claimed.len(), 1);

    for entry in &claimed {
        assert_eq!(osmo_core::operator_worker::process_entry(&handlers, entry), ProcessOutcome::Ack);
        stream.ack(osmo_core::operator_worker::STREAM_KEY, osmo_core::operator_worker::GROUP, &entry.id).unwrap();
    }

    assert_eq!(stream.acked.lock().unwrap().as_slice(), &["1-0".to_string()]);
    assert!(stream.pending.lock().unwrap().is_empty());
    assert!(job_store.get("pod_status", "cluster-a:wf-1:task-1:0").unwrap().is_some());
}
