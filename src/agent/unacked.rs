//! `UnackedMessages` (part of C10, §4.10/§4.7 "Shared-resource policy"): a
//! bounded, insertion-ordered buffer of messages sent but not yet
//! acknowledged by the central service. Owned by exactly one cooperative
//! task per stream — cross-thread access is not supported, matching the
//! single-writer discipline the spec calls for.
//!
//! Grounded on the teacher's bounded in-flight-request trackers; the ordered
//! map + notify-on-release shape is the idiomatic Rust translation of the
//! source's asyncio condition variable.

use std::collections::VecDeque;

use tokio::sync::Notify;

use crate::messages::MessageBody;

/// One buffered message: its wire uuid plus the body, so a replay after
/// reconnect can resend byte-for-byte what was queued.
struct Slot {
    uuid: String,
    body: MessageBody,
}

/// Bounded FIFO keyed by uuid. `push` blocks (cooperatively) once `len() ==
/// capacity`, released by any `ack`. `capacity == 0` means unbounded (used by
/// the test-only default).
pub struct UnackedMessages {
    capacity: usize,
    slots: tokio::sync::Mutex<VecDeque<Slot>>,
    released: Notify,
}

impl UnackedMessages {
    pub fn new(capacity: usize) -> Self {
        UnackedMessages { capacity, slots: tokio::sync::Mutex::new(VecDeque::new()), released: Notify::new() }
    }

    /// Inserts `body`, waiting for an ack to free a slot if the buffer is at
    /// capacity. Returns once the message is recorded.
    pub async fn push(&self, body: MessageBody) {
        loop {
            {
                let mut slots = self.slots.lock().await;
                if self.capacity == 0 || slots.len() < self.capacity {
                    slots.push_back(Slot { uuid: body.uuid.clone(), body });
                    return;
                }
            }
            self.released.notified().await;
        }
    }

    /// Removes the entry for `uuid`, if present, and wakes one waiting
    /// producer. Returns whether an entry was actually removed (a bare `ack`
    /// for an already-removed or unknown uuid is a no-op, not an error).
    pub async fn ack(&self, uuid: &str) -> bool {
        let removed = {
            let mut slots = self.slots.lock().await;
            if let Some(pos) = slots.iter().position(|s| s.uuid == uuid) {
                slots.remove(pos);
                true
            } else {
                false
            }
        };
        if removed {
            self.released.notify_one();
        }
        removed
    }

    /// Snapshot of every buffered message in insertion order, for replay
    /// immediately after reconnect (§4.10 step 3).
    pub async fn replay_snapshot(&self) -> Vec<MessageBody> {
        self.slots.lock().await.iter().map(|s| s.body.clone()).collect()
    }

    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }
}
