//! Event-watch loop (§4.7.3): deduplicates Kubernetes events and emits
//! `pod_event` messages, including a synthesized event for pods preempted by
//! the kai-scheduler.

use k8s_openapi::api::core::v1::Event;

use crate::agent::listener::event_dedup::{parse_kai_preempted_pod, EventDedup, EventKey};
use crate::messages::PodEventBody;

const KAI_PREEMPTION_REASON_PREFIX: &str = "Evict";

fn last_timestamp(event: &Event) -> String {
    event
        .last_timestamp
        .as_ref()
        .map(|t| t.0.to_rfc3339())
        .or_else(|| event.event_time.as_ref().map(|t| t.0.to_rfc3339()))
        .unwrap_or_default()
}

/// Decides whether to emit a `pod_event` for one observed event, applying
/// the `(type, reason, involved_object_name)` dedup (§4.7.3). Returns `None`
/// for non-`Pod` events that also don't match the kai-scheduler preemption
/// message shape.
pub fn handle_event(event: &Event, dedup: &mut EventDedup) -> Option<PodEventBody> {
    let involved_name = event.involved_object.name.clone().unwrap_or_default();
    let event_type = event.type_.clone().unwrap_or_default();
    let reason = event.reason.clone().unwrap_or_default();
    let message = event.message.clone().unwrap_or_default();

    let key = EventKey { event_type: event_type.clone(), reason: reason.clone(), involved_object_name: involved_name.clone() };
    if !dedup.observe(key, &last_timestamp(event)) {
        return None;
    }

    if event.involved_object.kind.as_deref() == Some("Pod") {
        return Some(PodEventBody {
            task_uuid: None,
            event_type,
            reason,
            message,
        });
    }

    if reason.contains(KAI_PREEMPTION_REASON_PREFIX) {
        if let Some(preempted_pod) = parse_kai_preempted_pod(&message) {
            return Some(PodEventBody {
                task_uuid: None,
                event_type,
                reason,
                message: format!("pod {preempted_pod} was preempted: {message}"),
            });
        }
    }

    None
}
