//! The wire format for the agent websocket plane (§4.10) and operator
//! message worker (§4.11): a tagged union of message bodies, serialized as
//! `{type, body, uuid, timestamp}` JSON.
//!
//! Grounded on spec §3/§6; field names mirror the wire contract exactly
//! since the central service and every listener must agree on them.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InitBody {
    pub k8s_uid: String,
    pub k8s_namespace: String,
    pub version: String,
    pub node_condition_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PodLogBody {
    pub task_uuid: String,
    pub container: String,
    pub lines: Vec<String>,
    pub is_delimiter: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdatePodBody {
    pub workflow_uuid: String,
    pub task_uuid: String,
    pub retry_id: u32,
    pub status: String,
    pub message: String,
    pub exit_code: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceBody {
    pub hostname: String,
    pub available: bool,
    pub conditions: Vec<String>,
    pub allocatable_fields: BTreeMap<String, String>,
    pub label_fields: BTreeMap<String, String>,
    pub taints: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceUsageBody {
    pub hostname: String,
    pub overall: HashMap<String, f64>,
    pub excluding_workflow_namespaces: HashMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeleteResourceBody {
    pub hostname: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeHashBody {
    pub hostnames: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorPodBody {
    pub workflow_uuid: String,
    pub task_uuid: String,
    pub retry_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PodConditionsBody {
    pub task_uuid: String,
    pub conditions: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct HeartbeatBody {}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobStatusBody {
    pub job_id: String,
    pub status: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum LoggingType {
    Debug,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingBody {
    pub level: LoggingType,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PodEventBody {
    pub task_uuid: Option<String>,
    pub event_type: String,
    pub reason: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AckBody {
    pub uuid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeConditionsBody {
    pub rules: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum MessageType {
    Init(InitBody),
    PodLog(PodLogBody),
    UpdatePod(UpdatePodBody),
    Resource(ResourceBody),
    ResourceUsage(ResourceUsageBody),
    DeleteResource(DeleteResourceBody),
    NodeHash(NodeHashBody),
    MonitorPod(MonitorPodBody),
    PodConditions(PodConditionsBody),
    Heartbeat(HeartbeatBody),
    JobStatus(JobStatusBody),
    Logging(LoggingBody),
    PodEvent(PodEventBody),
    Ack(AckBody),
    NodeConditions(NodeConditionsBody),
}

impl MessageType {
    /// The discriminator string used in the `message-type` metrics tag.
    pub fn kind(&self) -> &'static str {
        match self {
            MessageType::Init(_) => "init",
            MessageType::PodLog(_) => "pod_log",
            MessageType::UpdatePod(_) => "update_pod",
            MessageType::Resource(_) => "resource",
            MessageType::ResourceUsage(_) => "resource_usage",
            MessageType::DeleteResource(_) => "delete_resource",
            MessageType::NodeHash(_) => "node_hash",
            MessageType::MonitorPod(_) => "monitor_pod",
            MessageType::PodConditions(_) => "pod_conditions",
            MessageType::Heartbeat(_) => "heartbeat",
            MessageType::JobStatus(_) => "job_status",
            MessageType::Logging(_) => "logging",
            MessageType::PodEvent(_) => "pod_event",
            MessageType::Ack(_) => "ack",
            MessageType::NodeConditions(_) => "node_conditions",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageBody {
    #[serde(flatten)]
    pub message: MessageType,
    pub uuid: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Sink for outbound messages over the agent websocket plane (§4.10).
/// Implemented by whatever owns a stream's send queue; job handlers (C6)
/// and the backend listener's watch loops (C7) both emit through this seam
/// instead of depending on the connection machinery directly.
pub trait MessageSink: Send + Sync {
    fn send(&self, message: MessageBody);
}

pub struct NullMessageSink;
impl MessageSink for NullMessageSink {
    fn send(&self, _message: MessageBody) {}
}

impl MessageBody {
    pub fn new(message: MessageType) -> Self {
        MessageBody { message, uuid: Uuid::new_v4().to_string(), timestamp: chrono::Utc::now() }
    }

    pub fn heartbeat() -> Self {
        MessageBody::new(MessageType::Heartbeat(HeartbeatBody::default()))
    }

    pub fn ack_for(uuid: impl Into<String>) -> Self {
        MessageBody::new(MessageType::Ack(AckBody { uuid: uuid.into() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json_preserving_tag() {
        let body = MessageBody::new(MessageType::DeleteResource(DeleteResourceBody {
            hostname: "node-a".to_string(),
        }));
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("\"type\":\"delete_resource\""));
        let parsed: MessageBody = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, body);
    }

    #[test]
    fn ack_references_prior_uuid() {
        let ack = MessageBody::ack_for("abc-123");
        match ack.message {
            MessageType::Ack(AckBody { uuid }) => assert_eq!(uuid, "abc-123"),
            _ => panic!("expected ack"),
        }
    }

    #[test]
    fn kind_returns_wire_discriminator() {
        let heartbeat = MessageBody::heartbeat();
        assert_eq!(heartbeat.message.kind(), "heartbeat");
    }
}
