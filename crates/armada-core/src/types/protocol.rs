use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CodecError;
use crate::types::id::{NodeId, RequestId};
use crate::types::inference::{ChatMessage, InferenceOptions, UsageStats};
use crate::types::node::{NodeStats, NodeStatusKind, NodeType};
use crate::types::task::{TaskAssignment, TaskError, TaskResult};

/// Every message on the wire is one JSON object `{"type": ..., "data": ...}`.
///
/// Node→hub messages form a closed set and serialize through the derived
/// tag/content representation. Hub→node messages are decoded through an
/// explicit type switch so unrecognized types fall through to
/// [`HubMessage::Other`] instead of failing dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum NodeMessage {
    NodeRegister(RegisterData),
    Heartbeat(HeartbeatData),
    TaskResult(TaskResult),
    InferenceRequest(InferenceRequestData),
    NodeUnregister(UnregisterData),
}

impl NodeMessage {
    #[must_use]
    pub const fn message_type(&self) -> &'static str {
        match self {
            Self::NodeRegister(_) => "node_register",
            Self::Heartbeat(_) => "heartbeat",
            Self::TaskResult(_) => "task_result",
            Self::InferenceRequest(_) => "inference_request",
            Self::NodeUnregister(_) => "node_unregister",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub capabilities: Vec<String>,
    pub tools: Vec<String>,
    #[serde(default)]
    pub config: Value,
    pub stats: NodeStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatData {
    pub node_id: NodeId,
    pub status: NodeStatusKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<NodeStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceRequestData {
    pub request_id: RequestId,
    pub node_id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<InferenceOptions>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnregisterData {
    pub node_id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Typed view of everything the hub can push at the node.
#[derive(Debug, Clone)]
pub enum HubMessage {
    NodeRegistered(NodeRegisteredData),
    HeartbeatAck(HeartbeatAckData),
    TaskAssign(TaskAssignment),
    InferenceResponse(InferenceResponseData),
    InferenceResponseStream(InferenceStreamData),
    RateLimit(RateLimitData),
    Other { msg_type: String, data: Value },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    msg_type: String,
    #[serde(default)]
    data: Value,
}

impl HubMessage {
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, CodecError> {
        let envelope: Envelope = serde_json::from_slice(bytes)
            .map_err(|e| CodecError::DecodeFailed(e.to_string()))?;
        Self::from_envelope(envelope)
    }

    fn from_envelope(envelope: Envelope) -> Result<Self, CodecError> {
        let Envelope { msg_type, data } = envelope;
        let decoded = match msg_type.as_str() {
            "node_registered" => Self::NodeRegistered(decode_data(data)?),
            "heartbeat_ack" => Self::HeartbeatAck(decode_data(data)?),
            "task_assign" => Self::TaskAssign(decode_data(data)?),
            "inference_response" => Self::InferenceResponse(decode_data(data)?),
            "inference_response_stream" => Self::InferenceResponseStream(decode_data(data)?),
            "rate_limit" => Self::RateLimit(decode_data(data)?),
            _ => Self::Other { msg_type, data },
        };
        Ok(decoded)
    }

    #[must_use]
    pub fn message_type(&self) -> &str {
        match self {
            Self::NodeRegistered(_) => "node_registered",
            Self::HeartbeatAck(_) => "heartbeat_ack",
            Self::TaskAssign(_) => "task_assign",
            Self::InferenceResponse(_) => "inference_response",
            Self::InferenceResponseStream(_) => "inference_response_stream",
            Self::RateLimit(_) => "rate_limit",
            Self::Other { msg_type, .. } => msg_type,
        }
    }

    /// Encodes the hub-side representation. The node never sends these;
    /// this is for hub implementations and test fixtures.
    pub fn to_json_vec(&self) -> Result<Vec<u8>, CodecError> {
        let data = match self {
            Self::NodeRegistered(data) => encode_data(data)?,
            Self::HeartbeatAck(data) => encode_data(data)?,
            Self::TaskAssign(data) => encode_data(data)?,
            Self::InferenceResponse(data) => encode_data(data)?,
            Self::InferenceResponseStream(data) => encode_data(data)?,
            Self::RateLimit(data) => encode_data(data)?,
            Self::Other { data, .. } => data.clone(),
        };
        let envelope = Envelope {
            msg_type: self.message_type().to_string(),
            data,
        };
        serde_json::to_vec(&envelope).map_err(|e| CodecError::EncodeFailed(e.to_string()))
    }
}

fn decode_data<T: serde::de::DeserializeOwned>(data: Value) -> Result<T, CodecError> {
    serde_json::from_value(data).map_err(|e| CodecError::DecodeFailed(e.to_string()))
}

fn encode_data<T: Serialize>(data: &T) -> Result<Value, CodecError> {
    serde_json::to_value(data).map_err(|e| CodecError::EncodeFailed(e.to_string()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRegisteredData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatAckData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<NodeStatusKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

const fn default_true() -> bool {
    true
}

/// Hub-reported error payloads arrive either structured or as a bare string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorDetail {
    Structured(TaskError),
    Message(String),
}

impl ErrorDetail {
    #[must_use]
    pub fn into_task_error(self, fallback_code: &str) -> TaskError {
        match self {
            Self::Structured(err) => err,
            Self::Message(message) => TaskError::new(fallback_code, message),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceResponseData {
    pub request_id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceStreamData {
    pub request_id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(default)]
    pub chunk: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}
