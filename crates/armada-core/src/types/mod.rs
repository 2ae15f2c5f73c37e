mod id;
mod inference;
mod node;
mod protocol;
mod task;

pub use id::{NodeId, RequestId, TaskId};
pub use inference::{ChatMessage, InferenceOptions, InferenceReply, UsageStats};
pub use node::{NodeStats, NodeStatusKind, NodeType};
pub use protocol::{
    ErrorDetail, HeartbeatAckData, HeartbeatData, HubMessage, InferenceRequestData,
    InferenceResponseData, InferenceStreamData, NodeMessage, NodeRegisteredData, RateLimitData,
    RegisterData, UnregisterData,
};
pub use task::{error_codes, TaskAssignment, TaskError, TaskResult, DEFAULT_TASK_PRIORITY};
