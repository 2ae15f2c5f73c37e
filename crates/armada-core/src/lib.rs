pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use error::{CodecError, ConfigError, TransportError};

pub use traits::{
    CancelSource, CancelToken, Codec, FramedTransport, Listener, TaskContext, ToolHandler,
    TransportFactory,
};

pub use types::{
    error_codes, ChatMessage, ErrorDetail, HeartbeatAckData, HeartbeatData, HubMessage,
    InferenceOptions, InferenceReply, InferenceRequestData, InferenceResponseData,
    InferenceStreamData, NodeId, NodeMessage, NodeRegisteredData, NodeStats, NodeStatusKind,
    NodeType, RateLimitData, RegisterData, RequestId, TaskAssignment, TaskError, TaskId,
    TaskResult, UnregisterData, UsageStats, DEFAULT_TASK_PRIORITY,
};
