pub mod agent;
pub mod config;
pub mod connection;
pub mod error;
pub mod identity;
pub mod inference;
pub mod protocol;
pub mod registry;
pub mod scheduler;

pub use agent::NodeAgent;
pub use config::AgentConfig;
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState, ReconnectPolicy};
pub use error::{AgentError, InferenceError};
pub use identity::FileIdentityStore;
pub use inference::{
    ChunkCallback, ChunkStream, InferenceCall, InferenceHandle, InferenceProxy,
    InferenceProxyEvent,
};
pub use protocol::{
    InferenceEvent, MessageSender, ProtocolChannels, ProtocolClient, ProtocolEvent,
    RegistrationProfile, SessionState,
};
pub use registry::ToolRegistry;
pub use scheduler::{TaskOrchestrator, TaskStats};
