use armada_core::types::{error_codes, TaskError};
use armada_core::{CodecError, ConfigError, TransportError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Connection to hub is closed")]
    ConnectionClosed,

    #[error("Identity error: {0}")]
    Identity(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Failure modes of one proxied inference exchange. Cloneable so the same
/// error can finalize the final promise and the chunk sequence.
#[derive(Debug, Clone, Error)]
pub enum InferenceError {
    #[error("Node is not registered with the hub")]
    NotRegistered,

    #[error("Request cancelled")]
    Cancelled,

    #[error("Rate limited by the hub")]
    RateLimited {
        message: Option<String>,
        retry_after_ms: Option<u64>,
    },

    #[error("Hub error: {0}")]
    Hub(TaskError),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Finalized without a result")]
    ChannelClosed,
}

impl InferenceError {
    /// The machine-readable code for this error, matching `error_codes`.
    #[must_use]
    pub fn code(&self) -> &str {
        match self {
            Self::NotRegistered => error_codes::NODE_NOT_REGISTERED,
            Self::Cancelled => error_codes::REQUEST_CANCELLED,
            Self::RateLimited { .. } => error_codes::RATE_LIMITED,
            Self::Hub(error) => &error.code,
            Self::SendFailed(_) | Self::ChannelClosed => error_codes::INFERENCE_FAILED,
        }
    }

    #[must_use]
    pub fn into_task_error(self) -> TaskError {
        match self {
            Self::Hub(error) => error,
            other => TaskError::new(other.code().to_string(), other.to_string()),
        }
    }
}
