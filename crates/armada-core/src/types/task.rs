use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::id::{NodeId, TaskId};

/// Priority assumed when an assignment carries none. Higher values run first.
pub const DEFAULT_TASK_PRIORITY: i64 = 5;

/// Machine-readable codes carried by errors that cross the wire.
pub mod error_codes {
    pub const CAPABILITY_NOT_SUPPORTED: &str = "capability_not_supported";
    pub const TASK_TIMEOUT: &str = "task_timeout";
    pub const TASK_FAILED: &str = "task_failed";
    pub const NODE_NOT_REGISTERED: &str = "node_not_registered";
    pub const REQUEST_CANCELLED: &str = "request_cancelled";
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const INFERENCE_FAILED: &str = "inference_failed";
}

/// One unit of work pushed by the hub. Immutable once received.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAssignment {
    pub task_id: TaskId,
    pub node_id: NodeId,
    pub tool_name: String,
    #[serde(default)]
    pub tool_args: Value,
    #[serde(default, rename = "timeout", skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl TaskAssignment {
    #[must_use]
    pub fn new(task_id: TaskId, node_id: NodeId, tool_name: impl Into<String>) -> Self {
        Self {
            task_id,
            node_id,
            tool_name: tool_name.into(),
            tool_args: Value::Null,
            timeout_ms: None,
            priority: None,
            metadata: None,
        }
    }

    #[must_use]
    pub fn with_args(mut self, args: Value) -> Self {
        self.tool_args = args;
        self
    }

    #[must_use]
    pub const fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    #[must_use]
    pub fn effective_priority(&self) -> i64 {
        self.priority.unwrap_or(DEFAULT_TASK_PRIORITY)
    }
}

/// Structured failure detail sent inside a `task_result`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(rename_all = "camelCase")]
#[error("{code}: {message}")]
pub struct TaskError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl TaskError {
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(error_codes::TASK_TIMEOUT, message)
    }

    #[must_use]
    pub fn capability_not_supported(tool_name: &str) -> Self {
        Self::new(
            error_codes::CAPABILITY_NOT_SUPPORTED,
            format!("No handler registered for tool '{tool_name}'"),
        )
    }
}

/// Outcome of one assignment. Created exactly once and sent exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_id: TaskId,
    pub node_id: NodeId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
}

impl TaskResult {
    #[must_use]
    pub fn success(task_id: TaskId, node_id: NodeId, result: Value, elapsed_ms: u64) -> Self {
        Self {
            task_id,
            node_id,
            success: true,
            result: Some(result),
            error: None,
            execution_time_ms: Some(elapsed_ms),
        }
    }

    #[must_use]
    pub fn failure(task_id: TaskId, node_id: NodeId, error: TaskError, elapsed_ms: u64) -> Self {
        Self {
            task_id,
            node_id,
            success: false,
            result: None,
            error: Some(error),
            execution_time_ms: Some(elapsed_ms),
        }
    }
}
