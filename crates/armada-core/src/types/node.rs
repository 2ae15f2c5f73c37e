use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    #[default]
    Worker,
    Companion,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Worker => write!(f, "worker"),
            Self::Companion => write!(f, "companion"),
        }
    }
}

impl NodeType {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "worker" => Some(Self::Worker),
            "companion" => Some(Self::Companion),
            _ => None,
        }
    }
}

/// Status reported in heartbeats and echoed by the hub.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatusKind {
    Online,
    Offline,
    Busy,
    #[default]
    Unknown,
}

impl NodeStatusKind {
    #[must_use]
    pub const fn is_online(self) -> bool {
        matches!(self, Self::Online | Self::Busy)
    }
}

impl fmt::Display for NodeStatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
            Self::Busy => write!(f, "busy"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Orchestrator counters carried in `node_register` and `heartbeat`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeStats {
    pub active_tasks: u64,
    pub total_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
}

impl NodeStats {
    #[must_use]
    pub const fn new(
        active_tasks: u64,
        total_tasks: u64,
        completed_tasks: u64,
        failed_tasks: u64,
    ) -> Self {
        Self {
            active_tasks,
            total_tasks,
            completed_tasks,
            failed_tasks,
        }
    }

    /// The zeroed stats sent with the very first registration.
    #[must_use]
    pub const fn zeroed() -> Self {
        Self::new(0, 0, 0, 0)
    }

    #[must_use]
    pub const fn is_busy(&self) -> bool {
        self.active_tasks > 0
    }
}
