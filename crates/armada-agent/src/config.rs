use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use armada_core::config::ArmadaConfigFile;
use armada_core::error::ConfigError;
use armada_core::types::{NodeId, NodeType};
use armada_transport_tcp::TcpConfig;

use crate::connection::ReconnectPolicy;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub hub_addr: SocketAddr,
    pub auth_token: Option<String>,
    pub node_id: Option<NodeId>,
    pub node_name: String,
    pub node_type: NodeType,
    pub capabilities: Vec<String>,
    pub heartbeat_interval: Duration,
    pub max_concurrent_tasks: usize,
    pub default_task_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub identity_path: Option<PathBuf>,
    pub transport: TcpConfig,
}

impl AgentConfig {
    #[must_use]
    pub fn new(hub_addr: SocketAddr) -> Self {
        Self {
            hub_addr,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_hub_addr(mut self, addr: SocketAddr) -> Self {
        self.hub_addr = addr;
        self
    }

    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    #[must_use]
    pub fn with_node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }

    #[must_use]
    pub fn with_node_name(mut self, name: impl Into<String>) -> Self {
        self.node_name = name.into();
        self
    }

    #[must_use]
    pub const fn with_node_type(mut self, node_type: NodeType) -> Self {
        self.node_type = node_type;
        self
    }

    #[must_use]
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    #[must_use]
    pub const fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max;
        self
    }

    #[must_use]
    pub const fn with_default_task_timeout(mut self, timeout: Duration) -> Self {
        self.default_task_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    #[must_use]
    pub fn with_identity_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_transport(mut self, transport: TcpConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn from_file(file: &ArmadaConfigFile) -> Result<Self, ConfigError> {
        let hub_addr: SocketAddr =
            file.agent
                .hub_addr
                .parse()
                .map_err(|_| ConfigError::InvalidValue {
                    key: "agent.hub_addr".to_string(),
                    reason: format!("'{}' is not a socket address", file.agent.hub_addr),
                })?;

        let node_type = NodeType::parse(&file.agent.node_type).ok_or_else(|| {
            ConfigError::InvalidValue {
                key: "agent.node_type".to_string(),
                reason: format!("'{}' is not 'worker' or 'companion'", file.agent.node_type),
            }
        })?;

        let reconnect = ReconnectPolicy::new()
            .with_initial_delay(Duration::from_millis(file.reconnect.initial_delay_ms))
            .with_max_delay(Duration::from_millis(file.reconnect.max_delay_ms))
            .with_multiplier(file.reconnect.multiplier);

        let transport = TcpConfig::new()
            .with_connect_timeout(Duration::from_secs(file.transport.connect_timeout_secs))
            .with_max_frame_size(file.transport.max_frame_size)
            .with_nodelay(file.transport.nodelay);

        Ok(Self {
            hub_addr,
            auth_token: file.agent.auth_token.clone(),
            node_id: file.agent.node_id.clone().map(NodeId::new),
            node_name: file.agent.node_name.clone(),
            node_type,
            capabilities: file.agent.capabilities.clone(),
            heartbeat_interval: Duration::from_secs(file.agent.heartbeat_interval_secs),
            max_concurrent_tasks: file.agent.max_concurrent_tasks,
            default_task_timeout: Duration::from_secs(file.agent.default_task_timeout_secs),
            reconnect,
            identity_path: file.agent.identity_path.clone().map(PathBuf::from),
            transport,
        })
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            hub_addr: SocketAddr::from(([127, 0, 0, 1], 7600)),
            auth_token: None,
            node_id: None,
            node_name: "armada-node".to_string(),
            node_type: NodeType::Worker,
            capabilities: Vec::new(),
            heartbeat_interval: Duration::from_secs(30),
            max_concurrent_tasks: 4,
            default_task_timeout: Duration::from_secs(60),
            reconnect: ReconnectPolicy::default(),
            identity_path: None,
            transport: TcpConfig::default(),
        }
    }
}
