use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfigFile {
    pub hub_addr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub node_name: String,
    pub node_type: String,
    pub capabilities: Vec<String>,
    pub heartbeat_interval_secs: u64,
    pub max_concurrent_tasks: usize,
    pub default_task_timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_path: Option<String>,
}

impl Default for AgentConfigFile {
    fn default() -> Self {
        Self {
            hub_addr: "127.0.0.1:7600".to_string(),
            auth_token: None,
            node_id: None,
            node_name: "armada-node".to_string(),
            node_type: "worker".to_string(),
            capabilities: Vec::new(),
            heartbeat_interval_secs: 30,
            max_concurrent_tasks: 4,
            default_task_timeout_secs: 60,
            identity_path: None,
        }
    }
}

impl AgentConfigFile {
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("ARMADA_HUB_ADDR") {
            self.hub_addr = val;
        }
        if let Ok(val) = std::env::var("ARMADA_AUTH_TOKEN") {
            self.auth_token = Some(val);
        }
        if let Ok(val) = std::env::var("ARMADA_NODE_ID") {
            self.node_id = Some(val);
        }
        if let Ok(val) = std::env::var("ARMADA_NODE_NAME") {
            self.node_name = val;
        }
        if let Ok(val) = std::env::var("ARMADA_NODE_TYPE") {
            self.node_type = val;
        }
        if let Ok(val) = std::env::var("ARMADA_MAX_CONCURRENT") {
            if let Ok(parsed) = val.parse() {
                self.max_concurrent_tasks = parsed;
            }
        }
        if let Ok(val) = std::env::var("ARMADA_HEARTBEAT_SECS") {
            if let Ok(parsed) = val.parse() {
                self.heartbeat_interval_secs = parsed;
            }
        }
    }
}
