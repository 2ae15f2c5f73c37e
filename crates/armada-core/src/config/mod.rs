mod agent;
mod logging;
mod reconnect;
mod transport;

pub use agent::AgentConfigFile;
pub use logging::LoggingConfigFile;
pub use reconnect::ReconnectConfigFile;
pub use transport::TransportConfigFile;

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArmadaConfigFile {
    pub agent: AgentConfigFile,
    pub transport: TransportConfigFile,
    pub reconnect: ReconnectConfigFile,
    pub logging: LoggingConfigFile,
}

impl ArmadaConfigFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::NotFound(path.to_path_buf()))?;
        toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn apply_env_overrides(&mut self) {
        self.agent.apply_env_overrides();
        self.logging.apply_env_overrides();
    }
}
