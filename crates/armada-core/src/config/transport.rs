use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfigFile {
    pub connect_timeout_secs: u64,
    pub max_frame_size: usize,
    pub nodelay: bool,
}

impl Default for TransportConfigFile {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            max_frame_size: 16 * 1024 * 1024,
            nodelay: true,
        }
    }
}
