use std::path::{Path, PathBuf};

use armada_core::types::NodeId;
use tracing::{debug, info};

use crate::error::AgentError;

/// Resolves the node's stable identity: a configured id wins, else the
/// persisted file value, else a fresh id is generated and persisted for
/// reuse across restarts. The hub may still override the id for the
/// duration of a session; that override is never written back here.
#[derive(Debug, Clone)]
pub struct FileIdentityStore {
    path: PathBuf,
}

impl FileIdentityStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::data_dir().map_or_else(
            || PathBuf::from(".armada-node-id"),
            |dir| dir.join("armada").join("node-id"),
        )
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn resolve(&self, configured: Option<&NodeId>) -> Result<NodeId, AgentError> {
        if let Some(node_id) = configured {
            debug!(%node_id, "Using configured node identity");
            return Ok(node_id.clone());
        }

        match std::fs::read_to_string(&self.path) {
            Ok(contents) => {
                let trimmed = contents.trim();
                if !trimmed.is_empty() {
                    debug!(path = %self.path.display(), "Loaded persisted node identity");
                    return Ok(NodeId::new(trimmed));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(AgentError::Identity(format!(
                    "Failed to read {}: {e}",
                    self.path.display()
                )));
            }
        }

        let node_id = NodeId::generate();
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    AgentError::Identity(format!(
                        "Failed to create {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }
        std::fs::write(&self.path, node_id.as_str()).map_err(|e| {
            AgentError::Identity(format!("Failed to write {}: {e}", self.path.display()))
        })?;

        info!(%node_id, path = %self.path.display(), "Generated and persisted node identity");
        Ok(node_id)
    }
}
