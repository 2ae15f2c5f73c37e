use std::sync::Arc;

use armada_core::traits::ToolHandler;
use armada_core::types::NodeStats;
use armada_transport_tcp::TcpTransportFactory;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, instrument};

use crate::config::AgentConfig;
use crate::connection::ConnectionManager;
use crate::error::AgentError;
use crate::identity::FileIdentityStore;
use crate::inference::InferenceProxy;
use crate::protocol::{ProtocolClient, RegistrationProfile};
use crate::registry::ToolRegistry;
use crate::scheduler::{TaskOrchestrator, TaskStats};

/// Wires the whole node together: identity → connection → protocol client →
/// orchestrator + inference proxy.
///
/// Tools are registered on the shared registry before or after `start`;
/// the tool list the hub sees is re-read at every (re)registration.
pub struct NodeAgent {
    config: AgentConfig,
    registry: Arc<ToolRegistry>,
    shutdown_tx: broadcast::Sender<()>,
    stats: TaskStats,
    protocol: Option<ProtocolClient>,
    orchestrator: Option<TaskOrchestrator>,
    proxy: Option<InferenceProxy>,
    assignment_loop: Option<JoinHandle<()>>,
}

impl NodeAgent {
    #[must_use]
    pub fn new(config: AgentConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            registry: Arc::new(ToolRegistry::new()),
            shutdown_tx,
            stats: TaskStats::new(),
            protocol: None,
            orchestrator: None,
            proxy: None,
            assignment_loop: None,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &AgentConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> Arc<ToolRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn register_tool(&self, name: impl Into<String>, handler: Arc<dyn ToolHandler>) {
        self.registry.register(name, handler);
    }

    #[must_use]
    pub fn stats(&self) -> NodeStats {
        self.stats.snapshot()
    }

    /// Handle to the inference proxy, available once `start` has run.
    #[must_use]
    pub fn inference(&self) -> Option<InferenceProxy> {
        self.proxy.clone()
    }

    #[must_use]
    pub const fn orchestrator(&self) -> Option<&TaskOrchestrator> {
        self.orchestrator.as_ref()
    }

    #[must_use]
    pub const fn protocol(&self) -> Option<&ProtocolClient> {
        self.protocol.as_ref()
    }

    #[must_use]
    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Resolves identity, dials the hub, and brings up every component.
    /// Returns once the agent is connected and serving.
    #[instrument(skip(self), fields(hub = %self.config.hub_addr))]
    pub async fn start(&mut self) -> Result<(), AgentError> {
        let store = self.config.identity_path.as_ref().map_or_else(
            || FileIdentityStore::new(FileIdentityStore::default_path()),
            FileIdentityStore::new,
        );
        let node_id = store.resolve(self.config.node_id.as_ref())?;
        info!(%node_id, "Node identity resolved");

        let factory = TcpTransportFactory::with_config(self.config.transport.clone());
        let connection = ConnectionManager::start(
            factory,
            self.config.hub_addr,
            self.config.reconnect.clone(),
        )
        .await?;
        info!("Connected to hub");

        let profile = RegistrationProfile {
            name: self.config.node_name.clone(),
            node_type: self.config.node_type,
            capabilities: self.config.capabilities.clone(),
            config: self.registration_config(),
            registry: Arc::clone(&self.registry),
        };
        let (protocol, channels) = ProtocolClient::start(
            connection,
            profile,
            node_id,
            self.stats.clone(),
            self.config.heartbeat_interval,
        )?;

        let proxy = InferenceProxy::start(
            protocol.sender(),
            protocol.session(),
            channels.inference,
        );
        let orchestrator = TaskOrchestrator::new(
            Arc::clone(&self.registry),
            protocol.sender(),
            protocol.session(),
            self.stats.clone(),
            self.config.max_concurrent_tasks,
            self.config.default_task_timeout,
        );
        let assignment_loop = orchestrator.spawn_assignment_loop(channels.assignments);

        self.protocol = Some(protocol);
        self.orchestrator = Some(orchestrator);
        self.proxy = Some(proxy);
        self.assignment_loop = Some(assignment_loop);
        Ok(())
    }

    /// Starts the agent and blocks until `shutdown` fires, then tears down
    /// gracefully.
    pub async fn run(&mut self) -> Result<(), AgentError> {
        self.start().await?;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let _ = shutdown_rx.recv().await;
        self.stop().await;
        Ok(())
    }

    /// Graceful teardown: stop accepting assignments, send the farewell,
    /// clear the heartbeat, close the transport.
    pub async fn stop(&mut self) {
        info!("Agent shutting down");
        if let Some(orchestrator) = &self.orchestrator {
            orchestrator.stop();
        }
        if let Some(mut protocol) = self.protocol.take() {
            protocol.stop().await;
        }
        if let Some(handle) = self.assignment_loop.take() {
            handle.abort();
        }
    }

    fn registration_config(&self) -> serde_json::Value {
        json!({
            "maxConcurrentTasks": self.config.max_concurrent_tasks,
            "defaultTaskTimeoutMs": self.config.default_task_timeout.as_millis() as u64,
            "authToken": self.config.auth_token,
        })
    }
}

impl std::fmt::Debug for NodeAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeAgent")
            .field("config", &self.config)
            .field("started", &self.protocol.is_some())
            .field("tools", &self.registry.names())
            .finish_non_exhaustive()
    }
}
