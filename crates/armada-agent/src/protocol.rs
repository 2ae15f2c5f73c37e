use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use armada_core::traits::Codec;
use armada_core::types::{
    HeartbeatData, HubMessage, InferenceResponseData, InferenceStreamData, NodeId,
    NodeRegisteredData, NodeStatusKind, NodeType, RateLimitData, RegisterData, TaskAssignment,
    UnregisterData,
};
use armada_core::NodeMessage;
use armada_message_json::JsonCodec;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionEvent, ConnectionManager, ConnectionSender, ConnectionState};
use crate::error::AgentError;
use crate::registry::ToolRegistry;
use crate::scheduler::TaskStats;

/// Per-session registration state shared across the protocol client, the
/// orchestrator, and the inference proxy.
///
/// The node id starts from local identity resolution; a hub-assigned id
/// adopted at registration is authoritative for the rest of the session.
pub struct SessionState {
    node_id: RwLock<NodeId>,
    registered: AtomicBool,
    last_heartbeat_ack: Mutex<Option<Instant>>,
}

impl SessionState {
    pub(crate) fn new(node_id: NodeId) -> Self {
        Self {
            node_id: RwLock::new(node_id),
            registered: AtomicBool::new(false),
            last_heartbeat_ack: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.node_id
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn set_node_id(&self, node_id: NodeId) {
        *self.node_id.write().unwrap_or_else(|e| e.into_inner()) = node_id;
    }

    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    pub(crate) fn set_registered(&self, registered: bool) {
        self.registered.store(registered, Ordering::Release);
    }

    #[must_use]
    pub fn last_heartbeat_ack(&self) -> Option<Instant> {
        *self
            .last_heartbeat_ack
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn record_heartbeat_ack(&self) {
        *self
            .last_heartbeat_ack
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }
}

impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionState")
            .field("node_id", &self.node_id())
            .field("registered", &self.is_registered())
            .finish_non_exhaustive()
    }
}

/// What the node tells the hub about itself at every registration.
#[derive(Clone)]
pub struct RegistrationProfile {
    pub name: String,
    pub node_type: NodeType,
    pub capabilities: Vec<String>,
    pub config: Value,
    pub registry: Arc<ToolRegistry>,
}

impl fmt::Debug for RegistrationProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistrationProfile")
            .field("name", &self.name)
            .field("node_type", &self.node_type)
            .field("capabilities", &self.capabilities)
            .field("tools", &self.registry.names())
            .finish_non_exhaustive()
    }
}

/// Encodes typed node→hub messages onto the connection's outbound queue.
#[derive(Debug, Clone)]
pub struct MessageSender {
    conn: ConnectionSender,
    codec: JsonCodec,
}

impl MessageSender {
    pub(crate) const fn new(conn: ConnectionSender) -> Self {
        Self {
            conn,
            codec: JsonCodec::new(),
        }
    }

    pub async fn send(&self, msg: &NodeMessage) -> Result<(), AgentError> {
        let frame = self.codec.encode(msg)?;
        self.conn.send(frame).await
    }
}

/// Lifecycle and catch-all events, published on a broadcast channel.
#[derive(Debug, Clone)]
pub enum ProtocolEvent {
    Registered { node_id: NodeId },
    RegistrationFailed { message: String },
    HeartbeatAck { timestamp: Option<i64> },
    Message { msg_type: String, data: Value },
}

/// Inference-related hub messages, routed to the proxy's dispatch loop.
#[derive(Debug)]
pub enum InferenceEvent {
    Response(InferenceResponseData),
    Stream(InferenceStreamData),
    RateLimit(RateLimitData),
}

/// Receivers handed to the orchestrator and the inference proxy.
#[derive(Debug)]
pub struct ProtocolChannels {
    pub assignments: mpsc::Receiver<TaskAssignment>,
    pub inference: mpsc::Receiver<InferenceEvent>,
}

/// Speaks the node↔hub protocol over one managed connection: registration
/// on every open, heartbeats while registered, typed dispatch of inbound
/// messages. Malformed and unknown frames never break the dispatch loop.
pub struct ProtocolClient {
    connection: ConnectionManager,
    sender: MessageSender,
    session: Arc<SessionState>,
    events_tx: broadcast::Sender<ProtocolEvent>,
    dispatch_handle: JoinHandle<()>,
}

impl ProtocolClient {
    pub fn start(
        mut connection: ConnectionManager,
        profile: RegistrationProfile,
        node_id: NodeId,
        stats: TaskStats,
        heartbeat_interval: Duration,
    ) -> Result<(Self, ProtocolChannels), AgentError> {
        let events = connection
            .take_events()
            .ok_or(AgentError::ConnectionClosed)?;

        let session = Arc::new(SessionState::new(node_id));
        let sender = MessageSender::new(connection.sender());
        let (events_tx, _) = broadcast::channel(64);
        let (assignment_tx, assignments) = mpsc::channel(256);
        let (inference_tx, inference) = mpsc::channel(256);

        let dispatcher = Dispatcher {
            events,
            sender: sender.clone(),
            session: Arc::clone(&session),
            stats,
            profile,
            heartbeat_interval,
            events_tx: events_tx.clone(),
            assignment_tx,
            inference_tx,
            heartbeat: None,
        };
        let dispatch_handle = tokio::spawn(dispatcher.run());

        let client = Self {
            connection,
            sender,
            session,
            events_tx,
            dispatch_handle,
        };
        Ok((
            client,
            ProtocolChannels {
                assignments,
                inference,
            },
        ))
    }

    #[must_use]
    pub fn sender(&self) -> MessageSender {
        self.sender.clone()
    }

    #[must_use]
    pub fn session(&self) -> Arc<SessionState> {
        Arc::clone(&self.session)
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProtocolEvent> {
        self.events_tx.subscribe()
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Best-effort farewell, then connection teardown. The dispatch loop
    /// ends once the connection actor is gone.
    pub async fn stop(&mut self) {
        if self.session.is_registered() {
            let farewell = NodeMessage::NodeUnregister(UnregisterData {
                node_id: self.session.node_id(),
                reason: Some("shutdown".to_string()),
            });
            if let Err(e) = self.sender.send(&farewell).await {
                debug!(error = %e, "Could not send farewell");
            }
        }
        self.connection.stop().await;
        self.dispatch_handle.abort();
    }
}

impl fmt::Debug for ProtocolClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolClient")
            .field("session", &self.session)
            .field("connection_state", &self.connection.state())
            .finish_non_exhaustive()
    }
}

struct Dispatcher {
    events: mpsc::Receiver<ConnectionEvent>,
    sender: MessageSender,
    session: Arc<SessionState>,
    stats: TaskStats,
    profile: RegistrationProfile,
    heartbeat_interval: Duration,
    events_tx: broadcast::Sender<ProtocolEvent>,
    assignment_tx: mpsc::Sender<TaskAssignment>,
    inference_tx: mpsc::Sender<InferenceEvent>,
    heartbeat: Option<JoinHandle<()>>,
}

impl Dispatcher {
    async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            match event {
                ConnectionEvent::Connected => self.handle_open().await,
                ConnectionEvent::Disconnected => self.handle_close(),
                ConnectionEvent::Frame(bytes) => self.handle_frame(&bytes).await,
            }
        }
        self.stop_heartbeat();
        debug!("Protocol dispatch loop ended");
    }

    async fn handle_open(&mut self) {
        let register = NodeMessage::NodeRegister(RegisterData {
            node_id: Some(self.session.node_id()),
            name: self.profile.name.clone(),
            node_type: self.profile.node_type,
            capabilities: self.profile.capabilities.clone(),
            tools: self.profile.registry.names(),
            config: self.profile.config.clone(),
            stats: self.stats.snapshot(),
        });
        info!(node_id = %self.session.node_id(), "Registering with hub");
        if let Err(e) = self.sender.send(&register).await {
            warn!(error = %e, "Failed to send registration");
        }
    }

    fn handle_close(&mut self) {
        self.stop_heartbeat();
        self.session.set_registered(false);
    }

    async fn handle_frame(&mut self, bytes: &[u8]) {
        let msg = match HubMessage::from_json_slice(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "Dropping malformed frame from hub");
                return;
            }
        };

        match msg {
            HubMessage::NodeRegistered(data) => self.handle_registered(data),
            HubMessage::HeartbeatAck(data) => {
                self.session.record_heartbeat_ack();
                let _ = self.events_tx.send(ProtocolEvent::HeartbeatAck {
                    timestamp: data.timestamp,
                });
            }
            HubMessage::TaskAssign(assignment) => {
                debug!(task_id = %assignment.task_id, tool = %assignment.tool_name, "Task assigned");
                if self.assignment_tx.send(assignment).await.is_err() {
                    warn!("Task assignment dropped: no consumer attached");
                }
            }
            HubMessage::InferenceResponse(data) => {
                self.forward_inference(InferenceEvent::Response(data)).await;
            }
            HubMessage::InferenceResponseStream(data) => {
                self.forward_inference(InferenceEvent::Stream(data)).await;
            }
            HubMessage::RateLimit(data) => {
                self.forward_inference(InferenceEvent::RateLimit(data)).await;
            }
            HubMessage::Other { msg_type, data } => {
                debug!(%msg_type, "Unrecognized hub message");
                let _ = self
                    .events_tx
                    .send(ProtocolEvent::Message { msg_type, data });
            }
        }
    }

    fn handle_registered(&mut self, data: NodeRegisteredData) {
        if !data.success {
            let message = data
                .message
                .unwrap_or_else(|| "no reason given".to_string());
            warn!(%message, "Hub rejected registration");
            let _ = self
                .events_tx
                .send(ProtocolEvent::RegistrationFailed { message });
            return;
        }

        if let Some(node_id) = data.node_id {
            if node_id != self.session.node_id() {
                info!(%node_id, "Adopting hub-assigned node id");
                self.session.set_node_id(node_id);
            }
        }
        self.session.set_registered(true);
        self.start_heartbeat();

        let node_id = self.session.node_id();
        info!(%node_id, "Registered with hub");
        let _ = self.events_tx.send(ProtocolEvent::Registered { node_id });
    }

    async fn forward_inference(&self, event: InferenceEvent) {
        if self.inference_tx.send(event).await.is_err() {
            warn!("Inference event dropped: proxy is not consuming");
        }
    }

    fn start_heartbeat(&mut self) {
        self.stop_heartbeat();
        self.heartbeat = Some(tokio::spawn(run_heartbeat_loop(
            self.sender.clone(),
            Arc::clone(&self.session),
            self.stats.clone(),
            self.heartbeat_interval,
        )));
    }

    fn stop_heartbeat(&mut self) {
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
    }
}

/// Immediate first beat, then one per interval tick, carrying live
/// orchestrator stats. Aborted on disconnect; restarted only after the next
/// successful registration.
async fn run_heartbeat_loop(
    sender: MessageSender,
    session: Arc<SessionState>,
    stats: TaskStats,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let snapshot = stats.snapshot();
        let status = if snapshot.is_busy() {
            NodeStatusKind::Busy
        } else {
            NodeStatusKind::Online
        };
        let beat = NodeMessage::Heartbeat(HeartbeatData {
            node_id: session.node_id(),
            status,
            stats: Some(snapshot),
        });
        if let Err(e) = sender.send(&beat).await {
            warn!(error = %e, "Heartbeat send failed");
            return;
        }
        debug!(node_id = %session.node_id(), %status, "Heartbeat sent");
    }
}
