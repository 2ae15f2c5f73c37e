#![allow(clippy::expect_used, clippy::panic)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use armada_agent::{
    AgentConfig, InferenceCall, InferenceError, NodeAgent, ProtocolEvent, ReconnectPolicy,
};
use armada_agent::ConnectionState;
use armada_core::traits::{FramedTransport, Listener, TaskContext, ToolHandler};
use armada_core::types::{
    HeartbeatAckData, HeartbeatData, HubMessage, InferenceRequestData, InferenceResponseData,
    InferenceStreamData, NodeId, NodeMessage, NodeRegisteredData, NodeStatusKind, RegisterData,
    TaskAssignment, TaskError, TaskId, TaskResult, UsageStats,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
struct HubOptions {
    respond_to_register: bool,
    accept_registration: bool,
    assigned_node_id: Option<&'static str>,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            respond_to_register: true,
            accept_registration: true,
            assigned_node_id: None,
        }
    }
}

enum HubAction {
    Send(HubMessage),
    SendRaw(Vec<u8>),
    Close,
}

/// In-process hub speaking real NDJSON over TCP. Accepts one connection at
/// a time, auto-acks heartbeats, and (optionally) auto-accepts
/// registrations; everything else is driven by the test.
struct MockHub {
    addr: SocketAddr,
    from_node: UnboundedReceiver<NodeMessage>,
    to_node: UnboundedSender<HubAction>,
    _task: JoinHandle<()>,
}

impl MockHub {
    async fn start(opts: HubOptions) -> Self {
        let listener = armada_transport_tcp::TcpListener::bind(
            "127.0.0.1:0".parse().expect("loopback"),
        )
        .await
        .expect("hub bind failed");
        let addr = listener.local_addr().expect("hub local addr");

        let (from_tx, from_node) = mpsc::unbounded_channel();
        let (to_node, mut to_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            loop {
                let Ok((transport, _)) = listener.accept().await else {
                    return;
                };
                if !serve_connection(&transport, &opts, &from_tx, &mut to_rx).await {
                    return;
                }
            }
        });

        Self {
            addr,
            from_node,
            to_node,
            _task: task,
        }
    }

    fn send(&self, msg: HubMessage) {
        self.to_node
            .send(HubAction::Send(msg))
            .expect("hub task gone");
    }

    fn send_raw(&self, bytes: Vec<u8>) {
        self.to_node
            .send(HubAction::SendRaw(bytes))
            .expect("hub task gone");
    }

    fn close_connection(&self) {
        self.to_node.send(HubAction::Close).expect("hub task gone");
    }

    fn assign(&self, assignment: TaskAssignment) {
        self.send(HubMessage::TaskAssign(assignment));
    }

    /// Receives node messages until one matches, discarding the rest.
    async fn recv_matching<F>(&mut self, mut pred: F) -> NodeMessage
    where
        F: FnMut(&NodeMessage) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let msg = self.from_node.recv().await.expect("hub channel closed");
                if pred(&msg) {
                    return msg;
                }
            }
        })
        .await
        .expect("timed out waiting for node message")
    }

    async fn next_register(&mut self) -> RegisterData {
        match self
            .recv_matching(|m| matches!(m, NodeMessage::NodeRegister(_)))
            .await
        {
            NodeMessage::NodeRegister(data) => data,
            _ => unreachable!(),
        }
    }

    async fn next_task_result(&mut self) -> TaskResult {
        match self
            .recv_matching(|m| matches!(m, NodeMessage::TaskResult(_)))
            .await
        {
            NodeMessage::TaskResult(result) => result,
            _ => unreachable!(),
        }
    }

    async fn next_inference_request(&mut self) -> InferenceRequestData {
        match self
            .recv_matching(|m| matches!(m, NodeMessage::InferenceRequest(_)))
            .await
        {
            NodeMessage::InferenceRequest(data) => data,
            _ => unreachable!(),
        }
    }

    /// Passes when no task_result arrives within the window.
    async fn assert_no_task_result(&mut self, window: Duration) {
        let watch = async {
            loop {
                match self.from_node.recv().await {
                    Some(NodeMessage::TaskResult(result)) => {
                        panic!("unexpected task result: {result:?}")
                    }
                    Some(_) => {}
                    None => return,
                }
            }
        };
        let _ = tokio::time::timeout(window, watch).await;
    }
}

async fn serve_connection(
    transport: &armada_transport_tcp::TcpTransport,
    opts: &HubOptions,
    from_tx: &UnboundedSender<NodeMessage>,
    to_rx: &mut UnboundedReceiver<HubAction>,
) -> bool {
    loop {
        tokio::select! {
            frame = transport.recv_frame() => {
                let Ok(frame) = frame else { return true };
                let Ok(msg) = serde_json::from_slice::<NodeMessage>(&frame) else { continue };
                auto_reply(transport, opts, &msg).await;
                let _ = from_tx.send(msg);
            }
            action = to_rx.recv() => match action {
                Some(HubAction::Send(msg)) => {
                    let bytes = msg.to_json_vec().expect("hub encode");
                    let _ = transport.send_frame(&bytes).await;
                }
                Some(HubAction::SendRaw(bytes)) => {
                    let _ = transport.send_frame(&bytes).await;
                }
                Some(HubAction::Close) => return true,
                None => return false,
            }
        }
    }
}

async fn auto_reply(
    transport: &armada_transport_tcp::TcpTransport,
    opts: &HubOptions,
    msg: &NodeMessage,
) {
    let reply = match msg {
        NodeMessage::NodeRegister(data) if opts.respond_to_register => {
            Some(HubMessage::NodeRegistered(NodeRegisteredData {
                node_id: opts
                    .assigned_node_id
                    .map(NodeId::new)
                    .or_else(|| data.node_id.clone()),
                success: opts.accept_registration,
                message: (!opts.accept_registration).then(|| "node quota reached".to_string()),
            }))
        }
        NodeMessage::Heartbeat(_) => Some(HubMessage::HeartbeatAck(HeartbeatAckData {
            node_id: None,
            success: true,
            status: Some(NodeStatusKind::Online),
            timestamp: Some(1),
        })),
        _ => None,
    };
    if let Some(reply) = reply {
        let bytes = reply.to_json_vec().expect("hub encode");
        let _ = transport.send_frame(&bytes).await;
    }
}

/// Builds and starts an agent against the mock hub. `setup` runs before
/// `start`, so tools registered there are in the first registration's list.
async fn start_agent(
    hub_addr: SocketAddr,
    configure: impl FnOnce(AgentConfig) -> AgentConfig,
    setup: impl FnOnce(&NodeAgent),
) -> (NodeAgent, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = AgentConfig::new(hub_addr)
        .with_node_name("test-node")
        .with_heartbeat_interval(Duration::from_secs(60))
        .with_identity_path(dir.path().join("node-id"))
        .with_reconnect(
            ReconnectPolicy::new()
                .with_initial_delay(Duration::from_millis(50))
                .with_max_delay(Duration::from_secs(1))
                .with_multiplier(2.0),
        );
    let mut agent = NodeAgent::new(configure(config));
    setup(&agent);
    agent.start().await.expect("agent start failed");
    (agent, dir)
}

async fn wait_registered(agent: &NodeAgent) {
    let session = agent.protocol().expect("protocol missing").session();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !session.is_registered() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("registration timed out");
}

async fn wait_disconnected(agent: &NodeAgent) {
    let protocol = agent.protocol().expect("protocol missing");
    tokio::time::timeout(Duration::from_secs(5), async {
        while protocol.connection_state() == ConnectionState::Connected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("disconnect timed out");
}

fn assignment(task_id: &str, tool: &str) -> TaskAssignment {
    TaskAssignment::new(TaskId::new(task_id), NodeId::new("any"), tool)
}

struct EchoTool;

#[async_trait]
impl ToolHandler for EchoTool {
    async fn execute(&self, args: Value, _ctx: TaskContext) -> Result<Value, TaskError> {
        Ok(args)
    }
}

struct SlowTool {
    hold: Duration,
    concurrent: Arc<AtomicUsize>,
    max_seen: Arc<AtomicUsize>,
}

#[async_trait]
impl ToolHandler for SlowTool {
    async fn execute(&self, _args: Value, _ctx: TaskContext) -> Result<Value, TaskError> {
        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.hold).await;
        self.concurrent.fetch_sub(1, Ordering::SeqCst);
        Ok(json!({"done": true}))
    }
}

struct RecorderTool {
    order: Arc<Mutex<Vec<String>>>,
    gate: Arc<Notify>,
}

#[async_trait]
impl ToolHandler for RecorderTool {
    async fn execute(&self, args: Value, ctx: TaskContext) -> Result<Value, TaskError> {
        self.order
            .lock()
            .expect("order lock")
            .push(ctx.task_id.to_string());
        if args["block"] == json!(true) {
            self.gate.notified().await;
        }
        Ok(Value::Null)
    }
}

struct PatientTool {
    observed_cancel: Arc<AtomicBool>,
}

#[async_trait]
impl ToolHandler for PatientTool {
    async fn execute(&self, _args: Value, ctx: TaskContext) -> Result<Value, TaskError> {
        tokio::select! {
            () = tokio::time::sleep(Duration::from_secs(30)) => Ok(json!({"finished": true})),
            () = ctx.cancel.cancelled() => {
                self.observed_cancel.store(true, Ordering::SeqCst);
                Err(TaskError::new("cancelled", "handler observed cancellation"))
            }
        }
    }
}

#[tokio::test]
async fn registration_handshake_adopts_hub_node_id() {
    let mut hub = MockHub::start(HubOptions {
        assigned_node_id: Some("hub-fleet-7"),
        ..HubOptions::default()
    })
    .await;

    let (agent, _dir) = start_agent(
        hub.addr,
        |c| {
            c.with_node_id(NodeId::new("local-id"))
                .with_capability("chat")
        },
        |agent| agent.register_tool("echo", Arc::new(EchoTool)),
    )
    .await;

    let register = hub.next_register().await;
    assert_eq!(register.name, "test-node");
    assert_eq!(register.node_id, Some(NodeId::new("local-id")));
    assert_eq!(register.capabilities, vec!["chat"]);
    assert!(register.tools.contains(&"echo".to_string()));
    assert_eq!(register.stats.total_tasks, 0);

    wait_registered(&agent).await;
    let session = agent.protocol().expect("protocol").session();
    assert_eq!(session.node_id().as_str(), "hub-fleet-7");

    // The immediate post-registration heartbeat carries the adopted id.
    let beat = hub
        .recv_matching(|m| matches!(m, NodeMessage::Heartbeat(_)))
        .await;
    match beat {
        NodeMessage::Heartbeat(data) => {
            assert_eq!(data.node_id.as_str(), "hub-fleet-7");
            assert!(data.stats.is_some());
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn task_executes_and_reports_success() {
    let mut hub = MockHub::start(HubOptions::default()).await;
    let (agent, _dir) = start_agent(hub.addr, |c| c, |agent| {
        agent.register_tool("echo", Arc::new(EchoTool));
    })
    .await;
    wait_registered(&agent).await;

    hub.assign(assignment("t-1", "echo").with_args(json!({"x": 1})));

    let result = hub.next_task_result().await;
    assert_eq!(result.task_id.as_str(), "t-1");
    assert!(result.success);
    assert_eq!(result.result, Some(json!({"x": 1})));
    assert!(result.execution_time_ms.is_some());
    assert!(result.error.is_none());
}

#[tokio::test]
async fn unknown_tool_yields_exactly_one_failure() {
    let mut hub = MockHub::start(HubOptions::default()).await;
    let (agent, _dir) = start_agent(hub.addr, |c| c, |_| {}).await;
    wait_registered(&agent).await;

    hub.assign(assignment("t-missing", "nonexistent"));

    let result = hub.next_task_result().await;
    assert_eq!(result.task_id.as_str(), "t-missing");
    assert!(!result.success);
    assert_eq!(
        result.error.as_ref().map(|e| e.code.as_str()),
        Some("capability_not_supported")
    );

    hub.assert_no_task_result(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn concurrency_bound_is_never_exceeded() {
    let mut hub = MockHub::start(HubOptions::default()).await;
    let concurrent = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let tool = Arc::new(SlowTool {
        hold: Duration::from_millis(150),
        concurrent: Arc::clone(&concurrent),
        max_seen: Arc::clone(&max_seen),
    });
    let (agent, _dir) = start_agent(hub.addr, |c| c.with_max_concurrent_tasks(2), |agent| {
        agent.register_tool("slow", tool);
    })
    .await;
    wait_registered(&agent).await;

    for i in 0..5 {
        hub.assign(assignment(&format!("t-{i}"), "slow"));
    }

    for _ in 0..5 {
        let result = hub.next_task_result().await;
        assert!(result.success);
    }
    assert!(max_seen.load(Ordering::SeqCst) <= 2, "bound exceeded");
    assert_eq!(concurrent.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn queued_tasks_run_in_priority_then_fifo_order() {
    let mut hub = MockHub::start(HubOptions::default()).await;
    let order = Arc::new(Mutex::new(Vec::new()));
    let gate = Arc::new(Notify::new());
    let tool = Arc::new(RecorderTool {
        order: Arc::clone(&order),
        gate: Arc::clone(&gate),
    });
    let (agent, _dir) = start_agent(hub.addr, |c| c.with_max_concurrent_tasks(1), |agent| {
        agent.register_tool("record", tool);
    })
    .await;
    wait_registered(&agent).await;

    // Occupy the single slot, then queue behind it.
    hub.assign(assignment("t-gate", "record").with_args(json!({"block": true})));
    tokio::time::timeout(Duration::from_secs(5), async {
        while order.lock().expect("order lock").len() < 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("gate task never started");

    hub.assign(assignment("t-p1", "record").with_priority(1));
    hub.assign(assignment("t-p9", "record").with_priority(9));
    hub.assign(assignment("t-p5a", "record").with_priority(5));
    hub.assign(assignment("t-p5b", "record").with_priority(5));

    // Give the queue a moment to hold all four before releasing the gate.
    tokio::time::sleep(Duration::from_millis(100)).await;
    gate.notify_one();

    for _ in 0..5 {
        let result = hub.next_task_result().await;
        assert!(result.success);
    }

    let recorded = order.lock().expect("order lock").clone();
    assert_eq!(recorded, vec!["t-gate", "t-p9", "t-p5a", "t-p5b", "t-p1"]);
}

#[tokio::test]
async fn timeout_fires_cancellation_and_reports_task_timeout() {
    let mut hub = MockHub::start(HubOptions::default()).await;
    let observed_cancel = Arc::new(AtomicBool::new(false));
    let tool = Arc::new(PatientTool {
        observed_cancel: Arc::clone(&observed_cancel),
    });
    let (agent, _dir) = start_agent(hub.addr, |c| c, |agent| {
        agent.register_tool("patient", tool);
    })
    .await;
    wait_registered(&agent).await;

    hub.assign(assignment("t-slow", "patient").with_timeout_ms(100));

    let result = hub.next_task_result().await;
    assert_eq!(result.task_id.as_str(), "t-slow");
    assert!(!result.success);
    assert_eq!(
        result.error.as_ref().map(|e| e.code.as_str()),
        Some("task_timeout")
    );
    assert!(result.execution_time_ms.unwrap_or(0) >= 100);

    // The handler saw the signal; no duplicate result follows.
    tokio::time::timeout(Duration::from_secs(1), async {
        while !observed_cancel.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("handler never observed cancellation");
    hub.assert_no_task_result(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn unary_inference_round_trip() {
    let mut hub = MockHub::start(HubOptions::default()).await;
    let (agent, _dir) = start_agent(hub.addr, |c| c, |_| {}).await;
    wait_registered(&agent).await;

    let proxy = agent.inference().expect("proxy");
    let handle = proxy
        .request(InferenceCall::prompt("what is the fleet status?"))
        .await
        .expect("request failed");

    let request = hub.next_inference_request().await;
    assert_eq!(request.request_id, handle.request_id());
    assert_eq!(request.messages.len(), 1);

    hub.send(HubMessage::InferenceResponse(InferenceResponseData {
        request_id: request.request_id,
        node_id: None,
        success: true,
        content: Some("all ships nominal".to_string()),
        usage: Some(UsageStats::new(12, 4)),
        error: None,
        timestamp: None,
    }));

    let reply = handle.wait().await.expect("wait failed");
    assert_eq!(reply.content, "all ships nominal");
    assert_eq!(reply.usage.map(|u| u.completion_tokens), Some(4));
}

#[tokio::test]
async fn interleaved_streams_stay_isolated() {
    let mut hub = MockHub::start(HubOptions::default()).await;
    let (agent, _dir) = start_agent(hub.addr, |c| c, |_| {}).await;
    wait_registered(&agent).await;

    let proxy = agent.inference().expect("proxy");
    let mut handle_a = proxy
        .request(InferenceCall::prompt("first").streaming())
        .await
        .expect("request a");
    let mut handle_b = proxy
        .request(InferenceCall::prompt("second").streaming())
        .await
        .expect("request b");

    let req_a = hub.next_inference_request().await;
    let req_b = hub.next_inference_request().await;
    assert_eq!(req_a.request_id, handle_a.request_id());
    assert_eq!(req_b.request_id, handle_b.request_id());

    let chunk = |id, text: &str, done| {
        HubMessage::InferenceResponseStream(InferenceStreamData {
            request_id: id,
            node_id: None,
            chunk: text.to_string(),
            done,
            usage: None,
            timestamp: None,
        })
    };

    // Interleave deliveries across the two requests.
    hub.send(chunk(req_a.request_id, "A1 ", false));
    hub.send(chunk(req_b.request_id, "B1 ", false));
    hub.send(chunk(req_a.request_id, "A2", false));
    hub.send(chunk(req_b.request_id, "B2", false));
    hub.send(chunk(req_a.request_id, "", true));
    hub.send(chunk(req_b.request_id, "", true));

    let mut stream_a = handle_a.take_chunks().expect("chunks a");
    let mut collected_a = String::new();
    while let Some(item) = stream_a.recv().await {
        collected_a.push_str(&item.expect("chunk a"));
    }

    let mut stream_b = handle_b.take_chunks().expect("chunks b");
    let mut collected_b = String::new();
    while let Some(item) = stream_b.recv().await {
        collected_b.push_str(&item.expect("chunk b"));
    }

    assert_eq!(collected_a, "A1 A2");
    assert_eq!(collected_b, "B1 B2");
    assert_eq!(handle_a.wait().await.expect("final a").content, "A1 A2");
    assert_eq!(handle_b.wait().await.expect("final b").content, "B1 B2");
}

#[tokio::test]
async fn cancel_beats_late_response() {
    let mut hub = MockHub::start(HubOptions::default()).await;
    let (agent, _dir) = start_agent(hub.addr, |c| c, |_| {}).await;
    wait_registered(&agent).await;

    let proxy = agent.inference().expect("proxy");
    let handle = proxy
        .request(InferenceCall::prompt("never mind"))
        .await
        .expect("request failed");
    let request = hub.next_inference_request().await;

    handle.cancel();
    hub.send(HubMessage::InferenceResponse(InferenceResponseData {
        request_id: request.request_id,
        node_id: None,
        success: true,
        content: Some("too late".to_string()),
        usage: None,
        error: None,
        timestamp: None,
    }));

    let result = handle.wait().await;
    assert!(matches!(result, Err(InferenceError::Cancelled)));
    assert_eq!(proxy.pending_count(), 0);
}

#[tokio::test]
async fn rejected_registration_surfaces_event_and_blocks_inference() {
    let mut hub = MockHub::start(HubOptions {
        respond_to_register: false,
        ..HubOptions::default()
    })
    .await;
    let (agent, _dir) = start_agent(hub.addr, |c| c, |_| {}).await;

    let _register = hub.next_register().await;
    let protocol = agent.protocol().expect("protocol");
    let mut events = protocol.subscribe();

    // Unregistered: inference fails synchronously, before the wire.
    let proxy = agent.inference().expect("proxy");
    let result = proxy.request(InferenceCall::prompt("hello")).await;
    assert!(matches!(result, Err(InferenceError::NotRegistered)));

    hub.send(HubMessage::NodeRegistered(NodeRegisteredData {
        node_id: None,
        success: false,
        message: Some("node quota reached".to_string()),
    }));

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event timeout")
        .expect("event channel closed");
    match event {
        ProtocolEvent::RegistrationFailed { message } => {
            assert_eq!(message, "node quota reached");
        }
        other => panic!("expected registration failure, got {other:?}"),
    }
    assert!(!protocol.session().is_registered());
}

#[tokio::test]
async fn reconnect_flushes_queued_frames_in_order_and_reregisters() {
    let mut hub = MockHub::start(HubOptions::default()).await;
    let (agent, _dir) = start_agent(hub.addr, |c| c, |_| {}).await;
    wait_registered(&agent).await;

    hub.close_connection();
    wait_disconnected(&agent).await;

    // Outbound messages sent while disconnected queue in FIFO order.
    let sender = agent.protocol().expect("protocol").sender();
    for i in 1..=3 {
        sender
            .send(&NodeMessage::Heartbeat(HeartbeatData {
                node_id: NodeId::new(format!("q-{i}")),
                status: NodeStatusKind::Offline,
                stats: None,
            }))
            .await
            .expect("queue send failed");
    }

    let mut flushed = Vec::new();
    while flushed.len() < 3 {
        let msg = hub
            .recv_matching(|m| {
                matches!(m, NodeMessage::Heartbeat(h) if h.node_id.as_str().starts_with("q-"))
            })
            .await;
        if let NodeMessage::Heartbeat(data) = msg {
            flushed.push(data.node_id.as_str().to_string());
        }
    }
    assert_eq!(flushed, vec!["q-1", "q-2", "q-3"]);

    // A fresh registration follows the reconnect.
    wait_registered(&agent).await;
}

#[tokio::test]
async fn malformed_and_unknown_frames_do_not_break_dispatch() {
    let mut hub = MockHub::start(HubOptions::default()).await;
    let (agent, _dir) = start_agent(hub.addr, |c| c, |agent| {
        agent.register_tool("echo", Arc::new(EchoTool));
    })
    .await;
    wait_registered(&agent).await;

    hub.send_raw(b"{this is not json".to_vec());
    hub.send(HubMessage::Other {
        msg_type: "fleet_broadcast".to_string(),
        data: json!({"announcement": "drill at noon"}),
    });

    // Dispatch survives both; a normal task still round-trips.
    hub.assign(assignment("t-after", "echo").with_args(json!({"ok": true})));
    let result = hub.next_task_result().await;
    assert_eq!(result.task_id.as_str(), "t-after");
    assert!(result.success);
}

#[tokio::test]
async fn stop_drains_queue_and_sends_farewell() {
    let mut hub = MockHub::start(HubOptions::default()).await;
    let order = Arc::new(Mutex::new(Vec::new()));
    let gate = Arc::new(Notify::new());
    let tool = Arc::new(RecorderTool {
        order: Arc::clone(&order),
        gate: Arc::clone(&gate),
    });
    let (mut agent, _dir) = start_agent(hub.addr, |c| c.with_max_concurrent_tasks(1), |agent| {
        agent.register_tool("record", tool);
    })
    .await;
    wait_registered(&agent).await;

    hub.assign(assignment("t-running", "record").with_args(json!({"block": true})));
    tokio::time::timeout(Duration::from_secs(5), async {
        while order.lock().expect("order lock").is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("task never started");
    hub.assign(assignment("t-queued", "record"));

    tokio::time::sleep(Duration::from_millis(100)).await;
    agent.stop().await;

    let farewell = hub
        .recv_matching(|m| matches!(m, NodeMessage::NodeUnregister(_)))
        .await;
    match farewell {
        NodeMessage::NodeUnregister(data) => {
            assert_eq!(data.reason.as_deref(), Some("shutdown"));
        }
        _ => unreachable!(),
    }

    // The queued task was drained without executing.
    let recorded = order.lock().expect("order lock").clone();
    assert_eq!(recorded, vec!["t-running"]);
}
