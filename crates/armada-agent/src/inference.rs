use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use armada_core::types::{
    error_codes, ChatMessage, InferenceOptions, InferenceReply, InferenceRequestData,
    InferenceResponseData, InferenceStreamData, RateLimitData, RequestId,
};
use armada_core::NodeMessage;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, instrument, warn};

use crate::error::InferenceError;
use crate::protocol::{InferenceEvent, MessageSender, SessionState};

pub type ChunkCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// One inference invocation. Streaming is requested through
/// `options.stream`; the optional callback fires per chunk in addition to
/// the pull-based [`ChunkStream`].
pub struct InferenceCall {
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub options: InferenceOptions,
    pub request_id: Option<RequestId>,
    on_chunk: Option<ChunkCallback>,
}

impl InferenceCall {
    #[must_use]
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            model: None,
            messages,
            options: InferenceOptions::default(),
            request_id: None,
            on_chunk: None,
        }
    }

    /// Single-turn prompt from one user message.
    #[must_use]
    pub fn prompt(text: impl Into<String>) -> Self {
        Self::new(vec![ChatMessage::user(text)])
    }

    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: InferenceOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub const fn streaming(mut self) -> Self {
        self.options.stream = true;
        self
    }

    /// Pin the correlation id instead of minting one. Used by tests and by
    /// callers that track requests externally.
    #[must_use]
    pub const fn with_request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = Some(request_id);
        self
    }

    #[must_use]
    pub fn on_chunk(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_chunk = Some(Arc::new(callback));
        self
    }

    #[must_use]
    pub const fn is_streaming(&self) -> bool {
        self.options.stream
    }
}

impl fmt::Debug for InferenceCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceCall")
            .field("model", &self.model)
            .field("messages", &self.messages.len())
            .field("stream", &self.options.stream)
            .field("request_id", &self.request_id)
            .finish_non_exhaustive()
    }
}

/// Pull side of a streaming request. Ends (`None`) when the hub terminates
/// the stream or the request is finalized; a failure surfaces as one final
/// `Err` item before the end.
#[derive(Debug)]
pub struct ChunkStream {
    rx: mpsc::UnboundedReceiver<Result<String, InferenceError>>,
}

impl ChunkStream {
    pub async fn recv(&mut self) -> Option<Result<String, InferenceError>> {
        self.rx.recv().await
    }
}

/// Handle for one in-flight request. Finalized exactly once: by the hub's
/// terminating message, by an error, or by `cancel`.
pub struct InferenceHandle {
    request_id: RequestId,
    final_rx: oneshot::Receiver<Result<InferenceReply, InferenceError>>,
    chunks: Option<ChunkStream>,
    proxy: InferenceProxy,
}

impl InferenceHandle {
    #[must_use]
    pub const fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// The chunk sequence, present only for streaming calls. Yields `None`
    /// after the first call.
    pub fn take_chunks(&mut self) -> Option<ChunkStream> {
        self.chunks.take()
    }

    /// Force-rejects the request with `request_cancelled`. A hub response
    /// arriving later is discarded.
    pub fn cancel(&self) {
        self.proxy.cancel(self.request_id);
    }

    pub async fn wait(self) -> Result<InferenceReply, InferenceError> {
        match self.final_rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(InferenceError::ChannelClosed),
        }
    }
}

impl fmt::Debug for InferenceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceHandle")
            .field("request_id", &self.request_id)
            .field("streaming", &self.chunks.is_some())
            .finish_non_exhaustive()
    }
}

/// Proxy-level notifications, including errors for request ids that no
/// longer (or never did) have a pending entry.
#[derive(Debug, Clone)]
pub enum InferenceProxyEvent {
    RequestFailed {
        request_id: Option<RequestId>,
        code: String,
        message: String,
    },
}

struct PendingRequest {
    final_tx: oneshot::Sender<Result<InferenceReply, InferenceError>>,
    chunk_tx: Option<mpsc::UnboundedSender<Result<String, InferenceError>>>,
    on_chunk: Option<ChunkCallback>,
    accumulated: String,
}

/// Multiplexes unary and streaming inference exchanges over the single hub
/// connection, correlating inbound messages by request id. The pending map
/// is the one shared mutable resource; every finalization removes the entry
/// first, which is what makes finalization exactly-once.
#[derive(Clone)]
pub struct InferenceProxy {
    inner: Arc<ProxyInner>,
}

struct ProxyInner {
    sender: MessageSender,
    session: Arc<SessionState>,
    pending: Mutex<HashMap<RequestId, PendingRequest>>,
    events_tx: broadcast::Sender<InferenceProxyEvent>,
}

impl InferenceProxy {
    #[must_use]
    pub fn start(
        sender: MessageSender,
        session: Arc<SessionState>,
        events: mpsc::Receiver<InferenceEvent>,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(64);
        let proxy = Self {
            inner: Arc::new(ProxyInner {
                sender,
                session,
                pending: Mutex::new(HashMap::new()),
                events_tx,
            }),
        };
        tokio::spawn(run_dispatch(proxy.clone(), events));
        proxy
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<InferenceProxyEvent> {
        self.inner.events_tx.subscribe()
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.lock_pending().len()
    }

    /// Sends an `inference_request` and returns the handle immediately.
    /// Fails synchronously with `node_not_registered` before touching the
    /// wire when the session is not registered.
    #[instrument(skip(self, call), fields(stream = call.is_streaming()))]
    pub async fn request(&self, call: InferenceCall) -> Result<InferenceHandle, InferenceError> {
        if !self.inner.session.is_registered() {
            return Err(InferenceError::NotRegistered);
        }

        let request_id = call.request_id.unwrap_or_else(RequestId::new);
        let (final_tx, final_rx) = oneshot::channel();
        let (chunk_tx, chunks) = if call.is_streaming() {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(ChunkStream { rx }))
        } else {
            (None, None)
        };

        self.inner.lock_pending().insert(
            request_id,
            PendingRequest {
                final_tx,
                chunk_tx,
                on_chunk: call.on_chunk.clone(),
                accumulated: String::new(),
            },
        );

        let data = InferenceRequestData {
            request_id,
            node_id: self.inner.session.node_id(),
            model: call.model,
            messages: call.messages,
            options: Some(call.options),
        };
        if let Err(e) = self
            .inner
            .sender
            .send(&NodeMessage::InferenceRequest(data))
            .await
        {
            self.inner.lock_pending().remove(&request_id);
            return Err(InferenceError::SendFailed(e.to_string()));
        }

        debug!(%request_id, "Inference request sent");
        Ok(InferenceHandle {
            request_id,
            final_rx,
            chunks,
            proxy: self.clone(),
        })
    }

    /// Finalizes the request with `request_cancelled`. A no-op when the
    /// request was already finalized.
    pub fn cancel(&self, request_id: RequestId) {
        if self.inner.finalize_err(request_id, InferenceError::Cancelled) {
            debug!(%request_id, "Inference request cancelled");
        }
    }
}

impl fmt::Debug for InferenceProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceProxy")
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

impl ProxyInner {
    fn lock_pending(&self) -> MutexGuard<'_, HashMap<RequestId, PendingRequest>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn handle_response(&self, data: InferenceResponseData) {
        let request_id = data.request_id;
        if data.success {
            let Some(entry) = self.lock_pending().remove(&request_id) else {
                debug!(%request_id, "Discarding response for unknown or finalized request");
                return;
            };
            let content = match data.content {
                Some(content) if !content.is_empty() => content,
                // A terminating response after a stream may carry no body;
                // the accumulated chunks are the content.
                _ => entry.accumulated,
            };
            let _ = entry.final_tx.send(Ok(InferenceReply::new(content, data.usage)));
            debug!(%request_id, "Inference request resolved");
        } else {
            let error = data
                .error
                .map_or_else(
                    || {
                        armada_core::types::TaskError::new(
                            error_codes::INFERENCE_FAILED,
                            "Hub reported failure without detail",
                        )
                    },
                    |detail| detail.into_task_error(error_codes::INFERENCE_FAILED),
                );
            self.fail(request_id, InferenceError::Hub(error));
        }
    }

    fn handle_stream_chunk(&self, data: InferenceStreamData) {
        let request_id = data.request_id;
        let (callback, finished) = {
            let mut pending = self.lock_pending();
            let Some(entry) = pending.get_mut(&request_id) else {
                debug!(%request_id, "Discarding stream chunk for unknown or finalized request");
                return;
            };
            if !data.chunk.is_empty() {
                entry.accumulated.push_str(&data.chunk);
                if let Some(chunk_tx) = &entry.chunk_tx {
                    let _ = chunk_tx.send(Ok(data.chunk.clone()));
                }
            }
            let callback = entry.on_chunk.clone();
            let finished = if data.done {
                pending.remove(&request_id)
            } else {
                None
            };
            (callback, finished)
        };

        // User code runs outside the lock.
        if !data.chunk.is_empty() {
            if let Some(callback) = &callback {
                callback(&data.chunk);
            }
        }

        if let Some(entry) = finished {
            let _ = entry
                .final_tx
                .send(Ok(InferenceReply::new(entry.accumulated, data.usage)));
            debug!(%request_id, "Stream completed");
        }
    }

    fn handle_rate_limit(&self, data: RateLimitData) {
        let error = InferenceError::RateLimited {
            message: data.message.clone(),
            retry_after_ms: data.retry_after_ms,
        };
        match data.request_id {
            Some(request_id) => {
                warn!(%request_id, "Hub rate limit for in-flight request");
                self.fail(request_id, error);
            }
            None => {
                warn!("Hub rate limit notice");
                self.emit_failure(None, &error);
            }
        }
    }

    /// Rejects the pending entry if there is one; always emits the
    /// proxy-level event so rate limits and errors for unknown request ids
    /// are still observable.
    fn fail(&self, request_id: RequestId, error: InferenceError) {
        if !self.finalize_err(request_id, error.clone()) {
            debug!(%request_id, "Error for unknown or finalized request");
        }
        self.emit_failure(Some(request_id), &error);
    }

    fn finalize_err(&self, request_id: RequestId, error: InferenceError) -> bool {
        let Some(entry) = self.lock_pending().remove(&request_id) else {
            return false;
        };
        if let Some(chunk_tx) = &entry.chunk_tx {
            let _ = chunk_tx.send(Err(error.clone()));
        }
        let _ = entry.final_tx.send(Err(error));
        true
    }

    fn emit_failure(&self, request_id: Option<RequestId>, error: &InferenceError) {
        let _ = self.events_tx.send(InferenceProxyEvent::RequestFailed {
            request_id,
            code: error.code().to_string(),
            message: error.to_string(),
        });
    }

    fn fail_all(&self, error: &InferenceError) {
        let entries: Vec<(RequestId, PendingRequest)> =
            self.lock_pending().drain().collect();
        for (request_id, entry) in entries {
            if let Some(chunk_tx) = &entry.chunk_tx {
                let _ = chunk_tx.send(Err(error.clone()));
            }
            let _ = entry.final_tx.send(Err(error.clone()));
            debug!(%request_id, "Pending inference request failed on teardown");
        }
    }
}

async fn run_dispatch(proxy: InferenceProxy, mut events: mpsc::Receiver<InferenceEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            InferenceEvent::Response(data) => proxy.inner.handle_response(data),
            InferenceEvent::Stream(data) => proxy.inner.handle_stream_chunk(data),
            InferenceEvent::RateLimit(data) => proxy.inner.handle_rate_limit(data),
        }
    }
    debug!("Inference dispatch loop ended");
    proxy.inner.fail_all(&InferenceError::ChannelClosed);
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use armada_core::types::{NodeId, UsageStats};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc::Receiver;

    struct Fixture {
        proxy: InferenceProxy,
        events: mpsc::Sender<InferenceEvent>,
        outbound: Receiver<Vec<u8>>,
        session: Arc<SessionState>,
    }

    fn fixture() -> Fixture {
        let (conn, outbound) = crate::connection::sender_for_tests();
        let session = Arc::new(SessionState::new(NodeId::new("n-test")));
        session.set_registered(true);
        let (events, events_rx) = mpsc::channel(64);
        let proxy = InferenceProxy::start(
            MessageSender::new(conn),
            Arc::clone(&session),
            events_rx,
        );
        Fixture {
            proxy,
            events,
            outbound,
            session,
        }
    }

    fn unary_response(request_id: RequestId, content: &str) -> InferenceEvent {
        InferenceEvent::Response(InferenceResponseData {
            request_id,
            node_id: None,
            success: true,
            content: Some(content.to_string()),
            usage: Some(UsageStats::new(10, 5)),
            error: None,
            timestamp: None,
        })
    }

    #[tokio::test]
    async fn rejects_before_registration() {
        let fx = fixture();
        fx.session.set_registered(false);

        let result = fx.proxy.request(InferenceCall::prompt("hello")).await;
        assert!(matches!(result, Err(InferenceError::NotRegistered)));
        assert_eq!(fx.proxy.pending_count(), 0);
    }

    #[tokio::test]
    async fn unary_request_resolves() {
        let mut fx = fixture();

        let handle = fx
            .proxy
            .request(InferenceCall::prompt("hello"))
            .await
            .expect("request failed");
        let request_id = handle.request_id();

        // The request reached the outbound queue.
        let frame = fx.outbound.recv().await.expect("no outbound frame");
        let value: serde_json::Value = serde_json::from_slice(&frame).expect("frame json");
        assert_eq!(value["type"], "inference_request");
        assert_eq!(value["data"]["nodeId"], "n-test");

        fx.events
            .send(unary_response(request_id, "hi there"))
            .await
            .expect("event send");

        let reply = handle.wait().await.expect("wait failed");
        assert_eq!(reply.content, "hi there");
        assert_eq!(reply.usage.map(|u| u.total_tokens), Some(15));
        assert_eq!(fx.proxy.pending_count(), 0);
    }

    #[tokio::test]
    async fn cancel_then_late_response_finalizes_once() {
        let fx = fixture();

        let handle = fx
            .proxy
            .request(InferenceCall::prompt("hello"))
            .await
            .expect("request failed");
        let request_id = handle.request_id();

        handle.cancel();
        assert_eq!(fx.proxy.pending_count(), 0);

        // Late response for a cancelled id is discarded without error.
        fx.events
            .send(unary_response(request_id, "too late"))
            .await
            .expect("event send");
        tokio::task::yield_now().await;

        let result = handle.wait().await;
        assert!(matches!(result, Err(InferenceError::Cancelled)));
    }

    #[tokio::test]
    async fn streaming_chunks_and_callback() {
        let mut fx = fixture();
        let callback_hits = Arc::new(AtomicUsize::new(0));
        let hits = Arc::clone(&callback_hits);

        let mut handle = fx
            .proxy
            .request(
                InferenceCall::prompt("stream it")
                    .streaming()
                    .on_chunk(move |_| {
                        hits.fetch_add(1, Ordering::SeqCst);
                    }),
            )
            .await
            .expect("request failed");
        let request_id = handle.request_id();
        let mut chunks = handle.take_chunks().expect("chunk stream");

        for (text, done) in [("Hel", false), ("lo", false), ("", true)] {
            fx.events
                .send(InferenceEvent::Stream(InferenceStreamData {
                    request_id,
                    node_id: None,
                    chunk: text.to_string(),
                    done,
                    usage: done.then(|| UsageStats::new(3, 2)),
                    timestamp: None,
                }))
                .await
                .expect("event send");
        }

        let mut collected = String::new();
        while let Some(item) = chunks.recv().await {
            collected.push_str(&item.expect("chunk error"));
        }
        assert_eq!(collected, "Hello");
        assert_eq!(callback_hits.load(Ordering::SeqCst), 2);

        let reply = handle.wait().await.expect("wait failed");
        assert_eq!(reply.content, "Hello");
        assert_eq!(reply.usage.map(|u| u.prompt_tokens), Some(3));
    }

    #[tokio::test]
    async fn error_for_unknown_request_id_is_event_only() {
        let fx = fixture();
        let mut events = fx.proxy.subscribe();

        let unknown = RequestId::new();
        fx.events
            .send(InferenceEvent::Response(InferenceResponseData {
                request_id: unknown,
                node_id: None,
                success: false,
                content: None,
                usage: None,
                error: Some(armada_core::types::ErrorDetail::Message(
                    "no such request".to_string(),
                )),
                timestamp: None,
            }))
            .await
            .expect("event send");

        let event = tokio::time::timeout(std::time::Duration::from_secs(1), events.recv())
            .await
            .expect("timed out")
            .expect("event channel closed");
        match event {
            InferenceProxyEvent::RequestFailed {
                request_id, code, ..
            } => {
                assert_eq!(request_id, Some(unknown));
                assert_eq!(code, "inference_failed");
            }
        }
    }

    #[tokio::test]
    async fn rate_limit_rejects_known_request() {
        let fx = fixture();

        let handle = fx
            .proxy
            .request(InferenceCall::prompt("hello"))
            .await
            .expect("request failed");
        let request_id = handle.request_id();

        fx.events
            .send(InferenceEvent::RateLimit(RateLimitData {
                request_id: Some(request_id),
                message: Some("slow down".to_string()),
                retry_after_ms: Some(1000),
            }))
            .await
            .expect("event send");

        let result = handle.wait().await;
        match result {
            Err(InferenceError::RateLimited {
                message,
                retry_after_ms,
            }) => {
                assert_eq!(message.as_deref(), Some("slow down"));
                assert_eq!(retry_after_ms, Some(1000));
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
    }
}
