use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use armada_core::error::TransportError;
use armada_core::traits::{FramedTransport, TransportFactory};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::AgentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// Exponential backoff schedule for reconnect attempts:
/// `delay = min(initial * multiplier^attempt, max)`.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl ReconnectPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    #[must_use]
    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    #[must_use]
    pub const fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        // Past ~64 doublings every practical schedule is saturated at max.
        let exponent = i32::try_from(attempt.min(64)).unwrap_or(64);
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Raw connection-level events consumed by the protocol client.
#[derive(Debug)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    Frame(Vec<u8>),
}

enum Command {
    Send(Vec<u8>),
    Stop,
}

enum ReaderEvent {
    Frame(u64, Vec<u8>),
    Closed(u64),
}

/// Cloneable handle for queueing outbound frames with the connection actor.
#[derive(Debug, Clone)]
pub struct ConnectionSender {
    tx: mpsc::Sender<Command>,
}

impl ConnectionSender {
    pub async fn send(&self, frame: Vec<u8>) -> Result<(), AgentError> {
        self.tx
            .send(Command::Send(frame))
            .await
            .map_err(|_| AgentError::ConnectionClosed)
    }
}

/// Owns the one transport connection to the hub.
///
/// All writes flow through a single owner task, which also runs the
/// reconnect schedule and the offline queue. Frames sent while disconnected
/// are flushed in FIFO order as soon as the connection is re-established;
/// nothing is reordered or dropped by this layer.
pub struct ConnectionManager {
    command_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    events_rx: Option<mpsc::Receiver<ConnectionEvent>>,
    actor_handle: JoinHandle<()>,
}

impl ConnectionManager {
    /// Performs the first connect. Resolves once the transport is open and
    /// the owner task is running; errors if the first attempt fails.
    pub async fn start<F>(
        factory: F,
        hub_addr: SocketAddr,
        policy: ReconnectPolicy,
    ) -> Result<Self, AgentError>
    where
        F: TransportFactory + 'static,
        F::Transport: 'static,
    {
        let transport = factory.connect(hub_addr).await?;

        let (command_tx, command_rx) = mpsc::channel(256);
        let (event_tx, events_rx) = mpsc::channel(256);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        let (reader_tx, reader_rx) = mpsc::channel(256);

        let mut actor = ConnectionActor {
            factory,
            hub_addr,
            policy,
            command_rx,
            event_tx,
            state_tx,
            reader_tx,
            reader_rx,
            transport: None,
            reader_handle: None,
            pending: VecDeque::new(),
            attempt: 0,
            epoch: 0,
        };

        let actor_handle = tokio::spawn(async move {
            actor.install(transport).await;
            actor.run().await;
        });

        Ok(Self {
            command_tx,
            state_rx,
            events_rx: Some(events_rx),
            actor_handle,
        })
    }

    #[must_use]
    pub fn sender(&self) -> ConnectionSender {
        ConnectionSender {
            tx: self.command_tx.clone(),
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// The raw event stream. Yields `None` after the first call.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<ConnectionEvent>> {
        self.events_rx.take()
    }

    pub async fn send(&self, frame: Vec<u8>) -> Result<(), AgentError> {
        self.sender().send(frame).await
    }

    /// Closes the transport and suppresses further reconnect attempts.
    pub async fn stop(&self) {
        let _ = self.command_tx.send(Command::Stop).await;
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.actor_handle.is_finished()
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

struct ConnectionActor<F: TransportFactory> {
    factory: F,
    hub_addr: SocketAddr,
    policy: ReconnectPolicy,
    command_rx: mpsc::Receiver<Command>,
    event_tx: mpsc::Sender<ConnectionEvent>,
    state_tx: watch::Sender<ConnectionState>,
    reader_tx: mpsc::Sender<ReaderEvent>,
    reader_rx: mpsc::Receiver<ReaderEvent>,
    transport: Option<Arc<F::Transport>>,
    reader_handle: Option<JoinHandle<()>>,
    pending: VecDeque<Vec<u8>>,
    attempt: u32,
    epoch: u64,
}

impl<F> ConnectionActor<F>
where
    F: TransportFactory + 'static,
    F::Transport: 'static,
{
    async fn run(mut self) {
        loop {
            if self.transport.is_some() {
                tokio::select! {
                    cmd = self.command_rx.recv() => match cmd {
                        Some(Command::Send(frame)) => self.transmit(frame).await,
                        Some(Command::Stop) | None => {
                            self.shutdown().await;
                            return;
                        }
                    },
                    ev = self.reader_rx.recv() => match ev {
                        Some(ReaderEvent::Frame(epoch, frame)) => {
                            if epoch == self.epoch {
                                let _ = self.event_tx.send(ConnectionEvent::Frame(frame)).await;
                            }
                        }
                        Some(ReaderEvent::Closed(epoch)) => {
                            if epoch == self.epoch {
                                self.handle_disconnect().await;
                            }
                        }
                        // The actor holds a reader_tx clone, so the channel
                        // cannot close while the actor is alive.
                        None => {}
                    },
                }
            } else if !self.wait_out_backoff().await {
                return;
            } else {
                self.try_reconnect().await;
            }
        }
    }

    /// Sleeps the scheduled backoff while staying responsive to commands.
    /// Returns `false` when a stop arrived during the wait.
    async fn wait_out_backoff(&mut self) -> bool {
        let delay = self.policy.delay(self.attempt);
        debug!(attempt = self.attempt, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                cmd = self.command_rx.recv() => match cmd {
                    Some(Command::Send(frame)) => self.pending.push_back(frame),
                    Some(Command::Stop) | None => {
                        self.shutdown().await;
                        return false;
                    }
                },
                () = &mut sleep => return true,
            }
        }
    }

    async fn transmit(&mut self, frame: Vec<u8>) {
        let Some(transport) = self.transport.clone() else {
            self.pending.push_back(frame);
            return;
        };
        if let Err(e) = transport.send_frame(&frame).await {
            warn!(error = %e, "Send failed, queueing frame");
            self.pending.push_front(frame);
            self.handle_disconnect().await;
        }
    }

    async fn flush_pending(&mut self) {
        while let Some(frame) = self.pending.pop_front() {
            let Some(transport) = self.transport.clone() else {
                self.pending.push_front(frame);
                return;
            };
            if let Err(e) = transport.send_frame(&frame).await {
                warn!(error = %e, "Flush failed, keeping frame queued");
                self.pending.push_front(frame);
                self.handle_disconnect().await;
                return;
            }
        }
    }

    async fn try_reconnect(&mut self) {
        self.set_state(ConnectionState::Connecting);
        match self.factory.connect(self.hub_addr).await {
            Ok(transport) => {
                info!(attempt = self.attempt, "Reconnected to hub");
                self.attempt = 0;
                self.install(transport).await;
                self.flush_pending().await;
            }
            Err(e) => {
                self.attempt = self.attempt.saturating_add(1);
                warn!(error = %e, attempt = self.attempt, "Reconnect attempt failed");
                self.set_state(ConnectionState::Disconnected);
            }
        }
    }

    async fn install(&mut self, transport: F::Transport) {
        let transport = Arc::new(transport);
        self.epoch += 1;
        if let Some(handle) = self.reader_handle.take() {
            handle.abort();
        }
        self.reader_handle = Some(tokio::spawn(run_reader(
            Arc::clone(&transport),
            self.epoch,
            self.reader_tx.clone(),
        )));
        self.transport = Some(transport);
        self.set_state(ConnectionState::Connected);
        let _ = self.event_tx.send(ConnectionEvent::Connected).await;
    }

    async fn handle_disconnect(&mut self) {
        if let Some(handle) = self.reader_handle.take() {
            handle.abort();
        }
        self.transport = None;
        self.set_state(ConnectionState::Disconnected);
        let _ = self.event_tx.send(ConnectionEvent::Disconnected).await;
        info!(queued = self.pending.len(), "Connection to hub lost");
    }

    async fn shutdown(&mut self) {
        if let Some(handle) = self.reader_handle.take() {
            handle.abort();
        }
        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                debug!(error = %e, "Error closing transport");
            }
        }
        self.set_state(ConnectionState::Disconnected);
        let _ = self.event_tx.send(ConnectionEvent::Disconnected).await;
        info!("Connection manager stopped");
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Connection state changed");
        }
    }
}

async fn run_reader<T: FramedTransport>(
    transport: Arc<T>,
    epoch: u64,
    tx: mpsc::Sender<ReaderEvent>,
) {
    loop {
        match transport.recv_frame().await {
            Ok(frame) => {
                if tx.send(ReaderEvent::Frame(epoch, frame)).await.is_err() {
                    return;
                }
            }
            Err(TransportError::Closed) => {
                let _ = tx.send(ReaderEvent::Closed(epoch)).await;
                return;
            }
            Err(e) => {
                warn!(error = %e, "Transport receive error");
                let _ = tx.send(ReaderEvent::Closed(epoch)).await;
                return;
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn sender_for_tests() -> (ConnectionSender, mpsc::Receiver<Vec<u8>>) {
    let (tx, mut rx) = mpsc::channel(64);
    let (out_tx, out_rx) = mpsc::channel(64);
    tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            if let Command::Send(frame) = cmd {
                if out_tx.send(frame).await.is_err() {
                    return;
                }
            }
        }
    });
    (ConnectionSender { tx }, out_rx)
}
