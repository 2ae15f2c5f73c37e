use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;

use crate::types::{TaskError, TaskId};

/// Cancellation signal handed to a running tool handler.
///
/// The orchestrator fires it when the task's timeout elapses or the agent
/// shuts down. Handlers may poll `is_cancelled` between units of work or
/// await `cancelled` inside a `select!`. Firing the signal never aborts the
/// handler task; a handler that ignores it keeps running detached.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes once the token is fired. Also completes if the owning
    /// `CancelSource` is dropped, so a handler can never wait forever.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[derive(Debug)]
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

impl CancelSource {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    #[must_use]
    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-execution context passed to a tool handler.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub cancel: CancelToken,
}

impl TaskContext {
    #[must_use]
    pub fn new(task_id: TaskId, cancel: CancelToken) -> Self {
        Self { task_id, cancel }
    }
}

/// A registered capability. Implementations hold their own collaborators
/// (an inference proxy clone, database handles, ...) captured at
/// registration time; the orchestrator only supplies the arguments and the
/// execution context.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn execute(&self, args: Value, ctx: TaskContext) -> Result<Value, TaskError>;
}
