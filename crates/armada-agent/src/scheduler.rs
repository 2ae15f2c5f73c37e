use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use armada_core::traits::{CancelSource, TaskContext, ToolHandler};
use armada_core::types::{error_codes, NodeStats, TaskAssignment, TaskError, TaskResult};
use armada_core::NodeMessage;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::protocol::{MessageSender, SessionState};
use crate::registry::ToolRegistry;

/// Shared task counters. Cheap to clone; the protocol client reads the same
/// counters the orchestrator writes, so heartbeats always carry live values.
#[derive(Debug, Clone, Default)]
pub struct TaskStats {
    inner: Arc<StatsInner>,
}

#[derive(Debug, Default)]
struct StatsInner {
    active: AtomicU64,
    total: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl TaskStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn snapshot(&self) -> NodeStats {
        NodeStats::new(
            self.inner.active.load(AtomicOrdering::Relaxed),
            self.inner.total.load(AtomicOrdering::Relaxed),
            self.inner.completed.load(AtomicOrdering::Relaxed),
            self.inner.failed.load(AtomicOrdering::Relaxed),
        )
    }

    fn record_accepted(&self) {
        self.inner.total.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn record_started(&self) {
        self.inner.active.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn record_completed(&self, success: bool) {
        self.inner.active.fetch_sub(1, AtomicOrdering::Relaxed);
        if success {
            self.inner.completed.fetch_add(1, AtomicOrdering::Relaxed);
        } else {
            self.inner.failed.fetch_add(1, AtomicOrdering::Relaxed);
        }
    }

    fn record_failed_immediate(&self) {
        self.inner.failed.fetch_add(1, AtomicOrdering::Relaxed);
    }
}

/// Queued work plus everything resolved at accept time. Ordered by priority
/// (higher first), ties broken by enqueue sequence (FIFO).
struct PendingTask {
    assignment: TaskAssignment,
    handler: Arc<dyn ToolHandler>,
    timeout: Duration,
    enqueued_at: Instant,
    seq: u64,
}

impl PendingTask {
    fn priority(&self) -> i64 {
        self.assignment.effective_priority()
    }
}

impl PartialEq for PendingTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority() == other.priority() && self.seq == other.seq
    }
}

impl Eq for PendingTask {}

impl PartialOrd for PendingTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority()
            .cmp(&other.priority())
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct SchedulerQueue {
    heap: BinaryHeap<PendingTask>,
    running: usize,
    next_seq: u64,
    stopped: bool,
}

enum TaskOutcome {
    Success(Value),
    Failed(TaskError),
    TimedOut,
}

/// Bounded concurrent scheduler for hub-assigned tasks.
///
/// Every accepted assignment produces exactly one `task_result`. Timeouts
/// are soft: the cancellation signal fires and the result is reported, but
/// a handler that ignores the signal keeps its detached task running.
#[derive(Clone)]
pub struct TaskOrchestrator {
    inner: Arc<OrchestratorInner>,
}

struct OrchestratorInner {
    registry: Arc<ToolRegistry>,
    sender: MessageSender,
    session: Arc<SessionState>,
    stats: TaskStats,
    max_concurrent: usize,
    default_timeout: Duration,
    queue: Mutex<SchedulerQueue>,
}

impl TaskOrchestrator {
    #[must_use]
    pub fn new(
        registry: Arc<ToolRegistry>,
        sender: MessageSender,
        session: Arc<SessionState>,
        stats: TaskStats,
        max_concurrent: usize,
        default_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                registry,
                sender,
                session,
                stats,
                max_concurrent: max_concurrent.max(1),
                default_timeout,
                queue: Mutex::new(SchedulerQueue::default()),
            }),
        }
    }

    pub fn register_tool(&self, name: impl Into<String>, handler: Arc<dyn ToolHandler>) {
        self.inner.registry.register(name, handler);
    }

    pub fn unregister_tool(&self, name: &str) -> bool {
        self.inner.registry.unregister(name)
    }

    #[must_use]
    pub fn stats(&self) -> NodeStats {
        self.inner.stats.snapshot()
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.lock_queue().stopped
    }

    /// Drains the pending queue without executing it and refuses further
    /// assignments. In-flight tasks are left to finish on their own.
    pub fn stop(&self) {
        let mut queue = self.inner.lock_queue();
        queue.stopped = true;
        let drained = queue.heap.len();
        queue.heap.clear();
        drop(queue);
        if drained > 0 {
            info!(drained, "Dropped queued tasks on stop");
        }
    }

    /// Consumes assignments from the protocol client until the channel ends.
    #[must_use]
    pub fn spawn_assignment_loop(
        &self,
        mut assignments: mpsc::Receiver<TaskAssignment>,
    ) -> JoinHandle<()> {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            while let Some(assignment) = assignments.recv().await {
                orchestrator.handle_assignment(assignment).await;
            }
            debug!("Assignment loop ended");
        })
    }

    #[instrument(skip(self, assignment), fields(task_id = %assignment.task_id, tool = %assignment.tool_name))]
    pub async fn handle_assignment(&self, assignment: TaskAssignment) {
        if self.inner.lock_queue().stopped {
            warn!("Assignment rejected: orchestrator is stopped");
            return;
        }
        self.inner.stats.record_accepted();

        // Resolve the handler up front so an unknown tool fails immediately
        // without ever occupying a concurrency slot.
        let Some(handler) = self.inner.registry.get(&assignment.tool_name) else {
            warn!("No handler for tool");
            self.inner.stats.record_failed_immediate();
            let result = TaskResult::failure(
                assignment.task_id,
                self.inner.session.node_id(),
                TaskError::capability_not_supported(&assignment.tool_name),
                0,
            );
            self.inner.send_result(result).await;
            return;
        };

        let timeout = assignment
            .timeout_ms
            .map_or(self.inner.default_timeout, Duration::from_millis);

        {
            let mut queue = self.inner.lock_queue();
            if queue.stopped {
                return;
            }
            let seq = queue.next_seq;
            queue.next_seq += 1;
            queue.heap.push(PendingTask {
                assignment,
                handler,
                timeout,
                enqueued_at: Instant::now(),
                seq,
            });
            debug!(queued = queue.heap.len(), "Task enqueued");
        }
        self.dispatch();
    }

    /// Starts as many queued tasks as free slots allow. Popping and slot
    /// accounting happen under one lock, so the bound holds even when
    /// completions and new assignments race.
    fn dispatch(&self) {
        loop {
            let task = {
                let mut queue = self.inner.lock_queue();
                if queue.stopped || queue.running >= self.inner.max_concurrent {
                    return;
                }
                let Some(task) = queue.heap.pop() else {
                    return;
                };
                queue.running += 1;
                task
            };

            let orchestrator = self.clone();
            tokio::spawn(async move {
                orchestrator.inner.run_task(task).await;
                orchestrator.inner.lock_queue().running -= 1;
                orchestrator.dispatch();
            });
        }
    }
}

impl std::fmt::Debug for TaskOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let queue = self.inner.lock_queue();
        f.debug_struct("TaskOrchestrator")
            .field("queued", &queue.heap.len())
            .field("running", &queue.running)
            .field("stopped", &queue.stopped)
            .finish_non_exhaustive()
    }
}

impl OrchestratorInner {
    fn lock_queue(&self) -> MutexGuard<'_, SchedulerQueue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[allow(clippy::cast_possible_truncation)]
    async fn run_task(&self, task: PendingTask) {
        let PendingTask {
            assignment,
            handler,
            timeout,
            enqueued_at,
            ..
        } = task;
        let task_id = assignment.task_id.clone();

        self.stats.record_started();
        debug!(
            %task_id,
            tool = %assignment.tool_name,
            waited_ms = enqueued_at.elapsed().as_millis() as u64,
            "Task starting"
        );

        let cancel = CancelSource::new();
        let ctx = TaskContext::new(task_id.clone(), cancel.token());
        let args = assignment.tool_args.clone();
        let mut handler_task = tokio::spawn(async move { handler.execute(args, ctx).await });

        let started = Instant::now();
        let outcome = tokio::select! {
            result = &mut handler_task => match result {
                Ok(Ok(value)) => TaskOutcome::Success(value),
                Ok(Err(error)) => TaskOutcome::Failed(error),
                Err(join_error) => TaskOutcome::Failed(TaskError::new(
                    error_codes::TASK_FAILED,
                    format!("Handler aborted: {join_error}"),
                )),
            },
            () = tokio::time::sleep(timeout) => {
                // Soft timeout: fire the signal and report, but never abort
                // the handler task. A handler that ignores the signal keeps
                // running detached and leaks whatever it holds.
                cancel.cancel();
                TaskOutcome::TimedOut
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let node_id = self.session.node_id();
        let result = match outcome {
            TaskOutcome::Success(value) => {
                debug!(%task_id, elapsed_ms, "Task completed");
                TaskResult::success(task_id, node_id, value, elapsed_ms)
            }
            TaskOutcome::Failed(error) => {
                warn!(%task_id, code = %error.code, "Task failed");
                TaskResult::failure(task_id, node_id, error, elapsed_ms)
            }
            TaskOutcome::TimedOut => {
                warn!(%task_id, timeout_ms = timeout.as_millis() as u64, "Task timed out");
                let error = TaskError::timeout(format!(
                    "Task exceeded its {}ms timeout",
                    timeout.as_millis()
                ));
                TaskResult::failure(task_id, node_id, error, elapsed_ms)
            }
        };

        self.stats.record_completed(result.success);
        self.send_result(result).await;
    }

    async fn send_result(&self, result: TaskResult) {
        if let Err(e) = self.sender.send(&NodeMessage::TaskResult(result)).await {
            warn!(error = %e, "Failed to send task result");
        }
    }
}
