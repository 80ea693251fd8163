//! Dispatch bridge: hands inbound events from the listener to long-lived worker loops.
//!
//! `submit` never waits: it routes the event to one of a fixed set of worker
//! loops by hashing the session id and uses `try_send` on that worker's bounded
//! queue. Each worker handles its events one at a time, so events for the same
//! session are processed in arrival order and never interleave, while different
//! sessions proceed on different workers.
//!
//! Every task runs under a timeout with panics caught at the task boundary. An
//! error, timeout or panic marks that task failed, gets logged, and the worker
//! moves on to the next one.

use crate::session::SessionId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// What arrived from the chat platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Text(String),
    Voice { file_id: String, duration_secs: u32 },
    PollAnswer { poll_id: String, option_ids: Vec<u32> },
    Command { name: String, args: String },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Text(_) => "text",
            EventKind::Voice { .. } => "voice",
            EventKind::PollAnswer { .. } => "poll_answer",
            EventKind::Command { .. } => "command",
        }
    }
}

/// A parsed inbound event. Owned by the task that processes it.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub kind: EventKind,
    pub session_id: SessionId,
    /// When this process received the event.
    pub received_at: DateTime<Utc>,
    /// Platform-reported send time, when the platform provides one.
    pub sent_at: Option<DateTime<Utc>>,
    /// Platform delivery id (Telegram `update_id`), for logs.
    pub delivery_id: Option<i64>,
}

impl InboundEvent {
    pub fn new(session_id: impl Into<SessionId>, kind: EventKind) -> Self {
        Self {
            kind,
            session_id: session_id.into(),
            received_at: Utc::now(),
            sent_at: None,
            delivery_id: None,
        }
    }

    pub fn text(session_id: impl Into<SessionId>, text: impl Into<String>) -> Self {
        Self::new(session_id, EventKind::Text(text.into()))
    }
}

/// Processes one event. Implemented by the conversation logic (and by test doubles).
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, event: &InboundEvent) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Submitted,
    Running,
    Completed,
    Failed,
}

impl TaskState {
    /// Legal moves: `Submitted -> Running -> Completed | Failed`.
    pub fn can_advance_to(self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::Submitted, TaskState::Running)
                | (TaskState::Running, TaskState::Completed)
                | (TaskState::Running, TaskState::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

/// Why a task ended in `Failed`.
#[derive(Debug, thiserror::Error)]
pub enum TaskFailure {
    #[error("handler error: {0:#}")]
    Error(anyhow::Error),
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("handler panicked")]
    Panicked,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("dispatch queue full")]
    QueueFull,
    #[error("dispatch bridge is shutting down")]
    ShuttingDown,
}

/// One unit of work: the event it owns plus its lifecycle state.
/// The handler only borrows the event; the task outlives the call and records how it ended.
#[derive(Debug)]
pub struct DispatchTask {
    pub id: String,
    pub event: InboundEvent,
    state: TaskState,
}

impl DispatchTask {
    fn new(event: InboundEvent) -> Self {
        Self {
            id: format!("task-{}", uuid::Uuid::new_v4()),
            event,
            state: TaskState::Submitted,
        }
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Move to `next` if the transition is legal. Returns false (and keeps the state) otherwise.
    fn advance(&mut self, next: TaskState) -> bool {
        if !self.state.can_advance_to(next) {
            log::warn!("dispatch: {} ignoring {:?} -> {:?}", self.id, self.state, next);
            return false;
        }
        self.state = next;
        true
    }
}

/// Worker pool and timing settings.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub workers: usize,
    pub queue_capacity: usize,
    pub task_timeout: Duration,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 64,
            task_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time counters, reported by the health endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchStats {
    pub submitted: u64,
    pub rejected: u64,
    pub completed: u64,
    pub failed: u64,
    pub in_flight: u64,
}

pub struct DispatchBridge {
    senders: Mutex<Option<Vec<mpsc::Sender<DispatchTask>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl DispatchBridge {
    /// Start the worker loops. Must be called inside a Tokio runtime; the loops
    /// run until [`DispatchBridge::shutdown`].
    pub fn start(handler: Arc<dyn TaskHandler>, options: DispatchOptions) -> Self {
        let workers = options.workers.max(1);
        let capacity = options.queue_capacity.max(1);
        let counters = Arc::new(Counters::default());
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let (tx, rx) = mpsc::channel(capacity);
            senders.push(tx);
            handles.push(tokio::spawn(run_worker(
                index,
                rx,
                handler.clone(),
                counters.clone(),
                options.task_timeout,
            )));
        }
        log::info!(
            "dispatch: started {} worker loop(s), queue capacity {} each, task timeout {:?}",
            workers,
            capacity,
            options.task_timeout
        );
        Self {
            senders: Mutex::new(Some(senders)),
            workers: Mutex::new(handles),
            counters,
        }
    }

    /// Queue `event` without waiting. Returns the task id.
    pub fn submit(&self, event: InboundEvent) -> Result<String, SubmitError> {
        let guard = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(senders) = guard.as_ref() else {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(SubmitError::ShuttingDown);
        };
        let shard = shard_for(&event.session_id, senders.len());
        let task = DispatchTask::new(event);
        let id = task.id.clone();
        let session = task.event.session_id.clone();
        match senders[shard].try_send(task) {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                log::debug!("dispatch: {} submitted for session {} on worker {}", id, session, shard);
                Ok(id)
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                log::warn!("dispatch: worker {} queue full, rejecting event for session {}", shard, session);
                Err(SubmitError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                Err(SubmitError::ShuttingDown)
            }
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn stats(&self) -> DispatchStats {
        let submitted = self.counters.submitted.load(Ordering::Relaxed);
        let completed = self.counters.completed.load(Ordering::Relaxed);
        let failed = self.counters.failed.load(Ordering::Relaxed);
        DispatchStats {
            submitted,
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            completed,
            failed,
            in_flight: submitted.saturating_sub(completed.saturating_add(failed)),
        }
    }

    /// Stop accepting, let queued and running tasks finish within `timeout`,
    /// then abort whatever is left. Returns true when everything drained.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let senders = self
            .senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(senders);
        let handles = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        if handles.is_empty() {
            return true;
        }
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        log::info!("dispatch: draining {} worker loop(s)", handles.len());
        match tokio::time::timeout(timeout, futures_util::future::join_all(handles)).await {
            Ok(_) => {
                log::info!("dispatch: all worker loops drained");
                true
            }
            Err(_) => {
                log::warn!("dispatch: drain exceeded {:?}, aborting remaining tasks", timeout);
                for a in aborts {
                    a.abort();
                }
                false
            }
        }
    }
}

fn shard_for(session: &SessionId, workers: usize) -> usize {
    let mut h = DefaultHasher::new();
    session.hash(&mut h);
    (h.finish() % workers as u64) as usize
}

async fn run_worker(
    index: usize,
    mut rx: mpsc::Receiver<DispatchTask>,
    handler: Arc<dyn TaskHandler>,
    counters: Arc<Counters>,
    task_timeout: Duration,
) {
    while let Some(mut task) = rx.recv().await {
        task.advance(TaskState::Running);
        log::debug!("dispatch: {} {:?} on worker {}", task.id, task.state(), index);

        let outcome =
            AssertUnwindSafe(tokio::time::timeout(task_timeout, handler.handle(&task.event)))
                .catch_unwind()
                .await;
        let failure = match outcome {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(e))) => Some(TaskFailure::Error(e)),
            Ok(Err(_)) => Some(TaskFailure::TimedOut(task_timeout)),
            Err(_) => Some(TaskFailure::Panicked),
        };
        match failure {
            None => {
                task.advance(TaskState::Completed);
                counters.completed.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "dispatch: {} {:?} (session {}, {})",
                    task.id,
                    task.state(),
                    task.event.session_id,
                    task.event.kind.name()
                );
            }
            Some(f) => {
                task.advance(TaskState::Failed);
                counters.failed.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "dispatch: {} {:?} on worker {} (session {}, kind {}, delivery {:?}): {}",
                    task.id,
                    task.state(),
                    index,
                    task.event.session_id,
                    task.event.kind.name(),
                    task.event.delivery_id,
                    f
                );
            }
        }
    }
    log::debug!("dispatch: worker {} stopped", index);
}
