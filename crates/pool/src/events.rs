//! Lifecycle events published by the pool
//!
//! Every subscriber gets its own unbounded channel, so events are never
//! dropped for a live subscriber. Subscribers whose receiver has been
//! dropped are pruned on the next publish.

use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::WorkerError;
use crate::pool::PoolMetrics;
use crate::serde_millis::duration_millis;
use crate::task::TaskId;

/// Why a worker left the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// Removed by an explicit or automatic scale-down
    Scaled,
    /// Idle longer than the idle timeout
    IdleTimeout,
    /// Thread exited or faulted
    Crashed,
    /// Reported memory above the restart threshold
    MemoryLimit,
    /// Execution exceeded the cpu time limit
    Hung,
    /// Pool shutdown
    Shutdown,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scaled => write!(f, "scaled"),
            Self::IdleTimeout => write!(f, "idle_timeout"),
            Self::Crashed => write!(f, "crashed"),
            Self::MemoryLimit => write!(f, "memory_limit"),
            Self::Hung => write!(f, "hung"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Pool lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PoolEvent {
    PoolInitialized {
        workers: usize,
    },
    WorkerCreated {
        worker_id: String,
    },
    WorkerTerminated {
        worker_id: String,
        reason: TerminationReason,
    },
    WorkerError {
        worker_id: String,
        error: WorkerError,
    },
    TaskStarted {
        task_id: TaskId,
        worker_id: String,
    },
    TaskCompleted {
        task_id: TaskId,
        worker_id: String,
        #[serde(with = "duration_millis")]
        execution_time: Duration,
    },
    TaskFailed {
        task_id: TaskId,
        worker_id: Option<String>,
        error: WorkerError,
    },
    TaskProgress {
        task_id: TaskId,
        worker_id: String,
        progress: f64,
        message: Option<String>,
    },
    MemoryWarning {
        worker_id: String,
        usage: u64,
        threshold: u64,
    },
    PoolScaled {
        from: usize,
        to: usize,
    },
    MetricsUpdated {
        metrics: PoolMetrics,
    },
    PoolShutdown,
    Error {
        message: String,
    },
}

impl PoolEvent {
    /// Event name as published on the wire
    pub fn name(&self) -> &'static str {
        match self {
            Self::PoolInitialized { .. } => "pool-initialized",
            Self::WorkerCreated { .. } => "worker-created",
            Self::WorkerTerminated { .. } => "worker-terminated",
            Self::WorkerError { .. } => "worker-error",
            Self::TaskStarted { .. } => "task-started",
            Self::TaskCompleted { .. } => "task-completed",
            Self::TaskFailed { .. } => "task-failed",
            Self::TaskProgress { .. } => "task-progress",
            Self::MemoryWarning { .. } => "memory-warning",
            Self::PoolScaled { .. } => "pool-scaled",
            Self::MetricsUpdated { .. } => "metrics-updated",
            Self::PoolShutdown => "pool-shutdown",
            Self::Error { .. } => "error",
        }
    }
}

/// Fan-out of pool events to any number of subscribers
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<PoolEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<PoolEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver an event to every live subscriber
    pub fn publish(&self, event: PoolEvent) {
        trace!(event = event.name(), "publishing pool event");
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
