//! Pool and worker error types

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::queue::QueueError;
use crate::task::TaskId;

/// Errors returned by pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Task failed validation
    #[error("invalid task: {0}")]
    InvalidTask(String),

    /// Task id already used in this pool
    #[error("duplicate task id: {0}")]
    DuplicateTask(TaskId),

    /// Queue rejected the task
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Scale target outside configured bounds
    #[error("scale target {target} is outside [{min}, {max}]")]
    InvalidScaleTarget { target: usize, min: usize, max: usize },

    /// Invalid configuration
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),

    /// Pool is draining and accepts no new work
    #[error("worker pool is shutting down")]
    ShuttingDown,

    /// Pool has stopped or its coordinator is gone
    #[error("worker pool is unavailable")]
    Unavailable,

    /// Worker thread could not be spawned
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),

    /// The task ran and failed
    #[error("task failed: {0}")]
    Task(#[from] WorkerError),
}

impl PoolError {
    /// Whether this error was caused by invalid caller input
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidTask(_)
                | Self::DuplicateTask(_)
                | Self::Queue(_)
                | Self::InvalidScaleTarget { .. }
                | Self::InvalidConfig(_)
                | Self::ShuttingDown
        )
    }
}

/// Why a task or worker failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerErrorKind {
    /// Task exceeded a time limit
    Timeout,
    /// Worker exceeded its memory ceiling
    Memory,
    /// Worker execution unit faulted
    Crash,
    /// Task input or kind was rejected
    Validation,
    /// Handler failed while running
    Runtime,
    /// Pool shut down before the task finished
    Cancelled,
}

impl fmt::Display for WorkerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Memory => write!(f, "memory"),
            Self::Crash => write!(f, "crash"),
            Self::Validation => write!(f, "validation"),
            Self::Runtime => write!(f, "runtime"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Tagged failure record for a task or worker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerError {
    /// Failure category
    pub kind: WorkerErrorKind,

    /// Human-readable message
    pub message: String,

    /// Worker involved, if any
    pub worker_id: Option<String>,

    /// Task involved, if any
    pub task_id: Option<TaskId>,

    /// When the failure was recorded
    pub timestamp: DateTime<Utc>,

    /// Panic or backtrace text
    pub stack: Option<String>,

    /// Additional diagnostic details
    pub context: Option<serde_json::Value>,
}

impl WorkerError {
    /// Create a new error of the given kind
    pub fn new(kind: WorkerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            worker_id: None,
            task_id: None,
            timestamp: Utc::now(),
            stack: None,
            context: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(WorkerErrorKind::Timeout, message)
    }

    pub fn memory(message: impl Into<String>) -> Self {
        Self::new(WorkerErrorKind::Memory, message)
    }

    pub fn crash(message: impl Into<String>) -> Self {
        Self::new(WorkerErrorKind::Crash, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(WorkerErrorKind::Validation, message)
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(WorkerErrorKind::Runtime, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(WorkerErrorKind::Cancelled, message)
    }

    /// Attach the worker id
    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    /// Attach the task id
    pub fn with_task(mut self, task_id: impl Into<TaskId>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Attach stack text
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Attach diagnostic context
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind, self.message)
    }
}

impl std::error::Error for WorkerError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_error_builder() {
        let err = WorkerError::crash("thread exited")
            .with_worker("worker-1")
            .with_task("task-1")
            .with_context(serde_json::json!({"exit": "panic"}));

        assert_eq!(err.kind, WorkerErrorKind::Crash);
        assert_eq!(err.worker_id.as_deref(), Some("worker-1"));
        assert_eq!(err.task_id.as_deref(), Some("task-1"));
        assert_eq!(err.to_string(), "crash error: thread exited");
    }

    #[test]
    fn test_worker_error_serialization() {
        let err = WorkerError::memory("over limit").with_worker("worker-2");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "memory");

        let parsed: WorkerError = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, err);
    }

    #[test]
    fn test_validation_classification() {
        assert!(PoolError::ShuttingDown.is_validation());
        assert!(PoolError::InvalidScaleTarget { target: 9, min: 1, max: 4 }.is_validation());
        assert!(!PoolError::Unavailable.is_validation());
        assert!(!PoolError::Task(WorkerError::runtime("boom")).is_validation());
    }
}
