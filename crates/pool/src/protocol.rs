//! Message protocol between the pool coordinator and its workers
//!
//! Every message is wrapped in a [`Message`] envelope that carries the
//! correlating task id (when there is one) and a creation timestamp.
//!
//! ```text
//!   coordinator                          worker
//!       │ ── task-assignment ──────────────▶ │
//!       │ ◀────────────────── task-progress ─ │  (zero or more)
//!       │ ◀──────────── task-result / error ─ │
//!       │ ── health-check ─────────────────▶ │
//!       │ ◀─────────────────── health-check ─ │
//!       │ ◀───────────────── memory-warning ─ │  (any time)
//!       │ ── worker-shutdown ──────────────▶ │
//!       │ ◀──────────────── worker-shutdown ─ │
//! ```

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::WorkerError;
use crate::serde_millis::duration_millis;
use crate::task::{Task, TaskId, TaskResult};

/// Kind tag of a protocol message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    TaskAssignment,
    TaskResult,
    TaskError,
    TaskProgress,
    WorkerReady,
    WorkerShutdown,
    HealthCheck,
    MemoryWarning,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TaskAssignment => "task-assignment",
            Self::TaskResult => "task-result",
            Self::TaskError => "task-error",
            Self::TaskProgress => "task-progress",
            Self::WorkerReady => "worker-ready",
            Self::WorkerShutdown => "worker-shutdown",
            Self::HealthCheck => "health-check",
            Self::MemoryWarning => "memory-warning",
        };
        f.write_str(name)
    }
}

/// A message body with a known kind
pub trait MessageBody {
    fn kind(&self) -> MessageKind;
}

/// Timestamped envelope correlated by task id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message<T> {
    /// Task this message is about, if any
    pub task_id: Option<TaskId>,

    /// When the message was created
    pub timestamp: DateTime<Utc>,

    /// Kind-specific payload
    pub body: T,
}

impl<T: MessageBody> Message<T> {
    /// Wrap a body that is not about a specific task
    pub fn new(body: T) -> Self {
        Self {
            task_id: None,
            timestamp: Utc::now(),
            body,
        }
    }

    /// Wrap a body about the given task
    pub fn for_task(task_id: impl Into<TaskId>, body: T) -> Self {
        Self {
            task_id: Some(task_id.into()),
            timestamp: Utc::now(),
            body,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }
}

/// Messages sent from the coordinator to a worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "kebab-case")]
pub enum WorkerRequest {
    TaskAssignment { task: Task },
    HealthCheck,
    WorkerShutdown,
}

impl MessageBody for WorkerRequest {
    fn kind(&self) -> MessageKind {
        match self {
            Self::TaskAssignment { .. } => MessageKind::TaskAssignment,
            Self::HealthCheck => MessageKind::HealthCheck,
            Self::WorkerShutdown => MessageKind::WorkerShutdown,
        }
    }
}

/// Messages sent from a worker to the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "kebab-case")]
pub enum WorkerResponse {
    WorkerReady,
    TaskResult(TaskResult),
    TaskError(WorkerError),
    TaskProgress(ProgressReport),
    HealthCheck(HealthReport),
    MemoryWarning { usage: u64, threshold: u64 },
    WorkerShutdown,
}

impl MessageBody for WorkerResponse {
    fn kind(&self) -> MessageKind {
        match self {
            Self::WorkerReady => MessageKind::WorkerReady,
            Self::TaskResult(_) => MessageKind::TaskResult,
            Self::TaskError(_) => MessageKind::TaskError,
            Self::TaskProgress(_) => MessageKind::TaskProgress,
            Self::HealthCheck(_) => MessageKind::HealthCheck,
            Self::MemoryWarning { .. } => MessageKind::MemoryWarning,
            Self::WorkerShutdown => MessageKind::WorkerShutdown,
        }
    }
}

/// Incremental progress of a multi-item task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub completed: u64,
    pub total: u64,
    pub message: Option<String>,
}

impl ProgressReport {
    /// Fraction completed, clamped to 0.0 - 1.0
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        (self.completed as f64 / self.total as f64).clamp(0.0, 1.0)
    }
}

/// Worker self-assessment carried in a health report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerHealth {
    /// No task run yet
    Ready,
    /// Waiting for work, last task succeeded
    Idle,
    /// Waiting for work, last task failed
    Degraded,
}

/// Worker answer to a health check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: WorkerHealth,

    /// Task the worker ran most recently
    pub last_task: Option<TaskId>,

    #[serde(with = "duration_millis")]
    pub uptime: Duration,

    pub tasks_completed: u64,
    pub tasks_failed: u64,

    /// Sampled memory usage in bytes
    pub memory_usage: u64,
}

/// How a worker thread ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// Acknowledged shutdown or closed inbox
    Clean,
    /// Execution unit faulted
    Fault(String),
}

/// Envelope received by the coordinator from a worker thread
#[derive(Debug)]
pub struct WorkerSignal {
    pub worker_id: String,
    pub kind: SignalKind,
}

#[derive(Debug)]
pub enum SignalKind {
    Message(Message<WorkerResponse>),
    Exited(WorkerExit),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::CalculationKind;
    use serde_json::json;

    #[test]
    fn test_request_kinds() {
        let task = Task::new(CalculationKind::BalanceEquation, json!({}));
        let msg = Message::for_task(task.id.clone(), WorkerRequest::TaskAssignment { task });
        assert_eq!(msg.kind(), MessageKind::TaskAssignment);
        assert!(msg.task_id.is_some());

        assert_eq!(Message::new(WorkerRequest::HealthCheck).kind(), MessageKind::HealthCheck);
    }

    #[test]
    fn test_response_wire_format() {
        let msg = Message::for_task(
            "t-1",
            WorkerResponse::TaskProgress(ProgressReport {
                completed: 1,
                total: 4,
                message: None,
            }),
        );
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["task_id"], "t-1");
        assert_eq!(json["body"]["kind"], "task-progress");
        assert_eq!(json["body"]["payload"]["total"], 4);

        let ready = serde_json::to_value(Message::new(WorkerResponse::WorkerReady)).unwrap();
        assert_eq!(ready["body"]["kind"], "worker-ready");
    }

    #[test]
    fn test_response_deserializes() {
        let msg: Message<WorkerResponse> = serde_json::from_value(json!({
            "task_id": null,
            "timestamp": "2024-01-01T00:00:00Z",
            "body": {"kind": "memory-warning", "payload": {"usage": 10, "threshold": 5}}
        }))
        .unwrap();

        assert_eq!(msg.kind(), MessageKind::MemoryWarning);
        assert!(matches!(
            msg.body,
            WorkerResponse::MemoryWarning { usage: 10, threshold: 5 }
        ));
    }

    #[test]
    fn test_progress_fraction() {
        let report = ProgressReport {
            completed: 3,
            total: 4,
            message: None,
        };
        assert!((report.fraction() - 0.75).abs() < f64::EPSILON);

        let empty = ProgressReport {
            completed: 0,
            total: 0,
            message: None,
        };
        assert_eq!(empty.fraction(), 1.0);
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(MessageKind::TaskAssignment.to_string(), "task-assignment");
        assert_eq!(MessageKind::MemoryWarning.to_string(), "memory-warning");
    }
}
