//! Coordinator-side worker records

use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::metrics::WorkerInfo;
use crate::error::WorkerError;
use crate::task::TaskId;
use crate::worker::WorkerHandle;

/// Worker lifecycle status
///
/// `Starting -> Idle <-> Busy`, any -> `Error`, any -> `Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Starting,
    Idle,
    Busy,
    Error,
    Terminated,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Idle => write!(f, "idle"),
            Self::Busy => write!(f, "busy"),
            Self::Error => write!(f, "error"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

pub(crate) struct WorkerInstance {
    pub id: String,
    pub handle: WorkerHandle,
    pub status: WorkerStatus,
    pub created_at: DateTime<Utc>,
    pub last_used: Instant,
    pub last_used_at: DateTime<Utc>,
    pub tasks_completed: u64,
    pub total_execution_time: Duration,
    pub memory_usage: u64,
    pub peak_memory: u64,
    pub error_count: u32,
    pub last_error: Option<WorkerError>,
    pub current_task: Option<TaskId>,
}

impl WorkerInstance {
    pub fn new(id: String, handle: WorkerHandle) -> Self {
        let now = Utc::now();
        Self {
            id,
            handle,
            status: WorkerStatus::Starting,
            created_at: now,
            last_used: Instant::now(),
            last_used_at: now,
            tasks_completed: 0,
            total_execution_time: Duration::ZERO,
            memory_usage: 0,
            peak_memory: 0,
            error_count: 0,
            last_error: None,
            current_task: None,
        }
    }

    pub fn is_available(&self) -> bool {
        self.status == WorkerStatus::Idle
    }

    /// Can be removed without interrupting a task
    pub fn is_removable(&self) -> bool {
        matches!(self.status, WorkerStatus::Idle | WorkerStatus::Starting)
    }

    pub fn touch(&mut self) {
        self.last_used = Instant::now();
        self.last_used_at = Utc::now();
    }

    pub fn record_memory(&mut self, usage: u64) {
        self.memory_usage = usage;
        self.peak_memory = self.peak_memory.max(usage);
    }

    pub fn info(&self) -> WorkerInfo {
        WorkerInfo {
            id: self.id.clone(),
            status: self.status,
            created_at: self.created_at,
            last_used_at: self.last_used_at,
            tasks_completed: self.tasks_completed,
            total_execution_time: self.total_execution_time,
            memory_usage: self.memory_usage,
            peak_memory: self.peak_memory,
            error_count: self.error_count,
            last_error: self.last_error.clone(),
            current_task: self.current_task.clone(),
        }
    }
}
