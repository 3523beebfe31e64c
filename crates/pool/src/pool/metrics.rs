//! Pool metrics and worker snapshots

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::instance::WorkerStatus;
use crate::error::WorkerError;
use crate::queue::QueueStats;
use crate::serde_millis::duration_millis;
use crate::task::TaskId;

/// Point-in-time view of the whole pool
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolMetrics {
    pub total_workers: usize,
    pub idle_workers: usize,
    pub busy_workers: usize,
    pub starting_workers: usize,

    /// Tasks accepted since start
    pub total_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub timed_out_tasks: u64,
    pub cancelled_tasks: u64,
    pub queued_tasks: usize,
    pub running_tasks: usize,
    /// Tasks re-queued after losing their worker
    pub retried_tasks: u64,
    /// Worker crashes and forced restarts
    pub worker_restarts: u64,

    #[serde(with = "duration_millis")]
    pub avg_execution_time: Duration,
    /// Completions per second since start
    pub throughput: f64,
    /// Failed fraction of settled tasks
    pub error_rate: f64,

    /// Sum of the latest memory sample of every worker, in bytes
    pub memory_usage: u64,
    /// Highest single-worker memory sample seen, in bytes
    pub peak_memory: u64,

    #[serde(with = "duration_millis")]
    pub uptime: Duration,

    pub queue: QueueStats,
}

/// Snapshot of one worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: String,
    pub status: WorkerStatus,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub tasks_completed: u64,
    #[serde(with = "duration_millis")]
    pub total_execution_time: Duration,
    pub memory_usage: u64,
    pub peak_memory: u64,
    pub error_count: u32,
    pub last_error: Option<WorkerError>,
    pub current_task: Option<TaskId>,
}

impl WorkerInfo {
    /// Mean handler time per completed task
    pub fn avg_execution_time(&self) -> Duration {
        if self.tasks_completed == 0 {
            return Duration::ZERO;
        }
        self.total_execution_time / self.tasks_completed as u32
    }
}
