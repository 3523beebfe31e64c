//! Queue statistics

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::serde_millis::duration_millis;
use crate::task::Priority;

/// Snapshot of queue statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Tasks ever accepted
    pub total: u64,
    /// Tasks waiting in the queue
    pub pending: usize,
    /// Tasks handed out and not yet settled
    pub running: usize,
    pub completed: u64,
    pub failed: u64,
    /// Tasks expired while waiting
    pub timed_out: u64,
    #[serde(with = "duration_millis")]
    pub avg_wait_time: Duration,
    #[serde(with = "duration_millis")]
    pub avg_execution_time: Duration,
    /// Completions per second since the queue started
    pub throughput: f64,
    pub by_priority: Vec<PriorityStats>,
}

/// Per-priority breakdown
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorityStats {
    pub priority: Priority,
    pub pending: usize,
    pub enqueued: u64,
}

/// Running counters behind [`QueueStats`]
#[derive(Debug)]
pub(crate) struct StatsAccumulator {
    started_at: Instant,
    total: u64,
    running: usize,
    completed: u64,
    failed: u64,
    timed_out: u64,
    enqueued_by_priority: [u64; 4],
    avg_wait_ms: f64,
    waits: u64,
    avg_exec_ms: f64,
}

impl StatsAccumulator {
    pub(crate) fn new() -> Self {
        Self {
            started_at: Instant::now(),
            total: 0,
            running: 0,
            completed: 0,
            failed: 0,
            timed_out: 0,
            enqueued_by_priority: [0; 4],
            avg_wait_ms: 0.0,
            waits: 0,
            avg_exec_ms: 0.0,
        }
    }

    pub(crate) fn on_enqueue(&mut self, priority: Priority) {
        self.total += 1;
        self.enqueued_by_priority[priority.index()] += 1;
    }

    pub(crate) fn on_dequeue(&mut self, waited: Duration) {
        self.running += 1;
        self.waits += 1;
        self.avg_wait_ms = incremental_mean(self.avg_wait_ms, waited, self.waits);
    }

    pub(crate) fn on_expired(&mut self) {
        self.timed_out += 1;
    }

    pub(crate) fn on_completed(&mut self, execution_time: Duration) {
        self.running = self.running.saturating_sub(1);
        self.completed += 1;
        self.avg_exec_ms = incremental_mean(self.avg_exec_ms, execution_time, self.completed);
    }

    pub(crate) fn on_failed(&mut self) {
        self.running = self.running.saturating_sub(1);
        self.failed += 1;
    }

    pub(crate) fn on_released(&mut self) {
        self.running = self.running.saturating_sub(1);
    }

    pub(crate) fn snapshot(&self, pending_by_priority: [usize; 4]) -> QueueStats {
        let elapsed = self.started_at.elapsed().as_secs_f64();
        let throughput = if elapsed > 0.0 {
            self.completed as f64 / elapsed
        } else {
            0.0
        };

        QueueStats {
            total: self.total,
            pending: pending_by_priority.iter().sum(),
            running: self.running,
            completed: self.completed,
            failed: self.failed,
            timed_out: self.timed_out,
            avg_wait_time: Duration::from_secs_f64(self.avg_wait_ms / 1000.0),
            avg_execution_time: Duration::from_secs_f64(self.avg_exec_ms / 1000.0),
            throughput,
            by_priority: Priority::ALL
                .iter()
                .rev()
                .map(|p| PriorityStats {
                    priority: *p,
                    pending: pending_by_priority[p.index()],
                    enqueued: self.enqueued_by_priority[p.index()],
                })
                .collect(),
        }
    }
}

fn incremental_mean(mean: f64, sample: Duration, count: u64) -> f64 {
    let sample_ms = sample.as_secs_f64() * 1000.0;
    mean + (sample_ms - mean) / count as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incremental_mean() {
        let mut acc = StatsAccumulator::new();
        acc.on_dequeue(Duration::ZERO);
        acc.on_dequeue(Duration::ZERO);
        acc.on_completed(Duration::from_millis(100));
        acc.on_completed(Duration::from_millis(300));

        let stats = acc.snapshot([0; 4]);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.running, 0);
        assert_eq!(stats.avg_execution_time.as_millis(), 200);
    }

    #[test]
    fn test_priority_breakdown_is_highest_first() {
        let mut acc = StatsAccumulator::new();
        acc.on_enqueue(Priority::Critical);
        acc.on_enqueue(Priority::Low);

        let stats = acc.snapshot([1, 0, 0, 1]);
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.by_priority[0].priority, Priority::Critical);
        assert_eq!(stats.by_priority[0].enqueued, 1);
        assert_eq!(stats.by_priority[3].priority, Priority::Low);
    }

    #[test]
    fn test_running_never_underflows() {
        let mut acc = StatsAccumulator::new();
        acc.on_released();
        acc.on_failed();
        let stats = acc.snapshot([0; 4]);
        assert_eq!(stats.running, 0);
        assert_eq!(stats.failed, 1);
    }
}
