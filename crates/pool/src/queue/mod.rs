//! Priority task queue
//!
//! In-memory, capacity-bounded buffer of pending tasks:
//!
//! ```text
//!   enqueue ──▶ [critical] [high] [normal] [low] ──▶ dequeue
//!                   │         │       │       │
//!                   └─────────┴───┬───┴───────┘
//!                                 ▼
//!                      expiry sweep (interval)
//!                                 │
//!                                 ▼
//!                         expired channel
//! ```
//!
//! Dequeue always serves the highest non-empty priority bucket. Within a
//! bucket tasks are ordered by creation time, then by insertion order.

mod stats;

pub use stats::{PriorityStats, QueueStats};

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::task::{Priority, Task};
use stats::StatsAccumulator;

/// Queue errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    /// Queue is at capacity
    #[error("task queue is full (capacity {capacity})")]
    Full { capacity: usize },

    /// Task is malformed
    #[error("invalid task: {0}")]
    InvalidTask(String),

    /// Queue has been shut down
    #[error("task queue is closed")]
    Closed,
}

#[derive(Debug)]
struct QueuedTask {
    task: Task,
    enqueued_at: Instant,
}

type BucketKey = (DateTime<Utc>, u64);

#[derive(Debug)]
struct QueueInner {
    buckets: [BTreeMap<BucketKey, QueuedTask>; 4],
    seq: u64,
    closed: bool,
    stats: StatsAccumulator,
}

impl QueueInner {
    fn len(&self) -> usize {
        self.buckets.iter().map(BTreeMap::len).sum()
    }

    fn pending_by_priority(&self) -> [usize; 4] {
        let mut pending = [0; 4];
        for (i, bucket) in self.buckets.iter().enumerate() {
            pending[i] = bucket.len();
        }
        pending
    }
}

/// Priority-ordered task queue with timeout expiry
pub struct TaskQueue {
    config: QueueConfig,
    inner: Mutex<QueueInner>,
    notify: Notify,
    expired_tx: mpsc::UnboundedSender<Task>,
    shutdown_tx: watch::Sender<bool>,
    sweep_handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskQueue {
    /// Create a queue and the receiver on which expired tasks are reported
    pub fn new(config: QueueConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<Task>) {
        if config.persistent {
            warn!("queue persistence is not supported, tasks are kept in memory only");
        }

        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        let queue = Arc::new(Self {
            config,
            inner: Mutex::new(QueueInner {
                buckets: Default::default(),
                seq: 0,
                closed: false,
                stats: StatsAccumulator::new(),
            }),
            notify: Notify::new(),
            expired_tx,
            shutdown_tx,
            sweep_handle: Mutex::new(None),
        });

        (queue, expired_rx)
    }

    /// Start the background expiry sweep on the current tokio runtime
    pub fn start_sweep(self: &Arc<Self>) {
        let queue: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.sweep_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(queue) = queue.upgrade() else { break };
                        let expired = queue.sweep_expired();
                        if expired > 0 {
                            debug!(expired, "expired waiting tasks");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("queue sweep: shutdown requested");
                        break;
                    }
                }
            }
        });

        *self.sweep_handle.lock() = Some(handle);
    }

    /// Add a task to its priority bucket
    pub fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        task.validate().map_err(QueueError::InvalidTask)?;

        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(QueueError::Closed);
            }
            if inner.len() >= self.config.capacity {
                return Err(QueueError::Full {
                    capacity: self.config.capacity,
                });
            }

            inner.seq += 1;
            let key = (task.created_at, inner.seq);
            let priority = task.priority;
            inner.buckets[priority.index()].insert(
                key,
                QueuedTask {
                    task,
                    enqueued_at: Instant::now(),
                },
            );
            inner.stats.on_enqueue(priority);
        }

        self.notify.notify_one();
        Ok(())
    }

    /// Remove the next task, highest priority first
    pub fn dequeue(&self) -> Option<Task> {
        let mut inner = self.inner.lock();
        let queued = Priority::ALL
            .iter()
            .rev()
            .find_map(|p| inner.buckets[p.index()].pop_first())
            .map(|(_, queued)| queued)?;

        inner.stats.on_dequeue(queued.enqueued_at.elapsed());
        Some(queued.task)
    }

    /// Wait until a task is enqueued
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().len() == 0
    }

    pub fn size(&self) -> usize {
        self.inner.lock().len()
    }

    /// Snapshot of queue statistics
    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        inner.stats.snapshot(inner.pending_by_priority())
    }

    /// Record that a dequeued task completed
    pub fn record_completed(&self, execution_time: Duration) {
        self.inner.lock().stats.on_completed(execution_time);
    }

    /// Record that a dequeued task failed
    pub fn record_failed(&self) {
        self.inner.lock().stats.on_failed();
    }

    /// Release a dequeued task without settling it (requeue or cancel)
    pub fn release(&self) {
        self.inner.lock().stats.on_released();
    }

    /// Remove every task that has waited longer than its timeout
    ///
    /// Expired tasks are sent on the expiry channel. Returns how many
    /// tasks expired.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut expired = Vec::new();

        {
            let mut inner = self.inner.lock();
            let default_timeout = self.config.default_timeout;

            for bucket in inner.buckets.iter_mut() {
                let keys: Vec<BucketKey> = bucket
                    .iter()
                    .filter(|(_, queued)| {
                        queued
                            .task
                            .timeout
                            .or(default_timeout)
                            .is_some_and(|limit| now.duration_since(queued.enqueued_at) >= limit)
                    })
                    .map(|(key, _)| *key)
                    .collect();

                for key in keys {
                    if let Some(queued) = bucket.remove(&key) {
                        expired.push(queued.task);
                    }
                }
            }

            for _ in &expired {
                inner.stats.on_expired();
            }
        }

        let count = expired.len();
        for task in expired {
            debug!(task_id = %task.id, "task expired in queue");
            if self.expired_tx.send(task).is_err() {
                debug!("expiry receiver dropped");
            }
        }
        count
    }

    /// Stop the sweep, close the queue and return everything still waiting
    pub fn shutdown(&self) -> Vec<Task> {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.sweep_handle.lock().take() {
            handle.abort();
        }

        let mut inner = self.inner.lock();
        inner.closed = true;

        let mut flushed = Vec::with_capacity(inner.len());
        for p in Priority::ALL.iter().rev() {
            let bucket = std::mem::take(&mut inner.buckets[p.index()]);
            flushed.extend(bucket.into_values().map(|queued| queued.task));
        }

        info!(flushed = flushed.len(), "task queue shut down");
        flushed
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::CalculationKind;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    fn task(id: &str, priority: Priority) -> Task {
        Task::new(CalculationKind::CompoundAnalysis, json!({}))
            .with_id(id)
            .with_priority(priority)
    }

    #[test]
    fn test_priority_order() {
        let (queue, _expired) = TaskQueue::new(QueueConfig::default());
        queue.enqueue(task("low", Priority::Low)).unwrap();
        queue.enqueue(task("normal", Priority::Normal)).unwrap();
        queue.enqueue(task("critical", Priority::Critical)).unwrap();
        queue.enqueue(task("high", Priority::High)).unwrap();

        let order: Vec<String> = std::iter::from_fn(|| queue.dequeue()).map(|t| t.id).collect();
        assert_eq!(order, vec!["critical", "high", "normal", "low"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_fifo_within_priority() {
        let (queue, _expired) = TaskQueue::new(QueueConfig::default());
        let base = Utc::now();

        let mut first = task("first", Priority::Normal);
        first.created_at = base;
        let mut second = task("second", Priority::Normal);
        second.created_at = base;
        let mut older = task("older", Priority::Normal);
        older.created_at = base - ChronoDuration::seconds(5);

        queue.enqueue(first).unwrap();
        queue.enqueue(second).unwrap();
        queue.enqueue(older).unwrap();

        assert_eq!(queue.dequeue().unwrap().id, "older");
        assert_eq!(queue.dequeue().unwrap().id, "first");
        assert_eq!(queue.dequeue().unwrap().id, "second");
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn test_capacity_is_enforced() {
        let (queue, _expired) = TaskQueue::new(QueueConfig::default().with_capacity(2));
        queue.enqueue(task("a", Priority::Normal)).unwrap();
        queue.enqueue(task("b", Priority::Normal)).unwrap();

        let err = queue.enqueue(task("c", Priority::Critical)).unwrap_err();
        assert_eq!(err, QueueError::Full { capacity: 2 });
        assert_eq!(queue.size(), 2);
    }

    #[test]
    fn test_malformed_task_is_rejected() {
        let (queue, _expired) = TaskQueue::new(QueueConfig::default());
        let err = queue.enqueue(task("", Priority::Normal)).unwrap_err();
        assert!(matches!(err, QueueError::InvalidTask(_)));
        assert_eq!(queue.stats().total, 0);
    }

    #[test]
    fn test_sweep_reports_expired_tasks() {
        let (queue, mut expired) = TaskQueue::new(QueueConfig::default());
        queue
            .enqueue(task("short", Priority::High).with_timeout(Duration::from_millis(1)))
            .unwrap();
        queue.enqueue(task("forever", Priority::Normal)).unwrap();

        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(queue.sweep_expired(), 1);

        assert_eq!(expired.try_recv().unwrap().id, "short");
        assert_eq!(queue.size(), 1);
        assert_eq!(queue.stats().timed_out, 1);
    }

    #[test]
    fn test_default_timeout_applies() {
        let config = QueueConfig::default().with_default_timeout(Duration::from_millis(1));
        let (queue, mut expired) = TaskQueue::new(config);
        queue.enqueue(task("a", Priority::Normal)).unwrap();

        std::thread::sleep(Duration::from_millis(10));
        queue.sweep_expired();
        assert_eq!(expired.try_recv().unwrap().id, "a");
    }

    #[tokio::test]
    async fn test_background_sweep() {
        let config = QueueConfig::default().with_sweep_interval(Duration::from_millis(10));
        let (queue, mut expired) = TaskQueue::new(config);
        queue.start_sweep();

        queue
            .enqueue(task("a", Priority::Normal).with_timeout(Duration::from_millis(20)))
            .unwrap();

        let task = tokio::time::timeout(Duration::from_secs(2), expired.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.id, "a");
        queue.shutdown();
    }

    #[tokio::test]
    async fn test_enqueue_notifies() {
        let (queue, _expired) = TaskQueue::new(QueueConfig::default());
        queue.enqueue(task("a", Priority::Normal)).unwrap();
        tokio::time::timeout(Duration::from_secs(1), queue.notified())
            .await
            .unwrap();
    }

    #[test]
    fn test_shutdown_flushes_and_closes() {
        let (queue, _expired) = TaskQueue::new(QueueConfig::default());
        queue.enqueue(task("a", Priority::Low)).unwrap();
        queue.enqueue(task("b", Priority::Critical)).unwrap();

        let flushed: Vec<String> = queue.shutdown().into_iter().map(|t| t.id).collect();
        assert_eq!(flushed, vec!["b", "a"]);
        assert!(queue.is_closed());
        assert_eq!(
            queue.enqueue(task("c", Priority::Normal)),
            Err(QueueError::Closed)
        );
    }

    #[test]
    fn test_stats_track_lifecycle() {
        let (queue, _expired) = TaskQueue::new(QueueConfig::default());
        queue.enqueue(task("a", Priority::Normal)).unwrap();
        queue.enqueue(task("b", Priority::High)).unwrap();
        queue.enqueue(task("c", Priority::High)).unwrap();

        queue.dequeue();
        queue.dequeue();
        queue.record_completed(Duration::from_millis(50));
        queue.record_failed();

        let stats = queue.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.running, 0);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.avg_execution_time.as_millis(), 50);
        let high = stats
            .by_priority
            .iter()
            .find(|p| p.priority == Priority::High)
            .unwrap();
        assert_eq!(high.enqueued, 2);
        assert_eq!(high.pending, 0);
    }
}
