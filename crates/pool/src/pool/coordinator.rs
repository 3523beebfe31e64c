//! Pool coordinator
//!
//! A single tokio task owns the worker table, the in-flight executions and
//! the pending caller futures. Every mutation happens sequentially in its
//! `select!` loop:
//!
//! ```text
//!   commands ──────┐
//!   worker signals ┤
//!   queue expiry ──┼──▶ handle event ──▶ drain queue ──▶ auto-scale
//!   retry timers ──┤
//!   health tick ───┤
//!   metrics tick ──┘
//! ```

use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::balancer::{Candidate, LoadBalancer};
use super::instance::{WorkerInstance, WorkerStatus};
use super::metrics::{PoolMetrics, WorkerInfo};
use super::PoolStatus;
use crate::config::PoolConfig;
use crate::error::{PoolError, WorkerError, WorkerErrorKind};
use crate::events::{EventBus, PoolEvent, TerminationReason};
use crate::protocol::{
    Message, SignalKind, WorkerExit, WorkerRequest, WorkerResponse, WorkerSignal,
};
use crate::queue::TaskQueue;
use crate::reliability::{exceeded, RetryPolicy, TimeoutKind};
use crate::task::{Task, TaskExecution, TaskId, TaskResult};
use crate::worker::{
    panic_message, run_handler, task_result, HandlerOutcome, RuntimeSettings, TaskContext,
    WorkerHandle,
};

/// Pseudo worker id for tasks run on the host's blocking pool
pub(crate) const INLINE_WORKER_ID: &str = "inline";

/// Terminal outcome delivered to a task handle
pub(crate) type TaskOutcome = Result<TaskResult, WorkerError>;

/// Requests from [`PoolManager`](super::PoolManager) handles
pub(crate) enum Command {
    Submit {
        task: Task,
        outcome: oneshot::Sender<TaskOutcome>,
        ack: oneshot::Sender<Result<(), PoolError>>,
    },
    Scale {
        target: usize,
        reply: oneshot::Sender<Result<usize, PoolError>>,
    },
    Metrics {
        reply: oneshot::Sender<PoolMetrics>,
    },
    Workers {
        reply: oneshot::Sender<Vec<WorkerInfo>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Receiving ends of the coordinator's inputs
pub(crate) struct Channels {
    pub commands: mpsc::UnboundedReceiver<Command>,
    pub signals: mpsc::UnboundedReceiver<WorkerSignal>,
    pub expired: mpsc::UnboundedReceiver<Task>,
    pub retries: mpsc::UnboundedReceiver<Task>,
}

struct Dispatched {
    execution: TaskExecution,
    task: Task,
}

#[derive(Debug, Default)]
struct Counters {
    total: u64,
    completed: u64,
    failed: u64,
    timed_out: u64,
    cancelled: u64,
    retried: u64,
    restarts: u64,
    execution_time: Duration,
}

pub(crate) struct Coordinator {
    config: PoolConfig,
    settings: RuntimeSettings,
    queue: Arc<TaskQueue>,
    events: Arc<EventBus>,
    status: Arc<RwLock<PoolStatus>>,
    retry_policy: RetryPolicy,
    balancer: LoadBalancer,

    workers: Vec<WorkerInstance>,
    executions: HashMap<TaskId, Dispatched>,
    pending: HashMap<TaskId, oneshot::Sender<TaskOutcome>>,
    retries: HashMap<TaskId, u32>,
    seen_ids: HashSet<TaskId>,

    signal_tx: mpsc::UnboundedSender<WorkerSignal>,
    retry_tx: mpsc::UnboundedSender<Task>,

    next_worker: u64,
    counters: Counters,
    started_at: Instant,
    draining: bool,
    drain_deadline: Option<tokio::time::Instant>,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
    stopped: bool,
}

impl Coordinator {
    pub(crate) fn new(
        config: PoolConfig,
        settings: RuntimeSettings,
        queue: Arc<TaskQueue>,
        events: Arc<EventBus>,
        status: Arc<RwLock<PoolStatus>>,
        signal_tx: mpsc::UnboundedSender<WorkerSignal>,
        retry_tx: mpsc::UnboundedSender<Task>,
    ) -> Self {
        let retry_policy = RetryPolicy::from_recovery(&config.recovery);
        let balancer = LoadBalancer::new(config.load_balancing);

        Self {
            config,
            settings,
            queue,
            events,
            status,
            retry_policy,
            balancer,
            workers: Vec::new(),
            executions: HashMap::new(),
            pending: HashMap::new(),
            retries: HashMap::new(),
            seen_ids: HashSet::new(),
            signal_tx,
            retry_tx,
            next_worker: 0,
            counters: Counters::default(),
            started_at: Instant::now(),
            draining: false,
            drain_deadline: None,
            shutdown_waiters: Vec::new(),
            stopped: false,
        }
    }

    /// Spawn the initial workers
    pub(crate) fn initialize(&mut self) -> Result<(), PoolError> {
        for _ in 0..self.config.min_workers {
            if let Err(e) = self.spawn_worker() {
                if !self.config.recovery.fallback_to_main_thread {
                    self.terminate_all(TerminationReason::Shutdown);
                    return Err(e);
                }
                warn!(error = %e, "worker spawn failed, tasks will run inline");
                break;
            }
        }

        info!(
            workers = self.workers.len(),
            min_workers = self.config.min_workers,
            max_workers = self.config.max_workers,
            load_balancing = %self.config.load_balancing,
            "worker pool initialized"
        );
        self.events.publish(PoolEvent::PoolInitialized {
            workers: self.workers.len(),
        });
        Ok(())
    }

    /// Event loop; returns once the pool has stopped
    pub(crate) async fn run(mut self, mut channels: Channels) {
        let start = tokio::time::Instant::now();
        let mut health = tokio::time::interval_at(
            start + self.config.health_check_interval,
            self.config.health_check_interval,
        );
        let mut metrics = tokio::time::interval_at(
            start + self.config.metrics_interval,
            self.config.metrics_interval,
        );
        health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        metrics.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut commands_open = true;

        loop {
            let deadline = self
                .drain_deadline
                .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                command = channels.commands.recv(), if commands_open => match command {
                    Some(command) => self.guarded("command", |c| c.handle_command(command)),
                    None => {
                        debug!("all pool handles dropped");
                        commands_open = false;
                        self.begin_shutdown();
                    }
                },
                Some(signal) = channels.signals.recv() => {
                    self.guarded("worker signal", |c| c.handle_signal(signal));
                }
                Some(task) = channels.expired.recv() => {
                    self.guarded("queue expiry", |c| c.handle_expired(task));
                }
                Some(task) = channels.retries.recv() => {
                    self.guarded("retry", |c| c.handle_retry(task));
                }
                _ = health.tick(), if !self.draining => {
                    self.guarded("health check", Self::health_check);
                }
                _ = metrics.tick(), if !self.draining => {
                    self.guarded("metrics", Self::publish_metrics);
                }
                _ = tokio::time::sleep_until(deadline), if self.draining => {
                    warn!(
                        running = self.executions.len(),
                        "shutdown grace period elapsed, cancelling running tasks"
                    );
                    self.finish_shutdown();
                }
            }

            if self.stopped {
                break;
            }
            if self.draining && self.executions.is_empty() {
                self.finish_shutdown();
                break;
            }

            self.guarded("drain", |c| {
                c.drain();
                c.auto_scale();
            });
        }

        debug!("coordinator stopped");
    }

    /// Run `f`, publishing a generic error event if it panics
    fn guarded<F>(&mut self, context: &str, f: F)
    where
        F: FnOnce(&mut Self),
    {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| f(self))) {
            let message = format!("{context} handler panicked: {}", panic_message(payload.as_ref()));
            error!(%message, "coordinator handler panicked");
            self.events.publish(PoolEvent::Error { message });
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit { task, outcome, ack } => {
                let _ = ack.send(self.accept(task, outcome));
            }
            Command::Scale { target, reply } => {
                let _ = reply.send(self.scale(target));
            }
            Command::Metrics { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Workers { reply } => {
                let _ = reply.send(self.workers.iter().map(WorkerInstance::info).collect());
            }
            Command::Shutdown { reply } => {
                self.shutdown_waiters.push(reply);
                self.begin_shutdown();
            }
        }
    }

    fn accept(
        &mut self,
        task: Task,
        outcome: oneshot::Sender<TaskOutcome>,
    ) -> Result<(), PoolError> {
        if self.draining {
            return Err(PoolError::ShuttingDown);
        }
        task.validate().map_err(PoolError::InvalidTask)?;
        if self.seen_ids.contains(&task.id) {
            return Err(PoolError::DuplicateTask(task.id));
        }

        let task_id = task.id.clone();
        let priority = task.priority;
        self.queue.enqueue(task)?;

        debug!(task_id = %task_id, %priority, "task queued");
        self.seen_ids.insert(task_id.clone());
        self.pending.insert(task_id, outcome);
        self.counters.total += 1;
        Ok(())
    }

    fn scale(&mut self, target: usize) -> Result<usize, PoolError> {
        let (min, max) = (self.config.min_workers, self.config.max_workers);
        if target < min || target > max {
            return Err(PoolError::InvalidScaleTarget { target, min, max });
        }
        if self.draining {
            return Err(PoolError::ShuttingDown);
        }

        let from = self.workers.len();
        if target > from {
            for _ in from..target {
                self.spawn_worker()?;
            }
        } else if target < from {
            let mut excess = from - target;
            let mut slot = self.workers.len();
            while excess > 0 && slot > 0 {
                slot -= 1;
                if self.workers[slot].is_removable() {
                    self.remove_worker(slot, TerminationReason::Scaled);
                    excess -= 1;
                }
            }
            if excess > 0 {
                debug!(busy = excess, "busy workers left running during scale down");
            }
        }

        let to = self.workers.len();
        if to != from {
            info!(from, to, "worker pool scaled");
            self.events.publish(PoolEvent::PoolScaled { from, to });
        }
        Ok(to)
    }

    // =========================================================================
    // Worker signals
    // =========================================================================

    fn handle_signal(&mut self, signal: WorkerSignal) {
        let WorkerSignal { worker_id, kind } = signal;
        let message = match kind {
            SignalKind::Exited(exit) => return self.handle_exit(&worker_id, exit),
            SignalKind::Message(message) => message,
        };

        match message.body {
            WorkerResponse::WorkerReady => {
                if let Some(worker) = self.worker_mut(&worker_id) {
                    if worker.status == WorkerStatus::Starting {
                        worker.status = WorkerStatus::Idle;
                        worker.touch();
                        debug!(worker_id = %worker_id, "worker ready");
                    }
                }
            }
            WorkerResponse::TaskResult(result) => self.complete(&worker_id, result),
            WorkerResponse::TaskError(error) => self.fail_execution(&worker_id, error),
            WorkerResponse::TaskProgress(report) => {
                let Some(task_id) = message.task_id else { return };
                let Some(dispatched) = self.executions.get_mut(&task_id) else { return };
                if dispatched.execution.worker_id != worker_id {
                    return;
                }
                let progress = report.fraction();
                dispatched.execution.progress = Some(progress);
                self.events.publish(PoolEvent::TaskProgress {
                    task_id,
                    worker_id,
                    progress,
                    message: report.message,
                });
            }
            WorkerResponse::HealthCheck(report) => {
                debug!(
                    worker_id = %worker_id,
                    status = ?report.status,
                    last_task = ?report.last_task,
                    uptime_ms = report.uptime.as_millis() as u64,
                    tasks_completed = report.tasks_completed,
                    tasks_failed = report.tasks_failed,
                    memory_usage = report.memory_usage,
                    "health report"
                );
                self.observe_memory(&worker_id, report.memory_usage);
            }
            WorkerResponse::MemoryWarning { usage, threshold } => {
                if self.worker_mut(&worker_id).is_none() {
                    return;
                }
                self.events.publish(PoolEvent::MemoryWarning {
                    worker_id: worker_id.clone(),
                    usage,
                    threshold,
                });
                self.observe_memory(&worker_id, usage);
            }
            WorkerResponse::WorkerShutdown => {
                debug!(worker_id = %worker_id, "worker acknowledged shutdown");
            }
        }
    }

    /// Take the execution for `task_id` if `worker_id` is the one running it
    fn take_execution(&mut self, worker_id: &str, task_id: &str) -> Option<Dispatched> {
        match self.executions.get(task_id) {
            Some(d) if d.execution.worker_id == worker_id => self.executions.remove(task_id),
            _ => {
                debug!(worker_id, task_id, "ignoring message for unknown execution");
                None
            }
        }
    }

    fn release_worker(&mut self, worker_id: &str, execution_time: Option<Duration>) {
        if let Some(worker) = self.worker_mut(worker_id) {
            worker.status = WorkerStatus::Idle;
            worker.current_task = None;
            worker.touch();
            if let Some(elapsed) = execution_time {
                worker.tasks_completed += 1;
                worker.total_execution_time += elapsed;
            }
        }
    }

    fn complete(&mut self, worker_id: &str, result: TaskResult) {
        let Some(dispatched) = self.take_execution(worker_id, &result.task_id) else {
            return;
        };
        let task_id = dispatched.task.id;

        self.release_worker(worker_id, Some(result.execution_time));
        self.counters.completed += 1;
        self.counters.execution_time += result.execution_time;
        self.queue.record_completed(result.execution_time);
        self.retries.remove(&task_id);

        debug!(
            worker_id,
            task_id = %task_id,
            elapsed_ms = result.execution_time.as_millis() as u64,
            "task completed"
        );
        self.events.publish(PoolEvent::TaskCompleted {
            task_id: task_id.clone(),
            worker_id: worker_id.to_string(),
            execution_time: result.execution_time,
        });

        let memory_usage = result.memory_usage;
        if let Some(tx) = self.pending.remove(&task_id) {
            let _ = tx.send(Ok(result));
        }

        self.observe_memory(worker_id, memory_usage);
    }

    fn fail_execution(&mut self, worker_id: &str, error: WorkerError) {
        let Some(task_id) = error.task_id.clone() else {
            warn!(worker_id, error = %error, "task error without task id");
            return;
        };
        let Some(dispatched) = self.take_execution(worker_id, &task_id) else {
            return;
        };

        self.release_worker(worker_id, None);
        self.settle_failure(dispatched.task.id, Some(worker_id.to_string()), error, true);
    }

    fn handle_exit(&mut self, worker_id: &str, exit: WorkerExit) {
        let Some(slot) = self.slot_of(worker_id) else {
            debug!(worker_id, "terminated worker thread exited");
            return;
        };

        let reason = match exit {
            WorkerExit::Clean => "worker thread exited unexpectedly".to_string(),
            WorkerExit::Fault(reason) => reason,
        };
        let error = WorkerError::crash(reason).with_worker(worker_id);
        error!(worker_id, error = %error, "worker crashed");

        let worker = &mut self.workers[slot];
        worker.status = WorkerStatus::Error;
        worker.error_count += 1;
        worker.last_error = Some(error.clone());
        self.counters.restarts += 1;

        self.events.publish(PoolEvent::WorkerError {
            worker_id: worker_id.to_string(),
            error: error.clone(),
        });

        if let Some(dispatched) = self.remove_worker(slot, TerminationReason::Crashed) {
            let error = error.with_task(dispatched.task.id.clone());
            self.recover_task(dispatched.task, error);
        }

        if !self.draining
            && (self.config.recovery.restart_worker_on_error
                || self.workers.len() < self.config.min_workers)
        {
            self.replace_worker();
        }
    }

    // =========================================================================
    // Memory governance
    // =========================================================================

    fn observe_memory(&mut self, worker_id: &str, usage: u64) {
        let Some(worker) = self.worker_mut(worker_id) else { return };
        worker.record_memory(usage);

        let limit = self.config.memory_restart_threshold();
        if usage <= limit {
            return;
        }

        warn!(
            worker_id,
            usage,
            memory_limit = self.config.memory_limit,
            "worker memory above restart threshold, restarting"
        );
        self.counters.restarts += 1;

        let Some(slot) = self.slot_of(worker_id) else { return };
        if let Some(dispatched) = self.remove_worker(slot, TerminationReason::MemoryLimit) {
            let error = WorkerError::memory(format!(
                "worker memory {usage} bytes exceeded {limit} bytes"
            ))
            .with_worker(worker_id)
            .with_task(dispatched.task.id.clone());
            self.recover_task(dispatched.task, error);
        }

        if !self.draining {
            self.replace_worker();
        }
    }

    // =========================================================================
    // Queue expiry and retries
    // =========================================================================

    fn handle_expired(&mut self, task: Task) {
        let limit = task
            .timeout
            .or(self.config.queue.default_timeout)
            .or(self.config.task_timeout)
            .unwrap_or_default();
        let error = TimeoutKind::Queue.error(limit).with_task(task.id.clone());
        warn!(task_id = %task.id, "task expired before reaching a worker");
        self.settle_failure(task.id, None, error, false);
    }

    fn handle_retry(&mut self, task: Task) {
        let Some(tx) = self.pending.get(&task.id) else {
            return;
        };
        if tx.is_closed() {
            let error = WorkerError::cancelled("caller stopped waiting before the retry ran")
                .with_task(task.id.clone());
            self.settle_failure(task.id, None, error, false);
            return;
        }
        if self.draining {
            let error = WorkerError::cancelled("worker pool shut down before the retry ran")
                .with_task(task.id.clone());
            self.settle_failure(task.id, None, error, false);
            return;
        }

        let task_id = task.id.clone();
        if let Err(e) = self.queue.enqueue(task) {
            let error = WorkerError::runtime(format!("failed to re-queue task: {e}"))
                .with_task(task_id.clone());
            self.settle_failure(task_id, None, error, false);
        }
    }

    /// Re-queue a task whose worker was lost, or fail it when out of retries
    fn recover_task(&mut self, task: Task, error: WorkerError) {
        let retry = self.retries.get(&task.id).copied().unwrap_or(0) + 1;
        let budget = self.retry_policy.budget(task.retries, self.config.max_retries);
        let caller_waiting = self
            .pending
            .get(&task.id)
            .is_some_and(|tx| !tx.is_closed());

        let retryable = !self.config.recovery.isolate_failed_tasks
            && !self.draining
            && caller_waiting
            && self.retry_policy.allows(retry, budget);

        if !retryable {
            let worker_id = error.worker_id.clone();
            self.settle_failure(task.id, worker_id, error, true);
            return;
        }

        let delay = self.retry_policy.delay_for_retry(retry);
        info!(
            task_id = %task.id,
            retry,
            budget,
            delay_ms = delay.as_millis() as u64,
            "re-queueing task after worker loss"
        );
        self.retries.insert(task.id.clone(), retry);
        self.counters.retried += 1;
        self.queue.release();

        let retry_tx = self.retry_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = retry_tx.send(task);
        });
    }

    /// Deliver a failure to the caller and account for it
    fn settle_failure(
        &mut self,
        task_id: TaskId,
        worker_id: Option<String>,
        error: WorkerError,
        dequeued: bool,
    ) {
        match error.kind {
            WorkerErrorKind::Timeout => self.counters.timed_out += 1,
            WorkerErrorKind::Cancelled => self.counters.cancelled += 1,
            _ => self.counters.failed += 1,
        }
        if dequeued {
            self.queue.record_failed();
        }
        self.retries.remove(&task_id);

        debug!(task_id = %task_id, error = %error, "task failed");
        self.events.publish(PoolEvent::TaskFailed {
            task_id: task_id.clone(),
            worker_id,
            error: error.clone(),
        });

        if let Some(tx) = self.pending.remove(&task_id) {
            let _ = tx.send(Err(error));
        }
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    fn drain(&mut self) {
        if self.draining {
            return;
        }

        while !self.queue.is_empty() {
            let candidates: Vec<Candidate> = self
                .workers
                .iter()
                .enumerate()
                .filter(|(_, w)| w.is_available())
                .map(|(slot, w)| Candidate {
                    slot,
                    tasks_completed: w.tasks_completed,
                })
                .collect();

            if let Some(slot) = self.balancer.select(&candidates) {
                let Some(task) = self.queue.dequeue() else { break };
                self.dispatch(slot, task);
                continue;
            }

            if !self.workers.is_empty() {
                break;
            }

            // No live workers at all
            match self.spawn_worker() {
                Ok(_) => break,
                Err(e) if self.config.recovery.fallback_to_main_thread => {
                    warn!(error = %e, "no workers available, running task inline");
                    let Some(task) = self.queue.dequeue() else { break };
                    self.run_inline(task);
                }
                Err(_) => break,
            }
        }
    }

    fn dispatch(&mut self, slot: usize, task: Task) {
        let worker = &mut self.workers[slot];
        worker.status = WorkerStatus::Busy;
        worker.current_task = Some(task.id.clone());
        worker.touch();
        let worker_id = worker.id.clone();

        let message = Message::for_task(
            task.id.clone(),
            WorkerRequest::TaskAssignment { task: task.clone() },
        );
        if !worker.handle.send(message) {
            // The exit signal recovers the task
            warn!(worker_id = %worker_id, task_id = %task.id, "worker inbox closed");
        }

        debug!(worker_id = %worker_id, task_id = %task.id, kind = %task.kind, "task dispatched");
        self.events.publish(PoolEvent::TaskStarted {
            task_id: task.id.clone(),
            worker_id: worker_id.clone(),
        });
        self.executions.insert(
            task.id.clone(),
            Dispatched {
                execution: TaskExecution::new(task.id.clone(), worker_id),
                task,
            },
        );
    }

    /// Run a task on the host's blocking pool
    pub(crate) fn run_inline(&mut self, task: Task) {
        let handlers = self.settings.handlers.clone();
        let signals = self.signal_tx.clone();

        self.events.publish(PoolEvent::TaskStarted {
            task_id: task.id.clone(),
            worker_id: INLINE_WORKER_ID.to_string(),
        });
        self.executions.insert(
            task.id.clone(),
            Dispatched {
                execution: TaskExecution::new(task.id.clone(), INLINE_WORKER_ID.to_string()),
                task: task.clone(),
            },
        );

        tokio::task::spawn_blocking(move || {
            let ctx = TaskContext::for_worker(
                task.id.clone(),
                INLINE_WORKER_ID.to_string(),
                signals.clone(),
            );
            let response = match run_handler(&handlers, &task, &ctx) {
                HandlerOutcome::Completed {
                    data,
                    execution_time,
                } => WorkerResponse::TaskResult(task_result(
                    &task,
                    data,
                    execution_time,
                    0,
                    INLINE_WORKER_ID,
                )),
                HandlerOutcome::Failed(error) => {
                    WorkerResponse::TaskError(error.with_worker(INLINE_WORKER_ID))
                }
                HandlerOutcome::Fatal(reason) => WorkerResponse::TaskError(
                    WorkerError::crash(reason)
                        .with_worker(INLINE_WORKER_ID)
                        .with_task(task.id.clone()),
                ),
            };

            let _ = signals.send(WorkerSignal {
                worker_id: INLINE_WORKER_ID.to_string(),
                kind: SignalKind::Message(Message::for_task(task.id, response)),
            });
        });
    }

    fn auto_scale(&mut self) {
        if !self.config.auto_scale || self.draining {
            return;
        }

        let backlog = self.queue.size();
        let from = self.workers.len();
        if backlog < self.config.scaling_threshold || from >= self.config.max_workers {
            return;
        }

        if self.spawn_worker().is_ok() {
            info!(backlog, from, to = from + 1, "auto-scaled worker pool");
            self.events.publish(PoolEvent::PoolScaled { from, to: from + 1 });
        }
    }

    // =========================================================================
    // Health
    // =========================================================================

    fn health_check(&mut self) {
        for worker in &self.workers {
            worker.handle.send(Message::new(WorkerRequest::HealthCheck));
        }

        self.reap_hung_workers();
        self.reap_idle_workers();

        while self.workers.len() < self.config.min_workers {
            if self.spawn_worker().is_err() {
                break;
            }
        }
    }

    fn reap_hung_workers(&mut self) {
        let limit = self.config.cpu_time_limit;
        let now = Instant::now();
        let hung: Vec<(TaskId, String)> = self
            .executions
            .iter()
            .filter(|(_, d)| d.execution.worker_id != INLINE_WORKER_ID)
            .filter(|(_, d)| exceeded(d.execution.started_at, limit, now).is_some())
            .map(|(id, d)| (id.clone(), d.execution.worker_id.clone()))
            .collect();

        for (task_id, worker_id) in hung {
            warn!(worker_id = %worker_id, task_id = %task_id, "execution exceeded cpu time limit");
            let Some(slot) = self.slot_of(&worker_id) else { continue };
            self.counters.restarts += 1;

            if self.remove_worker(slot, TerminationReason::Hung).is_some() {
                let error = TimeoutKind::Execution
                    .error(limit)
                    .with_worker(worker_id.clone())
                    .with_task(task_id.clone());
                self.settle_failure(task_id, Some(worker_id), error, true);
            }

            if !self.draining {
                self.replace_worker();
            }
        }
    }

    fn reap_idle_workers(&mut self) {
        let idle_timeout = self.config.idle_timeout;
        while self.workers.len() > self.config.min_workers {
            let stale = self
                .workers
                .iter()
                .enumerate()
                .filter(|(_, w)| w.status == WorkerStatus::Idle)
                .filter(|(_, w)| w.last_used.elapsed() > idle_timeout)
                .min_by_key(|(_, w)| w.last_used)
                .map(|(slot, _)| slot);

            let Some(slot) = stale else { break };
            let from = self.workers.len();
            self.remove_worker(slot, TerminationReason::IdleTimeout);
            self.events.publish(PoolEvent::PoolScaled {
                from,
                to: self.workers.len(),
            });
        }
    }

    fn publish_metrics(&mut self) {
        let metrics = self.snapshot();
        debug!(
            workers = metrics.total_workers,
            busy = metrics.busy_workers,
            queued = metrics.queued_tasks,
            completed = metrics.completed_tasks,
            "pool metrics"
        );
        self.events.publish(PoolEvent::MetricsUpdated { metrics });
    }

    fn snapshot(&self) -> PoolMetrics {
        let count = |status: WorkerStatus| self.workers.iter().filter(|w| w.status == status).count();
        let uptime = self.started_at.elapsed();
        let c = &self.counters;

        let avg_execution_time = if c.completed > 0 {
            Duration::from_secs_f64(c.execution_time.as_secs_f64() / c.completed as f64)
        } else {
            Duration::ZERO
        };
        let settled = c.completed + c.failed + c.timed_out;
        let error_rate = if settled > 0 {
            (c.failed + c.timed_out) as f64 / settled as f64
        } else {
            0.0
        };
        let throughput = if uptime.as_secs_f64() > 0.0 {
            c.completed as f64 / uptime.as_secs_f64()
        } else {
            0.0
        };

        PoolMetrics {
            total_workers: self.workers.len(),
            idle_workers: count(WorkerStatus::Idle),
            busy_workers: count(WorkerStatus::Busy),
            starting_workers: count(WorkerStatus::Starting),
            total_tasks: c.total,
            completed_tasks: c.completed,
            failed_tasks: c.failed,
            timed_out_tasks: c.timed_out,
            cancelled_tasks: c.cancelled,
            queued_tasks: self.queue.size(),
            running_tasks: self.executions.len(),
            retried_tasks: c.retried,
            worker_restarts: c.restarts,
            avg_execution_time,
            throughput,
            error_rate,
            memory_usage: self.workers.iter().map(|w| w.memory_usage).sum(),
            peak_memory: self.workers.iter().map(|w| w.peak_memory).max().unwrap_or(0),
            uptime,
            queue: self.queue.stats(),
        }
    }

    // =========================================================================
    // Worker table
    // =========================================================================

    fn slot_of(&self, worker_id: &str) -> Option<usize> {
        self.workers.iter().position(|w| w.id == worker_id)
    }

    fn worker_mut(&mut self, worker_id: &str) -> Option<&mut WorkerInstance> {
        self.workers.iter_mut().find(|w| w.id == worker_id)
    }

    fn spawn_worker(&mut self) -> Result<String, PoolError> {
        self.next_worker += 1;
        let worker_id = format!("worker-{}", self.next_worker);

        let handle = match WorkerHandle::spawn(&worker_id, self.settings.clone(), self.signal_tx.clone()) {
            Ok(handle) => handle,
            Err(e) => {
                error!(worker_id = %worker_id, error = %e, "failed to spawn worker");
                self.events.publish(PoolEvent::Error {
                    message: format!("failed to spawn {worker_id}: {e}"),
                });
                return Err(PoolError::Spawn(e));
            }
        };

        self.workers.push(WorkerInstance::new(worker_id.clone(), handle));
        info!(worker_id = %worker_id, workers = self.workers.len(), "worker created");
        self.events.publish(PoolEvent::WorkerCreated {
            worker_id: worker_id.clone(),
        });
        Ok(worker_id)
    }

    fn replace_worker(&mut self) {
        if self.workers.len() >= self.config.max_workers {
            return;
        }
        if let Err(e) = self.spawn_worker() {
            warn!(error = %e, "could not replace worker");
        }
    }

    /// Remove a worker from the table, returning its in-flight task
    fn remove_worker(&mut self, slot: usize, reason: TerminationReason) -> Option<Dispatched> {
        let mut worker = self.workers.remove(slot);
        self.balancer.slot_removed(slot);

        let in_flight = worker
            .current_task
            .take()
            .and_then(|task_id| self.executions.remove(&task_id));

        worker.handle.terminate();
        worker.status = WorkerStatus::Terminated;

        info!(worker_id = %worker.id, %reason, "worker terminated");
        self.events.publish(PoolEvent::WorkerTerminated {
            worker_id: worker.id,
            reason,
        });
        in_flight
    }

    fn terminate_all(&mut self, reason: TerminationReason) {
        while !self.workers.is_empty() {
            let slot = self.workers.len() - 1;
            if let Some(dispatched) = self.remove_worker(slot, reason) {
                self.executions.insert(dispatched.task.id.clone(), dispatched);
            }
        }
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    fn begin_shutdown(&mut self) {
        if self.draining {
            return;
        }

        info!(
            running = self.executions.len(),
            queued = self.queue.size(),
            grace_ms = self.config.shutdown_grace_period.as_millis() as u64,
            "draining worker pool"
        );
        self.draining = true;
        *self.status.write() = PoolStatus::Draining;
        self.drain_deadline = Some(tokio::time::Instant::now() + self.config.shutdown_grace_period);
    }

    fn finish_shutdown(&mut self) {
        if self.stopped {
            return;
        }

        let running: Vec<(TaskId, String)> = self
            .executions
            .drain()
            .map(|(id, d)| (id, d.execution.worker_id))
            .collect();
        for (task_id, worker_id) in running {
            let error = WorkerError::cancelled("worker pool shut down before the task finished")
                .with_worker(worker_id.clone())
                .with_task(task_id.clone());
            self.settle_failure(task_id, Some(worker_id), error, true);
        }

        self.terminate_all(TerminationReason::Shutdown);

        for task in self.queue.shutdown() {
            let error = WorkerError::cancelled("worker pool shut down before the task started")
                .with_task(task.id.clone());
            self.settle_failure(task.id, None, error, false);
        }

        let outstanding: Vec<TaskId> = self.pending.keys().cloned().collect();
        for task_id in outstanding {
            let error = WorkerError::cancelled("worker pool shut down").with_task(task_id.clone());
            self.settle_failure(task_id, None, error, false);
        }

        *self.status.write() = PoolStatus::Stopped;
        self.stopped = true;
        self.events.publish(PoolEvent::PoolShutdown);
        info!(
            completed = self.counters.completed,
            failed = self.counters.failed,
            cancelled = self.counters.cancelled,
            "worker pool stopped"
        );

        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecoveryConfig;
    use crate::task::CalculationKind;
    use crate::worker::{HandlerError, HandlerTable};
    use serde_json::{json, Value};

    fn coordinator(config: PoolConfig, handlers: HandlerTable) -> (Coordinator, Channels, mpsc::UnboundedSender<Command>) {
        let (queue, expired) = TaskQueue::new(config.queue.clone());
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (signal_tx, signals) = mpsc::unbounded_channel();
        let (retry_tx, retries) = mpsc::unbounded_channel();
        let settings = RuntimeSettings {
            handlers,
            probe: Arc::new(|_: &str| 0u64),
            warning_threshold: u64::MAX,
            sample_interval: Duration::from_secs(60),
        };
        let coordinator = Coordinator::new(
            config,
            settings,
            queue,
            Arc::new(EventBus::new()),
            Arc::new(RwLock::new(PoolStatus::Running)),
            signal_tx,
            retry_tx,
        );
        let channels = Channels {
            commands,
            signals,
            expired,
            retries,
        };
        (coordinator, channels, command_tx)
    }

    fn submit(c: &mut Coordinator, task: Task) -> oneshot::Receiver<TaskOutcome> {
        let (outcome, rx) = oneshot::channel();
        let (ack, mut ack_rx) = oneshot::channel();
        c.handle_command(Command::Submit { task, outcome, ack });
        ack_rx.try_recv().unwrap().unwrap();
        rx
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_inline_fallback_executes_task() {
        let handlers = HandlerTable::new().with(
            CalculationKind::MatrixSolve,
            |p: &Value, _: &TaskContext| Ok(json!({"echo": p})),
        );
        let config = PoolConfig::default().with_min_workers(0);
        let (mut c, mut channels, _commands) = coordinator(config, handlers);

        let mut rx = submit(&mut c, Task::new(CalculationKind::MatrixSolve, json!(7)).with_id("t-1"));
        let task = c.queue.dequeue().unwrap();
        c.run_inline(task);

        let signal = channels.signals.recv().await.unwrap();
        assert_eq!(signal.worker_id, INLINE_WORKER_ID);
        c.handle_signal(signal);

        let result = rx.try_recv().unwrap().unwrap();
        assert_eq!(result.data, json!({"echo": 7}));
        assert_eq!(result.worker_id.as_deref(), Some(INLINE_WORKER_ID));
        assert!(c.executions.is_empty());
    }

    #[tokio::test]
    async fn test_inline_fatal_is_reported_as_crash() {
        let handlers = HandlerTable::new().with(
            CalculationKind::MatrixSolve,
            |_: &Value, _: &TaskContext| Err(HandlerError::Fatal("abort".into())),
        );
        let (mut c, mut channels, _commands) = coordinator(PoolConfig::default(), handlers);

        let mut rx = submit(&mut c, Task::new(CalculationKind::MatrixSolve, json!(null)));
        let task = c.queue.dequeue().unwrap();
        c.run_inline(task);
        c.handle_signal(channels.signals.recv().await.unwrap());

        let err = rx.try_recv().unwrap().unwrap_err();
        assert_eq!(err.kind, WorkerErrorKind::Crash);
    }

    #[tokio::test]
    async fn test_duplicate_and_draining_submissions_are_rejected() {
        let (mut c, _channels, _commands) = coordinator(PoolConfig::default(), HandlerTable::new());
        let task = Task::new(CalculationKind::MatrixSolve, json!(null)).with_id("dup");
        let _rx = submit(&mut c, task.clone());

        let (outcome, _rx2) = oneshot::channel();
        assert!(matches!(c.accept(task, outcome), Err(PoolError::DuplicateTask(_))));

        c.begin_shutdown();
        let (outcome, _rx3) = oneshot::channel();
        let other = Task::new(CalculationKind::MatrixSolve, json!(null));
        assert!(matches!(c.accept(other, outcome), Err(PoolError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_signals_from_unknown_workers_are_ignored() {
        let (mut c, _channels, _commands) = coordinator(PoolConfig::default(), HandlerTable::new());
        c.handle_signal(WorkerSignal {
            worker_id: "worker-99".into(),
            kind: SignalKind::Exited(WorkerExit::Fault("late".into())),
        });
        c.handle_signal(WorkerSignal {
            worker_id: "worker-99".into(),
            kind: SignalKind::Message(Message::new(WorkerResponse::MemoryWarning {
                usage: u64::MAX,
                threshold: 1,
            })),
        });
        assert!(c.workers.is_empty());
        assert_eq!(c.counters.restarts, 0);
    }

    #[tokio::test]
    async fn test_guarded_panic_becomes_error_event() {
        let (mut c, _channels, _commands) = coordinator(PoolConfig::default(), HandlerTable::new());
        let mut events = c.events.subscribe();

        c.guarded("test", |_| panic!("kaboom"));

        match events.try_recv().unwrap() {
            PoolEvent::Error { message } => assert!(message.contains("kaboom")),
            other => panic!("unexpected event {other:?}"),
        }
    }

    fn slow_solver() -> HandlerTable {
        HandlerTable::new().with(CalculationKind::MatrixSolve, |p: &Value, _: &TaskContext| {
            std::thread::sleep(Duration::from_millis(50));
            Ok(json!({"echo": p}))
        })
    }

    fn recovery_config(isolate_failed_tasks: bool) -> PoolConfig {
        PoolConfig::default().with_recovery(RecoveryConfig {
            retry_delay: Duration::from_millis(10),
            isolate_failed_tasks,
            ..RecoveryConfig::default()
        })
    }

    fn over_limit(worker_id: &str) -> WorkerSignal {
        WorkerSignal {
            worker_id: worker_id.into(),
            kind: SignalKind::Message(Message::new(WorkerResponse::MemoryWarning {
                usage: u64::MAX,
                threshold: 1,
            })),
        }
    }

    /// Spawn worker-1 and hand it `task`
    async fn busy_worker(c: &mut Coordinator, channels: &mut Channels, task: Task) -> oneshot::Receiver<TaskOutcome> {
        c.spawn_worker().unwrap();
        let ready = channels.signals.recv().await.unwrap();
        assert!(matches!(
            ready.kind,
            SignalKind::Message(Message { body: WorkerResponse::WorkerReady, .. })
        ));
        c.handle_signal(ready);

        let task_id = task.id.clone();
        let rx = submit(c, task);
        c.drain();
        assert_eq!(c.executions[&task_id].execution.worker_id, "worker-1");
        rx
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_memory_restart_requeues_running_task() {
        let (mut c, mut channels, _commands) = coordinator(recovery_config(false), slow_solver());
        let task = Task::new(CalculationKind::MatrixSolve, json!(3)).with_id("t-mem");
        let mut rx = busy_worker(&mut c, &mut channels, task).await;

        c.handle_signal(over_limit("worker-1"));
        assert_eq!(c.counters.restarts, 1);
        assert_eq!(c.counters.retried, 1);
        assert!(c.pending.contains_key("t-mem"));
        assert!(c.executions.is_empty());
        let ids: Vec<&str> = c.workers.iter().map(|w| w.id.as_str()).collect();
        assert_eq!(ids, ["worker-2"]);

        let retry = channels.retries.recv().await.unwrap();
        c.handle_retry(retry);

        let result = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let signal = channels.signals.recv().await.unwrap();
                c.handle_signal(signal);
                c.drain();
                if let Ok(outcome) = rx.try_recv() {
                    break outcome;
                }
            }
        })
        .await
        .unwrap()
        .unwrap();

        assert_eq!(result.data, json!({"echo": 3}));
        assert_eq!(result.worker_id.as_deref(), Some("worker-2"));
        assert!(c.pending.is_empty());
        assert_eq!(c.counters.failed, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_memory_restart_fails_isolated_task() {
        let (mut c, mut channels, _commands) = coordinator(recovery_config(true), slow_solver());
        let task = Task::new(CalculationKind::MatrixSolve, json!(3)).with_id("t-mem");
        let mut rx = busy_worker(&mut c, &mut channels, task).await;

        c.handle_signal(over_limit("worker-1"));

        let err = rx.try_recv().unwrap().unwrap_err();
        assert_eq!(err.kind, WorkerErrorKind::Memory);
        assert_eq!(err.worker_id.as_deref(), Some("worker-1"));
        assert!(c.pending.is_empty());
        assert!(c.executions.is_empty());
        assert!(c.queue.is_empty());
        assert_eq!(c.counters.retried, 0);
        assert_eq!(c.counters.failed, 1);
        assert_eq!(c.counters.restarts, 1);
    }

    #[tokio::test]
    async fn test_retry_for_abandoned_caller_is_not_requeued() {
        let (mut c, _channels, _commands) = coordinator(PoolConfig::default(), HandlerTable::new());
        let rx = submit(&mut c, Task::new(CalculationKind::MatrixSolve, json!(null)).with_id("gone"));
        let task = c.queue.dequeue().unwrap();
        drop(rx);

        c.handle_retry(task);

        assert!(c.queue.is_empty());
        assert!(!c.pending.contains_key("gone"));
        assert_eq!(c.counters.cancelled, 1);
    }

    #[tokio::test]
    async fn test_finish_shutdown_cancels_everything() {
        let (mut c, _channels, _commands) = coordinator(PoolConfig::default(), HandlerTable::new());
        let mut queued = submit(&mut c, Task::new(CalculationKind::MatrixSolve, json!(null)));

        c.begin_shutdown();
        c.finish_shutdown();

        let err = queued.try_recv().unwrap().unwrap_err();
        assert_eq!(err.kind, WorkerErrorKind::Cancelled);
        assert_eq!(*c.status.read(), PoolStatus::Stopped);
        assert!(c.queue.is_closed());
        assert_eq!(c.snapshot().cancelled_tasks, 1);
    }
}
