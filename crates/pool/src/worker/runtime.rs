//! Worker runtime
//!
//! Each worker is an OS thread driving its own current-thread tokio
//! runtime. The loop waits on the inbox and a memory sampling interval:
//!
//! ```text
//!   start ──▶ worker-ready
//!     │
//!     ▼
//!   loop ──┬── task-assignment ──▶ run handler ──▶ task-result / task-error
//!          ├── health-check ─────▶ health report
//!          ├── sample tick ──────▶ memory-warning (above threshold)
//!          └── worker-shutdown / inbox closed ──▶ acknowledge, exit
//! ```
//!
//! Handlers run synchronously on the worker thread, so a worker answers
//! health checks only between tasks. A handler returning
//! [`HandlerError::Fatal`] ends the loop with an error and the thread
//! exits; the coordinator sees the exit as a crash.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::handler::{HandlerError, HandlerTable, TaskContext};
use super::memory::MemoryProbe;
use crate::error::WorkerError;
use crate::protocol::{
    HealthReport, Message, SignalKind, WorkerExit, WorkerHealth, WorkerRequest, WorkerResponse,
    WorkerSignal,
};
use crate::task::{Task, TaskId, TaskResult};

/// Everything a worker thread needs to run
pub(crate) struct WorkerRuntime {
    worker_id: String,
    handlers: HandlerTable,
    probe: Arc<dyn MemoryProbe>,
    warning_threshold: u64,
    sample_interval: Duration,
    inbox: mpsc::UnboundedReceiver<Message<WorkerRequest>>,
    signals: mpsc::UnboundedSender<WorkerSignal>,
    started_at: Instant,
    tasks_completed: u64,
    tasks_failed: u64,
    last_task: Option<TaskId>,
    last_failed: bool,
    memory_usage: u64,
}

/// Settings shared by every worker of a pool
#[derive(Clone)]
pub(crate) struct RuntimeSettings {
    pub handlers: HandlerTable,
    pub probe: Arc<dyn MemoryProbe>,
    pub warning_threshold: u64,
    pub sample_interval: Duration,
}

impl WorkerRuntime {
    pub(crate) fn new(
        worker_id: String,
        settings: RuntimeSettings,
        inbox: mpsc::UnboundedReceiver<Message<WorkerRequest>>,
        signals: mpsc::UnboundedSender<WorkerSignal>,
    ) -> Self {
        Self {
            worker_id,
            handlers: settings.handlers,
            probe: settings.probe,
            warning_threshold: settings.warning_threshold,
            sample_interval: settings.sample_interval,
            inbox,
            signals,
            started_at: Instant::now(),
            tasks_completed: 0,
            tasks_failed: 0,
            last_task: None,
            last_failed: false,
            memory_usage: 0,
        }
    }

    /// Thread body: run the loop and always report how the thread ended
    pub(crate) fn run_thread(self) {
        let worker_id = self.worker_id.clone();
        let signals = self.signals.clone();
        let probe = self.probe.clone();

        let exit = match panic::catch_unwind(AssertUnwindSafe(move || self.block_on_loop())) {
            Ok(Ok(())) => WorkerExit::Clean,
            Ok(Err(reason)) => WorkerExit::Fault(reason),
            Err(payload) => WorkerExit::Fault(panic_message(payload.as_ref())),
        };

        match &exit {
            WorkerExit::Clean => debug!(worker_id = %worker_id, "worker thread exited"),
            WorkerExit::Fault(reason) => {
                error!(worker_id = %worker_id, reason = %reason, "worker thread faulted")
            }
        }

        probe.release(&worker_id);
        let _ = signals.send(WorkerSignal {
            worker_id,
            kind: SignalKind::Exited(exit),
        });
    }

    fn block_on_loop(self) -> Result<(), String> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|e| format!("failed to build worker runtime: {e}"))?;

        runtime.block_on(self.run())
    }

    async fn run(mut self) -> Result<(), String> {
        info!(worker_id = %self.worker_id, "worker started");
        self.memory_usage = self.probe.sample(&self.worker_id);
        self.send(Message::new(WorkerResponse::WorkerReady));

        let start = tokio::time::Instant::now() + self.sample_interval;
        let mut sampler = tokio::time::interval_at(start, self.sample_interval);
        sampler.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                message = self.inbox.recv() => {
                    let Some(message) = message else {
                        debug!(worker_id = %self.worker_id, "inbox closed");
                        return Ok(());
                    };

                    match message.body {
                        WorkerRequest::TaskAssignment { task } => self.execute(task)?,
                        WorkerRequest::HealthCheck => {
                            let report = self.health_report();
                            self.send(Message::new(WorkerResponse::HealthCheck(report)));
                        }
                        WorkerRequest::WorkerShutdown => {
                            debug!(worker_id = %self.worker_id, "shutdown requested");
                            self.send(Message::new(WorkerResponse::WorkerShutdown));
                            return Ok(());
                        }
                    }
                }
                _ = sampler.tick() => {
                    self.sample_memory();
                }
            }
        }
    }

    fn execute(&mut self, task: Task) -> Result<(), String> {
        debug!(worker_id = %self.worker_id, task_id = %task.id, kind = %task.kind, "executing task");

        let ctx = TaskContext::for_worker(task.id.clone(), self.worker_id.clone(), self.signals.clone());
        let outcome = run_handler(&self.handlers, &task, &ctx);
        self.memory_usage = self.probe.sample(&self.worker_id);
        self.last_task = Some(task.id.clone());
        self.last_failed = !matches!(outcome, HandlerOutcome::Completed { .. });
        if self.last_failed {
            self.tasks_failed += 1;
        }

        let response = match outcome {
            HandlerOutcome::Completed {
                data,
                execution_time,
            } => {
                self.tasks_completed += 1;
                WorkerResponse::TaskResult(task_result(
                    &task,
                    data,
                    execution_time,
                    self.memory_usage,
                    &self.worker_id,
                ))
            }
            HandlerOutcome::Failed(error) => {
                WorkerResponse::TaskError(error.with_worker(self.worker_id.clone()))
            }
            HandlerOutcome::Fatal(reason) => {
                warn!(worker_id = %self.worker_id, task_id = %task.id, "handler raised a fatal fault");
                return Err(reason);
            }
        };

        self.send(Message::for_task(task.id, response));
        self.check_memory_threshold();
        Ok(())
    }

    fn sample_memory(&mut self) {
        self.memory_usage = self.probe.sample(&self.worker_id);
        self.check_memory_threshold();
    }

    fn check_memory_threshold(&self) {
        if self.memory_usage > self.warning_threshold {
            warn!(
                worker_id = %self.worker_id,
                usage = self.memory_usage,
                threshold = self.warning_threshold,
                "worker memory above warning threshold"
            );
            self.send(Message::new(WorkerResponse::MemoryWarning {
                usage: self.memory_usage,
                threshold: self.warning_threshold,
            }));
        }
    }

    fn health_report(&self) -> HealthReport {
        let status = match (&self.last_task, self.last_failed) {
            (None, _) => WorkerHealth::Ready,
            (Some(_), false) => WorkerHealth::Idle,
            (Some(_), true) => WorkerHealth::Degraded,
        };
        HealthReport {
            status,
            last_task: self.last_task.clone(),
            uptime: self.started_at.elapsed(),
            tasks_completed: self.tasks_completed,
            tasks_failed: self.tasks_failed,
            memory_usage: self.memory_usage,
        }
    }

    fn send(&self, message: Message<WorkerResponse>) {
        if self
            .signals
            .send(WorkerSignal {
                worker_id: self.worker_id.clone(),
                kind: SignalKind::Message(message),
            })
            .is_err()
        {
            debug!(worker_id = %self.worker_id, "coordinator gone, dropping message");
        }
    }
}

/// Result of running one handler call
pub(crate) enum HandlerOutcome {
    Completed {
        data: serde_json::Value,
        execution_time: Duration,
    },
    Failed(WorkerError),
    Fatal(String),
}

/// Run the handler for `task`, catching panics
pub(crate) fn run_handler(handlers: &HandlerTable, task: &Task, ctx: &TaskContext) -> HandlerOutcome {
    let started = Instant::now();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        handlers.dispatch(task.kind, &task.payload, ctx)
    }));
    let execution_time = started.elapsed();

    let error = match outcome {
        Ok(Ok(data)) => {
            return HandlerOutcome::Completed {
                data,
                execution_time,
            }
        }
        Ok(Err(HandlerError::Fatal(reason))) => return HandlerOutcome::Fatal(reason),
        Ok(Err(e)) => e.into_worker_error(),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            WorkerError::runtime(format!("handler panicked: {message}")).with_stack(message)
        }
    };

    HandlerOutcome::Failed(
        error
            .with_task(task.id.clone())
            .with_context(serde_json::json!({ "kind": task.kind.as_str() })),
    )
}

/// Build the result message for a completed task
pub(crate) fn task_result(
    task: &Task,
    data: serde_json::Value,
    execution_time: Duration,
    memory_usage: u64,
    worker_id: &str,
) -> TaskResult {
    let mut metadata = HashMap::new();
    metadata.insert("kind".to_string(), serde_json::json!(task.kind.as_str()));

    TaskResult {
        task_id: task.id.clone(),
        success: true,
        data,
        execution_time,
        memory_usage,
        worker_id: Some(worker_id.to_string()),
        metadata,
    }
}

/// Text of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkerErrorKind;
    use crate::task::CalculationKind;
    use serde_json::{json, Value};

    struct Harness {
        inbox: mpsc::UnboundedSender<Message<WorkerRequest>>,
        signals: mpsc::UnboundedReceiver<WorkerSignal>,
        thread: std::thread::JoinHandle<()>,
    }

    fn start(handlers: HandlerTable, probe: Arc<dyn MemoryProbe>, threshold: u64) -> Harness {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let settings = RuntimeSettings {
            handlers,
            probe,
            warning_threshold: threshold,
            sample_interval: Duration::from_millis(20),
        };
        let runtime = WorkerRuntime::new("worker-test".into(), settings, inbox_rx, signal_tx);
        let thread = std::thread::spawn(move || runtime.run_thread());

        Harness {
            inbox: inbox_tx,
            signals: signal_rx,
            thread,
        }
    }

    fn handlers() -> HandlerTable {
        HandlerTable::new()
            .with(CalculationKind::MatrixSolve, |p: &Value, ctx: &TaskContext| {
                ctx.report_progress(1, 2);
                Ok(json!({"echo": p}))
            })
            .with(CalculationKind::Thermodynamics, |_: &Value, _: &TaskContext| {
                Err(HandlerError::failed("diverged"))
            })
            .with(CalculationKind::Stoichiometry, |_: &Value, _: &TaskContext| -> Result<Value, HandlerError> {
                panic!("boom")
            })
            .with(CalculationKind::BatchAnalysis, |_: &Value, _: &TaskContext| {
                Err(HandlerError::Fatal("segfault".into()))
            })
    }

    async fn next_message(h: &mut Harness) -> Message<WorkerResponse> {
        loop {
            let signal = tokio::time::timeout(Duration::from_secs(5), h.signals.recv())
                .await
                .unwrap()
                .unwrap();
            match signal.kind {
                SignalKind::Message(m) if m.kind() != crate::protocol::MessageKind::MemoryWarning => {
                    return m
                }
                SignalKind::Message(_) => continue,
                SignalKind::Exited(exit) => panic!("unexpected exit: {exit:?}"),
            }
        }
    }

    fn assign(h: &Harness, kind: CalculationKind) -> String {
        let task = Task::new(kind, json!({"x": 1}));
        let id = task.id.clone();
        h.inbox
            .send(Message::for_task(id.clone(), WorkerRequest::TaskAssignment { task }))
            .unwrap();
        id
    }

    #[tokio::test]
    async fn test_ready_result_and_progress() {
        let mut h = start(handlers(), Arc::new(|_: &str| 0u64), u64::MAX);
        assert!(matches!(next_message(&mut h).await.body, WorkerResponse::WorkerReady));

        let id = assign(&h, CalculationKind::MatrixSolve);
        let progress = next_message(&mut h).await;
        assert_eq!(progress.task_id.as_deref(), Some(id.as_str()));
        assert!(matches!(progress.body, WorkerResponse::TaskProgress(_)));

        match next_message(&mut h).await.body {
            WorkerResponse::TaskResult(result) => {
                assert_eq!(result.task_id, id);
                assert_eq!(result.data, json!({"echo": {"x": 1}}));
                assert_eq!(result.worker_id.as_deref(), Some("worker-test"));
            }
            other => panic!("expected result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_health_reflects_last_task() {
        let mut h = start(handlers(), Arc::new(|_: &str| 0u64), u64::MAX);
        next_message(&mut h).await;

        h.inbox.send(Message::new(WorkerRequest::HealthCheck)).unwrap();
        match next_message(&mut h).await.body {
            WorkerResponse::HealthCheck(report) => {
                assert_eq!(report.status, WorkerHealth::Ready);
                assert!(report.last_task.is_none());
            }
            other => panic!("expected health report, got {other:?}"),
        }

        let ok = assign(&h, CalculationKind::MatrixSolve);
        next_message(&mut h).await;
        next_message(&mut h).await;
        h.inbox.send(Message::new(WorkerRequest::HealthCheck)).unwrap();
        match next_message(&mut h).await.body {
            WorkerResponse::HealthCheck(report) => {
                assert_eq!(report.status, WorkerHealth::Idle);
                assert_eq!(report.last_task.as_deref(), Some(ok.as_str()));
                assert_eq!(report.tasks_completed, 1);
            }
            other => panic!("expected health report, got {other:?}"),
        }

        let failed = assign(&h, CalculationKind::Thermodynamics);
        next_message(&mut h).await;
        h.inbox.send(Message::new(WorkerRequest::HealthCheck)).unwrap();
        match next_message(&mut h).await.body {
            WorkerResponse::HealthCheck(report) => {
                assert_eq!(report.status, WorkerHealth::Degraded);
                assert_eq!(report.last_task.as_deref(), Some(failed.as_str()));
                assert_eq!(report.tasks_failed, 1);
            }
            other => panic!("expected health report, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_errors_and_panics_keep_worker_alive() {
        let mut h = start(handlers(), Arc::new(|_: &str| 0u64), u64::MAX);
        next_message(&mut h).await;

        assign(&h, CalculationKind::Thermodynamics);
        match next_message(&mut h).await.body {
            WorkerResponse::TaskError(e) => assert_eq!(e.kind, WorkerErrorKind::Runtime),
            other => panic!("expected error, got {other:?}"),
        }

        assign(&h, CalculationKind::Stoichiometry);
        match next_message(&mut h).await.body {
            WorkerResponse::TaskError(e) => {
                assert_eq!(e.kind, WorkerErrorKind::Runtime);
                assert_eq!(e.stack.as_deref(), Some("boom"));
            }
            other => panic!("expected error, got {other:?}"),
        }

        assign(&h, CalculationKind::CompoundAnalysis);
        match next_message(&mut h).await.body {
            WorkerResponse::TaskError(e) => assert_eq!(e.kind, WorkerErrorKind::Validation),
            other => panic!("expected error, got {other:?}"),
        }

        h.inbox.send(Message::new(WorkerRequest::HealthCheck)).unwrap();
        match next_message(&mut h).await.body {
            WorkerResponse::HealthCheck(report) => {
                assert_eq!(report.status, WorkerHealth::Degraded);
                assert_eq!(report.tasks_completed, 0);
                assert_eq!(report.tasks_failed, 3);
            }
            other => panic!("expected health report, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fatal_fault_exits_thread() {
        let mut h = start(handlers(), Arc::new(|_: &str| 0u64), u64::MAX);
        next_message(&mut h).await;
        assign(&h, CalculationKind::BatchAnalysis);

        let signal = tokio::time::timeout(Duration::from_secs(5), h.signals.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(signal.kind, SignalKind::Exited(WorkerExit::Fault(ref r)) if r == "segfault"));
        h.thread.join().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_is_acknowledged() {
        let mut h = start(handlers(), Arc::new(|_: &str| 0u64), u64::MAX);
        next_message(&mut h).await;

        h.inbox.send(Message::new(WorkerRequest::WorkerShutdown)).unwrap();
        assert!(matches!(next_message(&mut h).await.body, WorkerResponse::WorkerShutdown));

        let signal = h.signals.recv().await.unwrap();
        assert!(matches!(signal.kind, SignalKind::Exited(WorkerExit::Clean)));
    }

    #[tokio::test]
    async fn test_memory_warning_above_threshold() {
        let mut h = start(handlers(), Arc::new(|_: &str| 2048u64), 1024);

        let warning = loop {
            let signal = tokio::time::timeout(Duration::from_secs(5), h.signals.recv())
                .await
                .unwrap()
                .unwrap();
            if let SignalKind::Message(m) = signal.kind {
                if let WorkerResponse::MemoryWarning { usage, threshold } = m.body {
                    break (usage, threshold);
                }
            }
        };
        assert_eq!(warning, (2048, 1024));
        drop(h.inbox);
    }

    #[test]
    fn test_panic_message() {
        let payload = std::panic::catch_unwind(|| panic!("bad {}", 1)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "bad 1");
    }
}
