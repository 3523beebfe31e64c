//! Worker pool manager
//!
//! [`PoolManager`] is a cheap, cloneable handle. All pool state lives in a
//! single coordinator task; the handle talks to it over a command channel.
//!
//! # Example
//!
//! ```no_run
//! use reagent_pool::{CalculationKind, HandlerTable, PoolConfig, PoolManager, Task, TaskContext};
//! use serde_json::{json, Value};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let handlers = HandlerTable::new().with(
//!     CalculationKind::MatrixSolve,
//!     |payload: &Value, _ctx: &TaskContext| Ok(json!({"echo": payload})),
//! );
//!
//! let pool = PoolManager::builder(PoolConfig::default())
//!     .with_handlers(handlers)
//!     .start()
//!     .await?;
//!
//! let result = pool
//!     .execute(Task::new(CalculationKind::MatrixSolve, json!([1, 2])))
//!     .await?;
//! println!("{}", result.data);
//!
//! pool.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod balancer;
mod coordinator;
mod instance;
mod metrics;

pub use instance::WorkerStatus;
pub use metrics::{PoolMetrics, WorkerInfo};

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

use crate::config::PoolConfig;
use crate::error::{PoolError, WorkerError};
use crate::events::{EventBus, PoolEvent};
use crate::queue::TaskQueue;
use crate::reliability::TimeoutKind;
use crate::task::{Task, TaskId, TaskResult};
use crate::worker::{HandlerTable, MemoryProbe, ProcessMemoryProbe, RuntimeSettings};
use coordinator::{Channels, Command, Coordinator, TaskOutcome};

/// Pool lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    Starting,
    Running,
    /// No new tasks accepted, running tasks finishing
    Draining,
    Stopped,
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Draining => write!(f, "draining"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Future resolving to the outcome of a submitted task
///
/// Resolves exactly once: with the result, with the task's error, or with a
/// timeout error when the caller-side timeout elapses first.
pub struct TaskHandle {
    task_id: TaskId,
    inner: BoxFuture<'static, TaskOutcome>,
}

impl TaskHandle {
    fn new(task_id: TaskId, rx: oneshot::Receiver<TaskOutcome>, timeout: Option<Duration>) -> Self {
        let id = task_id.clone();
        let outcome = async move {
            rx.await.unwrap_or_else(|_| {
                Err(WorkerError::cancelled("worker pool stopped").with_task(id))
            })
        };

        let inner = match timeout {
            Some(limit) => {
                let id = task_id.clone();
                async move {
                    tokio::time::timeout(limit, outcome)
                        .await
                        .unwrap_or_else(|_| Err(TimeoutKind::Caller.error(limit).with_task(id)))
                }
                .boxed()
            }
            None => outcome.boxed(),
        };

        Self { task_id, inner }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }
}

impl Future for TaskHandle {
    type Output = Result<TaskResult, WorkerError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("task_id", &self.task_id)
            .finish_non_exhaustive()
    }
}

/// Builder for a [`PoolManager`]
pub struct PoolBuilder {
    config: PoolConfig,
    handlers: HandlerTable,
    probe: Option<Arc<dyn MemoryProbe>>,
    events: Arc<EventBus>,
}

impl PoolBuilder {
    /// Handlers the workers dispatch to
    pub fn with_handlers(mut self, handlers: HandlerTable) -> Self {
        self.handlers = handlers;
        self
    }

    /// Replace the process memory probe
    pub fn with_memory_probe(mut self, probe: impl MemoryProbe + 'static) -> Self {
        self.probe = Some(Arc::new(probe));
        self
    }

    /// Subscribe before start so initialization events are observed
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Spawn the initial workers and the coordinator
    ///
    /// Must be called within a tokio runtime.
    pub async fn start(self) -> Result<PoolManager, PoolError> {
        let mut config = self.config;
        config.validate()?;
        if config.queue.default_timeout.is_none() {
            config.queue.default_timeout = config.task_timeout;
        }

        let probe: Arc<dyn MemoryProbe> = match self.probe {
            Some(probe) => probe,
            None => Arc::new(ProcessMemoryProbe::new()),
        };
        let settings = RuntimeSettings {
            handlers: self.handlers,
            probe,
            warning_threshold: config.memory_warning_threshold,
            sample_interval: config.memory_sample_interval,
        };

        let (queue, expired) = TaskQueue::new(config.queue.clone());
        queue.start_sweep();

        let (command_tx, commands) = mpsc::unbounded_channel();
        let (signal_tx, signals) = mpsc::unbounded_channel();
        let (retry_tx, retries) = mpsc::unbounded_channel();
        let status = Arc::new(RwLock::new(PoolStatus::Starting));

        let mut coordinator = Coordinator::new(
            config.clone(),
            settings,
            Arc::clone(&queue),
            Arc::clone(&self.events),
            Arc::clone(&status),
            signal_tx,
            retry_tx,
        );
        if let Err(e) = coordinator.initialize() {
            queue.shutdown();
            return Err(e);
        }

        *status.write() = PoolStatus::Running;
        let handle = tokio::spawn(coordinator.run(Channels {
            commands,
            signals,
            expired,
            retries,
        }));

        Ok(PoolManager {
            inner: Arc::new(Inner {
                config,
                commands: command_tx,
                events: self.events,
                status,
                coordinator: Mutex::new(Some(handle)),
            }),
        })
    }
}

struct Inner {
    config: PoolConfig,
    commands: mpsc::UnboundedSender<Command>,
    events: Arc<EventBus>,
    status: Arc<RwLock<PoolStatus>>,
    coordinator: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a running worker pool
#[derive(Clone)]
pub struct PoolManager {
    inner: Arc<Inner>,
}

impl PoolManager {
    /// Start configuring a pool
    pub fn builder(config: PoolConfig) -> PoolBuilder {
        PoolBuilder {
            config,
            handlers: HandlerTable::new(),
            probe: None,
            events: Arc::new(EventBus::new()),
        }
    }

    /// Start a pool with the given handlers and the process memory probe
    pub async fn start(config: PoolConfig, handlers: HandlerTable) -> Result<Self, PoolError> {
        Self::builder(config).with_handlers(handlers).start().await
    }

    /// Queue a task and return a handle to its outcome
    ///
    /// Fails immediately when the task is malformed, its id was already
    /// used, the queue is full, or the pool is shutting down.
    #[instrument(skip(self, task), fields(task_id = %task.id, kind = %task.kind))]
    pub async fn submit_task(&self, task: Task) -> Result<TaskHandle, PoolError> {
        let task_id = task.id.clone();
        let timeout = task.timeout.or(self.inner.config.task_timeout);

        let (outcome, outcome_rx) = oneshot::channel();
        let (ack, ack_rx) = oneshot::channel();
        self.inner
            .commands
            .send(Command::Submit { task, outcome, ack })
            .map_err(|_| PoolError::ShuttingDown)?;
        ack_rx.await.map_err(|_| PoolError::ShuttingDown)??;

        debug!("task submitted");
        Ok(TaskHandle::new(task_id, outcome_rx, timeout))
    }

    /// Submit a task and wait for its outcome
    pub async fn execute(&self, task: Task) -> Result<TaskResult, PoolError> {
        let handle = self.submit_task(task).await?;
        Ok(handle.await?)
    }

    /// Resize the pool to `target` workers
    ///
    /// Returns the resulting pool size. Busy workers are never interrupted,
    /// so a scale-down can leave the pool above `target`.
    #[instrument(skip(self))]
    pub async fn scale_pool(&self, target: usize) -> Result<usize, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Scale { target, reply })?;
        rx.await.map_err(|_| PoolError::ShuttingDown)?
    }

    /// Current pool metrics
    pub async fn metrics(&self) -> Result<PoolMetrics, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Metrics { reply })?;
        rx.await.map_err(|_| PoolError::Unavailable)
    }

    /// Per-worker details
    pub async fn worker_info(&self) -> Result<Vec<WorkerInfo>, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Workers { reply })?;
        rx.await.map_err(|_| PoolError::Unavailable)
    }

    /// Receive pool lifecycle events
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    pub fn status(&self) -> PoolStatus {
        *self.inner.status.read()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Drain and stop the pool
    ///
    /// Running tasks get the configured grace period; queued and unfinished
    /// tasks are cancelled. Safe to call more than once.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.inner.commands.send(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }

        let handle = self.inner.coordinator.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "coordinator task failed");
            }
            info!("worker pool shut down");
        }
    }

    fn send(&self, command: Command) -> Result<(), PoolError> {
        self.inner
            .commands
            .send(command)
            .map_err(|_| PoolError::ShuttingDown)
    }
}

impl fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolManager")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
