//! Calculation handlers and the enum-indexed dispatch table

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::WorkerError;
use crate::protocol::{Message, ProgressReport, SignalKind, WorkerResponse, WorkerSignal};
use crate::task::{CalculationKind, TaskId};

/// Errors a handler can return
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum HandlerError {
    /// Payload rejected before any work was done
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// No handler registered for the kind
    #[error("unsupported calculation kind: {0}")]
    Unsupported(CalculationKind),

    /// Calculation failed
    #[error("calculation failed: {0}")]
    Failed(String),

    /// Unrecoverable fault; the worker executing the task exits
    #[error("fatal worker fault: {0}")]
    Fatal(String),
}

impl HandlerError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Convert into the error reported for the task.
    ///
    /// Fatal faults are reported by the coordinator as crashes instead.
    pub fn into_worker_error(self) -> WorkerError {
        match self {
            Self::InvalidInput(_) | Self::Unsupported(_) => WorkerError::validation(self.to_string()),
            Self::Failed(_) => WorkerError::runtime(self.to_string()),
            Self::Fatal(_) => WorkerError::crash(self.to_string()),
        }
    }
}

/// A synchronous calculation run inside a worker
///
/// Implemented for any `Fn(&Value, &TaskContext) -> Result<Value, HandlerError>`.
pub trait CalculationHandler: Send + Sync {
    fn execute(&self, payload: &Value, ctx: &TaskContext) -> Result<Value, HandlerError>;
}

impl<F> CalculationHandler for F
where
    F: Fn(&Value, &TaskContext) -> Result<Value, HandlerError> + Send + Sync,
{
    fn execute(&self, payload: &Value, ctx: &TaskContext) -> Result<Value, HandlerError> {
        self(payload, ctx)
    }
}

/// Handlers indexed by calculation kind
///
/// # Example
///
/// ```
/// use reagent_pool::{CalculationKind, HandlerTable, TaskContext};
/// use serde_json::{json, Value};
///
/// let table = HandlerTable::new().with(
///     CalculationKind::MatrixSolve,
///     |payload: &Value, _ctx: &TaskContext| Ok(json!({"echo": payload})),
/// );
/// assert!(table.supports(CalculationKind::MatrixSolve));
/// assert!(!table.supports(CalculationKind::Thermodynamics));
/// ```
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: [Option<Arc<dyn CalculationHandler>>; CalculationKind::COUNT],
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the kind
    pub fn register_handler<H>(&mut self, kind: CalculationKind, handler: H)
    where
        H: CalculationHandler + 'static,
    {
        self.handlers[kind.index()] = Some(Arc::new(handler));
    }

    /// Register a function or closure handler
    pub fn register<F>(&mut self, kind: CalculationKind, handler: F)
    where
        F: Fn(&Value, &TaskContext) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        self.register_handler(kind, handler);
    }

    /// Builder form of [`register`](Self::register)
    pub fn with<F>(mut self, kind: CalculationKind, handler: F) -> Self
    where
        F: Fn(&Value, &TaskContext) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        self.register(kind, handler);
        self
    }

    pub fn supports(&self, kind: CalculationKind) -> bool {
        self.handlers[kind.index()].is_some()
    }

    /// Kinds with a registered handler
    pub fn kinds(&self) -> Vec<CalculationKind> {
        CalculationKind::ALL
            .into_iter()
            .filter(|kind| self.supports(*kind))
            .collect()
    }

    /// Run the handler registered for `kind`
    pub fn dispatch(
        &self,
        kind: CalculationKind,
        payload: &Value,
        ctx: &TaskContext,
    ) -> Result<Value, HandlerError> {
        match &self.handlers[kind.index()] {
            Some(handler) => handler.execute(payload, ctx),
            None => Err(HandlerError::Unsupported(kind)),
        }
    }
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerTable")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[derive(Debug, Clone)]
enum ProgressSink {
    Discard,
    Reports(mpsc::UnboundedSender<ProgressReport>),
    Worker {
        worker_id: String,
        signals: mpsc::UnboundedSender<WorkerSignal>,
    },
}

/// Per-task context handed to a handler
#[derive(Debug, Clone)]
pub struct TaskContext {
    task_id: TaskId,
    sink: ProgressSink,
}

impl TaskContext {
    /// Context whose progress reports are discarded
    pub fn new(task_id: impl Into<TaskId>) -> Self {
        Self {
            task_id: task_id.into(),
            sink: ProgressSink::Discard,
        }
    }

    /// Context forwarding progress reports to a channel
    pub fn with_progress_channel(
        task_id: impl Into<TaskId>,
        tx: mpsc::UnboundedSender<ProgressReport>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            sink: ProgressSink::Reports(tx),
        }
    }

    pub(crate) fn for_worker(
        task_id: TaskId,
        worker_id: String,
        signals: mpsc::UnboundedSender<WorkerSignal>,
    ) -> Self {
        Self {
            task_id,
            sink: ProgressSink::Worker { worker_id, signals },
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Report that `completed` of `total` items are done
    pub fn report_progress(&self, completed: u64, total: u64) {
        self.send(ProgressReport {
            completed,
            total,
            message: None,
        });
    }

    /// Report progress with a short status message
    pub fn report_progress_with(&self, completed: u64, total: u64, message: impl Into<String>) {
        self.send(ProgressReport {
            completed,
            total,
            message: Some(message.into()),
        });
    }

    fn send(&self, report: ProgressReport) {
        // Receivers going away only means nobody is listening any more
        match &self.sink {
            ProgressSink::Discard => {}
            ProgressSink::Reports(tx) => {
                let _ = tx.send(report);
            }
            ProgressSink::Worker { worker_id, signals } => {
                let message =
                    Message::for_task(self.task_id.clone(), WorkerResponse::TaskProgress(report));
                let _ = signals.send(WorkerSignal {
                    worker_id: worker_id.clone(),
                    kind: SignalKind::Message(message),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkerErrorKind;
    use serde_json::json;

    fn double(payload: &Value, _ctx: &TaskContext) -> Result<Value, HandlerError> {
        let n = payload
            .get("n")
            .and_then(Value::as_i64)
            .ok_or_else(|| HandlerError::invalid_input("missing n"))?;
        Ok(json!(n * 2))
    }

    #[test]
    fn test_dispatch_to_registered_handler() {
        let table = HandlerTable::new().with(CalculationKind::MatrixSolve, double);
        let ctx = TaskContext::new("t-1");

        let out = table
            .dispatch(CalculationKind::MatrixSolve, &json!({"n": 21}), &ctx)
            .unwrap();
        assert_eq!(out, json!(42));
        assert_eq!(table.kinds(), vec![CalculationKind::MatrixSolve]);
    }

    #[test]
    fn test_unsupported_kind() {
        let table = HandlerTable::new();
        let err = table
            .dispatch(CalculationKind::Stoichiometry, &json!({}), &TaskContext::new("t"))
            .unwrap_err();
        assert_eq!(err, HandlerError::Unsupported(CalculationKind::Stoichiometry));
        assert_eq!(err.into_worker_error().kind, WorkerErrorKind::Validation);
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(
            HandlerError::invalid_input("x").into_worker_error().kind,
            WorkerErrorKind::Validation
        );
        assert_eq!(
            HandlerError::failed("x").into_worker_error().kind,
            WorkerErrorKind::Runtime
        );
        assert_eq!(
            HandlerError::Fatal("x".into()).into_worker_error().kind,
            WorkerErrorKind::Crash
        );
    }

    #[test]
    fn test_progress_channel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = TaskContext::with_progress_channel("t-1", tx);
        ctx.report_progress(1, 3);
        ctx.report_progress_with(3, 3, "done");

        assert_eq!(rx.try_recv().unwrap().completed, 1);
        let last = rx.try_recv().unwrap();
        assert_eq!(last.message.as_deref(), Some("done"));
        assert_eq!(last.fraction(), 1.0);
    }

    #[test]
    fn test_closures_are_handlers() {
        let table = HandlerTable::new().with(
            CalculationKind::BatchAnalysis,
            |_: &Value, ctx: &TaskContext| {
                ctx.report_progress(1, 1);
                Ok(json!(ctx.task_id()))
            },
        );
        let out = table
            .dispatch(CalculationKind::BatchAnalysis, &Value::Null, &TaskContext::new("abc"))
            .unwrap();
        assert_eq!(out, json!("abc"));
    }
}
