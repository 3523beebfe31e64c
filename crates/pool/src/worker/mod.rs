//! Worker side of the pool
//!
//! - [`HandlerTable`] - calculation handlers indexed by kind
//! - [`TaskContext`] - progress reporting for a running handler
//! - [`MemoryProbe`] - memory sampling used for governance

mod handler;
mod memory;
mod runtime;

pub use handler::{CalculationHandler, HandlerError, HandlerTable, TaskContext};
pub use memory::{MemoryProbe, ProcessMemoryProbe};

pub(crate) use runtime::{panic_message, run_handler, task_result, HandlerOutcome, RuntimeSettings};

use runtime::WorkerRuntime;

use std::thread::JoinHandle;

use tokio::sync::mpsc;

use crate::protocol::{Message, WorkerRequest, WorkerSignal};

/// Coordinator-side handle of a worker thread
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    inbox: Option<mpsc::UnboundedSender<Message<WorkerRequest>>>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Spawn a named worker thread
    pub(crate) fn spawn(
        worker_id: &str,
        settings: RuntimeSettings,
        signals: mpsc::UnboundedSender<WorkerSignal>,
    ) -> std::io::Result<Self> {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let runtime = WorkerRuntime::new(worker_id.to_string(), settings, inbox_rx, signals);

        let thread = std::thread::Builder::new()
            .name(worker_id.to_string())
            .spawn(move || runtime.run_thread())?;

        Ok(Self {
            inbox: Some(inbox_tx),
            thread: Some(thread),
        })
    }

    /// Send a request; false when the worker's inbox is gone
    pub(crate) fn send(&self, message: Message<WorkerRequest>) -> bool {
        self.inbox
            .as_ref()
            .is_some_and(|tx| tx.send(message).is_ok())
    }

    /// Ask the worker to stop and detach its thread
    ///
    /// A thread busy inside a handler finishes that call before it sees
    /// the request; its late messages are ignored by the coordinator.
    pub(crate) fn terminate(&mut self) {
        if let Some(tx) = self.inbox.take() {
            let _ = tx.send(Message::new(WorkerRequest::WorkerShutdown));
        }
        self.thread.take();
    }
}
