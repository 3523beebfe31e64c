//! # Calculation Worker Pool
//!
//! Offloads CPU-bound calculation tasks onto a bounded, self-healing pool of
//! worker threads.
//!
//! ## Features
//!
//! - **Priority queue**: capacity-bounded, four priority levels, FIFO within a level, timeout expiry
//! - **Load balancing**: round-robin, least-busy or random worker selection
//! - **Elastic sizing**: explicit scaling, backlog-driven auto-scaling and idle reaping
//! - **Memory governance**: per-worker sampling, warnings and proactive restarts
//! - **Crash recovery**: worker replacement and retries with exponential backoff
//! - **Lifecycle events**: every state change is published to subscribers
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       PoolManager                            │
//! │  (cloneable handle: submit, scale, metrics, shutdown)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ commands
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Coordinator                            │
//! │  (owns TaskQueue, worker table, executions, EventBus)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ protocol messages
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Worker threads                           │
//! │  (HandlerTable dispatch, progress, memory sampling)         │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod pool;
pub mod protocol;
pub mod queue;
pub mod reliability;
pub mod task;
pub mod worker;

mod serde_millis;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{LoadBalancing, PoolConfig, QueueConfig, RecoveryConfig};
    pub use crate::error::{PoolError, WorkerError, WorkerErrorKind};
    pub use crate::events::{PoolEvent, TerminationReason};
    pub use crate::pool::{PoolManager, PoolMetrics, PoolStatus, TaskHandle, WorkerInfo};
    pub use crate::task::{CalculationKind, Priority, Task, TaskResult};
    pub use crate::worker::{HandlerError, HandlerTable, TaskContext};
}

// Re-export key types at crate root
pub use config::{LoadBalancing, PoolConfig, QueueConfig, RecoveryConfig};
pub use error::{PoolError, WorkerError, WorkerErrorKind};
pub use events::{EventBus, PoolEvent, TerminationReason};
pub use pool::{
    PoolBuilder, PoolManager, PoolMetrics, PoolStatus, TaskHandle, WorkerInfo, WorkerStatus,
};
pub use protocol::{HealthReport, Message, MessageKind, WorkerHealth, WorkerRequest, WorkerResponse};
pub use queue::{QueueError, QueueStats, TaskQueue};
pub use reliability::RetryPolicy;
pub use task::{CalculationKind, Priority, Task, TaskExecution, TaskId, TaskResult, TaskStatus};
pub use worker::{
    CalculationHandler, HandlerError, HandlerTable, MemoryProbe, ProcessMemoryProbe, TaskContext,
};
