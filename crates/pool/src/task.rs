//! Tasks, priorities and task outcomes

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::serde_millis::{duration_millis, option_duration_millis};

/// Task identifier, unique across the lifetime of a pool
pub type TaskId = String;

/// Task priority. Higher priorities are dispatched first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Priority {
    /// All priorities, lowest first
    pub const ALL: [Priority; 4] = [
        Priority::Low,
        Priority::Normal,
        Priority::High,
        Priority::Critical,
    ];

    /// Bucket index used by the task queue
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Kind of calculation a task asks a worker to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CalculationKind {
    /// Balance a chemical equation to integer coefficients
    BalanceEquation,
    /// Aggregate thermodynamic quantities over a compound list
    Thermodynamics,
    /// Solve a linear system
    MatrixSolve,
    /// Analyse many formulas with incremental progress
    BatchAnalysis,
    /// Mole ratios, limiting reagent and yields
    Stoichiometry,
    /// Properties of a single compound
    CompoundAnalysis,
}

impl CalculationKind {
    /// Number of calculation kinds
    pub const COUNT: usize = 6;

    /// All calculation kinds
    pub const ALL: [CalculationKind; Self::COUNT] = [
        CalculationKind::BalanceEquation,
        CalculationKind::Thermodynamics,
        CalculationKind::MatrixSolve,
        CalculationKind::BatchAnalysis,
        CalculationKind::Stoichiometry,
        CalculationKind::CompoundAnalysis,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            Self::BalanceEquation => 0,
            Self::Thermodynamics => 1,
            Self::MatrixSolve => 2,
            Self::BatchAnalysis => 3,
            Self::Stoichiometry => 4,
            Self::CompoundAnalysis => 5,
        }
    }

    /// Wire name of the kind
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BalanceEquation => "balance-equation",
            Self::Thermodynamics => "thermodynamics",
            Self::MatrixSolve => "matrix-solve",
            Self::BatchAnalysis => "batch-analysis",
            Self::Stoichiometry => "stoichiometry",
            Self::CompoundAnalysis => "compound-analysis",
        }
    }
}

impl fmt::Display for CalculationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CalculationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown calculation kind: {s}"))
    }
}

/// A unit of work submitted to the pool
///
/// Tasks are immutable once built; the builder methods consume and return
/// the task so they can only be used before submission.
///
/// # Example
///
/// ```
/// use reagent_pool::{CalculationKind, Priority, Task};
/// use serde_json::json;
/// use std::time::Duration;
///
/// let task = Task::new(CalculationKind::BalanceEquation, json!({"equation": "H2 + O2 = H2O"}))
///     .with_priority(Priority::High)
///     .with_timeout(Duration::from_secs(5));
/// assert_eq!(task.priority, Priority::High);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    /// Unique task id
    pub id: TaskId,

    /// Calculation the worker should run
    pub kind: CalculationKind,

    /// Handler input
    pub payload: serde_json::Value,

    /// Dispatch priority
    #[serde(default)]
    pub priority: Priority,

    /// When the task was created
    pub created_at: DateTime<Utc>,

    /// Maximum time the caller waits for an outcome
    #[serde(default, with = "option_duration_millis")]
    pub timeout: Option<Duration>,

    /// Retry budget when the executing worker is lost
    #[serde(default)]
    pub retries: Option<u32>,

    /// Free-form caller metadata
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Task {
    /// Create a task with a generated id and normal priority
    pub fn new(kind: CalculationKind, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            kind,
            payload,
            priority: Priority::Normal,
            created_at: Utc::now(),
            timeout: None,
            retries: None,
            metadata: HashMap::new(),
        }
    }

    /// Use a caller-provided id
    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the caller-side timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the retry budget
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Attach a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Check the task is well formed
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("task id must not be empty".to_string());
        }
        if matches!(self.timeout, Some(t) if t.is_zero()) {
            return Err(format!("task {} has a zero timeout", self.id));
        }
        Ok(())
    }
}

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl TaskStatus {
    /// Whether no further transition can happen
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Timeout | Self::Cancelled
        )
    }
}

/// Successful outcome of a task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskResult {
    /// Task this result belongs to
    pub task_id: TaskId,

    /// Always true for results delivered through a task handle
    pub success: bool,

    /// Handler output
    pub data: serde_json::Value,

    /// Wall time spent inside the handler
    #[serde(with = "duration_millis")]
    pub execution_time: Duration,

    /// Memory usage sampled by the worker after execution, in bytes
    pub memory_usage: u64,

    /// Worker that produced the result
    pub worker_id: Option<String>,

    /// Extra details from the worker
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Pool-side record of an in-flight task
#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub task_id: TaskId,
    pub worker_id: String,
    pub started_at: Instant,
    pub status: TaskStatus,
    /// Fraction completed, 0.0 - 1.0
    pub progress: Option<f64>,
    pub memory_usage: Option<u64>,
    pub cpu_time: Option<Duration>,
}

impl TaskExecution {
    pub(crate) fn new(task_id: TaskId, worker_id: String) -> Self {
        Self {
            task_id,
            worker_id,
            started_at: Instant::now(),
            status: TaskStatus::Running,
            progress: None,
            memory_usage: None,
            cpu_time: None,
        }
    }
}
