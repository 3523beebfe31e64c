//! Pool configuration
//!
//! All options are defaulted. Configuration can be built in code with the
//! `with_*` builders, deserialized (durations are milliseconds) or read
//! from `REAGENT_*` environment variables with [`PoolConfig::from_env`].

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PoolError;
use crate::serde_millis::{duration_millis, option_duration_millis};

/// Policy used to pick the idle worker that receives the next task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancing {
    /// Rotate through idle workers in table order
    RoundRobin,
    /// Idle worker with the fewest completed tasks
    LeastBusy,
    /// Uniform pick among idle workers
    Random,
}

impl Default for LoadBalancing {
    fn default() -> Self {
        Self::LeastBusy
    }
}

impl fmt::Display for LoadBalancing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RoundRobin => write!(f, "round-robin"),
            Self::LeastBusy => write!(f, "least-busy"),
            Self::Random => write!(f, "random"),
        }
    }
}

impl FromStr for LoadBalancing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round-robin" => Ok(Self::RoundRobin),
            "least-busy" => Ok(Self::LeastBusy),
            "random" => Ok(Self::Random),
            other => Err(format!("unknown load balancing policy: {other}")),
        }
    }
}

/// Failure recovery configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Upper bound on retries of a task whose worker was lost
    pub max_retries: u32,

    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub retry_delay: Duration,

    /// Double the delay on every further attempt
    pub exponential_backoff: bool,

    /// Replace a worker after it crashes
    pub restart_worker_on_error: bool,

    /// Fail a task that crashed its worker instead of retrying it
    pub isolate_failed_tasks: bool,

    /// Run tasks on the host's blocking pool when no worker can be spawned
    pub fallback_to_main_thread: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            exponential_backoff: true,
            restart_worker_on_error: true,
            isolate_failed_tasks: false,
            fallback_to_main_thread: false,
        }
    }
}

/// Task queue configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of waiting tasks
    pub capacity: usize,

    /// How often waiting tasks are checked for expiry
    #[serde(with = "duration_millis")]
    pub sweep_interval: Duration,

    /// Wait limit for tasks that carry no timeout of their own
    #[serde(with = "option_duration_millis")]
    pub default_timeout: Option<Duration>,

    /// Persist the queue across restarts (not supported, logged and ignored)
    pub persistent: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            sweep_interval: Duration::from_secs(1),
            default_timeout: None,
            persistent: false,
        }
    }
}

impl QueueConfig {
    /// Set the capacity
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Set the expiry sweep interval
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the default wait limit
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    /// Workers kept alive at all times
    pub min_workers: usize,

    /// Upper bound on live workers
    pub max_workers: usize,

    /// Idle time after which surplus workers are terminated
    #[serde(with = "duration_millis")]
    pub idle_timeout: Duration,

    /// Caller-side timeout for tasks without their own
    #[serde(with = "option_duration_millis")]
    pub task_timeout: Option<Duration>,

    /// Default retry budget for tasks without their own
    pub max_retries: u32,

    /// Per-worker memory ceiling in bytes
    pub memory_limit: u64,

    /// Worker-side absolute threshold for memory warnings, in bytes
    pub memory_warning_threshold: u64,

    /// Execution time after which a worker is considered hung
    #[serde(with = "duration_millis")]
    pub cpu_time_limit: Duration,

    /// Worker selection policy
    pub load_balancing: LoadBalancing,

    /// Grow the pool when the queue backs up
    pub auto_scale: bool,

    /// Queue length that triggers auto-scaling
    pub scaling_threshold: usize,

    /// Interval between health checks
    #[serde(with = "duration_millis")]
    pub health_check_interval: Duration,

    /// Interval between metrics snapshots
    #[serde(with = "duration_millis")]
    pub metrics_interval: Duration,

    /// Interval between worker memory samples
    #[serde(with = "duration_millis")]
    pub memory_sample_interval: Duration,

    /// How long shutdown waits for running tasks
    #[serde(with = "duration_millis")]
    pub shutdown_grace_period: Duration,

    /// Failure recovery
    pub recovery: RecoveryConfig,

    /// Task queue
    pub queue: QueueConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            min_workers: 2,
            max_workers: cpus.max(2),
            idle_timeout: Duration::from_secs(60),
            task_timeout: Some(Duration::from_secs(300)),
            max_retries: 3,
            memory_limit: 512 * 1024 * 1024,
            memory_warning_threshold: 256 * 1024 * 1024,
            cpu_time_limit: Duration::from_secs(120),
            load_balancing: LoadBalancing::LeastBusy,
            auto_scale: true,
            scaling_threshold: 10,
            health_check_interval: Duration::from_secs(30),
            metrics_interval: Duration::from_secs(10),
            memory_sample_interval: Duration::from_secs(5),
            shutdown_grace_period: Duration::from_secs(30),
            recovery: RecoveryConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Create a configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Create configuration from environment variables
    ///
    /// Unset or unparsable variables keep their defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_parse("REAGENT_MIN_WORKERS") {
            config.min_workers = v;
        }
        if let Some(v) = env_parse("REAGENT_MAX_WORKERS") {
            config.max_workers = v;
        }
        if let Some(ms) = env_parse("REAGENT_IDLE_TIMEOUT_MS") {
            config.idle_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("REAGENT_TASK_TIMEOUT_MS") {
            config.task_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(v) = env_parse("REAGENT_MAX_RETRIES") {
            config.max_retries = v;
        }
        if let Some(v) = env_parse("REAGENT_MEMORY_LIMIT") {
            config.memory_limit = v;
        }
        if let Some(v) = env_parse("REAGENT_MEMORY_WARNING_THRESHOLD") {
            config.memory_warning_threshold = v;
        }
        if let Some(ms) = env_parse("REAGENT_CPU_TIME_LIMIT_MS") {
            config.cpu_time_limit = Duration::from_millis(ms);
        }
        if let Some(v) = env_parse("REAGENT_LOAD_BALANCING") {
            config.load_balancing = v;
        }
        if let Some(v) = env_parse("REAGENT_AUTO_SCALE") {
            config.auto_scale = v;
        }
        if let Some(v) = env_parse("REAGENT_SCALING_THRESHOLD") {
            config.scaling_threshold = v;
        }
        if let Some(v) = env_parse("REAGENT_QUEUE_CAPACITY") {
            config.queue.capacity = v;
        }
        if let Some(v) = env_parse("REAGENT_RESTART_ON_ERROR") {
            config.recovery.restart_worker_on_error = v;
        }
        if let Some(v) = env_parse("REAGENT_ISOLATE_FAILED_TASKS") {
            config.recovery.isolate_failed_tasks = v;
        }

        config
    }

    /// Set the minimum worker count
    pub fn with_min_workers(mut self, min: usize) -> Self {
        self.min_workers = min;
        self
    }

    /// Set the maximum worker count
    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = max;
        self
    }

    /// Set the idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the default caller-side task timeout
    pub fn with_task_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.task_timeout = timeout;
        self
    }

    /// Set the default retry budget
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the per-worker memory ceiling
    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit = bytes;
        self
    }

    /// Set the worker-side memory warning threshold
    pub fn with_memory_warning_threshold(mut self, bytes: u64) -> Self {
        self.memory_warning_threshold = bytes;
        self
    }

    /// Set the execution time limit
    pub fn with_cpu_time_limit(mut self, limit: Duration) -> Self {
        self.cpu_time_limit = limit;
        self
    }

    /// Set the load balancing policy
    pub fn with_load_balancing(mut self, policy: LoadBalancing) -> Self {
        self.load_balancing = policy;
        self
    }

    /// Enable or disable auto-scaling
    pub fn with_auto_scale(mut self, enabled: bool) -> Self {
        self.auto_scale = enabled;
        self
    }

    /// Set the auto-scaling queue threshold
    pub fn with_scaling_threshold(mut self, threshold: usize) -> Self {
        self.scaling_threshold = threshold;
        self
    }

    /// Set the health check interval
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Set the metrics interval
    pub fn with_metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }

    /// Set the memory sample interval
    pub fn with_memory_sample_interval(mut self, interval: Duration) -> Self {
        self.memory_sample_interval = interval;
        self
    }

    /// Set the shutdown grace period
    pub fn with_shutdown_grace_period(mut self, grace: Duration) -> Self {
        self.shutdown_grace_period = grace;
        self
    }

    /// Set the recovery configuration
    pub fn with_recovery(mut self, recovery: RecoveryConfig) -> Self {
        self.recovery = recovery;
        self
    }

    /// Set the queue configuration
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_workers == 0 {
            return Err(PoolError::InvalidConfig(
                "max_workers must be at least 1".into(),
            ));
        }
        if self.min_workers > self.max_workers {
            return Err(PoolError::InvalidConfig(format!(
                "min_workers ({}) must not exceed max_workers ({})",
                self.min_workers, self.max_workers
            )));
        }
        if self.queue.capacity == 0 {
            return Err(PoolError::InvalidConfig(
                "queue capacity must be at least 1".into(),
            ));
        }
        let intervals = [
            ("health_check_interval", self.health_check_interval),
            ("metrics_interval", self.metrics_interval),
            ("memory_sample_interval", self.memory_sample_interval),
            ("queue.sweep_interval", self.queue.sweep_interval),
        ];
        for (name, interval) in intervals {
            if interval.is_zero() {
                return Err(PoolError::InvalidConfig(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }

    /// Memory usage above which a worker is restarted
    pub fn memory_restart_threshold(&self) -> u64 {
        self.memory_limit / 10 * 9
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}
