//! Task timeouts
//!
//! A task can time out in three places, each handled by a different
//! component:
//!
//! - while waiting in the queue (the queue's expiry sweep)
//! - while the caller awaits its handle (a local timer on the handle)
//! - while executing on a worker (cpu time supervision on health ticks)

use std::fmt;
use std::time::{Duration, Instant};

use crate::error::WorkerError;

/// Where a timeout was detected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Queue,
    Caller,
    Execution,
}

impl TimeoutKind {
    /// Build the error delivered to the caller
    pub fn error(self, limit: Duration) -> WorkerError {
        WorkerError::timeout(format!("{self} exceeded {}ms", limit.as_millis()))
    }
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queue => write!(f, "queue wait"),
            Self::Caller => write!(f, "task timeout"),
            Self::Execution => write!(f, "execution time"),
        }
    }
}

/// Elapsed time since `started_at` if it exceeds `limit`
pub fn exceeded(started_at: Instant, limit: Duration, now: Instant) -> Option<Duration> {
    let elapsed = now.saturating_duration_since(started_at);
    (elapsed > limit).then_some(elapsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkerErrorKind;

    #[test]
    fn test_exceeded() {
        let start = Instant::now();
        let later = start + Duration::from_secs(5);
        assert_eq!(
            exceeded(start, Duration::from_secs(2), later),
            Some(Duration::from_secs(5))
        );
        assert_eq!(exceeded(start, Duration::from_secs(10), later), None);
        assert_eq!(exceeded(later, Duration::ZERO, start), None);
    }

    #[test]
    fn test_timeout_error_message() {
        let err = TimeoutKind::Caller.error(Duration::from_millis(250));
        assert_eq!(err.kind, WorkerErrorKind::Timeout);
        assert_eq!(err.message, "task timeout exceeded 250ms");
    }
}
