//! Retry policy for recovered tasks

use std::time::Duration;

use rand::Rng;

use crate::config::RecoveryConfig;

/// Backoff schedule for re-queueing a task after its worker was lost
///
/// Retries are numbered from 1. The first retry waits `initial_delay`;
/// with exponential backoff every further retry doubles the delay up to
/// `max_delay`.
///
/// # Example
///
/// ```
/// use reagent_pool::{RecoveryConfig, RetryPolicy};
/// use std::time::Duration;
///
/// let policy = RetryPolicy::from_recovery(&RecoveryConfig::default()).with_jitter(0.0);
/// assert_eq!(policy.delay_for_retry(1), Duration::from_secs(1));
/// assert_eq!(policy.delay_for_retry(3), Duration::from_secs(4));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// 2.0 for exponential backoff, 1.0 for fixed delays
    pub backoff_coefficient: f64,
    /// Jitter factor (0.0-1.0), 0.1 means +/-10%
    pub jitter: f64,
}

impl RetryPolicy {
    /// Build the policy described by a recovery configuration
    pub fn from_recovery(recovery: &RecoveryConfig) -> Self {
        let backoff_coefficient = if recovery.exponential_backoff { 2.0 } else { 1.0 };
        Self {
            max_retries: recovery.max_retries,
            initial_delay: recovery.retry_delay,
            max_delay: recovery.retry_delay.saturating_mul(32),
            backoff_coefficient,
            jitter: 0.1,
        }
    }

    /// Cap the number of retries
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Retry budget for a task: its own budget or the pool default,
    /// never above the recovery cap
    pub fn budget(&self, task_retries: Option<u32>, pool_default: u32) -> u32 {
        task_retries.unwrap_or(pool_default).min(self.max_retries)
    }

    /// Whether retry number `retry` (1-based) fits within `budget`
    pub fn allows(&self, retry: u32, budget: u32) -> bool {
        retry >= 1 && retry <= budget
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 || self.initial_delay.is_zero() {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(retry - 1).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());

        let delay = if self.jitter > 0.0 {
            let spread = capped * self.jitter;
            (capped + rand::thread_rng().gen_range(-spread..=spread)).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_recovery(&RecoveryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_delays() {
        let policy = RetryPolicy::default().with_jitter(0.0);
        assert_eq!(policy.delay_for_retry(0), Duration::ZERO);
        assert_eq!(policy.delay_for_retry(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_retry(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_retry(3), Duration::from_secs(4));
    }

    #[test]
    fn test_fixed_delays() {
        let recovery = RecoveryConfig {
            exponential_backoff: false,
            retry_delay: Duration::from_millis(200),
            ..Default::default()
        };
        let policy = RetryPolicy::from_recovery(&recovery).with_jitter(0.0);
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_retry(5), Duration::from_millis(200));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::default().with_jitter(0.0);
        assert_eq!(policy.delay_for_retry(40), Duration::from_secs(32));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::default().with_jitter(0.5);
        for _ in 0..50 {
            let delay = policy.delay_for_retry(1);
            assert!(delay >= Duration::from_millis(500));
            assert!(delay <= Duration::from_millis(1500));
        }
    }

    #[test]
    fn test_budget() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.budget(None, 3), 3);
        assert_eq!(policy.budget(Some(1), 3), 1);
        assert_eq!(policy.budget(Some(10), 3), 3);

        assert!(policy.allows(1, 1));
        assert!(!policy.allows(2, 1));
        assert!(!policy.allows(1, 0));
    }

    #[test]
    fn test_zero_delay() {
        let recovery = RecoveryConfig {
            retry_delay: Duration::ZERO,
            ..Default::default()
        };
        let policy = RetryPolicy::from_recovery(&recovery);
        assert_eq!(policy.delay_for_retry(3), Duration::ZERO);
    }
}
