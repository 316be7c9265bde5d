//! Retry policy for failed jobs

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::duration_millis;

/// Backoff policy applied by [`JobStore::fail_job`](super::JobStore::fail_job)
///
/// The delay is computed from the retry count recorded *before* the failure:
///
/// ```
/// use harvester_ingest::queue::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::default();
///
/// assert_eq!(policy.delay_for_retry(0), Duration::from_secs(60));
/// assert_eq!(policy.delay_for_retry(1), Duration::from_secs(120));
/// assert_eq!(policy.delay_for_retry(2), Duration::from_secs(240));
/// assert!(!policy.can_retry(3));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Failures recorded while the count is below this value may be retried
    pub max_retries: u32,

    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,

    /// Backoff multiplier
    pub backoff_coefficient: f64,

    /// Upper bound for any single delay
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(60),
            backoff_coefficient: 2.0,
            max_delay: Duration::from_secs(60 * 60),
        }
    }
}

impl RetryPolicy {
    /// Create a policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Set the maximum number of retries
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the base delay
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the backoff coefficient
    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient.max(1.0);
        self
    }

    /// Set the maximum delay
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Whether a job that has already been retried `retry_count` times may retry again
    pub fn can_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Delay before the next attempt of a job with `retry_count` prior retries
    pub fn delay_for_retry(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.base_delay, Duration::from_secs(60));
        assert_eq!(policy.backoff_coefficient, 2.0);
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_for_retry(0), Duration::from_secs(60));
        assert_eq!(policy.delay_for_retry(1), Duration::from_secs(120));
        assert_eq!(policy.delay_for_retry(2), Duration::from_secs(240));
    }

    #[test]
    fn test_max_delay_cap() {
        let policy = RetryPolicy::default().with_max_delay(Duration::from_secs(90));
        assert_eq!(policy.delay_for_retry(5), Duration::from_secs(90));
    }

    #[test]
    fn test_can_retry() {
        let policy = RetryPolicy::default();

        assert!(policy.can_retry(0));
        assert!(policy.can_retry(2));
        assert!(!policy.can_retry(3));
        assert!(!RetryPolicy::no_retry().can_retry(0));
    }

    #[test]
    fn test_serialization() {
        let policy = RetryPolicy::default().with_max_retries(5);

        let json = serde_json::to_string(&policy).unwrap();
        let parsed: RetryPolicy = serde_json::from_str(&json).unwrap();

        assert_eq!(policy, parsed);
    }
}
