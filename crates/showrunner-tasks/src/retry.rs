//! Retry policy and backoff schedule

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy configuration
///
/// Delay for retry `n` (1-based) is `initial_delay * 2^(n-1)`, capped at
/// `max_delay`, with `± jitter` applied as a fraction of the capped delay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Cap applied to the exponential schedule
    pub max_delay: Duration,
    /// Jitter fraction, e.g. 0.10 for ±10%
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(600),
            jitter: 0.10,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Create an exponential policy
    pub fn exponential(max_retries: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
            jitter: 0.10,
        }
    }

    /// Calculate the delay before the given retry attempt (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * 2f64.powi(attempt.saturating_sub(1) as i32);
        let capped_delay = base_delay.min(self.max_delay.as_secs_f64());

        let final_delay = if self.jitter > 0.0 {
            capped_delay * (1.0 + rand_jitter() * self.jitter)
        } else {
            capped_delay
        };

        Duration::from_secs_f64(final_delay.max(0.0))
    }

    /// Whether the given attempt count still has retry budget left
    pub fn can_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Generate a jitter factor in [-1.0, 1.0] from the clock's subsecond nanos
fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    ((nanos % 2000) as f64 / 1000.0) - 1.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert!(policy.can_retry(0));
        assert!(policy.can_retry(2));
        assert!(!policy.can_retry(3));
    }

    #[test]
    fn test_no_retry_policy() {
        let policy = RetryPolicy::no_retry();
        assert!(!policy.can_retry(0));
    }

    #[test]
    fn test_exponential_schedule_without_jitter() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::exponential(5, Duration::from_secs(60), Duration::from_secs(600))
        };
        assert_eq!(policy.delay_for_attempt(1).as_secs(), 60);
        assert_eq!(policy.delay_for_attempt(2).as_secs(), 120);
        assert_eq!(policy.delay_for_attempt(3).as_secs(), 240);
        assert_eq!(policy.delay_for_attempt(4).as_secs(), 480);
        // Capped at max_delay
        assert_eq!(policy.delay_for_attempt(5).as_secs(), 600);
        assert_eq!(policy.delay_for_attempt(10).as_secs(), 600);
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = RetryPolicy::default();
        for attempt in 1..=4 {
            let base = 60.0 * 2f64.powi(attempt as i32 - 1);
            let expected = base.min(600.0);
            let delay = policy.delay_for_attempt(attempt).as_secs_f64();
            assert!(delay >= expected * 0.9 - 1e-6, "delay {} below jitter floor", delay);
            assert!(delay <= expected * 1.1 + 1e-6, "delay {} above jitter ceiling", delay);
        }
    }

    #[test]
    fn test_attempt_zero_has_no_delay() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
    }
}
