//! Retry policy value object.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy for calls to unreliable external services.
///
/// `max_attempts` counts the first call, so a policy with `max_attempts = 3`
/// performs at most two retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Backoff multiplier for exponential backoff.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    #[serde(default = "default_true")]
    pub use_jitter: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    2000
}

fn default_max_delay_ms() -> u64 {
    60000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

impl RetryPolicy {
    /// Create a new retry policy with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a policy with `max_attempts` attempts and a `base_delay` first backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay_ms: base_delay.as_millis() as u64,
            ..Default::default()
        }
    }

    /// Create a retry policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Disable jitter (deterministic delays).
    pub fn without_jitter(mut self) -> Self {
        self.use_jitter = false;
        self
    }

    /// Calculate the delay after the failed attempt `attempt` (0-indexed).
    ///
    /// `base * multiplier^attempt`, capped at `max_delay_ms`, plus up to 25% jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay =
            self.base_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);

        let delay_ms = base_delay.min(self.max_delay_ms as f64) as u64;

        if self.use_jitter {
            // Add up to 25% jitter
            let jitter = (delay_ms as f64 * 0.25 * rand::random::<f64>()) as u64;
            Duration::from_millis(delay_ms + jitter)
        } else {
            Duration::from_millis(delay_ms)
        }
    }

    /// Check if another attempt is allowed after `attempts_made` attempts.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Get the total maximum time that could be spent sleeping between attempts.
    pub fn max_total_delay(&self) -> Duration {
        let mut total = 0u64;
        for attempt in 0..self.max_attempts.saturating_sub(1) {
            let base_delay =
                self.base_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
            total += base_delay.min(self.max_delay_ms as f64) as u64;
        }
        // Add potential jitter
        if self.use_jitter {
            total = (total as f64 * 1.25) as u64;
        }
        Duration::from_millis(total)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            use_jitter: default_true(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay_ms, 2000);
        assert!(policy.use_jitter);
    }

    #[test]
    fn test_no_retry() {
        let policy = RetryPolicy::no_retry();
        assert_eq!(policy.max_attempts, 1);
        assert!(policy.should_retry(0));
        assert!(!policy.should_retry(1));
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::exponential(3, Duration::from_secs(2));
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_delay_calculation_no_jitter() {
        let policy = RetryPolicy::exponential(5, Duration::from_secs(2)).without_jitter();

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(8000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(16000));
    }

    #[test]
    fn test_jitter_keeps_delays_increasing() {
        let policy = RetryPolicy::exponential(6, Duration::from_millis(100));
        for _ in 0..50 {
            let delays: Vec<_> = (0..5).map(|i| policy.delay_for_attempt(i)).collect();
            assert!(delays.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn test_delay_capped_at_max() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 1000,
            max_delay_ms: 5000,
            backoff_multiplier: 2.0,
            use_jitter: false,
        };

        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(5000));
    }

    #[test]
    fn test_max_total_delay() {
        let policy = RetryPolicy::exponential(3, Duration::from_secs(2)).without_jitter();
        assert_eq!(policy.max_total_delay(), Duration::from_secs(6));
    }
}
