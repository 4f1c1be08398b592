//! Retry classification and backoff timing for provider calls.

use std::time::Duration;

use rand::Rng;

/// Whether an HTTP status is worth a retry or failover.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429) || status >= 500
}

/// Backoff schedule for repeated passes over the adapter chain.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Delay before attempt `attempt` (0-based): exponential with full
    /// jitter, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        let jitter = rand::thread_rng().gen_range(0.0..=1.0);
        exp.mul_f64(jitter)
    }

    /// Upper bound of the delay for attempt `attempt`, before jitter.
    pub fn max_delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(408));
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(500));
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(401));
        assert!(!is_retryable_status(200));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let config = RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        };
        assert_eq!(config.max_delay_for(0), Duration::from_millis(100));
        assert_eq!(config.max_delay_for(1), Duration::from_millis(200));
        assert_eq!(config.max_delay_for(2), Duration::from_millis(400));
        assert_eq!(config.max_delay_for(10), Duration::from_secs(1));
    }

    #[test]
    fn jittered_delay_stays_in_bounds() {
        let config = RetryConfig::default();
        for attempt in 0..4 {
            let delay = config.delay_for(attempt);
            assert!(delay <= config.max_delay_for(attempt));
        }
    }
}
