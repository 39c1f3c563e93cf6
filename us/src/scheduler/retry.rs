//! Retry policy: capped exponential backoff

use std::time::Duration;

use super::config::SchedulerConfig;

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-admit after `delay`
    Retry { delay: Duration },
    /// Attempts used up, the failure is final
    Exhausted,
}

/// Backoff policy derived from the scheduler config
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(config.retry_attempts, config.base_retry_delay(), config.max_retry_delay())
    }

    /// `min(base * 2^(attempt-1), max)` for the retry following `attempt`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Decide after `attempt` attempts have been made and the last one failed
    pub fn decide(&self, attempt: u32) -> RetryDecision {
        if attempt <= self.max_retries {
            RetryDecision::Retry {
                delay: self.backoff(attempt),
            }
        } else {
            RetryDecision::Exhausted
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::from_millis(100), Duration::from_millis(1000))
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let policy = policy(10);
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(5), Duration::from_millis(1000));
        assert_eq!(policy.backoff(64), Duration::from_millis(1000));
    }

    #[test]
    fn test_two_retries_means_three_attempts() {
        let policy = policy(2);
        assert!(matches!(policy.decide(1), RetryDecision::Retry { .. }));
        assert!(matches!(policy.decide(2), RetryDecision::Retry { .. }));
        assert_eq!(policy.decide(3), RetryDecision::Exhausted);
    }

    #[test]
    fn test_zero_retries_fails_immediately() {
        assert_eq!(policy(0).decide(1), RetryDecision::Exhausted);
    }

    #[test]
    fn test_from_config() {
        let config = SchedulerConfig {
            retry_attempts: 4,
            base_retry_delay_ms: 50,
            max_retry_delay_ms: 500,
            ..Default::default()
        };
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.max_retries, 4);
        assert_eq!(policy.decide(1), RetryDecision::Retry {
            delay: Duration::from_millis(50)
        });
    }
}
