//! Bounded exponential backoff between attempts of one pass.

use std::time::Duration;

use super::error::ReplicationError;

/// Retry budget and delay curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self { max_attempts: max_attempts.max(1), base_delay, max_delay }
    }

    /// Whether another attempt may follow `attempt` (1-based) after `error`.
    pub fn should_retry(&self, attempt: u32, error: &ReplicationError) -> bool {
        error.is_retryable() && attempt < self.max_attempts
    }

    /// Delay before the attempt following `attempt` (1-based): `base * 2^(attempt-1)`,
    /// raised to any server-requested minimum and capped at `max_delay`.
    pub fn delay_after(&self, attempt: u32, error: &ReplicationError) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let computed = self.base_delay.saturating_mul(1u32 << exponent);
        let requested = error.retry_after().unwrap_or_default();
        computed.max(requested).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttled() -> ReplicationError {
        ReplicationError::throttled("busy")
    }

    #[test]
    fn test_delays_double_and_cap() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_millis(1_000));

        assert_eq!(policy.delay_after(1, &throttled()), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2, &throttled()), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3, &throttled()), Duration::from_millis(400));
        assert_eq!(policy.delay_after(5, &throttled()), Duration::from_millis(1_000));
        assert_eq!(policy.delay_after(40, &throttled()), Duration::from_millis(1_000));
    }

    #[test]
    fn test_retry_after_is_honored() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(10));
        let err = ReplicationError::Throttled {
            message: "slow down".to_string(),
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(policy.delay_after(1, &err), Duration::from_secs(2));
    }

    #[test]
    fn test_attempt_budget() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(10));
        assert!(policy.should_retry(1, &throttled()));
        assert!(policy.should_retry(2, &throttled()));
        assert!(!policy.should_retry(3, &throttled()));
        assert!(!policy.should_retry(1, &ReplicationError::not_found("x")));
    }

    #[test]
    fn test_zero_attempts_still_allows_one() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO, Duration::ZERO).max_attempts, 1);
    }
}
