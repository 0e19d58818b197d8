//! Retry budget and backoff schedule

use std::time::Duration;

/// Attempt budget with a capped doubling backoff.
///
/// The wait after failed attempt `k` (1-based) is `base * 2^(k-1)`, clamped
/// to `max_backoff`. The schedule never shrinks from one attempt to the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts,
            base_backoff,
            max_backoff,
        }
    }

    /// Same schedule with a different attempt budget
    pub fn with_max_attempts(self, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..self
        }
    }

    /// Wait after failed attempt `attempt` (1-based)
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_doubling_schedule() {
        let policy = RetryPolicy::new(6, Duration::from_secs(2), Duration::from_secs(30));
        let waits: Vec<u64> = (1..=6).map(|k| policy.backoff_after(k).as_secs()).collect();
        assert_eq!(waits, vec![2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_huge_attempt_numbers_saturate() {
        let policy = RetryPolicy::new(u32::MAX, Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(policy.backoff_after(u32::MAX), Duration::from_secs(60));
        assert_eq!(policy.backoff_after(0), Duration::from_secs(1));
    }

    proptest! {
        #[test]
        fn prop_backoff_never_decreases(
            base_ms in 0u64..100_000,
            max_ms in 0u64..1_000_000,
            attempt in 1u32..200,
        ) {
            let policy = RetryPolicy::new(
                10,
                Duration::from_millis(base_ms),
                Duration::from_millis(max_ms),
            );
            prop_assert!(policy.backoff_after(attempt + 1) >= policy.backoff_after(attempt));
            prop_assert!(policy.backoff_after(attempt) <= Duration::from_millis(max_ms));
        }
    }
}
