//! Bounded exponential backoff shared by worker and storage retries.

use std::time::Duration;

/// Doubling delay starting at `initial`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
        }
    }

    /// No waiting at all; used by tests and dry runs.
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.initial
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_until_cap() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
        assert_eq!(policy.delay(4), Duration::from_millis(500));
        assert_eq!(policy.delay(40), Duration::from_millis(500));
    }

    #[test]
    fn test_max_never_below_initial() {
        let policy = BackoffPolicy::new(Duration::from_secs(2), Duration::from_secs(1));
        assert_eq!(policy.max, Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(2));
    }

    #[test]
    fn test_immediate_is_zero() {
        assert_eq!(BackoffPolicy::immediate().delay(5), Duration::ZERO);
    }
}
