//! Reconnection policy: capped exponential backoff with a bounded attempt budget.
//! Pure arithmetic over the attempt number; holds no clock and no state.

use std::time::Duration;

use crate::config::LinkConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectionScheduler {
    base: Duration,
    max: Duration,
    max_attempts: u32,
}

impl ReconnectionScheduler {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max,
            max_attempts,
        }
    }

    pub fn from_config(config: &LinkConfig) -> Self {
        Self::new(
            config.base_backoff,
            config.max_backoff,
            config.max_retry_attempts,
        )
    }

    /// `min(base * 2^n, max)`; `n` is 0 for the first retry after a drop.
    pub fn next_delay(&self, n: u32) -> Duration {
        1u32.checked_shl(n)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// `false` once `attempt` exceeds the configured budget.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> ReconnectionScheduler {
        ReconnectionScheduler::new(Duration::from_millis(100), Duration::from_secs(2), 3)
    }

    #[test]
    fn delay_doubles_until_capped() {
        let s = scheduler();
        assert_eq!(s.next_delay(0), Duration::from_millis(100));
        assert_eq!(s.next_delay(1), Duration::from_millis(200));
        assert_eq!(s.next_delay(2), Duration::from_millis(400));
        assert_eq!(s.next_delay(4), Duration::from_millis(1600));
        assert_eq!(s.next_delay(5), Duration::from_secs(2));
    }

    #[test]
    fn delay_is_always_within_bounds() {
        let s = scheduler();
        assert!(s.next_delay(0) >= Duration::from_millis(100));
        for n in 0..200 {
            assert!(s.next_delay(n) <= Duration::from_secs(2), "n = {n}");
        }
        assert_eq!(s.next_delay(u32::MAX), Duration::from_secs(2));
    }

    #[test]
    fn huge_base_does_not_overflow() {
        let s = ReconnectionScheduler::new(Duration::MAX, Duration::MAX, 1);
        assert_eq!(s.next_delay(3), Duration::MAX);
    }

    #[test]
    fn retry_budget_is_bounded() {
        let s = scheduler();
        assert!(s.should_retry(1));
        assert!(s.should_retry(3));
        for n in 4..100 {
            assert!(!s.should_retry(n));
        }
    }

    #[test]
    fn zero_budget_never_retries() {
        let s = ReconnectionScheduler::new(Duration::from_millis(1), Duration::from_millis(1), 0);
        assert!(!s.should_retry(1));
    }
}
