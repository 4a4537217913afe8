//! Exponential retry policy shared by reconnection and prefill.

use std::time::Duration;

/// `delay(n) = min(base · 2ⁿ⁻¹, max)` where `n` counts consecutive failures
/// since the last success or reset.
///
/// The policy is a plain value: it never sleeps. Callers feed it failures
/// and sleep for whatever it returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_ms: u64,
    pub max_ms: u64,
    attempt: u32,
    /// When set, the counter restarts at 1 once it would exceed this value.
    reset_after: Option<u32>,
}

impl RetryPolicy {
    pub fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base_ms,
            max_ms,
            attempt: 0,
            reset_after: None,
        }
    }

    pub fn with_reset_after(mut self, bound: u32) -> Self {
        self.reset_after = (bound > 0).then_some(bound);
        self
    }

    /// Delay for the `n`th consecutive failure (1-based). `n == 0` is no delay.
    pub fn delay_for(&self, n: u32) -> Duration {
        if n == 0 {
            return Duration::ZERO;
        }
        let exp = (n - 1).min(63);
        let factor = 1u64.checked_shl(exp).unwrap_or(u64::MAX);
        let ms = self.base_ms.saturating_mul(factor).min(self.max_ms);
        Duration::from_millis(ms)
    }

    /// Count one more failure and return the delay before the next attempt.
    pub fn record_failure(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        if let Some(bound) = self.reset_after {
            if self.attempt > bound {
                self.attempt = 1;
            }
        }
        self.delay_for(self.attempt)
    }

    /// Delay for the current attempt count without changing it.
    pub fn current_delay(&self) -> Duration {
        self.delay_for(self.attempt)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_then_caps() {
        let mut p = RetryPolicy::new(5_000, 60_000);
        let delays: Vec<u64> = (0..7).map(|_| p.record_failure().as_millis() as u64).collect();
        assert_eq!(delays, [5_000, 10_000, 20_000, 40_000, 60_000, 60_000, 60_000]);
        assert_eq!(p.attempt(), 7);
    }

    #[test]
    fn reset_restarts_sequence() {
        let mut p = RetryPolicy::new(5_000, 60_000);
        p.record_failure();
        p.record_failure();
        p.reset();
        assert_eq!(p.attempt(), 0);
        assert_eq!(p.current_delay(), Duration::ZERO);
        assert_eq!(p.record_failure(), Duration::from_millis(5_000));
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let p = RetryPolicy::new(5_000, 60_000);
        assert_eq!(p.delay_for(10_000), Duration::from_millis(60_000));
        assert_eq!(p.delay_for(u32::MAX), Duration::from_millis(60_000));
    }

    #[test]
    fn reset_after_bounds_the_counter() {
        let mut p = RetryPolicy::new(100, 1_000).with_reset_after(3);
        for _ in 0..3 {
            p.record_failure();
        }
        assert_eq!(p.attempt(), 3);
        assert_eq!(p.record_failure(), Duration::from_millis(100));
        assert_eq!(p.attempt(), 1);
    }
}
