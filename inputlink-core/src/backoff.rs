//! Exponential reconnect backoff.
//!
//! After `k` consecutive failures the wait is `min(base · 2^(k-1), max)`.
//! A connected period lasting at least `stability_threshold` resets the
//! failure count, so a link that flaps quickly keeps backing off while a
//! link that was healthy for a while reconnects fast.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub stability_threshold: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            stability_threshold: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    failures: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    /// Consecutive failures recorded so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Wait that would follow `k` consecutive failures.
    pub fn delay_for(&self, k: u32) -> Duration {
        if k == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(k - 1).unwrap_or(u32::MAX);
        self.policy
            .base
            .checked_mul(factor)
            .unwrap_or(self.policy.max)
            .min(self.policy.max)
    }

    /// Record one more failure and return the wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.delay_for(self.failures)
    }

    /// Record how long the last connection stayed up. Returns `true` if
    /// the period was stable and the failure count was reset.
    pub fn record_connected(&mut self, period: Duration) -> bool {
        if period >= self.policy.stability_threshold {
            self.failures = 0;
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn doubles_from_base() {
        let mut b = Backoff::new(BackoffPolicy::default());
        let waits: Vec<_> = (0..5).map(|_| b.next_delay()).collect();
        assert_eq!(waits, vec![secs(1), secs(2), secs(4), secs(8), secs(16)]);
    }

    #[test]
    fn caps_at_max() {
        let mut b = Backoff::new(BackoffPolicy::default());
        for _ in 0..5 {
            b.next_delay();
        }
        assert_eq!(b.next_delay(), secs(30));
        for _ in 0..100 {
            assert_eq!(b.next_delay(), secs(30));
        }
    }

    #[test]
    fn matches_closed_form() {
        let b = Backoff::new(BackoffPolicy::default());
        for k in 1..40u32 {
            let expected = secs(1u64.checked_shl(k - 1).unwrap_or(u64::MAX).min(30));
            assert_eq!(b.delay_for(k), expected, "k = {k}");
        }
    }

    #[test]
    fn stable_connection_resets() {
        let mut b = Backoff::new(BackoffPolicy::default());
        b.next_delay();
        b.next_delay();
        b.next_delay();
        assert!(b.record_connected(secs(10)));
        assert_eq!(b.failures(), 0);
        assert_eq!(b.next_delay(), secs(1));
    }

    #[test]
    fn short_connection_keeps_backing_off() {
        let mut b = Backoff::new(BackoffPolicy::default());
        b.next_delay();
        b.next_delay();
        assert!(!b.record_connected(secs(3)));
        assert_eq!(b.next_delay(), secs(4));
    }
}
