//! Retry with exponential backoff.
//!
//! A failed attempt `n` (1-based) waits `base * 2^(n-1)` plus uniform jitter
//! of up to `jitter_fraction` of that delay, capped at `max_delay`, before
//! attempt `n + 1`. [`RetryBudget`] tracks consecutive failures against a
//! [`RetryPolicy`] and says when the attempts run out.

use rand::Rng;
use serde::Serialize;
use std::time::Duration;

/// Parameters of a backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub base_interval: Duration,
    /// Jitter as a fraction of each delay.
    pub jitter_fraction: f64,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Creates a policy without jitter and a 10 s cap.
    pub fn new(max_attempts: u32, base_interval: Duration) -> Self {
        Self {
            max_attempts,
            base_interval,
            jitter_fraction: 0.0,
            max_delay: Duration::from_secs(10),
        }
    }

    /// Sets the jitter fraction.
    pub fn with_jitter_fraction(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    /// Sets the delay cap.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// The delay without jitter after failed attempt `attempt` (1-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_interval
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// The delay after failed attempt `attempt`, with jitter drawn from `rng`.
    pub fn delay_for_attempt<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        if base.is_zero() || self.jitter_fraction == 0.0 {
            return base;
        }
        let jitter = base.as_secs_f64() * self.jitter_fraction * rng.gen::<f64>();
        (base + Duration::from_secs_f64(jitter)).min(self.max_delay)
    }
}

/// Consecutive-failure accounting against a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryBudget {
    policy: RetryPolicy,
    failures: u32,
}

impl RetryBudget {
    /// Creates a fresh budget.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    /// Returns the policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Number of failures recorded so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Returns true if another failure would exhaust the budget.
    pub fn is_last_attempt(&self) -> bool {
        self.failures + 1 >= self.policy.max_attempts
    }

    /// Records a failed attempt.
    ///
    /// Returns the delay before the next attempt, or `None` once the policy's
    /// attempts are used up.
    pub fn record_failure<R: Rng>(&mut self, rng: &mut R) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if self.failures >= self.policy.max_attempts {
            None
        } else {
            Some(self.policy.delay_for_attempt(self.failures, rng))
        }
    }

    /// Forgets recorded failures.
    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    #[test]
    fn base_delay_doubles() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100));
        assert_eq!(policy.base_delay(0), Duration::ZERO);
        assert_eq!(policy.base_delay(1), Duration::from_millis(100));
        assert_eq!(policy.base_delay(2), Duration::from_millis(200));
        assert_eq!(policy.base_delay(3), Duration::from_millis(400));
    }

    #[test]
    fn jitter_stays_within_fraction() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100)).with_jitter_fraction(0.5);
        let mut rng = rng();

        for attempt in 1..=4 {
            let base = policy.base_delay(attempt);
            for _ in 0..50 {
                let delay = policy.delay_for_attempt(attempt, &mut rng);
                assert!(delay >= base);
                assert!(delay <= base + base / 2);
            }
        }
    }

    #[test]
    fn delay_respects_cap() {
        let policy = RetryPolicy::new(20, Duration::from_secs(1))
            .with_jitter_fraction(0.5)
            .with_max_delay(Duration::from_secs(10));
        let mut rng = rng();

        assert_eq!(policy.base_delay(10), Duration::from_secs(10));
        assert!(policy.delay_for_attempt(6, &mut rng) <= Duration::from_secs(10));
        assert!(policy.delay_for_attempt(31, &mut rng) <= Duration::from_secs(10));
    }

    #[test]
    fn budget_exhausts_after_max_attempts() {
        let mut budget = RetryBudget::new(RetryPolicy::new(3, Duration::from_millis(100)));
        let mut rng = rng();

        assert!(!budget.is_last_attempt());
        assert_eq!(budget.record_failure(&mut rng), Some(Duration::from_millis(100)));
        assert_eq!(budget.record_failure(&mut rng), Some(Duration::from_millis(200)));
        assert!(budget.is_last_attempt());
        assert_eq!(budget.record_failure(&mut rng), None);
        assert_eq!(budget.failures(), 3);

        budget.reset();
        assert_eq!(budget.failures(), 0);
    }

    #[test]
    fn single_attempt_budget_never_retries() {
        let mut budget = RetryBudget::new(RetryPolicy::new(1, Duration::from_millis(100)));
        assert_eq!(budget.record_failure(&mut rng()), None);
    }
}
