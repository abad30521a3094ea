//! Retry policy and backoff calculation.
//!
//! `base = initial_delay * multiplier^(attempt - 1)`, clamped to `max_delay`.
//! Attempts are 1-indexed: the first retry after the original failure is
//! attempt 1. Symmetric jitter (`base ± base * jitter_fraction`) spreads
//! simultaneous failures so a provider outage does not produce a
//! synchronized retry storm.
//!
//! Overflow behavior: the exponential computation saturates at `max_delay`
//! rather than panicking, so absurd attempt numbers stay safe.
//!
//! Example
//! ```rust
//! use redrive::RetryPolicy;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::builder()
//!     .max_attempts(5)
//!     .initial_delay(Duration::from_secs(60))
//!     .max_delay(Duration::from_secs(3600))
//!     .build()
//!     .unwrap();
//! assert_eq!(policy.base_delay(1), Duration::from_secs(60));
//! assert_eq!(policy.base_delay(2), Duration::from_secs(120));
//! assert_eq!(policy.base_delay(12), Duration::from_secs(3600)); // clamped
//! ```

use rand::{rng, Rng};
use std::fmt;
use std::time::Duration;

/// Errors produced while building a retry policy.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyError {
    /// `max_attempts` must be > 0.
    InvalidMaxAttempts(u32),
    /// `multiplier` must be >= 1.0 and finite.
    InvalidMultiplier(f64),
    /// `jitter_fraction` must be within [0, 1].
    InvalidJitterFraction(f64),
    /// `max_delay` must be >= `initial_delay`.
    MaxLessThanInitial { initial: Duration, max: Duration },
}

impl fmt::Display for PolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyError::InvalidMaxAttempts(n) => {
                write!(f, "max_attempts must be > 0 (got {})", n)
            }
            PolicyError::InvalidMultiplier(m) => {
                write!(f, "multiplier must be finite and >= 1.0 (got {})", m)
            }
            PolicyError::InvalidJitterFraction(j) => {
                write!(f, "jitter_fraction must be within [0, 1] (got {})", j)
            }
            PolicyError::MaxLessThanInitial { initial, max } => {
                write!(f, "max_delay ({:?}) must be >= initial_delay ({:?})", max, initial)
            }
        }
    }
}

impl std::error::Error for PolicyError {}

/// Retry policy: attempt cap plus backoff shape.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter_fraction: f64,
}

impl Default for RetryPolicy {
    /// Production defaults: 5 attempts, 60s initial, 1h cap, doubling, ±10%.
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60 * 60),
            multiplier: 2.0,
            jitter_fraction: 0.10,
        }
    }
}

impl RetryPolicy {
    /// Construct a new builder with defaults.
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    /// Total failed attempts allowed before a message is dead-lettered.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn jitter_fraction(&self) -> f64 {
        self.jitter_fraction
    }

    /// Unjittered delay before the given retry attempt (1-indexed).
    ///
    /// Attempt 0 is the original send; it has no delay.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(1024) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let max_millis = self.max_delay.as_millis() as f64;
        if !millis.is_finite() || millis >= max_millis {
            return self.max_delay;
        }
        Duration::from_millis(millis as u64)
    }

    /// Jittered delay before the given retry attempt.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let mut rng = rng();
        self.next_delay_with_rng(attempt, &mut rng)
    }

    /// Jittered delay using a caller-supplied RNG (for deterministic tests).
    pub fn next_delay_with_rng<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        if base.is_zero() || self.jitter_fraction == 0.0 {
            return base;
        }
        let base_millis = base.as_millis() as f64;
        let offset = base_millis * self.jitter_fraction * rng.random_range(-1.0..=1.0);
        let jittered = (base_millis + offset).max(0.0);
        Duration::from_millis(jittered as u64)
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    pub fn new() -> Self {
        Self { policy: RetryPolicy::default() }
    }

    /// Set total failed attempts allowed. Must be > 0.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.policy.max_attempts = attempts;
        self
    }

    /// Set the delay before the first retry.
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.policy.initial_delay = delay;
        self
    }

    /// Cap the delay between attempts.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    /// Set the exponential growth factor. Must be finite and >= 1.0.
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.policy.multiplier = multiplier;
        self
    }

    /// Set the symmetric jitter fraction. Must be within [0, 1];
    /// 0 disables jitter (useful in tests).
    pub fn jitter_fraction(mut self, fraction: f64) -> Self {
        self.policy.jitter_fraction = fraction;
        self
    }

    /// Build the policy, validating inputs.
    pub fn build(self) -> Result<RetryPolicy, PolicyError> {
        let p = self.policy;
        if p.max_attempts == 0 {
            return Err(PolicyError::InvalidMaxAttempts(0));
        }
        if !p.multiplier.is_finite() || p.multiplier < 1.0 {
            return Err(PolicyError::InvalidMultiplier(p.multiplier));
        }
        if !p.jitter_fraction.is_finite() || !(0.0..=1.0).contains(&p.jitter_fraction) {
            return Err(PolicyError::InvalidJitterFraction(p.jitter_fraction));
        }
        if p.max_delay < p.initial_delay {
            return Err(PolicyError::MaxLessThanInitial {
                initial: p.initial_delay,
                max: p.max_delay,
            });
        }
        Ok(p)
    }
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy::builder().jitter_fraction(0.0).build().expect("builder")
    }

    #[test]
    fn base_delay_doubles_each_attempt() {
        let policy = no_jitter();
        assert_eq!(policy.base_delay(1), Duration::from_secs(60));
        assert_eq!(policy.base_delay(2), Duration::from_secs(120));
        assert_eq!(policy.base_delay(3), Duration::from_secs(240));
        assert_eq!(policy.base_delay(4), Duration::from_secs(480));
    }

    #[test]
    fn base_delay_clamps_at_max() {
        let policy = no_jitter();
        // 60s * 2^6 = 3840s > 1h
        assert_eq!(policy.base_delay(7), Duration::from_secs(3600));
        assert_eq!(policy.base_delay(100), Duration::from_secs(3600));
    }

    #[test]
    fn attempt_zero_has_no_delay() {
        assert_eq!(no_jitter().base_delay(0), Duration::ZERO);
        assert_eq!(no_jitter().next_delay(0), Duration::ZERO);
    }

    #[test]
    fn huge_attempt_saturates_instead_of_panicking() {
        let policy = RetryPolicy::builder()
            .multiplier(10.0)
            .jitter_fraction(0.0)
            .build()
            .expect("builder");
        assert_eq!(policy.base_delay(u32::MAX), policy.max_delay());
    }

    #[test]
    fn jittered_delay_stays_within_fraction_bounds() {
        let policy = RetryPolicy::default();
        let mut rng = StdRng::seed_from_u64(42);
        for attempt in 1..=10 {
            let base = policy.base_delay(attempt).as_millis() as f64;
            let lo = base * 0.9;
            let hi = base * 1.1;
            for _ in 0..100 {
                let delay = policy.next_delay_with_rng(attempt, &mut rng).as_millis() as f64;
                assert!(delay >= lo - 1.0 && delay <= hi + 1.0, "attempt {attempt}: {delay}");
            }
        }
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let policy = no_jitter();
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(policy.next_delay_with_rng(3, &mut rng), policy.base_delay(3));
    }

    #[test]
    fn builder_rejects_invalid_configs() {
        assert!(matches!(
            RetryPolicy::builder().max_attempts(0).build(),
            Err(PolicyError::InvalidMaxAttempts(0))
        ));
        assert!(matches!(
            RetryPolicy::builder().multiplier(0.5).build(),
            Err(PolicyError::InvalidMultiplier(_))
        ));
        assert!(matches!(
            RetryPolicy::builder().jitter_fraction(1.5).build(),
            Err(PolicyError::InvalidJitterFraction(_))
        ));
        assert!(matches!(
            RetryPolicy::builder()
                .initial_delay(Duration::from_secs(100))
                .max_delay(Duration::from_secs(10))
                .build(),
            Err(PolicyError::MaxLessThanInitial { .. })
        ));
    }

    #[test]
    fn defaults_match_documented_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 5);
        assert_eq!(policy.initial_delay(), Duration::from_secs(60));
        assert_eq!(policy.max_delay(), Duration::from_secs(3600));
        assert!((policy.jitter_fraction() - 0.10).abs() < f64::EPSILON);
    }
}
