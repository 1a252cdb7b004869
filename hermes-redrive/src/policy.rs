//! Retry policy for record handling.
//!
//! The budget is counted in attempts, not time: a record is handed to its
//! handler at most `max_attempts` times per batch. Between attempts the
//! redriver waits a bounded, jittered exponential delay so that a sustained
//! transport outage is not hammered in a tight loop. A `base_delay_ms` of
//! zero disables the wait entirely.

use std::time::Duration;

use hermes_common::ConfigError;
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts per record, including the first one.
    ///
    /// Default: 3 attempts
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,

    /// Delay after the first failed attempt (in milliseconds).
    ///
    /// Each further failure doubles it: `base * 2^(attempt - 1)`.
    ///
    /// Default: 200 milliseconds
    #[serde(default = "defaults::base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound for the delay between two attempts (in milliseconds).
    ///
    /// Default: 5000 milliseconds
    #[serde(default = "defaults::max_delay_ms")]
    pub max_delay_ms: u64,

    /// Randomization applied to each delay, within ±`jitter_factor`.
    ///
    /// Default: 0.1 (±10%)
    #[serde(default = "defaults::jitter_factor")]
    pub jitter_factor: f64,

    /// Upper bound for a single attempt (in seconds).
    ///
    /// An attempt that runs longer is abandoned and counted as failed.
    /// `None` leaves timeouts to the handler's own collaborators.
    #[serde(default)]
    pub attempt_timeout_secs: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::max_attempts(),
            base_delay_ms: defaults::base_delay_ms(),
            max_delay_ms: defaults::max_delay_ms(),
            jitter_factor: defaults::jitter_factor(),
            attempt_timeout_secs: None,
        }
    }
}

impl RetryPolicy {
    /// Default backoff with a custom attempt budget.
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Retry straight away, without waiting between attempts.
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter_factor: 0.0,
            attempt_timeout_secs: None,
        }
    }

    #[must_use]
    pub const fn with_attempt_timeout(mut self, secs: u64) -> Self {
        self.attempt_timeout_secs = Some(secs);
        self
    }

    /// Check the policy is usable.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when `max_attempts` is zero, the jitter factor
    /// is outside `0.0..=1.0`, the delay bounds are inverted or the attempt
    /// timeout is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid(
                "retry.max_attempts",
                "must be at least 1",
            ));
        }

        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::invalid(
                "retry.jitter_factor",
                format!("{} is not within 0.0..=1.0", self.jitter_factor),
            ));
        }

        if self.max_delay_ms < self.base_delay_ms {
            return Err(ConfigError::invalid(
                "retry.max_delay_ms",
                format!(
                    "{} is smaller than base_delay_ms ({})",
                    self.max_delay_ms, self.base_delay_ms
                ),
            ));
        }

        if self.attempt_timeout_secs == Some(0) {
            return Err(ConfigError::invalid(
                "retry.attempt_timeout_secs",
                "must be greater than 0",
            ));
        }

        Ok(())
    }

    /// Whether another attempt may follow `attempts` failed ones.
    #[must_use]
    pub const fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Attempts left after `attempts` have been made. Saturates at zero.
    #[must_use]
    pub const fn remaining_attempts(&self, attempts: u32) -> u32 {
        self.max_attempts.saturating_sub(attempts)
    }

    /// Whether the attempt following `attempts` ones is the last allowed.
    #[must_use]
    pub const fn is_final_attempt(&self, attempts: u32) -> bool {
        attempts.saturating_add(1) >= self.max_attempts
    }

    #[must_use]
    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout_secs.map(Duration::from_secs)
    }

    /// How long to wait after the `attempt`-th failure (1-indexed).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        backoff_delay(
            attempt,
            self.base_delay_ms,
            self.max_delay_ms,
            self.jitter_factor,
        )
    }
}

/// `min(base * 2^(attempt - 1), max) * (1 ± jitter)`
fn backoff_delay(attempt: u32, base_ms: u64, max_ms: u64, jitter_factor: f64) -> Duration {
    if base_ms == 0 {
        return Duration::ZERO;
    }

    let exponent = attempt.saturating_sub(1);
    let delay = if exponent >= 63 {
        max_ms
    } else {
        base_ms.saturating_mul(1u64 << exponent).min(max_ms)
    };

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    let jittered = if jitter_factor > 0.0 {
        let range = (delay as f64) * jitter_factor;
        let jitter: f64 = rand::rng().random_range(-range..=range);
        ((delay as f64) + jitter).max(0.0) as u64
    } else {
        delay
    };

    Duration::from_millis(jittered)
}

mod defaults {
    pub const fn max_attempts() -> u32 {
        3
    }

    pub const fn base_delay_ms() -> u64 {
        200
    }

    pub const fn max_delay_ms() -> u64 {
        5_000
    }

    pub const fn jitter_factor() -> f64 {
        0.1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay_ms, 200);
        assert_eq!(policy.max_delay_ms, 5_000);
        assert!((policy.jitter_factor - 0.1).abs() < f64::EPSILON);
        assert_eq!(policy.attempt_timeout(), None);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_zero_attempts_is_rejected() {
        let err = RetryPolicy::new(0).validate().expect_err("0 attempts");
        assert_eq!(
            err.to_string(),
            "Invalid value for retry.max_attempts: must be at least 1"
        );
    }

    #[test]
    fn test_invalid_backoff_is_rejected() {
        let policy = RetryPolicy {
            jitter_factor: 1.5,
            ..RetryPolicy::default()
        };
        assert!(policy.validate().is_err());

        let policy = RetryPolicy {
            base_delay_ms: 1_000,
            max_delay_ms: 10,
            ..RetryPolicy::default()
        };
        assert!(policy.validate().is_err());

        assert!(RetryPolicy::new(3).with_attempt_timeout(0).validate().is_err());
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::new(3);

        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    #[test]
    fn test_remaining_and_final_attempts() {
        let policy = RetryPolicy::new(3);

        assert_eq!(policy.remaining_attempts(0), 3);
        assert_eq!(policy.remaining_attempts(2), 1);
        assert_eq!(policy.remaining_attempts(5), 0);

        assert!(!policy.is_final_attempt(0));
        assert!(!policy.is_final_attempt(1));
        assert!(policy.is_final_attempt(2));
    }

    #[test]
    fn test_final_attempt_at_the_counter_limit() {
        assert!(RetryPolicy::new(3).is_final_attempt(u32::MAX));

        let unbounded = RetryPolicy::new(u32::MAX);
        assert!(!unbounded.is_final_attempt(0));
        assert!(!unbounded.is_final_attempt(u32::MAX - 2));
        assert!(unbounded.is_final_attempt(u32::MAX - 1));
        assert!(unbounded.is_final_attempt(u32::MAX));
    }

    #[test]
    fn test_immediate_policy_never_waits() {
        let policy = RetryPolicy::immediate(5);
        for attempt in 1..=5 {
            assert_eq!(policy.delay_for(attempt), Duration::ZERO);
        }
    }

    #[test]
    fn test_exponential_backoff_without_jitter() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter_factor: 0.0,
            attempt_timeout_secs: None,
        };

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(200), Duration::from_millis(1_000));
    }

    #[test]
    fn test_backoff_jitter_stays_in_range() {
        for _ in 0..50 {
            let delay = backoff_delay(2, 100, 10_000, 0.2);
            assert!(
                (160..=240).contains(&delay.as_millis()),
                "Delay {delay:?} should be within 160..=240ms"
            );
        }
    }

    #[test]
    fn test_policy_deserializes_with_defaults() {
        let policy: RetryPolicy = ron::from_str("(max_attempts: 5)").expect("valid policy");
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay_ms, 200);
    }
}
