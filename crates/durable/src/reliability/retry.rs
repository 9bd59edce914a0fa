//! Retry policy and retry decisions

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::activity::{ActivityError, ErrorClass};

/// Configuration for activity retries
///
/// Supports exponential backoff with optional jitter. The delay after failed
/// attempt `n` is `initial_interval * backoff_coefficient^(n-1)`, capped at
/// `max_interval`.
///
/// # Example
///
/// ```
/// use txflow_durable::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(3)
///     .with_initial_interval(Duration::from_secs(1))
///     .with_max_interval(Duration::from_secs(10))
///     .with_jitter(0.0);
///
/// assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(1));
/// assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(2));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Maximum delay between retries
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier (e.g., 2.0 for exponential)
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0) to add randomness
    ///
    /// A value of 0.1 means ±10% randomness.
    pub jitter: f64,

    /// Error types that must NOT be retried
    #[serde(default)]
    pub non_retryable_errors: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

/// Invalid retry policy configuration
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RetryPolicyError {
    #[error("max_attempts must be at least 1")]
    ZeroAttempts,

    #[error("backoff_coefficient must be at least 1.0, got {0}")]
    ShrinkingBackoff(f64),

    #[error("jitter must be within 0.0..=1.0, got {0}")]
    JitterOutOfRange(f64),
}

/// Outcome of consulting a policy about a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run another attempt after the delay
    Retry {
        /// Attempt number of the next attempt
        next_attempt: u32,
        /// Backoff before the next attempt
        delay: Duration,
    },

    /// The error is terminal; no further attempts
    NonRetryable,

    /// The error was retryable but the attempt budget is spent
    Exhausted,
}

impl RetryDecision {
    /// Whether another attempt follows
    pub fn will_retry(&self) -> bool {
        matches!(self, Self::Retry { .. })
    }
}

impl RetryPolicy {
    /// Create an exponential backoff retry policy with sensible defaults
    ///
    /// - 5 max attempts
    /// - 1 second initial interval
    /// - 60 second max interval
    /// - 2x backoff coefficient
    /// - 10% jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            backoff_coefficient: 2.0,
            jitter: 0.1,
            non_retryable_errors: vec![],
        }
    }

    /// Create a policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            non_retryable_errors: vec![],
        }
    }

    /// Create a policy with fixed intervals (no backoff)
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            non_retryable_errors: vec![],
        }
    }

    /// Set the maximum number of attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the initial retry interval
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Set the maximum retry interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set the backoff coefficient
    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Add a non-retryable error type
    pub fn with_non_retryable_error(mut self, error_type: impl Into<String>) -> Self {
        self.non_retryable_errors.push(error_type.into());
        self
    }

    /// Check the policy invariants
    pub fn validate(&self) -> Result<(), RetryPolicyError> {
        if self.max_attempts < 1 {
            return Err(RetryPolicyError::ZeroAttempts);
        }
        if !(self.backoff_coefficient >= 1.0) {
            return Err(RetryPolicyError::ShrinkingBackoff(self.backoff_coefficient));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(RetryPolicyError::JitterOutOfRange(self.jitter));
        }
        Ok(())
    }

    /// Calculate the delay before a given attempt number (1-based)
    ///
    /// The first attempt runs immediately.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let retry_num = attempt - 1; // first retry follows attempt 1
        let base = self.initial_interval.as_secs_f64()
            * self.backoff_coefficient.powi(retry_num as i32 - 1);
        let capped = base.min(self.max_interval.as_secs_f64());

        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let mut rng = rand::thread_rng();
            let jitter_range = capped * self.jitter;
            let jitter_offset = rng.gen_range(-jitter_range..jitter_range);
            (capped + jitter_offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }

    /// Check if an error type should be retried
    pub fn should_retry(&self, error_type: Option<&str>) -> bool {
        match error_type {
            Some(error_type) => !self.non_retryable_errors.iter().any(|e| e == error_type),
            None => true,
        }
    }

    /// Check if there are remaining attempts
    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }

    /// Decide what happens after `attempt` failed with `error`
    pub fn decide(&self, error: &ActivityError, attempt: u32) -> RetryDecision {
        if error.classification() == ErrorClass::Terminal
            || !self.should_retry(error.error_type.as_deref())
        {
            return RetryDecision::NonRetryable;
        }

        if !self.has_attempts_remaining(attempt) {
            return RetryDecision::Exhausted;
        }

        let next_attempt = attempt + 1;
        RetryDecision::Retry {
            next_attempt,
            delay: self.delay_for_attempt(next_attempt),
        }
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_defaults() {
        let policy = RetryPolicy::exponential();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_interval, Duration::from_secs(1));
        assert_eq!(policy.backoff_coefficient, 2.0);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_no_retry() {
        let policy = RetryPolicy::no_retry();
        assert_eq!(policy.max_attempts, 1);
        assert!(!policy.has_attempts_remaining(1));
        assert_eq!(
            policy.decide(&ActivityError::retryable("boom"), 1),
            RetryDecision::Exhausted
        );
    }

    #[test]
    fn test_validate_rejects_bad_policies() {
        assert_eq!(
            RetryPolicy::exponential().with_max_attempts(0).validate(),
            Err(RetryPolicyError::ZeroAttempts)
        );
        assert_eq!(
            RetryPolicy::exponential()
                .with_backoff_coefficient(0.5)
                .validate(),
            Err(RetryPolicyError::ShrinkingBackoff(0.5))
        );
    }

    #[test]
    fn test_fixed_interval() {
        let policy = RetryPolicy::fixed(Duration::from_secs(5), 3);

        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(5));
    }

    #[test]
    fn test_delay_for_attempt() {
        let policy = RetryPolicy::exponential().with_jitter(0.0);

        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(4));
    }

    #[test]
    fn test_max_interval_cap() {
        let policy = RetryPolicy::exponential()
            .with_max_interval(Duration::from_secs(5))
            .with_jitter(0.0);

        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_within_range() {
        let policy = RetryPolicy::fixed(Duration::from_secs(10), 3).with_jitter(0.1);

        for _ in 0..50 {
            let delay = policy.delay_for_attempt(2);
            assert!(delay >= Duration::from_secs(9));
            assert!(delay <= Duration::from_secs(11));
        }
    }

    #[test]
    fn test_non_retryable_errors() {
        let policy = RetryPolicy::exponential()
            .with_non_retryable_error("validation_failed")
            .with_non_retryable_error("compliance_violation");

        assert!(!policy.should_retry(Some("validation_failed")));
        assert!(!policy.should_retry(Some("compliance_violation")));
        assert!(policy.should_retry(Some("network_error")));
        assert!(policy.should_retry(None));
    }

    #[test]
    fn test_decide_retry_then_exhausted() {
        let policy = RetryPolicy::exponential()
            .with_max_attempts(3)
            .with_jitter(0.0);
        let error = ActivityError::retryable("upstream timeout").with_type("upstream_timeout");

        assert_eq!(
            policy.decide(&error, 1),
            RetryDecision::Retry {
                next_attempt: 2,
                delay: Duration::from_secs(1)
            }
        );
        assert_eq!(
            policy.decide(&error, 2),
            RetryDecision::Retry {
                next_attempt: 3,
                delay: Duration::from_secs(2)
            }
        );
        assert_eq!(policy.decide(&error, 3), RetryDecision::Exhausted);
    }

    #[test]
    fn test_decide_terminal_errors() {
        let policy = RetryPolicy::exponential().with_non_retryable_error("compliance_violation");

        let terminal = ActivityError::non_retryable("malformed input");
        assert_eq!(policy.decide(&terminal, 1), RetryDecision::NonRetryable);

        let listed = ActivityError::retryable("blocked").with_type("compliance_violation");
        assert_eq!(policy.decide(&listed, 1), RetryDecision::NonRetryable);
        assert!(!policy.decide(&listed, 1).will_retry());
    }

    #[test]
    fn test_serialization() {
        let policy = RetryPolicy::exponential()
            .with_max_attempts(10)
            .with_non_retryable_error("TEST");

        let json = serde_json::to_string(&policy).unwrap();
        let parsed: RetryPolicy = serde_json::from_str(&json).unwrap();

        assert_eq!(policy, parsed);
    }
}
