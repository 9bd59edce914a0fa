//! Reliability primitives
//!
//! Retry policies decide, for a classified activity error and an attempt
//! number, whether another attempt runs and after what backoff.

mod retry;

pub use retry::{RetryDecision, RetryPolicy, RetryPolicyError};
