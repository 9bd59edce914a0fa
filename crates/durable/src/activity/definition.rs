//! Activity trait definition and error classification

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::ActivityContext;

/// Failure classification used by the retry policy engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Transient failure (network, upstream timeout, rate limit)
    Retryable,

    /// Business or input failure that must not be retried
    Terminal,
}

/// Common error type codes
pub mod error_types {
    /// Attempt exceeded its start-to-close timeout
    pub const START_TO_CLOSE_TIMEOUT: &str = "start_to_close_timeout";
    /// No heartbeat within the heartbeat window
    pub const HEARTBEAT_TIMEOUT: &str = "heartbeat_timeout";
    /// Activity input could not be decoded
    pub const MALFORMED_INPUT: &str = "malformed_input";
    /// Activity output could not be encoded
    pub const MALFORMED_OUTPUT: &str = "malformed_output";
    /// Attempt was cancelled
    pub const CANCELLED: &str = "cancelled";
    /// No handler registered for the activity type
    pub const UNKNOWN_ACTIVITY: &str = "unknown_activity";
}

/// Error type for activity failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityError {
    /// Error message
    pub message: String,

    /// Error type/code for programmatic handling
    pub error_type: Option<String>,

    /// Whether this error is retryable
    ///
    /// Non-retryable errors fail the activity immediately.
    pub retryable: bool,

    /// Additional error details (for debugging)
    pub details: Option<serde_json::Value>,
}

impl ActivityError {
    /// Create a new retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: true,
            details: None,
        }
    }

    /// Create a non-retryable error
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: false,
            details: None,
        }
    }

    /// Set the error type
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Add error details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Classify this error for the retry policy engine
    pub fn classification(&self) -> ErrorClass {
        if self.retryable {
            ErrorClass::Retryable
        } else {
            ErrorClass::Terminal
        }
    }

    /// Check the error type code
    pub fn is_type(&self, error_type: &str) -> bool {
        self.error_type.as_deref() == Some(error_type)
    }

    /// Turn a retryable error into the terminal failure surfaced after the
    /// attempt budget is spent
    pub fn exhausted(mut self, attempts: u32) -> Self {
        self.message = format!("retries exhausted after {attempts} attempts: {}", self.message);
        self.retryable = false;
        self
    }
}

impl std::fmt::Display for ActivityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ActivityError {}

impl From<anyhow::Error> for ActivityError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(err.to_string())
    }
}

/// An activity is a unit of side-effecting work that may fail and be retried
///
/// Activities wrap calls to external collaborators. They:
/// - Run outside the deterministic workflow logic
/// - May fail transiently and be retried per the activity's policy
/// - Can heartbeat for liveness and observe cancellation through the context
///
/// Activities run at least once, so their effects must be idempotent.
///
/// # Example
///
/// ```ignore
/// use txflow_durable::prelude::*;
///
/// struct SendEmailActivity;
///
/// #[async_trait]
/// impl Activity for SendEmailActivity {
///     const TYPE: &'static str = "send_email";
///     type Input = SendEmailInput;
///     type Output = SendEmailOutput;
///
///     async fn execute(
///         &self,
///         ctx: &ActivityContext,
///         input: Self::Input,
///     ) -> Result<Self::Output, ActivityError> {
///         Ok(SendEmailOutput { message_id: "...".into() })
///     }
/// }
/// ```
#[async_trait]
pub trait Activity: Send + Sync + 'static {
    /// Unique type identifier for this activity
    const TYPE: &'static str;

    /// Input type for the activity
    type Input: Serialize + DeserializeOwned + Send;

    /// Output type for the activity
    type Output: Serialize + DeserializeOwned + Send;

    /// Execute one attempt of the activity
    ///
    /// # Errors
    ///
    /// Return `ActivityError::retryable()` for transient failures that should be retried.
    /// Return `ActivityError::non_retryable()` for permanent failures.
    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError>;
}

/// Type-erased activity interface used by the executor
#[async_trait]
pub trait AnyActivity: Send + Sync {
    /// Activity type identifier
    fn activity_type(&self) -> &'static str;

    /// Execute with JSON input and output
    async fn execute_json(
        &self,
        ctx: &ActivityContext,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, ActivityError>;
}

/// Wrapper to implement AnyActivity for any Activity
pub(crate) struct ActivityWrapper<A: Activity> {
    pub(crate) inner: A,
}

#[async_trait]
impl<A: Activity> AnyActivity for ActivityWrapper<A> {
    fn activity_type(&self) -> &'static str {
        A::TYPE
    }

    async fn execute_json(
        &self,
        ctx: &ActivityContext,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, ActivityError> {
        let typed_input: A::Input = serde_json::from_value(input).map_err(|e| {
            ActivityError::non_retryable(format!("invalid input for {}: {e}", A::TYPE))
                .with_type(error_types::MALFORMED_INPUT)
        })?;

        let output = self.inner.execute(ctx, typed_input).await?;

        serde_json::to_value(output).map_err(|e| {
            ActivityError::non_retryable(format!("invalid output from {}: {e}", A::TYPE))
                .with_type(error_types::MALFORMED_OUTPUT)
        })
    }
}
