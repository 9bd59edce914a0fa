//! Workflow trait definition

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::{WorkflowAction, WorkflowSignal};
use crate::activity::ActivityError;

/// Error type for workflow failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowError {
    /// Human-readable failure reason
    pub message: String,

    /// Error code for programmatic handling
    pub code: Option<String>,

    /// Whether this error is retryable
    pub retryable: bool,
}

impl WorkflowError {
    /// Create a new workflow error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: false,
        }
    }

    /// Create a retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: true,
        }
    }

    /// Set the error code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for WorkflowError {}

/// A workflow is a deterministic state machine driven by events
///
/// Workflows define:
/// - How to start execution (`on_start`)
/// - How to react to activity outcomes (`on_activity_completed`, `on_activity_failed`)
/// - How to react to timers and external signals (`on_timer_fired`, `on_signal`)
/// - What a query sees (`query`)
///
/// # Determinism
///
/// Given the same sequence of events a workflow must produce the same sequence
/// of actions. Callbacks may only read their arguments and their own state:
/// no wall-clock reads, no randomness, no I/O. Anything of that kind has to be
/// obtained as the result of an activity so that it is recorded.
///
/// # Example
///
/// ```ignore
/// use txflow_durable::prelude::*;
///
/// struct OrderWorkflow {
///     order_id: String,
///     done: bool,
/// }
///
/// impl Workflow for OrderWorkflow {
///     const TYPE: &'static str = "order_workflow";
///     type Input = OrderInput;
///     type Output = OrderResult;
///
///     fn new(input: Self::Input) -> Self {
///         Self { order_id: input.order_id, done: false }
///     }
///
///     fn on_start(&mut self) -> Vec<WorkflowAction> {
///         vec![WorkflowAction::schedule_activity(
///             "validate",
///             "validate_order",
///             json!({ "order_id": self.order_id }),
///         )]
///     }
///
///     // ... implement other methods
/// }
/// ```
pub trait Workflow: Send + Sync + 'static {
    /// Unique type identifier for this workflow
    ///
    /// Used to look up the workflow factory during replay.
    const TYPE: &'static str;

    /// Input type for starting the workflow
    type Input: Serialize + DeserializeOwned + Send + Clone;

    /// Output type when workflow completes successfully
    type Output: Serialize + DeserializeOwned + Send;

    /// Create a new workflow instance from input
    ///
    /// Called both when starting a new execution and when replaying one.
    fn new(input: Self::Input) -> Self;

    /// Called once when the execution starts
    fn on_start(&mut self) -> Vec<WorkflowAction>;

    /// Called when an activity completes successfully
    fn on_activity_completed(
        &mut self,
        activity_id: &str,
        result: serde_json::Value,
    ) -> Vec<WorkflowAction>;

    /// Called when an activity fails terminally (non-retryable or retries exhausted)
    fn on_activity_failed(
        &mut self,
        activity_id: &str,
        error: &ActivityError,
    ) -> Vec<WorkflowAction>;

    /// Called when a timer fires
    fn on_timer_fired(&mut self, timer_id: &str) -> Vec<WorkflowAction> {
        let _ = timer_id;
        vec![]
    }

    /// Called when an awaited signal is delivered
    fn on_signal(&mut self, signal: &WorkflowSignal) -> Vec<WorkflowAction> {
        let _ = signal;
        vec![]
    }

    /// Workflow time: the recorded timestamp of the event about to be handled
    ///
    /// Called before every callback. Replay passes the same timestamps the live
    /// run saw, so anything derived from them is deterministic.
    fn on_clock(&mut self, now: DateTime<Utc>) {
        let _ = now;
    }

    /// Called after the execution was cancelled externally
    ///
    /// No actions can be issued from here; the execution is already terminal.
    fn on_cancelled(&mut self, reason: &str) {
        let _ = reason;
    }

    /// Check if workflow has reached a terminal state
    fn is_completed(&self) -> bool;

    /// Get the workflow result (if completed successfully)
    fn result(&self) -> Option<Self::Output>;

    /// Get the workflow error (if failed)
    fn error(&self) -> Option<WorkflowError> {
        None
    }

    /// Side-effect-free view of the workflow's logical state
    fn query(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_error_display() {
        let error = WorkflowError::new("compliance_violation");
        assert_eq!(error.to_string(), "compliance_violation");
    }

    #[test]
    fn test_workflow_error_with_code() {
        let error = WorkflowError::new("cancelled").with_code("cancelled");
        assert_eq!(error.code, Some("cancelled".to_string()));
        assert!(!error.retryable);
    }

    #[test]
    fn test_workflow_error_retryable() {
        let error = WorkflowError::retryable("temporary failure");
        assert!(error.retryable);
    }
}
