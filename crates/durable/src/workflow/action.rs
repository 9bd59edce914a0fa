//! Workflow actions and activity options

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::WorkflowError;
use crate::reliability::RetryPolicy;

/// Commands a workflow can issue in response to events
///
/// Each action is persisted as a [`WorkflowEvent`](super::WorkflowEvent) before
/// its effect is performed. During replay the recorded events are matched
/// against the actions the workflow produces again, so a workflow must emit the
/// same actions in the same order for the same history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowAction {
    /// Schedule an activity for execution
    ScheduleActivity {
        /// Unique identifier for this activity within the workflow
        activity_id: String,

        /// Type of activity to execute (used to look up the handler)
        activity_type: String,

        /// Input data for the activity (JSON)
        input: serde_json::Value,

        /// Execution options (retries, timeouts)
        options: ActivityOptions,
    },

    /// Start a durable timer that fires after the specified duration
    StartTimer {
        /// Unique identifier for this timer within the workflow
        timer_id: String,

        /// Duration to wait before firing
        #[serde(with = "duration_serde")]
        duration: Duration,
    },

    /// Cancel a pending timer
    CancelTimer {
        /// ID of the timer to cancel
        timer_id: String,
    },

    /// Wait for the earliest signal of the given type
    ///
    /// A matching signal that already sits in the execution's inbox is
    /// delivered immediately.
    AwaitSignal {
        /// Signal type to wait for
        signal_type: String,
    },

    /// Stop waiting for a signal type
    CancelSignalWait {
        /// Signal type no longer awaited
        signal_type: String,
    },

    /// Request cancellation of an in-flight activity
    CancelActivity {
        /// ID of the activity to cancel
        activity_id: String,
    },

    /// Complete the workflow successfully with a result
    CompleteWorkflow {
        /// Result value (JSON)
        result: serde_json::Value,
    },

    /// Fail the workflow with an error
    FailWorkflow {
        /// Error details
        error: WorkflowError,
    },
}

impl WorkflowAction {
    /// Create a schedule activity action with default options
    pub fn schedule_activity(
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self::ScheduleActivity {
            activity_id: activity_id.into(),
            activity_type: activity_type.into(),
            input,
            options: ActivityOptions::default(),
        }
    }

    /// Create a schedule activity action with explicit options
    pub fn schedule_activity_with(
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
        input: serde_json::Value,
        options: ActivityOptions,
    ) -> Self {
        Self::ScheduleActivity {
            activity_id: activity_id.into(),
            activity_type: activity_type.into(),
            input,
            options,
        }
    }

    /// Create a complete workflow action
    pub fn complete(result: serde_json::Value) -> Self {
        Self::CompleteWorkflow { result }
    }

    /// Create a fail workflow action
    pub fn fail(error: WorkflowError) -> Self {
        Self::FailWorkflow { error }
    }

    /// Create a timer action
    pub fn timer(timer_id: impl Into<String>, duration: Duration) -> Self {
        Self::StartTimer {
            timer_id: timer_id.into(),
            duration,
        }
    }

    /// Create a timer cancellation action
    pub fn cancel_timer(timer_id: impl Into<String>) -> Self {
        Self::CancelTimer {
            timer_id: timer_id.into(),
        }
    }

    /// Create a signal wait action
    pub fn await_signal(signal_type: impl Into<String>) -> Self {
        Self::AwaitSignal {
            signal_type: signal_type.into(),
        }
    }

    /// Create an action that stops waiting for a signal type
    pub fn cancel_signal_wait(signal_type: impl Into<String>) -> Self {
        Self::CancelSignalWait {
            signal_type: signal_type.into(),
        }
    }

    /// Short name used in logs and replay diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ScheduleActivity { .. } => "schedule_activity",
            Self::StartTimer { .. } => "start_timer",
            Self::CancelTimer { .. } => "cancel_timer",
            Self::AwaitSignal { .. } => "await_signal",
            Self::CancelSignalWait { .. } => "cancel_signal_wait",
            Self::CancelActivity { .. } => "cancel_activity",
            Self::CompleteWorkflow { .. } => "complete_workflow",
            Self::FailWorkflow { .. } => "fail_workflow",
        }
    }
}

/// Options for activity execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityOptions {
    /// Retry policy for this activity
    pub retry_policy: RetryPolicy,

    /// Maximum time for a single attempt (from start to completion)
    #[serde(with = "duration_serde")]
    pub start_to_close_timeout: Duration,

    /// Heartbeat window for long-running activities
    ///
    /// If set, the activity must heartbeat at least once per window or the
    /// attempt is failed as retryable.
    #[serde(default, with = "option_duration_serde")]
    pub heartbeat_timeout: Option<Duration>,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            start_to_close_timeout: Duration::from_secs(300),
            heartbeat_timeout: None,
        }
    }
}

impl ActivityOptions {
    /// Create options with a specific retry policy
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set the start-to-close timeout
    pub fn with_start_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.start_to_close_timeout = timeout;
        self
    }

    /// Enable heartbeating with the specified window
    pub fn with_heartbeat(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(timeout);
        self
    }
}

/// Serde support for Duration (as milliseconds)
mod duration_serde {
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

/// Serde support for Option<Duration>
mod option_duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => (d.as_millis() as u64).serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_schedule_activity_action() {
        let action =
            WorkflowAction::schedule_activity("embed", "generate_embedding", json!({"id": "tx-1"}));

        match action {
            WorkflowAction::ScheduleActivity {
                activity_id,
                activity_type,
                input,
                ..
            } => {
                assert_eq!(activity_id, "embed");
                assert_eq!(activity_type, "generate_embedding");
                assert_eq!(input, json!({"id": "tx-1"}));
            }
            _ => panic!("Expected ScheduleActivity"),
        }
    }

    #[test]
    fn test_activity_options_serialization() {
        let options = ActivityOptions::default()
            .with_start_to_close_timeout(Duration::from_secs(90))
            .with_heartbeat(Duration::from_secs(30));

        let json = serde_json::to_string(&options).unwrap();
        let parsed: ActivityOptions = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.start_to_close_timeout, Duration::from_secs(90));
        assert_eq!(parsed.heartbeat_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_heartbeat_timeout_defaults_to_none() {
        let json = json!({
            "retry_policy": RetryPolicy::no_retry(),
            "start_to_close_timeout": 1000
        });

        let parsed: ActivityOptions = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.heartbeat_timeout, None);
    }

    #[test]
    fn test_workflow_action_tagging() {
        let action = WorkflowAction::await_signal("human_review_complete");

        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["type"], "await_signal");

        let parsed: WorkflowAction = serde_json::from_value(json).unwrap();
        assert_eq!(action, parsed);
        assert_eq!(parsed.kind(), "await_signal");
    }

    #[test]
    fn test_timer_action() {
        let action = WorkflowAction::timer("deadline", Duration::from_secs(60));

        match action {
            WorkflowAction::StartTimer { timer_id, duration } => {
                assert_eq!(timer_id, "deadline");
                assert_eq!(duration, Duration::from_secs(60));
            }
            _ => panic!("Expected StartTimer"),
        }
    }
}
