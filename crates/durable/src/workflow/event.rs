//! Workflow events for persistence

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ActivityOptions, WorkflowError, WorkflowSignal};
use crate::activity::ActivityError;

/// Types of activity timeouts
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutType {
    /// Attempt did not complete within start_to_close_timeout
    StartToClose,

    /// Activity did not heartbeat within heartbeat_timeout
    Heartbeat,
}

impl TimeoutType {
    /// Error type recorded on the resulting [`ActivityError`]
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::StartToClose => "start_to_close_timeout",
            Self::Heartbeat => "heartbeat_timeout",
        }
    }
}

/// Events stored in the per-execution event log
///
/// These events form the append-only history of an execution. They are used for:
/// - Persisting progress before any effect is acted upon
/// - Replaying executions after a restart
/// - Answering queries about archived executions
///
/// Events are immutable once written. Execution state is reconstructed by
/// folding all events in sequence order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    // =========================================================================
    // Workflow Lifecycle Events
    // =========================================================================
    /// Workflow was started with the given input
    WorkflowStarted {
        /// The input provided when starting the workflow
        input: serde_json::Value,
    },

    /// Workflow completed successfully
    WorkflowCompleted {
        /// The result value
        result: serde_json::Value,
    },

    /// Workflow failed with an error
    WorkflowFailed {
        /// Error details
        error: WorkflowError,
    },

    /// Workflow was cancelled externally
    WorkflowCancelled {
        /// Reason for cancellation
        reason: String,
    },

    // =========================================================================
    // Activity Lifecycle Events
    // =========================================================================
    /// Activity was scheduled for execution
    ActivityScheduled {
        /// Unique activity identifier within the workflow
        activity_id: String,

        /// Type of activity to execute
        activity_type: String,

        /// Input for the activity
        input: serde_json::Value,

        /// Execution options
        options: ActivityOptions,
    },

    /// An attempt was dispatched to the activity executor
    ActivityStarted {
        /// Activity identifier
        activity_id: String,

        /// Attempt number (1-based)
        attempt: u32,

        /// ID of the engine instance executing the attempt
        worker_id: String,
    },

    /// Activity completed successfully
    ActivityCompleted {
        /// Activity identifier
        activity_id: String,

        /// Attempt that produced the result
        attempt: u32,

        /// Result returned by the activity
        result: serde_json::Value,
    },

    /// An attempt failed
    ActivityFailed {
        /// Activity identifier
        activity_id: String,

        /// Attempt that failed
        attempt: u32,

        /// Classified error
        error: ActivityError,

        /// Whether another attempt follows
        will_retry: bool,

        /// Backoff before the next attempt, when one follows
        #[serde(default)]
        retry_delay_ms: Option<u64>,

        /// When the next attempt is due; survives restarts like a timer's fire time
        #[serde(default)]
        retry_at: Option<DateTime<Utc>>,
    },

    /// Activity was cancelled before producing an outcome
    ActivityCancelled {
        /// Activity identifier
        activity_id: String,

        /// Reason for cancellation
        reason: String,
    },

    // =========================================================================
    // Timer Events
    // =========================================================================
    /// Timer was started
    TimerStarted {
        /// Timer identifier
        timer_id: String,

        /// Duration in milliseconds
        duration_ms: u64,

        /// Absolute fire time, used to re-arm the timer after a restart
        fire_at: DateTime<Utc>,
    },

    /// Timer fired (duration elapsed)
    TimerFired {
        /// Timer identifier
        timer_id: String,
    },

    /// Timer was cancelled
    TimerCancelled {
        /// Timer identifier
        timer_id: String,
    },

    // =========================================================================
    // Signal Events
    // =========================================================================
    /// The workflow started waiting for a signal type
    SignalAwaited {
        /// Awaited signal type
        signal_type: String,
    },

    /// The workflow stopped waiting for a signal type
    SignalWaitCancelled {
        /// Signal type no longer awaited
        signal_type: String,
    },

    /// External signal was received into the execution's inbox
    SignalReceived {
        /// The signal that was received
        signal: WorkflowSignal,
    },
}

impl WorkflowEvent {
    /// Stable name of the event variant (matches the serde tag)
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::WorkflowStarted { .. } => "workflow_started",
            Self::WorkflowCompleted { .. } => "workflow_completed",
            Self::WorkflowFailed { .. } => "workflow_failed",
            Self::WorkflowCancelled { .. } => "workflow_cancelled",
            Self::ActivityScheduled { .. } => "activity_scheduled",
            Self::ActivityStarted { .. } => "activity_started",
            Self::ActivityCompleted { .. } => "activity_completed",
            Self::ActivityFailed { .. } => "activity_failed",
            Self::ActivityCancelled { .. } => "activity_cancelled",
            Self::TimerStarted { .. } => "timer_started",
            Self::TimerFired { .. } => "timer_fired",
            Self::TimerCancelled { .. } => "timer_cancelled",
            Self::SignalAwaited { .. } => "signal_awaited",
            Self::SignalWaitCancelled { .. } => "signal_wait_cancelled",
            Self::SignalReceived { .. } => "signal_received",
        }
    }

    /// Get the activity_id if this is an activity-related event
    pub fn activity_id(&self) -> Option<&str> {
        match self {
            Self::ActivityScheduled { activity_id, .. }
            | Self::ActivityStarted { activity_id, .. }
            | Self::ActivityCompleted { activity_id, .. }
            | Self::ActivityFailed { activity_id, .. }
            | Self::ActivityCancelled { activity_id, .. } => Some(activity_id),
            _ => None,
        }
    }

    /// Check if this is a terminal workflow event
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkflowCompleted { .. }
                | Self::WorkflowFailed { .. }
                | Self::WorkflowCancelled { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_workflow_event_tag_matches_event_type() {
        let event = WorkflowEvent::TimerStarted {
            timer_id: "review_deadline".to_string(),
            duration_ms: 1_000,
            fire_at: Utc::now(),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], event.event_type());

        let parsed: WorkflowEvent = serde_json::from_value(json).unwrap();
        assert_eq!(event, parsed);
    }

    #[test]
    fn test_activity_failed_without_retry_delay_field() {
        let json = json!({
            "type": "activity_failed",
            "activity_id": "save_decision",
            "attempt": 5,
            "error": ActivityError::retryable("connection reset"),
            "will_retry": false
        });

        let parsed: WorkflowEvent = serde_json::from_value(json).unwrap();
        match parsed {
            WorkflowEvent::ActivityFailed { retry_delay_ms, .. } => {
                assert_eq!(retry_delay_ms, None)
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_activity_id_extraction() {
        let event = WorkflowEvent::ActivityStarted {
            activity_id: "generate_embedding".to_string(),
            attempt: 1,
            worker_id: "worker-1".to_string(),
        };
        assert_eq!(event.activity_id(), Some("generate_embedding"));

        let start_event = WorkflowEvent::WorkflowStarted { input: json!({}) };
        assert_eq!(start_event.activity_id(), None);
    }

    #[test]
    fn test_is_terminal() {
        assert!(WorkflowEvent::WorkflowCompleted { result: json!({}) }.is_terminal());
        assert!(WorkflowEvent::WorkflowFailed {
            error: WorkflowError::new("error")
        }
        .is_terminal());
        assert!(WorkflowEvent::WorkflowCancelled {
            reason: "cancelled".to_string()
        }
        .is_terminal());

        assert!(!WorkflowEvent::WorkflowStarted { input: json!({}) }.is_terminal());
        assert!(!WorkflowEvent::SignalAwaited {
            signal_type: "human_review_complete".to_string()
        }
        .is_terminal());
    }

    #[test]
    fn test_timeout_error_types() {
        assert_eq!(TimeoutType::StartToClose.error_type(), "start_to_close_timeout");
        assert_eq!(TimeoutType::Heartbeat.error_type(), "heartbeat_timeout");
    }
}
