//! Workflow signals and the per-execution signal inbox

use std::collections::{BTreeSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// External signals that can be sent to running workflows
///
/// Signals are named events with a JSON payload, addressed to one execution.
/// They are recorded in the event log on arrival and handed to the workflow
/// through its [`SignalChannel`] once the workflow waits for that name.
///
/// # Example
///
/// ```
/// use txflow_durable::WorkflowSignal;
///
/// let signal = WorkflowSignal::new(
///     "human_review_complete",
///     serde_json::json!({ "review_id": "rev-1", "verdict": "approve" }),
/// );
/// assert_eq!(signal.signal_type, "human_review_complete");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowSignal {
    /// Signal type identifier
    pub signal_type: String,

    /// Signal payload (JSON)
    pub payload: serde_json::Value,

    /// When the signal was sent
    pub sent_at: DateTime<Utc>,
}

impl WorkflowSignal {
    /// Create a new signal
    pub fn new(signal_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            signal_type: signal_type.into(),
            payload,
            sent_at: Utc::now(),
        }
    }

    /// Create a cancellation signal
    pub fn cancel(reason: impl Into<String>) -> Self {
        Self::new(
            signal_types::CANCEL,
            serde_json::json!({ "reason": reason.into() }),
        )
    }

    /// Check if this is a cancellation signal
    pub fn is_cancel(&self) -> bool {
        self.signal_type == signal_types::CANCEL
    }

    /// Cancellation reason carried by a cancel signal
    pub fn cancel_reason(&self) -> Option<&str> {
        if !self.is_cancel() {
            return None;
        }
        self.payload.get("reason").and_then(|r| r.as_str())
    }
}

/// Common signal type constants
pub mod signal_types {
    /// Request execution cancellation (routed to the engine, never buffered)
    pub const CANCEL: &str = "cancel";
}

/// Ordered inbox of signals for one execution
///
/// Signals that arrive while the workflow is not waiting on their name are
/// buffered in arrival order. When the workflow starts waiting on a name, the
/// earliest buffered signal of that name is handed over immediately; otherwise
/// the wait stays open until a matching signal arrives.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SignalChannel {
    buffered: VecDeque<WorkflowSignal>,
    awaiting: BTreeSet<String>,
}

impl SignalChannel {
    /// Create an empty inbox
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept an arriving signal
    ///
    /// Returns the signal back when the workflow is currently waiting on its
    /// name (the wait is consumed); otherwise buffers it and returns `None`.
    pub fn receive(&mut self, signal: WorkflowSignal) -> Option<WorkflowSignal> {
        if self.awaiting.remove(&signal.signal_type) {
            Some(signal)
        } else {
            self.buffered.push_back(signal);
            None
        }
    }

    /// Start waiting for a signal name
    ///
    /// Returns the earliest buffered match, consuming it, if one exists.
    pub fn await_signal(&mut self, signal_type: &str) -> Option<WorkflowSignal> {
        let position = self
            .buffered
            .iter()
            .position(|s| s.signal_type == signal_type);

        match position {
            Some(index) => self.buffered.remove(index),
            None => {
                self.awaiting.insert(signal_type.to_string());
                None
            }
        }
    }

    /// Stop waiting for a signal name. Returns whether a wait was open.
    pub fn cancel_wait(&mut self, signal_type: &str) -> bool {
        self.awaiting.remove(signal_type)
    }

    /// Signal names currently awaited
    pub fn awaiting(&self) -> impl Iterator<Item = &str> {
        self.awaiting.iter().map(|s| s.as_str())
    }

    /// Check whether a signal name is awaited
    pub fn is_awaiting(&self, signal_type: &str) -> bool {
        self.awaiting.contains(signal_type)
    }

    /// Number of buffered, undelivered signals
    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn review(id: &str) -> WorkflowSignal {
        WorkflowSignal::new("human_review_complete", json!({ "review_id": id }))
    }

    #[test]
    fn test_cancel_signal() {
        let signal = WorkflowSignal::cancel("operator request");

        assert!(signal.is_cancel());
        assert_eq!(signal.signal_type, signal_types::CANCEL);
        assert_eq!(signal.cancel_reason(), Some("operator request"));
        assert_eq!(review("r").cancel_reason(), None);
    }

    #[test]
    fn test_signal_before_wait_is_buffered() {
        let mut channel = SignalChannel::new();

        assert!(channel.receive(review("first")).is_none());
        assert!(channel.receive(review("second")).is_none());
        assert_eq!(channel.buffered_len(), 2);

        let delivered = channel
            .await_signal("human_review_complete")
            .expect("should deliver buffered signal");
        assert_eq!(delivered.payload["review_id"], "first");
        assert_eq!(channel.buffered_len(), 1);
        assert!(!channel.is_awaiting("human_review_complete"));
    }

    #[test]
    fn test_signal_after_wait_is_delivered() {
        let mut channel = SignalChannel::new();

        assert!(channel.await_signal("human_review_complete").is_none());
        assert!(channel.is_awaiting("human_review_complete"));

        let delivered = channel.receive(review("only"));
        assert!(delivered.is_some());
        assert_eq!(channel.buffered_len(), 0);
        assert!(!channel.is_awaiting("human_review_complete"));
    }

    #[test]
    fn test_other_signal_names_stay_buffered() {
        let mut channel = SignalChannel::new();
        channel.receive(WorkflowSignal::new("note", json!({})));

        assert!(channel.await_signal("human_review_complete").is_none());
        assert_eq!(channel.buffered_len(), 1);
    }

    #[test]
    fn test_cancel_wait() {
        let mut channel = SignalChannel::new();
        channel.await_signal("human_review_complete");

        assert!(channel.cancel_wait("human_review_complete"));
        assert!(!channel.cancel_wait("human_review_complete"));
        assert!(channel.receive(review("late")).is_none());
        assert_eq!(channel.buffered_len(), 1);
    }
}
