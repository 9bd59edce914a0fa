//! Execution state as a fold over the event log
//!
//! `ExecutionState` is rebuilt by applying recorded events in sequence order.
//! The same `apply` is used while an execution runs live and while it is
//! replayed after a restart, so both paths reach identical state.
//!
//! Workflow callbacks push the actions they produce onto a queue. Every event
//! that records an action pops the front of that queue and must match it;
//! a mismatch means the workflow code is no longer deterministic for this
//! history. Actions still queued when the history ends have not been
//! performed yet and are executed by the driver.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use super::registry::{AnyWorkflow, RegistryError, WorkflowRegistry};
use crate::activity::ActivityError;
use crate::persistence::{EventRecord, WorkflowStatus};
use crate::workflow::{ActivityOptions, SignalChannel, WorkflowAction, WorkflowError, WorkflowEvent};

/// Errors raised while folding an event history
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    /// The workflow produced a different action than the one recorded
    #[error("non-determinism at event {sequence}: recorded {recorded}, workflow produced {produced}")]
    NonDeterminism {
        sequence: i32,
        recorded: &'static str,
        produced: String,
    },

    /// An event refers to an activity or timer the history never created
    #[error("unexpected {event_type} at event {sequence}: {detail}")]
    UnexpectedEvent {
        sequence: i32,
        event_type: &'static str,
        detail: String,
    },

    /// History does not begin with `workflow_started`
    #[error("history of {0} does not start with workflow_started")]
    MissingStart(Uuid),

    /// Event recorded after the execution became terminal
    #[error("event {sequence} recorded after terminal state")]
    AfterTerminal { sequence: i32 },

    /// Sequence numbers are not contiguous
    #[error("sequence gap: expected {expected}, found {actual}")]
    SequenceGap { expected: i32, actual: i32 },

    /// Workflow could not be instantiated
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Lifecycle of one activity invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    /// Scheduled, no attempt dispatched yet
    Scheduled,
    /// An attempt is in flight
    Running,
    /// Last attempt failed, another one follows after the recorded delay
    FailedRetryable,
    /// Completed successfully
    Completed,
    /// Failed terminally
    Failed,
    /// Cancelled before producing an outcome
    Cancelled,
}

impl InvocationStatus {
    /// Check if the invocation still expects an attempt outcome
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Scheduled | Self::Running | Self::FailedRetryable)
    }
}

/// One scheduled activity and its attempt bookkeeping
#[derive(Debug, Clone)]
pub struct ActivityInvocation {
    pub activity_id: String,
    pub activity_type: String,
    pub input: Value,
    pub options: ActivityOptions,
    /// Latest attempt number (0 until the first attempt starts)
    pub attempt: u32,
    pub status: InvocationStatus,
    pub last_error: Option<ActivityError>,
    /// Backoff recorded with the last retryable failure
    pub retry_delay: Option<Duration>,
    /// Due time of the next attempt while backing off
    pub retry_at: Option<DateTime<Utc>>,
    /// When the latest attempt started
    pub started_at: Option<DateTime<Utc>>,
    pub scheduled_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Timer started and neither fired nor cancelled
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingTimer {
    pub timer_id: String,
    pub fire_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Query view of one activity invocation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivityView {
    pub activity_id: String,
    pub activity_type: String,
    pub attempt: u32,
    pub status: InvocationStatus,
    pub last_error: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// Set while backing off before the next attempt
    pub retry_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Side-effect-free view of an execution, answered without touching its driver
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionSnapshot {
    pub execution_id: Uuid,
    pub workflow_type: String,
    pub status: WorkflowStatus,
    /// Logical state reported by the workflow itself
    pub workflow_state: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub event_count: usize,
    pub activities: Vec<ActivityView>,
    pub pending_timers: Vec<PendingTimer>,
    pub awaiting_signals: Vec<String>,
    pub buffered_signals: usize,
    pub result: Option<Value>,
    pub error: Option<WorkflowError>,
}

impl ExecutionSnapshot {
    /// Terminal reason: the failure message, if any
    pub fn reason(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.message.as_str())
    }
}

/// In-memory state of one execution
pub struct ExecutionState {
    workflow_id: Uuid,
    workflow_type: String,
    workflow: Box<dyn AnyWorkflow>,
    pending_actions: VecDeque<WorkflowAction>,
    activities: Vec<ActivityInvocation>,
    timers: BTreeMap<String, PendingTimer>,
    signals: SignalChannel,
    status: WorkflowStatus,
    next_sequence: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    result: Option<Value>,
    error: Option<WorkflowError>,
}

impl ExecutionState {
    /// Empty state for a workflow instance that has not seen any event
    pub fn new(workflow_id: Uuid, workflow: Box<dyn AnyWorkflow>) -> Self {
        let now = Utc::now();
        Self {
            workflow_id,
            workflow_type: workflow.workflow_type().to_string(),
            workflow,
            pending_actions: VecDeque::new(),
            activities: Vec::new(),
            timers: BTreeMap::new(),
            signals: SignalChannel::new(),
            status: WorkflowStatus::Pending,
            next_sequence: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    /// Rebuild state by folding a full history
    ///
    /// The workflow instance is created from the input recorded in the first
    /// event, never from the current store metadata.
    pub fn replay(
        registry: &WorkflowRegistry,
        workflow_id: Uuid,
        workflow_type: &str,
        records: &[EventRecord],
    ) -> Result<Self, ReplayError> {
        let input = match records.first().map(|r| &r.event) {
            Some(WorkflowEvent::WorkflowStarted { input }) => input.clone(),
            _ => return Err(ReplayError::MissingStart(workflow_id)),
        };

        let workflow = registry.create(workflow_type, input)?;
        let mut state = Self::new(workflow_id, workflow);
        for record in records {
            state.apply(record)?;
        }
        Ok(state)
    }

    /// Apply one recorded event
    pub fn apply(&mut self, record: &EventRecord) -> Result<(), ReplayError> {
        if record.sequence != self.next_sequence {
            return Err(ReplayError::SequenceGap {
                expected: self.next_sequence,
                actual: record.sequence,
            });
        }
        if self.status.is_terminal() {
            return Err(ReplayError::AfterTerminal {
                sequence: record.sequence,
            });
        }

        let sequence = record.sequence;
        let at = record.recorded_at;
        self.workflow.on_clock(at);

        match &record.event {
            WorkflowEvent::WorkflowStarted { .. } => {
                if sequence != 0 {
                    return Err(self.unexpected(&record.event, "workflow already started"));
                }
                self.created_at = at;
                self.status = WorkflowStatus::Running;
                let actions = self.workflow.on_start();
                self.pending_actions.extend(actions);
            }

            WorkflowEvent::ActivityScheduled {
                activity_id,
                activity_type,
                input,
                options,
            } => {
                self.expect_action(sequence, &record.event, |action| {
                    matches!(action, WorkflowAction::ScheduleActivity {
                        activity_id: a, activity_type: t, ..
                    } if a == activity_id && t == activity_type)
                })?;

                let invocation = ActivityInvocation {
                    activity_id: activity_id.clone(),
                    activity_type: activity_type.clone(),
                    input: input.clone(),
                    options: options.clone(),
                    attempt: 0,
                    status: InvocationStatus::Scheduled,
                    last_error: None,
                    retry_delay: None,
                    retry_at: None,
                    started_at: None,
                    scheduled_at: at,
                    updated_at: at,
                };
                match self.activities.iter_mut().find(|i| i.activity_id == *activity_id) {
                    Some(existing) => *existing = invocation,
                    None => self.activities.push(invocation),
                }
            }

            WorkflowEvent::ActivityStarted {
                activity_id,
                attempt,
                ..
            } => {
                let invocation = self.open_invocation(&record.event, activity_id)?;
                invocation.attempt = *attempt;
                invocation.status = InvocationStatus::Running;
                invocation.retry_at = None;
                invocation.started_at = Some(at);
                invocation.updated_at = at;
            }

            WorkflowEvent::ActivityCompleted {
                activity_id,
                result,
                ..
            } => {
                let invocation = self.open_invocation(&record.event, activity_id)?;
                invocation.status = InvocationStatus::Completed;
                invocation.updated_at = at;

                let actions = self.workflow.on_activity_completed(activity_id, result.clone());
                self.pending_actions.extend(actions);
            }

            WorkflowEvent::ActivityFailed {
                activity_id,
                error,
                will_retry,
                retry_delay_ms,
                retry_at,
                ..
            } => {
                let invocation = self.open_invocation(&record.event, activity_id)?;
                invocation.last_error = Some(error.clone());
                invocation.updated_at = at;

                if *will_retry {
                    let delay = Duration::from_millis(retry_delay_ms.unwrap_or(0));
                    invocation.status = InvocationStatus::FailedRetryable;
                    invocation.retry_delay = Some(delay);
                    // histories without a due time back off from the failure
                    invocation.retry_at = retry_at.or_else(|| {
                        TimeDelta::from_std(delay)
                            .ok()
                            .and_then(|delta| at.checked_add_signed(delta))
                    });
                } else {
                    invocation.status = InvocationStatus::Failed;
                    invocation.retry_delay = None;
                    invocation.retry_at = None;
                    let actions = self.workflow.on_activity_failed(activity_id, error);
                    self.pending_actions.extend(actions);
                }
            }

            WorkflowEvent::ActivityCancelled { activity_id, .. } => {
                self.pop_if(|action| {
                    matches!(action, WorkflowAction::CancelActivity { activity_id: a } if a == activity_id)
                });
                // Cancelling an invocation that already settled is a no-op
                if let Ok(invocation) = self.open_invocation(&record.event, activity_id) {
                    invocation.status = InvocationStatus::Cancelled;
                    invocation.updated_at = at;
                }
            }

            WorkflowEvent::TimerStarted {
                timer_id,
                duration_ms,
                fire_at,
            } => {
                self.expect_action(sequence, &record.event, |action| {
                    matches!(action, WorkflowAction::StartTimer { timer_id: t, .. } if t == timer_id)
                })?;
                self.timers.insert(
                    timer_id.clone(),
                    PendingTimer {
                        timer_id: timer_id.clone(),
                        fire_at: *fire_at,
                        duration_ms: *duration_ms,
                    },
                );
            }

            WorkflowEvent::TimerFired { timer_id } => {
                if self.timers.remove(timer_id).is_none() {
                    return Err(self.unexpected(&record.event, format!("timer {timer_id} is not pending")));
                }
                let actions = self.workflow.on_timer_fired(timer_id);
                self.pending_actions.extend(actions);
            }

            WorkflowEvent::TimerCancelled { timer_id } => {
                self.pop_if(|action| {
                    matches!(action, WorkflowAction::CancelTimer { timer_id: t } if t == timer_id)
                });
                self.timers.remove(timer_id);
            }

            WorkflowEvent::SignalAwaited { signal_type } => {
                self.expect_action(sequence, &record.event, |action| {
                    matches!(action, WorkflowAction::AwaitSignal { signal_type: s } if s == signal_type)
                })?;
                if let Some(signal) = self.signals.await_signal(signal_type) {
                    let actions = self.workflow.on_signal(&signal);
                    self.pending_actions.extend(actions);
                }
            }

            WorkflowEvent::SignalWaitCancelled { signal_type } => {
                self.expect_action(sequence, &record.event, |action| {
                    matches!(action, WorkflowAction::CancelSignalWait { signal_type: s } if s == signal_type)
                })?;
                self.signals.cancel_wait(signal_type);
            }

            WorkflowEvent::SignalReceived { signal } => {
                if let Some(signal) = self.signals.receive(signal.clone()) {
                    let actions = self.workflow.on_signal(&signal);
                    self.pending_actions.extend(actions);
                }
            }

            WorkflowEvent::WorkflowCompleted { result } => {
                self.expect_action(sequence, &record.event, |action| {
                    matches!(action, WorkflowAction::CompleteWorkflow { .. })
                })?;
                self.result = Some(result.clone());
                self.finish(WorkflowStatus::Completed, at);
            }

            WorkflowEvent::WorkflowFailed { error } => {
                // Engine-side failures (event budget) arrive without a queued action
                self.pop_if(|action| matches!(action, WorkflowAction::FailWorkflow { .. }));
                self.error = Some(error.clone());
                self.finish(WorkflowStatus::Failed, at);
            }

            WorkflowEvent::WorkflowCancelled { reason } => {
                self.workflow.on_cancelled(reason);
                self.error = Some(WorkflowError::new("cancelled").with_code("cancelled"));
                for invocation in self.activities.iter_mut().filter(|i| i.status.is_open()) {
                    invocation.status = InvocationStatus::Cancelled;
                    invocation.updated_at = at;
                }
                self.timers.clear();
                self.finish(WorkflowStatus::Failed, at);
            }
        }

        self.next_sequence += 1;
        self.updated_at = at;
        Ok(())
    }

    fn finish(&mut self, status: WorkflowStatus, at: DateTime<Utc>) {
        self.status = status;
        self.completed_at = Some(at);
        self.pending_actions.clear();
    }

    fn expect_action(
        &mut self,
        sequence: i32,
        event: &WorkflowEvent,
        matches: impl FnOnce(&WorkflowAction) -> bool,
    ) -> Result<(), ReplayError> {
        match self.pending_actions.front() {
            Some(action) if matches(action) => {
                self.pending_actions.pop_front();
                Ok(())
            }
            other => Err(ReplayError::NonDeterminism {
                sequence,
                recorded: event.event_type(),
                produced: other
                    .map(|a| a.kind().to_string())
                    .unwrap_or_else(|| "no action".to_string()),
            }),
        }
    }

    fn pop_if(&mut self, matches: impl FnOnce(&WorkflowAction) -> bool) {
        if self.pending_actions.front().is_some_and(matches) {
            self.pending_actions.pop_front();
        }
    }

    fn open_invocation(
        &mut self,
        event: &WorkflowEvent,
        activity_id: &str,
    ) -> Result<&mut ActivityInvocation, ReplayError> {
        let sequence = self.next_sequence;
        let event_type = event.event_type();
        self.activities
            .iter_mut()
            .find(|i| i.activity_id == activity_id && i.status.is_open())
            .ok_or_else(|| ReplayError::UnexpectedEvent {
                sequence,
                event_type,
                detail: format!("activity {activity_id} has no open invocation"),
            })
    }

    fn unexpected(&self, event: &WorkflowEvent, detail: impl Into<String>) -> ReplayError {
        ReplayError::UnexpectedEvent {
            sequence: self.next_sequence,
            event_type: event.event_type(),
            detail: detail.into(),
        }
    }

    /// Execution id
    pub fn workflow_id(&self) -> Uuid {
        self.workflow_id
    }

    /// Registered workflow type
    pub fn workflow_type(&self) -> &str {
        &self.workflow_type
    }

    /// Current status
    pub fn status(&self) -> WorkflowStatus {
        self.status
    }

    /// Check if no further event may be recorded
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Sequence number the next event must carry
    pub fn next_sequence(&self) -> i32 {
        self.next_sequence
    }

    /// Oldest action produced by the workflow and not yet recorded
    pub fn next_action(&self) -> Option<&WorkflowAction> {
        self.pending_actions.front()
    }

    /// Number of actions waiting to be recorded
    pub fn pending_action_count(&self) -> usize {
        self.pending_actions.len()
    }

    /// Look up the latest invocation of an activity
    pub fn invocation(&self, activity_id: &str) -> Option<&ActivityInvocation> {
        self.activities.iter().find(|i| i.activity_id == activity_id)
    }

    /// All invocations in scheduling order
    pub fn invocations(&self) -> impl Iterator<Item = &ActivityInvocation> {
        self.activities.iter()
    }

    /// Look up a pending timer
    pub fn timer(&self, timer_id: &str) -> Option<&PendingTimer> {
        self.timers.get(timer_id)
    }

    /// All pending timers
    pub fn timers(&self) -> impl Iterator<Item = &PendingTimer> {
        self.timers.values()
    }

    /// Successful result, once completed
    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    /// Failure, once failed or cancelled
    pub fn error(&self) -> Option<&WorkflowError> {
        self.error.as_ref()
    }

    /// Build the query view
    pub fn snapshot(&self) -> ExecutionSnapshot {
        ExecutionSnapshot {
            execution_id: self.workflow_id,
            workflow_type: self.workflow_type.clone(),
            status: self.status,
            workflow_state: self.workflow.query(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
            event_count: self.next_sequence as usize,
            activities: self
                .activities
                .iter()
                .map(|i| ActivityView {
                    activity_id: i.activity_id.clone(),
                    activity_type: i.activity_type.clone(),
                    attempt: i.attempt,
                    status: i.status,
                    last_error: i.last_error.as_ref().map(|e| e.message.clone()),
                    scheduled_at: i.scheduled_at,
                    started_at: i.started_at,
                    retry_at: i.retry_at,
                    updated_at: i.updated_at,
                })
                .collect(),
            pending_timers: self.timers.values().cloned().collect(),
            awaiting_signals: self.signals.awaiting().map(str::to_string).collect(),
            buffered_signals: self.signals.buffered_len(),
            result: self.result.clone(),
            error: self.error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{Workflow, WorkflowSignal};
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct PaymentInput {
        amount: u64,
    }

    /// Charges a card, then waits for a settlement signal or a deadline
    struct PaymentWorkflow {
        amount: u64,
        charged: bool,
        outcome: Option<String>,
        started_at: Option<DateTime<Utc>>,
        now: Option<DateTime<Utc>>,
    }

    impl Workflow for PaymentWorkflow {
        const TYPE: &'static str = "payment";
        type Input = PaymentInput;
        type Output = Value;

        fn new(input: Self::Input) -> Self {
            Self {
                amount: input.amount,
                charged: false,
                outcome: None,
                started_at: None,
                now: None,
            }
        }

        fn on_clock(&mut self, now: DateTime<Utc>) {
            self.started_at.get_or_insert(now);
            self.now = Some(now);
        }

        fn on_start(&mut self) -> Vec<WorkflowAction> {
            vec![WorkflowAction::schedule_activity(
                "charge",
                "charge_card",
                json!({ "amount": self.amount }),
            )]
        }

        fn on_activity_completed(&mut self, _activity_id: &str, _result: Value) -> Vec<WorkflowAction> {
            self.charged = true;
            vec![
                WorkflowAction::timer("settle_deadline", Duration::from_secs(60)),
                WorkflowAction::await_signal("settled"),
            ]
        }

        fn on_activity_failed(&mut self, _activity_id: &str, error: &ActivityError) -> Vec<WorkflowAction> {
            self.outcome = Some("charge_failed".into());
            vec![WorkflowAction::fail(WorkflowError::new(&error.message))]
        }

        fn on_timer_fired(&mut self, _timer_id: &str) -> Vec<WorkflowAction> {
            self.outcome = Some("expired".into());
            vec![
                WorkflowAction::cancel_signal_wait("settled"),
                WorkflowAction::complete(json!("expired")),
            ]
        }

        fn on_signal(&mut self, _signal: &WorkflowSignal) -> Vec<WorkflowAction> {
            self.outcome = Some("settled".into());
            vec![
                WorkflowAction::cancel_timer("settle_deadline"),
                WorkflowAction::complete(json!("settled")),
            ]
        }

        fn is_completed(&self) -> bool {
            self.outcome.is_some()
        }

        fn result(&self) -> Option<Value> {
            self.outcome.clone().map(Value::String)
        }

        fn query(&self) -> Value {
            let elapsed_ms = match (self.started_at, self.now) {
                (Some(started), Some(now)) => (now - started).num_milliseconds(),
                _ => 0,
            };
            json!({ "charged": self.charged, "outcome": self.outcome, "elapsed_ms": elapsed_ms })
        }
    }

    fn registry() -> WorkflowRegistry {
        let mut registry = WorkflowRegistry::new();
        registry.register::<PaymentWorkflow>();
        registry
    }

    fn records(events: Vec<WorkflowEvent>) -> Vec<EventRecord> {
        let now = Utc::now();
        events
            .into_iter()
            .enumerate()
            .map(|(i, event)| EventRecord {
                sequence: i as i32,
                event,
                recorded_at: now,
            })
            .collect()
    }

    fn started() -> WorkflowEvent {
        WorkflowEvent::WorkflowStarted {
            input: json!({ "amount": 120 }),
        }
    }

    fn scheduled() -> WorkflowEvent {
        WorkflowEvent::ActivityScheduled {
            activity_id: "charge".into(),
            activity_type: "charge_card".into(),
            input: json!({ "amount": 120 }),
            options: ActivityOptions::default(),
        }
    }

    fn attempt_started(attempt: u32) -> WorkflowEvent {
        WorkflowEvent::ActivityStarted {
            activity_id: "charge".into(),
            attempt,
            worker_id: "test".into(),
        }
    }

    fn charged() -> Vec<WorkflowEvent> {
        vec![
            started(),
            scheduled(),
            attempt_started(1),
            WorkflowEvent::ActivityCompleted {
                activity_id: "charge".into(),
                attempt: 1,
                result: json!({ "charge_id": "ch_1" }),
            },
            WorkflowEvent::TimerStarted {
                timer_id: "settle_deadline".into(),
                duration_ms: 60_000,
                fire_at: Utc::now(),
            },
            WorkflowEvent::SignalAwaited {
                signal_type: "settled".into(),
            },
        ]
    }

    #[test]
    fn test_replay_leaves_unrecorded_actions_pending() {
        let state = ExecutionState::replay(&registry(), Uuid::now_v7(), "payment", &records(vec![started()]))
            .unwrap();

        assert_eq!(state.status(), WorkflowStatus::Running);
        assert_eq!(state.pending_action_count(), 1);
        assert!(matches!(
            state.next_action(),
            Some(WorkflowAction::ScheduleActivity { activity_id, .. }) if activity_id == "charge"
        ));
    }

    #[test]
    fn test_replay_waiting_for_signal() {
        let state =
            ExecutionState::replay(&registry(), Uuid::now_v7(), "payment", &records(charged())).unwrap();

        assert!(state.next_action().is_none());
        assert!(state.timer("settle_deadline").is_some());
        let snapshot = state.snapshot();
        assert_eq!(snapshot.awaiting_signals, vec!["settled".to_string()]);
        assert_eq!(snapshot.workflow_state["charged"], true);
        assert_eq!(snapshot.event_count, 6);
        assert_eq!(snapshot.activities[0].status, InvocationStatus::Completed);
    }

    #[test]
    fn test_signal_before_wait_is_delivered_on_await() {
        let mut events = charged();
        // signal arrives while the charge is still running
        events.insert(
            3,
            WorkflowEvent::SignalReceived {
                signal: WorkflowSignal::new("settled", json!({})),
            },
        );

        let state =
            ExecutionState::replay(&registry(), Uuid::now_v7(), "payment", &records(events)).unwrap();

        // delivered as soon as the wait was recorded
        assert_eq!(state.snapshot().workflow_state["outcome"], "settled");
        assert_eq!(
            state.next_action(),
            Some(&WorkflowAction::cancel_timer("settle_deadline"))
        );
    }

    #[test]
    fn test_timer_fired_completes() {
        let mut events = charged();
        events.push(WorkflowEvent::TimerFired {
            timer_id: "settle_deadline".into(),
        });
        events.push(WorkflowEvent::SignalWaitCancelled {
            signal_type: "settled".into(),
        });
        events.push(WorkflowEvent::WorkflowCompleted {
            result: json!("expired"),
        });

        let state =
            ExecutionState::replay(&registry(), Uuid::now_v7(), "payment", &records(events)).unwrap();

        assert_eq!(state.status(), WorkflowStatus::Completed);
        assert_eq!(state.result(), Some(&json!("expired")));
        assert!(state.timers().next().is_none());
        assert!(state.snapshot().completed_at.is_some());
    }

    #[test]
    fn test_retryable_failure_then_next_attempt() {
        let events = vec![
            started(),
            scheduled(),
            attempt_started(1),
            WorkflowEvent::ActivityFailed {
                activity_id: "charge".into(),
                attempt: 1,
                error: ActivityError::retryable("gateway timeout"),
                will_retry: true,
                retry_delay_ms: Some(250),
                retry_at: None,
            },
        ];

        let records = records(events);
        let failed_at = records[3].recorded_at;
        let state = ExecutionState::replay(&registry(), Uuid::now_v7(), "payment", &records).unwrap();
        let invocation = state.invocation("charge").unwrap();
        assert_eq!(invocation.status, InvocationStatus::FailedRetryable);
        assert_eq!(invocation.retry_delay, Some(Duration::from_millis(250)));
        assert_eq!(invocation.retry_at, Some(failed_at + TimeDelta::milliseconds(250)));
        assert_eq!(state.status(), WorkflowStatus::Running);
    }

    #[test]
    fn test_terminal_failure_reaches_workflow() {
        let events = vec![
            started(),
            scheduled(),
            attempt_started(1),
            WorkflowEvent::ActivityFailed {
                activity_id: "charge".into(),
                attempt: 1,
                error: ActivityError::non_retryable("card declined"),
                will_retry: false,
                retry_delay_ms: None,
                retry_at: None,
            },
        ];

        let state =
            ExecutionState::replay(&registry(), Uuid::now_v7(), "payment", &records(events)).unwrap();

        assert!(matches!(state.next_action(), Some(WorkflowAction::FailWorkflow { .. })));
        assert_eq!(state.invocation("charge").unwrap().status, InvocationStatus::Failed);
    }

    #[test]
    fn test_mismatched_action_is_non_determinism() {
        let events = vec![
            started(),
            WorkflowEvent::TimerStarted {
                timer_id: "settle_deadline".into(),
                duration_ms: 1000,
                fire_at: Utc::now(),
            },
        ];

        let result = ExecutionState::replay(&registry(), Uuid::now_v7(), "payment", &records(events));

        assert!(matches!(
            result,
            Err(ReplayError::NonDeterminism { sequence: 1, recorded: "timer_started", .. })
        ));
    }

    #[test]
    fn test_history_must_start_with_workflow_started() {
        let result = ExecutionState::replay(&registry(), Uuid::now_v7(), "payment", &records(vec![scheduled()]));
        assert!(matches!(result, Err(ReplayError::MissingStart(_))));
    }

    #[test]
    fn test_events_after_terminal_rejected() {
        let events = vec![
            started(),
            WorkflowEvent::WorkflowCancelled {
                reason: "operator".into(),
            },
            scheduled(),
        ];

        let result = ExecutionState::replay(&registry(), Uuid::now_v7(), "payment", &records(events));
        assert!(matches!(result, Err(ReplayError::AfterTerminal { sequence: 2 })));
    }

    #[test]
    fn test_cancellation_closes_open_work() {
        let mut events = charged();
        events.push(WorkflowEvent::WorkflowCancelled {
            reason: "operator".into(),
        });

        let state =
            ExecutionState::replay(&registry(), Uuid::now_v7(), "payment", &records(events)).unwrap();

        assert_eq!(state.status(), WorkflowStatus::Failed);
        assert!(state.timers().next().is_none());
        assert_eq!(state.error().unwrap().message, "cancelled");
        assert_eq!(state.snapshot().reason(), Some("cancelled"));
    }

    #[test]
    fn test_sequence_gap_detected() {
        let mut history = records(vec![started(), scheduled()]);
        history[1].sequence = 5;

        let result = ExecutionState::replay(&registry(), Uuid::now_v7(), "payment", &history);
        assert!(matches!(result, Err(ReplayError::SequenceGap { expected: 1, actual: 5 })));
    }

    #[test]
    fn test_workflow_time_follows_recorded_timestamps() {
        let mut events = charged();
        events.push(WorkflowEvent::TimerFired {
            timer_id: "settle_deadline".into(),
        });
        let start = Utc::now() - TimeDelta::hours(2);
        let history: Vec<EventRecord> = records(events)
            .into_iter()
            .map(|mut record| {
                record.recorded_at = start + TimeDelta::seconds(record.sequence as i64 * 10);
                record
            })
            .collect();

        let state = ExecutionState::replay(&registry(), Uuid::now_v7(), "payment", &history).unwrap();

        // six events after WorkflowStarted, ten seconds apart; the wall clock plays no part
        assert_eq!(state.snapshot().workflow_state["elapsed_ms"], json!(60_000));
        assert_eq!(state.snapshot().created_at, start);
    }
}
