//! Per-execution driver task
//!
//! Every live execution is owned by exactly one driver task. The driver is the
//! only writer of its execution's event log and state: attempt outcomes, timer
//! fires, signals and cancellation requests all arrive through one inbox and
//! are handled strictly one at a time.
//!
//! Each effect follows the same order: record the event, fold it into the
//! state, publish the snapshot, and only then act on it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::executor::{EngineError, EngineInner, SignalDelivery};
use super::state::{ExecutionSnapshot, ExecutionState, InvocationStatus};
use super::timer::remaining;
use crate::activity::{AttemptOutcome, AttemptRequest};
use crate::reliability::RetryDecision;
use crate::workflow::{WorkflowAction, WorkflowError, WorkflowEvent, WorkflowSignal};

/// Messages handled by a driver, in arrival order
pub(crate) enum ExecutionMessage {
    /// An activity attempt produced an outcome
    AttemptFinished {
        activity_id: String,
        attempt: u32,
        outcome: AttemptOutcome,
    },

    /// A timer sleep elapsed
    TimerFired { timer_id: String },

    /// The backoff before a retry elapsed
    RetryDue { activity_id: String, attempt: u32 },

    /// External signal
    Signal {
        signal: WorkflowSignal,
        ack: oneshot::Sender<SignalDelivery>,
    },

    /// External cancellation
    Cancel {
        reason: String,
        ack: oneshot::Sender<SignalDelivery>,
    },
}

pub(crate) struct ExecutionDriver {
    engine: Arc<EngineInner>,
    state: ExecutionState,
    inbox: mpsc::UnboundedReceiver<ExecutionMessage>,
    outbox: mpsc::UnboundedSender<ExecutionMessage>,
    snapshot: watch::Sender<ExecutionSnapshot>,
    attempts: HashMap<String, CancellationToken>,
    stop: CancellationToken,
}

impl ExecutionDriver {
    pub(crate) fn new(
        engine: Arc<EngineInner>,
        state: ExecutionState,
        inbox: mpsc::UnboundedReceiver<ExecutionMessage>,
        outbox: mpsc::UnboundedSender<ExecutionMessage>,
        snapshot: watch::Sender<ExecutionSnapshot>,
    ) -> Self {
        let stop = engine.shutdown.child_token();
        Self {
            engine,
            state,
            inbox,
            outbox,
            snapshot,
            attempts: HashMap::new(),
            stop,
        }
    }

    fn workflow_id(&self) -> Uuid {
        self.state.workflow_id()
    }

    /// Drive the execution until it is terminal, the engine shuts down, or
    /// the event log rejects a write
    pub(crate) async fn run(mut self) {
        let workflow_id = self.workflow_id();

        if let Err(err) = self.resume().await {
            self.abort(err);
            return;
        }

        while !self.state.is_terminal() {
            let message = tokio::select! {
                message = self.inbox.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
                _ = self.stop.cancelled() => {
                    info!(%workflow_id, "Engine shutting down, leaving execution for recovery");
                    self.release();
                    return;
                }
            };

            if let Err(err) = self.handle(message).await {
                self.abort(err);
                return;
            }
        }

        if self.state.is_terminal() {
            self.finalize().await;
        }
    }

    /// Re-establish in-flight work from the folded state, then perform any
    /// actions the workflow produced but the log does not contain yet
    async fn resume(&mut self) -> Result<(), EngineError> {
        let open: Vec<(String, InvocationStatus, u32, Option<DateTime<Utc>>)> = self
            .state
            .invocations()
            .filter(|i| i.status.is_open())
            .map(|i| (i.activity_id.clone(), i.status, i.attempt, i.retry_at))
            .collect();

        for (activity_id, status, attempt, retry_at) in open {
            match status {
                InvocationStatus::Running => {
                    debug!(workflow_id = %self.workflow_id(), %activity_id, attempt, "Re-dispatching attempt");
                    self.dispatch(&activity_id, attempt);
                }
                InvocationStatus::FailedRetryable => {
                    // whatever is left of the recorded backoff
                    let retry_at = retry_at.unwrap_or_else(Utc::now);
                    self.arm_retry(&activity_id, attempt + 1, retry_at);
                }
                InvocationStatus::Scheduled => {
                    self.start_attempt(&activity_id, 1).await?;
                }
                _ => {}
            }
        }

        let timers: Vec<(String, DateTime<Utc>)> = self
            .state
            .timers()
            .map(|t| (t.timer_id.clone(), t.fire_at))
            .collect();
        for (timer_id, fire_at) in timers {
            self.arm_timer(timer_id, fire_at);
        }

        self.drain().await
    }

    async fn handle(&mut self, message: ExecutionMessage) -> Result<(), EngineError> {
        match message {
            ExecutionMessage::AttemptFinished {
                activity_id,
                attempt,
                outcome,
            } => self.on_attempt_finished(activity_id, attempt, outcome).await,

            ExecutionMessage::TimerFired { timer_id } => self.on_timer_fired(timer_id).await,

            ExecutionMessage::RetryDue {
                activity_id,
                attempt,
            } => self.on_retry_due(activity_id, attempt).await,

            ExecutionMessage::Signal { signal, ack } => {
                debug!(workflow_id = %self.workflow_id(), signal_type = %signal.signal_type, "Recording signal");
                self.record(WorkflowEvent::SignalReceived { signal }).await?;
                self.drain().await?;
                let _ = ack.send(SignalDelivery::Recorded);
                Ok(())
            }

            ExecutionMessage::Cancel { reason, ack } => {
                self.on_cancel(reason).await?;
                let _ = ack.send(SignalDelivery::Recorded);
                Ok(())
            }
        }
    }

    async fn on_attempt_finished(
        &mut self,
        activity_id: String,
        attempt: u32,
        outcome: AttemptOutcome,
    ) -> Result<(), EngineError> {
        let current = self.state.invocation(&activity_id).map(|i| (i.status, i.attempt));
        if current != Some((InvocationStatus::Running, attempt)) {
            debug!(
                workflow_id = %self.workflow_id(),
                %activity_id,
                attempt,
                "Dropping outcome of stale attempt"
            );
            return Ok(());
        }
        self.attempts.remove(&activity_id);

        match outcome {
            AttemptOutcome::Completed(result) => {
                self.record(WorkflowEvent::ActivityCompleted {
                    activity_id,
                    attempt,
                    result,
                })
                .await?;
            }

            AttemptOutcome::Failed {
                error,
                decision: RetryDecision::Retry { next_attempt, delay },
            } => {
                let retry_at = due_at(delay);
                self.record(WorkflowEvent::ActivityFailed {
                    activity_id: activity_id.clone(),
                    attempt,
                    error,
                    will_retry: true,
                    retry_delay_ms: Some(delay.as_millis() as u64),
                    retry_at: Some(retry_at),
                })
                .await?;
                if !self.state.is_terminal() {
                    self.arm_retry(&activity_id, next_attempt, retry_at);
                }
                return Ok(());
            }

            AttemptOutcome::Failed { error, .. } => {
                warn!(
                    workflow_id = %self.workflow_id(),
                    %activity_id,
                    attempt,
                    error = %error,
                    "Activity failed terminally"
                );
                self.record(WorkflowEvent::ActivityFailed {
                    activity_id,
                    attempt,
                    error,
                    will_retry: false,
                    retry_delay_ms: None,
                    retry_at: None,
                })
                .await?;
            }
        }

        self.drain().await
    }

    async fn on_retry_due(&mut self, activity_id: String, attempt: u32) -> Result<(), EngineError> {
        let backing_off = self.state.invocation(&activity_id).is_some_and(|i| {
            i.status == InvocationStatus::FailedRetryable && i.attempt + 1 == attempt
        });
        if !backing_off {
            debug!(workflow_id = %self.workflow_id(), %activity_id, attempt, "Dropping stale retry");
            return Ok(());
        }
        self.start_attempt(&activity_id, attempt).await
    }

    async fn on_timer_fired(&mut self, timer_id: String) -> Result<(), EngineError> {
        // Cancelled or already fired: the first recorded outcome wins
        if self.state.timer(&timer_id).is_none() {
            debug!(workflow_id = %self.workflow_id(), %timer_id, "Ignoring fire of settled timer");
            return Ok(());
        }

        self.engine.timers.disarm(self.workflow_id(), &timer_id);
        info!(workflow_id = %self.workflow_id(), %timer_id, "Timer fired");
        self.record(WorkflowEvent::TimerFired { timer_id }).await?;
        self.drain().await
    }

    async fn on_cancel(&mut self, reason: String) -> Result<(), EngineError> {
        info!(workflow_id = %self.workflow_id(), %reason, "Cancelling execution");
        self.release();
        self.record(WorkflowEvent::WorkflowCancelled { reason }).await
    }

    /// Perform queued actions until the queue is empty or the execution ends
    async fn drain(&mut self) -> Result<(), EngineError> {
        while !self.state.is_terminal() {
            let Some(action) = self.state.next_action().cloned() else {
                break;
            };
            self.perform(action).await?;
        }
        Ok(())
    }

    async fn perform(&mut self, action: WorkflowAction) -> Result<(), EngineError> {
        let workflow_id = self.workflow_id();

        match action {
            WorkflowAction::ScheduleActivity {
                activity_id,
                activity_type,
                input,
                options,
            } => {
                if let Err(err) = options.retry_policy.validate() {
                    warn!(%workflow_id, %activity_id, error = %err, "Rejecting invalid retry policy");
                    return self
                        .record(WorkflowEvent::WorkflowFailed {
                            error: WorkflowError::new(format!(
                                "activity {activity_id} has an invalid retry policy: {err}"
                            ))
                            .with_code("invalid_retry_policy"),
                        })
                        .await;
                }

                debug!(%workflow_id, %activity_id, %activity_type, "Scheduling activity");
                self.record(WorkflowEvent::ActivityScheduled {
                    activity_id: activity_id.clone(),
                    activity_type,
                    input,
                    options,
                })
                .await?;
                self.start_attempt(&activity_id, 1).await?;
            }

            WorkflowAction::StartTimer { timer_id, duration } => {
                let fire_at = due_at(duration);
                debug!(%workflow_id, %timer_id, ?duration, %fire_at, "Starting timer");

                self.record(WorkflowEvent::TimerStarted {
                    timer_id: timer_id.clone(),
                    duration_ms: duration.as_millis() as u64,
                    fire_at,
                })
                .await?;
                if !self.state.is_terminal() {
                    self.arm_timer(timer_id, fire_at);
                }
            }

            WorkflowAction::CancelTimer { timer_id } => {
                self.record(WorkflowEvent::TimerCancelled {
                    timer_id: timer_id.clone(),
                })
                .await?;
                self.engine.timers.cancel(workflow_id, &timer_id);
            }

            WorkflowAction::AwaitSignal { signal_type } => {
                self.record(WorkflowEvent::SignalAwaited { signal_type }).await?;
            }

            WorkflowAction::CancelSignalWait { signal_type } => {
                self.record(WorkflowEvent::SignalWaitCancelled { signal_type })
                    .await?;
            }

            WorkflowAction::CancelActivity { activity_id } => {
                self.record(WorkflowEvent::ActivityCancelled {
                    activity_id: activity_id.clone(),
                    reason: "cancelled by workflow".to_string(),
                })
                .await?;
                if let Some(token) = self.attempts.remove(&activity_id) {
                    token.cancel();
                }
            }

            WorkflowAction::CompleteWorkflow { result } => {
                self.record(WorkflowEvent::WorkflowCompleted { result }).await?;
            }

            WorkflowAction::FailWorkflow { error } => {
                self.record(WorkflowEvent::WorkflowFailed { error }).await?;
            }
        }

        Ok(())
    }

    /// Record `activity_started` for an attempt and dispatch it
    ///
    /// Called only once any backoff has elapsed, so the recorded start is the
    /// real start of the attempt.
    async fn start_attempt(&mut self, activity_id: &str, attempt: u32) -> Result<(), EngineError> {
        self.record(WorkflowEvent::ActivityStarted {
            activity_id: activity_id.to_string(),
            attempt,
            worker_id: self.engine.config.worker_id.clone(),
        })
        .await?;

        if !self.state.is_terminal() {
            self.dispatch(activity_id, attempt);
        }
        Ok(())
    }

    /// Wait out a retry backoff, then ask the driver to start the attempt
    fn arm_retry(&mut self, activity_id: &str, attempt: u32, retry_at: DateTime<Utc>) {
        let delay = remaining(retry_at, Utc::now());
        debug!(workflow_id = %self.workflow_id(), %activity_id, attempt, ?delay, "Backing off");

        let token = self.stop.child_token();
        if let Some(previous) = self.attempts.insert(activity_id.to_string(), token.clone()) {
            previous.cancel();
        }

        let outbox = self.outbox.clone();
        let activity_id = activity_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let _ = outbox.send(ExecutionMessage::RetryDue { activity_id, attempt });
                }
                _ = token.cancelled() => {}
            }
        });
    }

    fn dispatch(&mut self, activity_id: &str, attempt: u32) {
        let Some(invocation) = self.state.invocation(activity_id) else {
            return;
        };

        let request = AttemptRequest {
            workflow_id: self.workflow_id(),
            activity_id: activity_id.to_string(),
            activity_type: invocation.activity_type.clone(),
            input: invocation.input.clone(),
            options: invocation.options.clone(),
            attempt,
        };

        let token = self.stop.child_token();
        if let Some(previous) = self.attempts.insert(activity_id.to_string(), token.clone()) {
            previous.cancel();
        }

        let outbox = self.outbox.clone();
        let activity_id = activity_id.to_string();
        self.engine
            .activities
            .dispatch(request, token, move |outcome| {
                let _ = outbox.send(ExecutionMessage::AttemptFinished {
                    activity_id,
                    attempt,
                    outcome,
                });
            });
    }

    fn arm_timer(&self, timer_id: String, fire_at: DateTime<Utc>) {
        let outbox = self.outbox.clone();
        let id = timer_id.clone();
        self.engine
            .timers
            .arm(self.workflow_id(), &timer_id, fire_at, move || {
                let _ = outbox.send(ExecutionMessage::TimerFired { timer_id: id });
            });
    }

    /// Append one event, fold it, publish the new snapshot
    ///
    /// When the event budget is spent the execution is failed instead.
    async fn record(&mut self, event: WorkflowEvent) -> Result<(), EngineError> {
        let limit = self.engine.config.max_events_per_workflow;
        let sequence = self.state.next_sequence();

        let event = if !event.is_terminal() && sequence as usize + 1 >= limit {
            warn!(workflow_id = %self.workflow_id(), limit, "Event limit reached, failing execution");
            WorkflowEvent::WorkflowFailed {
                error: WorkflowError::new(format!("event limit of {limit} reached"))
                    .with_code("event_limit_exceeded"),
            }
        } else {
            event
        };

        let records = self
            .engine
            .store
            .append_events(self.workflow_id(), sequence, vec![event])
            .await?;

        for record in &records {
            self.state.apply(record)?;
        }
        self.snapshot.send_replace(self.state.snapshot());
        Ok(())
    }

    /// Cancel every attempt and timer this driver owns
    fn release(&mut self) {
        for (_, token) in self.attempts.drain() {
            token.cancel();
        }
        self.engine.timers.cancel_all(self.workflow_id());
    }

    async fn finalize(&mut self) {
        let workflow_id = self.workflow_id();
        self.release();

        let status = self.state.status();
        if let Err(err) = self
            .engine
            .store
            .update_workflow_status(
                workflow_id,
                status,
                self.state.result().cloned(),
                self.state.error().cloned(),
            )
            .await
        {
            error!(%workflow_id, error = %err, "Failed to persist terminal status");
        }

        match self.state.error() {
            Some(error) => info!(%workflow_id, %status, reason = %error.message, "Execution finished"),
            None => info!(%workflow_id, %status, "Execution finished"),
        }

        let engine = Arc::clone(&self.engine);
        let retention = engine.config.retention_window;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(retention) => {}
                _ = engine.shutdown.cancelled() => {}
            }
            engine.executions.remove(workflow_id);
            debug!(%workflow_id, "Evicted execution from registry");
        });
    }

    /// Stop driving after an error; the log stays as the source of truth
    fn abort(&mut self, err: EngineError) {
        let workflow_id = self.workflow_id();
        error!(%workflow_id, error = %err, "Execution driver stopped");
        self.release();
        self.engine.executions.remove(workflow_id);
    }
}

/// Absolute due time of a delay starting now
fn due_at(delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| Utc::now().checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
