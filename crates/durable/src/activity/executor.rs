//! Activity executor
//!
//! Runs single activity attempts under their start-to-close timeout, heartbeat
//! window and cancellation token and classifies the outcome through the
//! attempt's retry policy. It never records anything itself, and it does not
//! wait out backoffs: the owning execution records each outcome and the due
//! time of any retry before acting on it.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::definition::{error_types, ActivityWrapper, AnyActivity};
use super::{Activity, ActivityContext, ActivityError};
use crate::reliability::RetryDecision;
use crate::workflow::{ActivityOptions, TimeoutType};

/// One attempt of a scheduled activity
#[derive(Debug, Clone)]
pub struct AttemptRequest {
    /// Owning execution
    pub workflow_id: Uuid,
    /// Activity identifier within the execution
    pub activity_id: String,
    /// Registered activity type
    pub activity_type: String,
    /// JSON input
    pub input: Value,
    /// Timeouts and retry policy
    pub options: ActivityOptions,
    /// Attempt number (1-based)
    pub attempt: u32,
}

/// Classified outcome of one attempt
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// The attempt produced a result
    Completed(Value),

    /// The attempt failed; `decision` says whether another attempt follows
    Failed {
        error: ActivityError,
        decision: RetryDecision,
    },
}

/// Executes activity attempts for all executions of an engine
pub struct ActivityExecutor {
    activities: DashMap<String, Arc<dyn AnyActivity>>,
    permits: Arc<Semaphore>,
}

impl ActivityExecutor {
    /// Create an executor allowing `max_concurrent` attempts at a time
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            activities: DashMap::new(),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Register an activity handler
    pub fn register<A: Activity>(&self, activity: A) {
        self.activities
            .insert(A::TYPE.to_string(), Arc::new(ActivityWrapper { inner: activity }));
    }

    /// Check if an activity type is registered
    pub fn contains(&self, activity_type: &str) -> bool {
        self.activities.contains_key(activity_type)
    }

    /// Registered activity type names
    pub fn activity_types(&self) -> Vec<String> {
        self.activities.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of attempts that may start right now
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run a single attempt to completion and classify its outcome
    pub async fn run_attempt(
        &self,
        request: &AttemptRequest,
        cancel: CancellationToken,
    ) -> AttemptOutcome {
        let policy = &request.options.retry_policy;

        let Some(activity) = self
            .activities
            .get(&request.activity_type)
            .map(|entry| Arc::clone(entry.value()))
        else {
            let error = ActivityError::non_retryable(format!(
                "no handler registered for activity type {}",
                request.activity_type
            ))
            .with_type(error_types::UNKNOWN_ACTIVITY);
            return AttemptOutcome::Failed {
                error,
                decision: RetryDecision::NonRetryable,
            };
        };

        let _permit = tokio::select! {
            permit = self.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return cancelled_outcome(),
            },
            _ = cancel.cancelled() => return cancelled_outcome(),
        };

        debug!(
            workflow_id = %request.workflow_id,
            activity_id = %request.activity_id,
            activity_type = %request.activity_type,
            attempt = request.attempt,
            "Running activity attempt"
        );

        let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel(16);
        let ctx = ActivityContext::new(
            request.workflow_id,
            request.activity_id.clone(),
            request.attempt,
            policy.max_attempts,
        )
        .with_heartbeat(heartbeat_tx)
        .with_cancellation(cancel.child_token());

        let heartbeat_window = request.options.heartbeat_timeout;
        let result = {
            let call = activity.execute_json(&ctx, request.input.clone());
            tokio::pin!(call);
            let deadline = tokio::time::sleep(request.options.start_to_close_timeout);
            tokio::pin!(deadline);
            let mut last_beat = Instant::now();

            loop {
                let heartbeat_deadline =
                    last_beat + heartbeat_window.unwrap_or(request.options.start_to_close_timeout);

                tokio::select! {
                    biased;
                    result = &mut call => break result,
                    _ = cancel.cancelled() => {
                        break Err(ActivityError::non_retryable("attempt cancelled")
                            .with_type(error_types::CANCELLED));
                    }
                    Some(_) = heartbeat_rx.recv() => {
                        last_beat = Instant::now();
                    }
                    _ = &mut deadline => break Err(timeout_error(TimeoutType::StartToClose, request)),
                    _ = tokio::time::sleep_until(heartbeat_deadline), if heartbeat_window.is_some() => {
                        break Err(timeout_error(TimeoutType::Heartbeat, request));
                    }
                }
            }
        };

        match result {
            Ok(value) => AttemptOutcome::Completed(value),
            Err(error) => {
                let decision = if error.is_type(error_types::CANCELLED) {
                    RetryDecision::NonRetryable
                } else {
                    policy.decide(&error, request.attempt)
                };

                warn!(
                    workflow_id = %request.workflow_id,
                    activity_id = %request.activity_id,
                    attempt = request.attempt,
                    max_attempts = policy.max_attempts,
                    error = %error,
                    error_type = ?error.error_type,
                    will_retry = decision.will_retry(),
                    "Activity attempt failed"
                );

                let error = match decision {
                    RetryDecision::Exhausted => error.exhausted(request.attempt),
                    _ => error,
                };
                AttemptOutcome::Failed { error, decision }
            }
        }
    }

    /// Spawn an attempt, reporting its outcome through `on_finished`
    pub fn dispatch<F>(
        self: &Arc<Self>,
        request: AttemptRequest,
        cancel: CancellationToken,
        on_finished: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce(AttemptOutcome) + Send + 'static,
    {
        let executor = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = executor.run_attempt(&request, cancel).await;
            on_finished(outcome);
        })
    }
}

impl fmt::Debug for ActivityExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityExecutor")
            .field("activity_types", &self.activity_types())
            .field("available_permits", &self.permits.available_permits())
            .finish()
    }
}

fn cancelled_outcome() -> AttemptOutcome {
    AttemptOutcome::Failed {
        error: ActivityError::non_retryable("attempt cancelled").with_type(error_types::CANCELLED),
        decision: RetryDecision::NonRetryable,
    }
}

fn timeout_error(timeout_type: TimeoutType, request: &AttemptRequest) -> ActivityError {
    let window = match timeout_type {
        TimeoutType::StartToClose => Some(request.options.start_to_close_timeout),
        TimeoutType::Heartbeat => request.options.heartbeat_timeout,
    };
    ActivityError::retryable(format!(
        "{} timed out ({}) after {:?}",
        request.activity_type,
        timeout_type.error_type(),
        window.unwrap_or_default()
    ))
    .with_type(timeout_type.error_type())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::reliability::RetryPolicy;

    struct Echo;

    #[async_trait]
    impl Activity for Echo {
        const TYPE: &'static str = "echo";
        type Input = Value;
        type Output = Value;

        async fn execute(&self, _ctx: &ActivityContext, input: Value) -> Result<Value, ActivityError> {
            Ok(input)
        }
    }

    struct Flaky {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Activity for Flaky {
        const TYPE: &'static str = "flaky";
        type Input = Value;
        type Output = Value;

        async fn execute(&self, _ctx: &ActivityContext, _input: Value) -> Result<Value, ActivityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ActivityError::retryable("connection reset").with_type("network_error"))
        }
    }

    /// Never finishes and never heartbeats
    struct Silent;

    #[async_trait]
    impl Activity for Silent {
        const TYPE: &'static str = "silent";
        type Input = Value;
        type Output = Value;

        async fn execute(&self, _ctx: &ActivityContext, _input: Value) -> Result<Value, ActivityError> {
            std::future::pending::<()>().await;
            Ok(Value::Null)
        }
    }

    /// Heartbeats every second and finishes after five seconds
    struct Chatty;

    #[async_trait]
    impl Activity for Chatty {
        const TYPE: &'static str = "chatty";
        type Input = Value;
        type Output = Value;

        async fn execute(&self, ctx: &ActivityContext, _input: Value) -> Result<Value, ActivityError> {
            for step in 0..5 {
                tokio::time::sleep(Duration::from_secs(1)).await;
                ctx.heartbeat(Some(json!({ "step": step }))).await?;
            }
            Ok(json!("done"))
        }
    }

    fn request(activity_type: &str, options: ActivityOptions, attempt: u32) -> AttemptRequest {
        AttemptRequest {
            workflow_id: Uuid::now_v7(),
            activity_id: activity_type.to_string(),
            activity_type: activity_type.to_string(),
            input: json!({ "value": 1 }),
            options,
            attempt,
        }
    }

    fn quick_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::fixed(Duration::from_millis(10), max_attempts)
    }

    #[tokio::test]
    async fn test_successful_attempt() {
        let executor = ActivityExecutor::new(4);
        executor.register(Echo);

        let outcome = executor
            .run_attempt(&request("echo", ActivityOptions::default(), 1), CancellationToken::new())
            .await;

        assert_eq!(outcome, AttemptOutcome::Completed(json!({ "value": 1 })));
    }

    #[tokio::test]
    async fn test_retryable_failure_then_exhaustion() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = ActivityExecutor::new(4);
        executor.register(Flaky {
            calls: calls.clone(),
        });
        let options = ActivityOptions::default().with_retry(quick_policy(2));

        let first = executor
            .run_attempt(&request("flaky", options.clone(), 1), CancellationToken::new())
            .await;
        assert!(matches!(
            first,
            AttemptOutcome::Failed {
                decision: RetryDecision::Retry { next_attempt: 2, .. },
                ..
            }
        ));

        let second = executor
            .run_attempt(&request("flaky", options, 2), CancellationToken::new())
            .await;
        match second {
            AttemptOutcome::Failed { error, decision } => {
                assert_eq!(decision, RetryDecision::Exhausted);
                assert!(!error.retryable);
                assert!(error.is_type("network_error"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_activity_is_terminal() {
        let executor = ActivityExecutor::new(1);

        let outcome = executor
            .run_attempt(&request("missing", ActivityOptions::default(), 1), CancellationToken::new())
            .await;

        match outcome {
            AttemptOutcome::Failed { error, decision } => {
                assert_eq!(decision, RetryDecision::NonRetryable);
                assert!(error.is_type(error_types::UNKNOWN_ACTIVITY));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_to_close_timeout_is_retryable() {
        let executor = ActivityExecutor::new(1);
        executor.register(Silent);
        let options = ActivityOptions::default()
            .with_retry(quick_policy(3))
            .with_start_to_close_timeout(Duration::from_secs(30));

        let outcome = executor
            .run_attempt(&request("silent", options, 1), CancellationToken::new())
            .await;

        match outcome {
            AttemptOutcome::Failed { error, decision } => {
                assert!(error.is_type("start_to_close_timeout"));
                assert!(decision.will_retry());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_heartbeat_is_retryable() {
        let executor = ActivityExecutor::new(1);
        executor.register(Silent);
        let options = ActivityOptions::default()
            .with_retry(quick_policy(3))
            .with_start_to_close_timeout(Duration::from_secs(90))
            .with_heartbeat(Duration::from_secs(10));

        let started = Instant::now();
        let outcome = executor
            .run_attempt(&request("silent", options, 1), CancellationToken::new())
            .await;

        match outcome {
            AttemptOutcome::Failed { error, decision } => {
                assert!(error.is_type("heartbeat_timeout"));
                assert!(decision.will_retry());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(90));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_keep_attempt_alive() {
        let executor = ActivityExecutor::new(1);
        executor.register(Chatty);
        let options = ActivityOptions::default()
            .with_start_to_close_timeout(Duration::from_secs(90))
            .with_heartbeat(Duration::from_secs(2));

        let outcome = executor
            .run_attempt(&request("chatty", options, 1), CancellationToken::new())
            .await;

        assert_eq!(outcome, AttemptOutcome::Completed(json!("done")));
    }

    #[tokio::test]
    async fn test_cancellation_aborts_attempt() {
        let executor = ActivityExecutor::new(1);
        executor.register(Silent);
        let executor = Arc::new(executor);
        let cancel = CancellationToken::new();
        let (tx, rx) = tokio::sync::oneshot::channel();

        let handle = executor.dispatch(
            request("silent", ActivityOptions::default(), 1),
            cancel.clone(),
            move |outcome| {
                let _ = tx.send(outcome);
            },
        );
        cancel.cancel();

        let outcome = rx.await.expect("should report outcome");
        handle.await.expect("task should finish");
        match outcome {
            AttemptOutcome::Failed { error, decision } => {
                assert!(error.is_type(error_types::CANCELLED));
                assert_eq!(decision, RetryDecision::NonRetryable);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
