//! Activity execution context

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Payload sent with heartbeats
#[derive(Debug, Clone)]
pub struct HeartbeatPayload {
    /// Optional progress details
    pub details: Option<serde_json::Value>,
}

/// Error from heartbeat operations
#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    /// Heartbeat channel closed (attempt abandoned by the executor)
    #[error("heartbeat channel closed")]
    ChannelClosed,

    /// Activity was cancelled
    #[error("activity was cancelled")]
    Cancelled,
}

/// Context provided to activities during execution
///
/// The context provides:
/// - Information about the current attempt
/// - Heartbeats for long-running activities
/// - Cancellation detection
///
/// # Example
///
/// ```ignore
/// async fn execute(&self, ctx: &ActivityContext, input: Input) -> Result<Output, ActivityError> {
///     let mut ticker = tokio::time::interval(Duration::from_secs(5));
///     let call = client.analyze(&input);
///     tokio::pin!(call);
///     loop {
///         tokio::select! {
///             result = &mut call => return result.map_err(Into::into),
///             _ = ticker.tick() => ctx.heartbeat(None).await?,
///             _ = ctx.cancelled() => return Err(ActivityError::non_retryable("cancelled")),
///         }
///     }
/// }
/// ```
#[derive(Debug)]
pub struct ActivityContext {
    /// Unique execution attempt ID
    pub attempt_id: Uuid,

    /// Current attempt number (1-based)
    pub attempt: u32,

    /// Maximum attempts allowed
    pub max_attempts: u32,

    /// Execution that owns this activity
    pub workflow_id: Uuid,

    /// Activity ID within the workflow
    pub activity_id: String,

    heartbeat_tx: Option<mpsc::Sender<HeartbeatPayload>>,

    cancellation: CancellationToken,
}

impl ActivityContext {
    /// Create a new activity context
    pub fn new(workflow_id: Uuid, activity_id: String, attempt: u32, max_attempts: u32) -> Self {
        Self {
            attempt_id: Uuid::now_v7(),
            attempt,
            max_attempts,
            workflow_id,
            activity_id,
            heartbeat_tx: None,
            cancellation: CancellationToken::new(),
        }
    }

    /// Create a context with heartbeat support
    pub fn with_heartbeat(mut self, tx: mpsc::Sender<HeartbeatPayload>) -> Self {
        self.heartbeat_tx = Some(tx);
        self
    }

    /// Tie this context to an externally owned cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Get a token that cancels this attempt when triggered
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Record a heartbeat
    ///
    /// Heartbeats keep the attempt alive under a heartbeat window and carry
    /// optional progress details.
    ///
    /// # Errors
    ///
    /// Returns an error if the attempt has been cancelled or the executor has
    /// stopped listening.
    pub async fn heartbeat(
        &self,
        details: Option<serde_json::Value>,
    ) -> Result<(), HeartbeatError> {
        if self.is_cancelled() {
            return Err(HeartbeatError::Cancelled);
        }

        if let Some(tx) = &self.heartbeat_tx {
            tx.send(HeartbeatPayload { details })
                .await
                .map_err(|_| HeartbeatError::ChannelClosed)?;
        }

        Ok(())
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves when cancellation is requested
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    /// Check if this is the last attempt the policy allows
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

impl From<HeartbeatError> for super::ActivityError {
    fn from(err: HeartbeatError) -> Self {
        match err {
            HeartbeatError::Cancelled => super::ActivityError::non_retryable(err.to_string())
                .with_type(super::error_types::CANCELLED),
            HeartbeatError::ChannelClosed => super::ActivityError::retryable(err.to_string()),
        }
    }
}
