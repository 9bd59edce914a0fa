//! Workflow engine
//!
//! The `WorkflowEngine` is responsible for:
//! - Starting new executions
//! - Routing signals, cancellation and queries to live executions
//! - Answering queries for archived executions by replaying their log
//! - Recovering non-terminal executions after a restart

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::driver::{ExecutionDriver, ExecutionMessage};
use super::executions::{ExecutionHandle, ExecutionRegistry};
use super::registry::{RegistryError, WorkflowRegistry};
use super::state::{ExecutionSnapshot, ExecutionState, ReplayError};
use super::timer::TimerService;
use crate::activity::{Activity, ActivityExecutor};
use crate::persistence::{StoreError, WorkflowEventStore, WorkflowInfo, WorkflowStatus};
use crate::workflow::{Workflow, WorkflowEvent, WorkflowSignal};

/// Configuration for the workflow engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Identifier recorded on every dispatched attempt
    pub worker_id: String,

    /// Maximum events per execution; the execution fails when it is reached
    pub max_events_per_workflow: usize,

    /// How long a terminal execution stays in the live registry
    pub retention_window: Duration,

    /// Upper bound on concurrently running activity attempts
    pub max_concurrent_activities: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_id: "txflow-engine".to_string(),
            max_events_per_workflow: 10_000,
            retention_window: Duration::from_secs(3600),
            max_concurrent_activities: 64,
        }
    }
}

impl EngineConfig {
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_max_events(mut self, max_events: usize) -> Self {
        self.max_events_per_workflow = max_events;
        self
    }

    pub fn with_retention_window(mut self, retention: Duration) -> Self {
        self.retention_window = retention;
        self
    }

    pub fn with_max_concurrent_activities(mut self, max: usize) -> Self {
        self.max_concurrent_activities = max;
        self
    }
}

/// Errors from engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Registry error
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Replay error (non-determinism or corrupt history)
    #[error("replay error: {0}")]
    Replay(#[from] ReplayError),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Workflow not found
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    /// Workflow id already used
    #[error("workflow already exists: {0}")]
    AlreadyExists(Uuid),

    /// Execution is neither terminal nor driven by this engine
    #[error("execution {0} is not live on this engine (run recovery first)")]
    ExecutionNotLive(Uuid),

    /// Execution driver stopped before reaching a terminal state
    #[error("execution {0} stopped before finishing")]
    ExecutionAborted(Uuid),

    /// Engine was shut down
    #[error("engine is shut down")]
    ShutDown,
}

fn lookup_error(err: StoreError) -> EngineError {
    match err {
        StoreError::WorkflowNotFound(id) => EngineError::WorkflowNotFound(id),
        other => EngineError::Store(other),
    }
}

/// What happened to a signal or cancellation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "delivery", rename_all = "snake_case")]
pub enum SignalDelivery {
    /// Recorded in the execution's event log
    Recorded,

    /// Dropped without effect, e.g. the execution is already terminal
    Ignored { reason: String },
}

/// Outcome of a recovery pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    /// Executions now driven by this engine
    pub resumed: Vec<Uuid>,

    /// Executions whose terminal event was recorded but whose status was not
    pub finalized: Vec<Uuid>,

    /// Executions that could not be recovered, with the reason
    pub failed: Vec<(Uuid, String)>,

    /// Executions that were already live
    pub already_live: usize,
}

/// Shared engine internals
pub(crate) struct EngineInner {
    pub(crate) store: Arc<dyn WorkflowEventStore>,
    pub(crate) workflows: RwLock<WorkflowRegistry>,
    pub(crate) activities: Arc<ActivityExecutor>,
    pub(crate) timers: TimerService,
    pub(crate) executions: ExecutionRegistry,
    pub(crate) config: EngineConfig,
    pub(crate) shutdown: CancellationToken,
}

/// Durable workflow engine
///
/// Runs every execution on its own driver task. The event store is the source
/// of truth: live state is always the fold of the recorded events, and after a
/// restart [`recover`](Self::recover) rebuilds every non-terminal execution
/// from its log.
///
/// # Example
///
/// ```ignore
/// use txflow_durable::prelude::*;
///
/// let store = Arc::new(InMemoryWorkflowEventStore::new());
/// let engine = WorkflowEngine::new(store, EngineConfig::default());
/// engine.register_workflow::<OrderWorkflow>();
/// engine.register_activity(ChargeCardActivity::new(gateway));
///
/// let id = engine.start_workflow::<OrderWorkflow>(Uuid::now_v7(), input).await?;
/// let snapshot = engine.wait_for_terminal(id).await?;
/// ```
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    /// Create an engine over the given store
    pub fn new(store: Arc<dyn WorkflowEventStore>, config: EngineConfig) -> Self {
        let activities = Arc::new(ActivityExecutor::new(config.max_concurrent_activities));
        Self {
            inner: Arc::new(EngineInner {
                store,
                workflows: RwLock::new(WorkflowRegistry::new()),
                activities,
                timers: TimerService::new(),
                executions: ExecutionRegistry::new(),
                config,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Register a workflow type
    pub fn register_workflow<W: Workflow>(&self) {
        self.inner.workflows.write().register::<W>();
    }

    /// Register an activity handler
    pub fn register_activity<A: Activity>(&self, activity: A) {
        self.inner.activities.register(activity);
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Underlying event store
    pub fn store(&self) -> &Arc<dyn WorkflowEventStore> {
        &self.inner.store
    }

    /// Number of executions in the live registry
    pub fn live_executions(&self) -> usize {
        self.inner.executions.len()
    }

    /// Start a new execution
    ///
    /// `workflow_started` is recorded before this returns, so the execution
    /// is queryable immediately.
    pub async fn start_workflow<W: Workflow>(
        &self,
        workflow_id: Uuid,
        input: W::Input,
    ) -> Result<Uuid, EngineError> {
        let input = serde_json::to_value(input)?;
        self.start_workflow_json(W::TYPE, workflow_id, input).await
    }

    /// Start a new execution from a type name and JSON input
    #[instrument(skip(self, input))]
    pub async fn start_workflow_json(
        &self,
        workflow_type: &str,
        workflow_id: Uuid,
        input: serde_json::Value,
    ) -> Result<Uuid, EngineError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(EngineError::ShutDown);
        }

        // Reject unknown types and malformed input before anything is stored
        let workflow = self.inner.workflows.read().create(workflow_type, input.clone())?;

        self.inner
            .store
            .create_workflow(workflow_id, workflow_type, input.clone())
            .await
            .map_err(|e| match e {
                StoreError::AlreadyExists(id) => EngineError::AlreadyExists(id),
                other => EngineError::Store(other),
            })?;

        let mut state = ExecutionState::new(workflow_id, workflow);
        self.record_start(&mut state, input).await?;
        self.inner
            .store
            .update_workflow_status(workflow_id, WorkflowStatus::Running, None, None)
            .await?;

        info!(%workflow_id, %workflow_type, "Started execution");
        self.spawn_driver(state);
        Ok(workflow_id)
    }

    async fn record_start(
        &self,
        state: &mut ExecutionState,
        input: serde_json::Value,
    ) -> Result<(), EngineError> {
        let records = self
            .inner
            .store
            .append_events(state.workflow_id(), 0, vec![WorkflowEvent::WorkflowStarted { input }])
            .await?;
        for record in &records {
            state.apply(record)?;
        }
        Ok(())
    }

    fn spawn_driver(&self, state: ExecutionState) -> bool {
        let workflow_id = state.workflow_id();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(state.snapshot());

        let handle = ExecutionHandle {
            inbox: inbox_tx.clone(),
            snapshot: snapshot_rx,
        };
        if !self.inner.executions.insert(workflow_id, handle) {
            warn!(%workflow_id, "Execution already live, not spawning a second driver");
            return false;
        }

        let driver = ExecutionDriver::new(
            Arc::clone(&self.inner),
            state,
            inbox_rx,
            inbox_tx,
            snapshot_tx,
        );
        tokio::spawn(driver.run());
        true
    }

    /// Deliver a signal to an execution
    ///
    /// Signals to terminal executions are ignored and logged. A `cancel`
    /// signal is routed to [`cancel`](Self::cancel).
    #[instrument(skip(self, signal), fields(signal_type = %signal.signal_type))]
    pub async fn signal(
        &self,
        workflow_id: Uuid,
        signal: WorkflowSignal,
    ) -> Result<SignalDelivery, EngineError> {
        if signal.is_cancel() {
            let reason = signal.cancel_reason().unwrap_or("cancelled").to_string();
            return self.cancel(workflow_id, reason).await;
        }

        let signal_type = signal.signal_type.clone();
        self.route(workflow_id, &signal_type, |ack| ExecutionMessage::Signal {
            signal,
            ack,
        })
        .await
    }

    /// Cancel an execution at its current suspension point
    ///
    /// Outstanding attempts and pending timers are cancelled and
    /// `workflow_cancelled` is recorded.
    #[instrument(skip(self, reason))]
    pub async fn cancel(
        &self,
        workflow_id: Uuid,
        reason: impl Into<String>,
    ) -> Result<SignalDelivery, EngineError> {
        let reason = reason.into();
        self.route(workflow_id, "cancel", |ack| ExecutionMessage::Cancel { reason, ack })
            .await
    }

    async fn route(
        &self,
        workflow_id: Uuid,
        signal_type: &str,
        message: impl FnOnce(oneshot::Sender<SignalDelivery>) -> ExecutionMessage,
    ) -> Result<SignalDelivery, EngineError> {
        let Some(handle) = self.inner.executions.get(workflow_id) else {
            let info = self
                .inner
                .store
                .get_workflow_info(workflow_id)
                .await
                .map_err(lookup_error)?;
            if info.status.is_terminal() {
                return Ok(ignored(workflow_id, signal_type, info.status));
            }
            return Err(EngineError::ExecutionNotLive(workflow_id));
        };

        if handle.is_terminal() {
            let status = handle.snapshot.borrow().status;
            return Ok(ignored(workflow_id, signal_type, status));
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        if handle.inbox.send(message(ack_tx)).is_err() {
            return Err(EngineError::ExecutionAborted(workflow_id));
        }

        match ack_rx.await {
            Ok(delivery) => Ok(delivery),
            // Dropped unacknowledged: either finished first or the driver stopped
            Err(_) if handle.is_terminal() => {
                let status = handle.snapshot.borrow().status;
                Ok(ignored(workflow_id, signal_type, status))
            }
            Err(_) => Err(EngineError::ExecutionAborted(workflow_id)),
        }
    }

    /// Read an execution's current snapshot
    ///
    /// Live executions answer from their last published snapshot without
    /// involving the driver; evicted or foreign executions are rebuilt from the
    /// event log.
    pub async fn query(&self, workflow_id: Uuid) -> Result<ExecutionSnapshot, EngineError> {
        if let Some(handle) = self.inner.executions.get(workflow_id) {
            return Ok(handle.snapshot.borrow().clone());
        }

        let info = self
            .inner
            .store
            .get_workflow_info(workflow_id)
            .await
            .map_err(lookup_error)?;
        let records = self.inner.store.load_events(workflow_id).await?;
        if records.is_empty() {
            let workflow = self
                .inner
                .workflows
                .read()
                .create(&info.workflow_type, info.input.clone())?;
            return Ok(ExecutionState::new(workflow_id, workflow).snapshot());
        }

        let state = ExecutionState::replay(
            &self.inner.workflows.read(),
            workflow_id,
            &info.workflow_type,
            &records,
        )?;
        Ok(state.snapshot())
    }

    /// Wait until an execution reaches a terminal state
    pub async fn wait_for_terminal(
        &self,
        workflow_id: Uuid,
    ) -> Result<ExecutionSnapshot, EngineError> {
        let Some(handle) = self.inner.executions.get(workflow_id) else {
            let snapshot = self.query(workflow_id).await?;
            if snapshot.status.is_terminal() {
                return Ok(snapshot);
            }
            return Err(EngineError::ExecutionNotLive(workflow_id));
        };

        let mut snapshots = handle.snapshot;
        loop {
            {
                let snapshot = snapshots.borrow_and_update();
                if snapshot.status.is_terminal() {
                    return Ok(snapshot.clone());
                }
            }
            if snapshots.changed().await.is_err() {
                let snapshot = snapshots.borrow().clone();
                if snapshot.status.is_terminal() {
                    return Ok(snapshot);
                }
                return Err(EngineError::ExecutionAborted(workflow_id));
            }
        }
    }

    /// Resume every non-terminal execution found in the store
    ///
    /// Safe to call repeatedly: executions already live on this engine are
    /// skipped.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<RecoveryReport, EngineError> {
        let candidates = self
            .inner
            .store
            .list_workflows(&[WorkflowStatus::Pending, WorkflowStatus::Running])
            .await?;

        let mut report = RecoveryReport::default();
        for info in candidates {
            if self.inner.executions.contains(info.id) {
                report.already_live += 1;
                continue;
            }

            match self.resume_execution(&info).await {
                Ok(true) => report.resumed.push(info.id),
                Ok(false) => report.finalized.push(info.id),
                Err(err) => {
                    error!(workflow_id = %info.id, error = %err, "Failed to recover execution");
                    report.failed.push((info.id, err.to_string()));
                }
            }
        }

        info!(
            resumed = report.resumed.len(),
            finalized = report.finalized.len(),
            failed = report.failed.len(),
            "Recovery finished"
        );
        Ok(report)
    }

    /// Returns `true` when a driver was spawned
    async fn resume_execution(&self, info: &WorkflowInfo) -> Result<bool, EngineError> {
        let records = self.inner.store.load_events(info.id).await?;

        let state = if records.is_empty() {
            // Crashed between creating the instance and recording its start
            let workflow = self
                .inner
                .workflows
                .read()
                .create(&info.workflow_type, info.input.clone())?;
            let mut state = ExecutionState::new(info.id, workflow);
            self.record_start(&mut state, info.input.clone()).await?;
            state
        } else {
            ExecutionState::replay(
                &self.inner.workflows.read(),
                info.id,
                &info.workflow_type,
                &records,
            )?
        };

        if state.is_terminal() {
            self.inner
                .store
                .update_workflow_status(
                    info.id,
                    state.status(),
                    state.result().cloned(),
                    state.error().cloned(),
                )
                .await?;
            return Ok(false);
        }

        if info.status == WorkflowStatus::Pending {
            self.inner
                .store
                .update_workflow_status(info.id, WorkflowStatus::Running, None, None)
                .await?;
        }

        info!(
            workflow_id = %info.id,
            events = records.len(),
            pending_actions = state.pending_action_count(),
            "Resuming execution"
        );
        Ok(self.spawn_driver(state))
    }

    /// Stop all drivers, attempts and timers
    ///
    /// Executions stay non-terminal in the store and are picked up by the
    /// next [`recover`](Self::recover).
    pub fn shutdown(&self) {
        info!(live = self.inner.executions.len(), "Shutting down workflow engine");
        self.inner.shutdown.cancel();
    }

    /// Check if [`shutdown`](Self::shutdown) was called
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

fn ignored(workflow_id: Uuid, signal_type: &str, status: WorkflowStatus) -> SignalDelivery {
    warn!(%workflow_id, %signal_type, %status, "Ignoring signal for terminal execution");
    SignalDelivery::Ignored {
        reason: format!("execution is {status}"),
    }
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("config", &self.inner.config)
            .field("workflows", &*self.inner.workflows.read())
            .field("activities", &self.inner.activities)
            .field("live_executions", &self.inner.executions.len())
            .finish()
    }
}
