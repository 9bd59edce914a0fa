//! WorkflowEventStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::{WorkflowError, WorkflowEvent};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Workflow not found
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    /// Workflow id already taken
    #[error("workflow already exists: {0}")]
    AlreadyExists(Uuid),

    /// Concurrency conflict (optimistic locking failed)
    #[error("concurrency conflict: expected sequence {expected}, got {actual}")]
    ConcurrencyConflict { expected: i32, actual: i32 },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Workflow status as tracked by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Workflow created, no driver has picked it up yet
    Pending,

    /// Workflow is running
    Running,

    /// Workflow completed successfully
    Completed,

    /// Workflow failed, including external cancellation
    Failed,
}

impl WorkflowStatus {
    /// Check if no further transition can happen
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Status name as stored
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::Database(format!(
                "unknown workflow status: {other}"
            ))),
        }
    }
}

/// Workflow information stored alongside the event log
#[derive(Debug, Clone)]
pub struct WorkflowInfo {
    pub id: Uuid,
    pub workflow_type: String,
    pub status: WorkflowStatus,
    pub input: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<WorkflowError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One persisted event with its position and store metadata
///
/// `recorded_at` feeds the query surface only; replay never reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Zero-based position in the execution's history
    pub sequence: i32,

    /// The event itself
    pub event: WorkflowEvent,

    /// When the store accepted the event
    pub recorded_at: DateTime<Utc>,
}

/// Store for workflow instances and their event logs
///
/// Implementations must be thread-safe. Appends are atomic per call and use
/// optimistic concurrency: `expected_sequence` must equal the number of events
/// already stored for the workflow.
#[async_trait]
pub trait WorkflowEventStore: Send + Sync + 'static {
    /// Create a new workflow instance
    ///
    /// Fails with [`StoreError::AlreadyExists`] when the id is taken.
    async fn create_workflow(
        &self,
        workflow_id: Uuid,
        workflow_type: &str,
        input: serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Get full workflow info
    async fn get_workflow_info(&self, workflow_id: Uuid) -> Result<WorkflowInfo, StoreError>;

    /// Append events to a workflow (with optimistic concurrency)
    ///
    /// Returns the stored records, stamped with the store's own clock. Callers
    /// fold these records rather than stamping events themselves.
    async fn append_events(
        &self,
        workflow_id: Uuid,
        expected_sequence: i32,
        events: Vec<WorkflowEvent>,
    ) -> Result<Vec<EventRecord>, StoreError>;

    /// Load all events for a workflow in sequence order (for replay)
    async fn load_events(&self, workflow_id: Uuid) -> Result<Vec<EventRecord>, StoreError>;

    /// Update workflow status
    async fn update_workflow_status(
        &self,
        workflow_id: Uuid,
        status: WorkflowStatus,
        result: Option<serde_json::Value>,
        error: Option<WorkflowError>,
    ) -> Result<(), StoreError>;

    /// List workflows in any of the given statuses, oldest first
    async fn list_workflows(
        &self,
        statuses: &[WorkflowStatus],
    ) -> Result<Vec<WorkflowInfo>, StoreError>;
}
