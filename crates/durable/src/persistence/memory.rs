//! In-memory implementation of WorkflowEventStore for testing

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::workflow::{WorkflowError, WorkflowEvent};

/// Internal workflow state
struct WorkflowState {
    workflow_type: String,
    status: WorkflowStatus,
    input: serde_json::Value,
    result: Option<serde_json::Value>,
    error: Option<WorkflowError>,
    events: Vec<EventRecord>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl WorkflowState {
    fn info(&self, id: Uuid) -> WorkflowInfo {
        WorkflowInfo {
            id,
            workflow_type: self.workflow_type.clone(),
            status: self.status,
            input: self.input.clone(),
            result: self.result.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// In-memory implementation of WorkflowEventStore
///
/// Stores everything in process memory with the same semantics as the
/// PostgreSQL implementation. Used by tests and by the worker binary when no
/// database is configured.
///
/// # Example
///
/// ```
/// use txflow_durable::InMemoryWorkflowEventStore;
///
/// let store = InMemoryWorkflowEventStore::new();
/// assert_eq!(store.workflow_count(), 0);
/// ```
pub struct InMemoryWorkflowEventStore {
    workflows: RwLock<HashMap<Uuid, WorkflowState>>,
}

impl InMemoryWorkflowEventStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            workflows: RwLock::new(HashMap::new()),
        }
    }

    /// Get the number of workflows
    pub fn workflow_count(&self) -> usize {
        self.workflows.read().len()
    }

    /// Get the number of events recorded for a workflow
    pub fn event_count(&self, workflow_id: Uuid) -> usize {
        self.workflows
            .read()
            .get(&workflow_id)
            .map(|w| w.events.len())
            .unwrap_or(0)
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.workflows.write().clear();
    }
}

impl Default for InMemoryWorkflowEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowEventStore for InMemoryWorkflowEventStore {
    async fn create_workflow(
        &self,
        workflow_id: Uuid,
        workflow_type: &str,
        input: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write();
        if workflows.contains_key(&workflow_id) {
            return Err(StoreError::AlreadyExists(workflow_id));
        }

        let now = Utc::now();
        workflows.insert(
            workflow_id,
            WorkflowState {
                workflow_type: workflow_type.to_string(),
                status: WorkflowStatus::Pending,
                input,
                result: None,
                error: None,
                events: vec![],
                created_at: now,
                updated_at: now,
            },
        );
        Ok(())
    }

    async fn get_workflow_info(&self, workflow_id: Uuid) -> Result<WorkflowInfo, StoreError> {
        let workflows = self.workflows.read();
        workflows
            .get(&workflow_id)
            .map(|w| w.info(workflow_id))
            .ok_or(StoreError::WorkflowNotFound(workflow_id))
    }

    async fn append_events(
        &self,
        workflow_id: Uuid,
        expected_sequence: i32,
        events: Vec<WorkflowEvent>,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let mut workflows = self.workflows.write();
        let workflow = workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        let current_sequence = workflow.events.len() as i32;
        if current_sequence != expected_sequence {
            return Err(StoreError::ConcurrencyConflict {
                expected: expected_sequence,
                actual: current_sequence,
            });
        }

        let now = Utc::now();
        let records: Vec<EventRecord> = events
            .into_iter()
            .enumerate()
            .map(|(offset, event)| EventRecord {
                sequence: current_sequence + offset as i32,
                event,
                recorded_at: now,
            })
            .collect();
        workflow.events.extend(records.iter().cloned());
        workflow.updated_at = now;

        Ok(records)
    }

    async fn load_events(&self, workflow_id: Uuid) -> Result<Vec<EventRecord>, StoreError> {
        let workflows = self.workflows.read();
        workflows
            .get(&workflow_id)
            .map(|w| w.events.clone())
            .ok_or(StoreError::WorkflowNotFound(workflow_id))
    }

    async fn update_workflow_status(
        &self,
        workflow_id: Uuid,
        status: WorkflowStatus,
        result: Option<serde_json::Value>,
        error: Option<WorkflowError>,
    ) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write();
        let workflow = workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        workflow.status = status;
        if result.is_some() {
            workflow.result = result;
        }
        if error.is_some() {
            workflow.error = error;
        }
        workflow.updated_at = Utc::now();
        Ok(())
    }

    async fn list_workflows(
        &self,
        statuses: &[WorkflowStatus],
    ) -> Result<Vec<WorkflowInfo>, StoreError> {
        let workflows = self.workflows.read();
        let mut matching: Vec<WorkflowInfo> = workflows
            .iter()
            .filter(|(_, w)| statuses.contains(&w.status))
            .map(|(id, w)| w.info(*id))
            .collect();
        matching.sort_by_key(|w| (w.created_at, w.id));
        Ok(matching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::ActivityOptions;

    #[tokio::test]
    async fn test_create_and_get_workflow() {
        let store = InMemoryWorkflowEventStore::new();
        let workflow_id = Uuid::now_v7();

        store
            .create_workflow(
                workflow_id,
                "test_workflow",
                serde_json::json!({"key": "value"}),
            )
            .await
            .unwrap();

        let info = store.get_workflow_info(workflow_id).await.unwrap();
        assert_eq!(info.status, WorkflowStatus::Pending);
        assert_eq!(info.workflow_type, "test_workflow");
        assert_eq!(info.input, serde_json::json!({"key": "value"}));
    }

    #[tokio::test]
    async fn test_duplicate_workflow_id_rejected() {
        let store = InMemoryWorkflowEventStore::new();
        let workflow_id = Uuid::now_v7();

        store
            .create_workflow(workflow_id, "test", serde_json::json!({}))
            .await
            .unwrap();
        let result = store
            .create_workflow(workflow_id, "test", serde_json::json!({}))
            .await;

        assert!(matches!(result, Err(StoreError::AlreadyExists(id)) if id == workflow_id));
    }

    #[tokio::test]
    async fn test_append_and_load_events() {
        let store = InMemoryWorkflowEventStore::new();
        let workflow_id = Uuid::now_v7();

        store
            .create_workflow(workflow_id, "test", serde_json::json!({}))
            .await
            .unwrap();

        let appended = store
            .append_events(
                workflow_id,
                0,
                vec![WorkflowEvent::WorkflowStarted {
                    input: serde_json::json!({}),
                }],
            )
            .await
            .unwrap();
        assert_eq!(appended.len(), 1);
        assert_eq!(appended[0].sequence, 0);

        let appended = store
            .append_events(
                workflow_id,
                1,
                vec![WorkflowEvent::ActivityScheduled {
                    activity_id: "step-1".to_string(),
                    activity_type: "test_activity".to_string(),
                    input: serde_json::json!({}),
                    options: ActivityOptions::default(),
                }],
            )
            .await
            .unwrap();
        assert_eq!(appended[0].sequence, 1);

        let events = store.load_events(workflow_id).await.unwrap();
        assert_eq!(events[1].recorded_at, appended[0].recorded_at);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].sequence, 0);
        assert_eq!(events[1].sequence, 1);
        assert!(matches!(
            events[1].event,
            WorkflowEvent::ActivityScheduled { .. }
        ));
        assert_eq!(store.event_count(workflow_id), 2);
    }

    #[tokio::test]
    async fn test_optimistic_concurrency() {
        let store = InMemoryWorkflowEventStore::new();
        let workflow_id = Uuid::now_v7();

        store
            .create_workflow(workflow_id, "test", serde_json::json!({}))
            .await
            .unwrap();
        store
            .append_events(
                workflow_id,
                0,
                vec![WorkflowEvent::WorkflowStarted {
                    input: serde_json::json!({}),
                }],
            )
            .await
            .unwrap();

        // A second writer that thinks the log is still empty loses
        let result = store
            .append_events(
                workflow_id,
                0,
                vec![WorkflowEvent::WorkflowStarted {
                    input: serde_json::json!({}),
                }],
            )
            .await;

        assert!(matches!(
            result,
            Err(StoreError::ConcurrencyConflict {
                expected: 0,
                actual: 1
            })
        ));
        assert_eq!(store.event_count(workflow_id), 1);
    }

    #[tokio::test]
    async fn test_update_status_keeps_previous_result() {
        let store = InMemoryWorkflowEventStore::new();
        let workflow_id = Uuid::now_v7();

        store
            .create_workflow(workflow_id, "test", serde_json::json!({}))
            .await
            .unwrap();
        store
            .update_workflow_status(
                workflow_id,
                WorkflowStatus::Completed,
                Some(serde_json::json!({"ok": true})),
                None,
            )
            .await
            .unwrap();

        let info = store.get_workflow_info(workflow_id).await.unwrap();
        assert_eq!(info.status, WorkflowStatus::Completed);
        assert_eq!(info.result, Some(serde_json::json!({"ok": true})));
        assert!(info.error.is_none());
    }

    #[tokio::test]
    async fn test_list_workflows_by_status() {
        let store = InMemoryWorkflowEventStore::new();
        let running = Uuid::now_v7();
        let done = Uuid::now_v7();

        for id in [running, done] {
            store
                .create_workflow(id, "test", serde_json::json!({}))
                .await
                .unwrap();
        }
        store
            .update_workflow_status(running, WorkflowStatus::Running, None, None)
            .await
            .unwrap();
        store
            .update_workflow_status(done, WorkflowStatus::Completed, None, None)
            .await
            .unwrap();

        let active = store
            .list_workflows(&[WorkflowStatus::Pending, WorkflowStatus::Running])
            .await
            .unwrap();

        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, running);
    }

    #[tokio::test]
    async fn test_missing_workflow() {
        let store = InMemoryWorkflowEventStore::new();
        let missing = Uuid::now_v7();

        assert!(matches!(
            store.load_events(missing).await,
            Err(StoreError::WorkflowNotFound(_))
        ));
        assert!(matches!(
            store.append_events(missing, 0, vec![]).await,
            Err(StoreError::WorkflowNotFound(_))
        ));
    }
}
