//! Workflow registry for type-erased workflow creation
//!
//! The registry maps workflow type names to factories that build workflow
//! instances from JSON input, so executions can be started and replayed from
//! the stored type name alone.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::activity::ActivityError;
use crate::workflow::{Workflow, WorkflowAction, WorkflowError, WorkflowSignal};

/// Type-erased workflow interface
///
/// Lets the engine drive workflows without knowing their concrete types.
/// Inputs, results and queries cross this boundary as JSON.
pub trait AnyWorkflow: Send + Sync {
    /// Get the workflow type identifier
    fn workflow_type(&self) -> &'static str;

    /// Called when the execution starts
    fn on_start(&mut self) -> Vec<WorkflowAction>;

    /// Called when an activity completes
    fn on_activity_completed(&mut self, activity_id: &str, result: Value) -> Vec<WorkflowAction>;

    /// Called when an activity fails terminally
    fn on_activity_failed(&mut self, activity_id: &str, error: &ActivityError)
        -> Vec<WorkflowAction>;

    /// Called when a timer fires
    fn on_timer_fired(&mut self, timer_id: &str) -> Vec<WorkflowAction>;

    /// Called when an awaited signal is delivered
    fn on_signal(&mut self, signal: &WorkflowSignal) -> Vec<WorkflowAction>;

    /// Advances workflow time to a recorded event timestamp
    fn on_clock(&mut self, now: DateTime<Utc>);

    /// Called after external cancellation
    fn on_cancelled(&mut self, reason: &str);

    /// Check if workflow has completed
    fn is_completed(&self) -> bool;

    /// Get the result as JSON (if completed successfully)
    fn result_json(&self) -> Option<Value>;

    /// Get the error (if failed)
    fn error(&self) -> Option<WorkflowError>;

    /// Side-effect-free JSON view of the workflow's state
    fn query(&self) -> Value;
}

/// Wrapper to implement AnyWorkflow for any Workflow
struct WorkflowWrapper<W: Workflow> {
    inner: W,
}

impl<W: Workflow> AnyWorkflow for WorkflowWrapper<W> {
    fn workflow_type(&self) -> &'static str {
        W::TYPE
    }

    fn on_start(&mut self) -> Vec<WorkflowAction> {
        self.inner.on_start()
    }

    fn on_activity_completed(&mut self, activity_id: &str, result: Value) -> Vec<WorkflowAction> {
        self.inner.on_activity_completed(activity_id, result)
    }

    fn on_activity_failed(
        &mut self,
        activity_id: &str,
        error: &ActivityError,
    ) -> Vec<WorkflowAction> {
        self.inner.on_activity_failed(activity_id, error)
    }

    fn on_timer_fired(&mut self, timer_id: &str) -> Vec<WorkflowAction> {
        self.inner.on_timer_fired(timer_id)
    }

    fn on_signal(&mut self, signal: &WorkflowSignal) -> Vec<WorkflowAction> {
        self.inner.on_signal(signal)
    }

    fn on_clock(&mut self, now: DateTime<Utc>) {
        self.inner.on_clock(now)
    }

    fn on_cancelled(&mut self, reason: &str) {
        self.inner.on_cancelled(reason)
    }

    fn is_completed(&self) -> bool {
        self.inner.is_completed()
    }

    fn result_json(&self) -> Option<Value> {
        self.inner
            .result()
            .and_then(|r| serde_json::to_value(r).ok())
    }

    fn error(&self) -> Option<WorkflowError> {
        self.inner.error()
    }

    fn query(&self) -> Value {
        self.inner.query()
    }
}

/// Factory function type for creating workflows from JSON input
pub type WorkflowFactory =
    Box<dyn Fn(Value) -> Result<Box<dyn AnyWorkflow>, serde_json::Error> + Send + Sync>;

/// Registry of workflow factories
pub struct WorkflowRegistry {
    factories: HashMap<String, WorkflowFactory>,
}

impl Default for WorkflowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a workflow type
    pub fn register<W: Workflow>(&mut self) {
        let factory: WorkflowFactory = Box::new(|input: Value| {
            let typed_input: W::Input = serde_json::from_value(input)?;
            Ok(Box::new(WorkflowWrapper {
                inner: W::new(typed_input),
            }) as Box<dyn AnyWorkflow>)
        });

        self.factories.insert(W::TYPE.to_string(), factory);
    }

    /// Check if a workflow type is registered
    pub fn contains(&self, workflow_type: &str) -> bool {
        self.factories.contains_key(workflow_type)
    }

    /// Create a workflow instance from type name and JSON input
    pub fn create(
        &self,
        workflow_type: &str,
        input: Value,
    ) -> Result<Box<dyn AnyWorkflow>, RegistryError> {
        let factory = self
            .factories
            .get(workflow_type)
            .ok_or_else(|| RegistryError::UnknownWorkflowType(workflow_type.to_string()))?;

        factory(input).map_err(RegistryError::Deserialization)
    }

    /// Get the number of registered workflow types
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Get all registered workflow type names
    pub fn workflow_types(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("workflow_types", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Errors from registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Workflow type not registered
    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    /// Failed to deserialize workflow input
    #[error("failed to deserialize workflow input: {0}")]
    Deserialization(#[source] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct ApprovalInput {
        request_id: String,
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct ApprovalOutput {
        approved: bool,
    }

    /// Waits for an approval signal, then completes
    struct ApprovalWorkflow {
        request_id: String,
        approved: Option<bool>,
        cancelled: Option<String>,
    }

    impl Workflow for ApprovalWorkflow {
        const TYPE: &'static str = "approval_workflow";
        type Input = ApprovalInput;
        type Output = ApprovalOutput;

        fn new(input: Self::Input) -> Self {
            Self {
                request_id: input.request_id,
                approved: None,
                cancelled: None,
            }
        }

        fn on_start(&mut self) -> Vec<WorkflowAction> {
            vec![WorkflowAction::await_signal("approval")]
        }

        fn on_activity_completed(&mut self, _activity_id: &str, _result: Value) -> Vec<WorkflowAction> {
            vec![]
        }

        fn on_activity_failed(
            &mut self,
            _activity_id: &str,
            error: &ActivityError,
        ) -> Vec<WorkflowAction> {
            vec![WorkflowAction::fail(WorkflowError::new(&error.message))]
        }

        fn on_signal(&mut self, signal: &WorkflowSignal) -> Vec<WorkflowAction> {
            let approved = signal.payload["approved"].as_bool().unwrap_or(false);
            self.approved = Some(approved);
            vec![WorkflowAction::complete(json!({ "approved": approved }))]
        }

        fn on_cancelled(&mut self, reason: &str) {
            self.cancelled = Some(reason.to_string());
        }

        fn is_completed(&self) -> bool {
            self.approved.is_some() || self.cancelled.is_some()
        }

        fn result(&self) -> Option<Self::Output> {
            self.approved.map(|approved| ApprovalOutput { approved })
        }

        fn query(&self) -> Value {
            json!({
                "request_id": self.request_id,
                "approved": self.approved,
                "cancelled": self.cancelled,
            })
        }
    }

    fn registry() -> WorkflowRegistry {
        let mut registry = WorkflowRegistry::new();
        registry.register::<ApprovalWorkflow>();
        registry
    }

    #[test]
    fn test_register_and_create() {
        let registry = registry();

        assert!(registry.contains("approval_workflow"));
        assert!(!registry.contains("unknown"));
        assert_eq!(registry.len(), 1);

        let workflow = registry
            .create("approval_workflow", json!({ "request_id": "req-1" }))
            .expect("should create workflow");

        assert_eq!(workflow.workflow_type(), "approval_workflow");
        assert!(!workflow.is_completed());
        assert_eq!(workflow.query()["request_id"], "req-1");
    }

    #[test]
    fn test_unknown_workflow_type() {
        let result = WorkflowRegistry::new().create("unknown", json!({}));
        assert!(matches!(result, Err(RegistryError::UnknownWorkflowType(_))));
    }

    #[test]
    fn test_invalid_input() {
        let result = registry().create("approval_workflow", json!({}));
        assert!(matches!(result, Err(RegistryError::Deserialization(_))));
    }

    #[test]
    fn test_signal_drives_type_erased_workflow() {
        let mut workflow = registry()
            .create("approval_workflow", json!({ "request_id": "req-2" }))
            .unwrap();

        let actions = workflow.on_start();
        assert_eq!(actions, vec![WorkflowAction::await_signal("approval")]);

        let actions = workflow.on_signal(&WorkflowSignal::new("approval", json!({ "approved": true })));
        assert!(matches!(actions[0], WorkflowAction::CompleteWorkflow { .. }));
        assert!(workflow.is_completed());
        assert_eq!(workflow.result_json(), Some(json!({ "approved": true })));
    }

    #[test]
    fn test_cancellation_reaches_workflow() {
        let mut workflow = registry()
            .create("approval_workflow", json!({ "request_id": "req-3" }))
            .unwrap();
        workflow.on_start();

        workflow.on_cancelled("operator request");

        assert!(workflow.is_completed());
        assert!(workflow.result_json().is_none());
        assert_eq!(workflow.query()["cancelled"], "operator request");
    }

    #[test]
    fn test_registry_debug() {
        let debug_str = format!("{:?}", registry());
        assert!(debug_str.contains("approval_workflow"));
    }
}
