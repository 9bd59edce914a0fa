//! Registry of live executions
//!
//! Maps execution ids to the handles used to reach their driver task. Each
//! entry lives in its own `DashMap` shard, so routing a signal to one
//! execution never contends with unrelated executions.

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::driver::ExecutionMessage;
use super::state::ExecutionSnapshot;

/// Handle to one live execution
#[derive(Clone)]
pub(crate) struct ExecutionHandle {
    /// Serialized inbox of the execution's driver
    pub(crate) inbox: mpsc::UnboundedSender<ExecutionMessage>,

    /// Latest published snapshot
    pub(crate) snapshot: watch::Receiver<ExecutionSnapshot>,
}

impl ExecutionHandle {
    /// Check if the latest snapshot is terminal
    pub(crate) fn is_terminal(&self) -> bool {
        self.snapshot.borrow().status.is_terminal()
    }
}

/// Process-wide map of execution id to execution handle
#[derive(Default)]
pub(crate) struct ExecutionRegistry {
    entries: DashMap<Uuid, ExecutionHandle>,
}

impl ExecutionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Insert a handle unless the id is already live
    pub(crate) fn insert(&self, workflow_id: Uuid, handle: ExecutionHandle) -> bool {
        match self.entries.entry(workflow_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(handle);
                true
            }
        }
    }

    /// Clone the handle of a live execution
    pub(crate) fn get(&self, workflow_id: Uuid) -> Option<ExecutionHandle> {
        self.entries.get(&workflow_id).map(|entry| entry.value().clone())
    }

    pub(crate) fn contains(&self, workflow_id: Uuid) -> bool {
        self.entries.contains_key(&workflow_id)
    }

    pub(crate) fn remove(&self, workflow_id: Uuid) {
        self.entries.remove(&workflow_id);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::registry::WorkflowRegistry;
    use crate::engine::state::ExecutionState;
    use crate::workflow::{Workflow, WorkflowAction};
    use serde_json::Value;

    struct Noop;

    impl Workflow for Noop {
        const TYPE: &'static str = "noop";
        type Input = Value;
        type Output = Value;

        fn new(_input: Value) -> Self {
            Noop
        }

        fn on_start(&mut self) -> Vec<WorkflowAction> {
            vec![]
        }

        fn on_activity_completed(&mut self, _id: &str, _result: Value) -> Vec<WorkflowAction> {
            vec![]
        }

        fn on_activity_failed(
            &mut self,
            _id: &str,
            _error: &crate::activity::ActivityError,
        ) -> Vec<WorkflowAction> {
            vec![]
        }

        fn is_completed(&self) -> bool {
            false
        }

        fn result(&self) -> Option<Value> {
            None
        }
    }

    fn handle(workflow_id: Uuid) -> ExecutionHandle {
        let mut registry = WorkflowRegistry::new();
        registry.register::<Noop>();
        let workflow = registry.create("noop", Value::Null).unwrap();
        let state = ExecutionState::new(workflow_id, workflow);

        let (inbox, _rx) = mpsc::unbounded_channel();
        let (_tx, snapshot) = watch::channel(state.snapshot());
        ExecutionHandle { inbox, snapshot }
    }

    #[test]
    fn test_insert_is_exclusive_per_id() {
        let registry = ExecutionRegistry::new();
        let id = Uuid::now_v7();

        assert!(registry.insert(id, handle(id)));
        assert!(!registry.insert(id, handle(id)));
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(id));

        let live = registry.get(id).expect("handle should be live");
        assert!(!live.is_terminal());

        registry.remove(id);
        assert!(registry.get(id).is_none());
    }
}
