//! # Durable Execution Engine
//!
//! An event-sourced workflow orchestration core for multi-step pipelines with
//! long waits, human input and unreliable collaborators.
//!
//! ## Features
//!
//! - **Event-sourced executions**: every transition is appended to the event log before it is acted on
//! - **Replay-based recovery**: state is a pure fold of the log, rebuilt on restart
//! - **Automatic retries**: per-activity retry policies with exponential backoff and jitter
//! - **Heartbeats and timeouts**: start-to-close and heartbeat windows per attempt
//! - **Durable timers and signals**: buffered signal inboxes, timers that survive restarts
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowEngine                          │
//! │  (execution registry, signal/query routing, recovery)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │  one driver task per execution
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │            ExecutionDriver  +  ExecutionState               │
//! │  (records events, folds them, performs queued actions)      │
//! └─────────────────────────────────────────────────────────────┘
//!          │                       │                      │
//!          ▼                       ▼                      ▼
//! ┌─────────────────┐   ┌─────────────────────┐   ┌──────────────┐
//! │ ActivityExecutor │   │ WorkflowEventStore  │   │ TimerService │
//! │ (retry, timeout) │   │ (memory / Postgres) │   │ (tokio sleep)│
//! └─────────────────┘   └─────────────────────┘   └──────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use txflow_durable::prelude::*;
//!
//! struct MyWorkflow {
//!     done: bool,
//! }
//!
//! impl Workflow for MyWorkflow {
//!     const TYPE: &'static str = "my_workflow";
//!     type Input = MyInput;
//!     type Output = MyOutput;
//!
//!     fn new(input: Self::Input) -> Self {
//!         Self { done: false }
//!     }
//!
//!     fn on_start(&mut self) -> Vec<WorkflowAction> {
//!         vec![WorkflowAction::schedule_activity("step-1", "my_activity", json!({}))]
//!     }
//!
//!     // ... implement other trait methods
//! }
//!
//! let engine = WorkflowEngine::new(Arc::new(InMemoryWorkflowEventStore::new()), EngineConfig::default());
//! engine.register_workflow::<MyWorkflow>();
//! engine.recover().await?;
//! ```

pub mod activity;
pub mod engine;
pub mod persistence;
pub mod reliability;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::activity::{Activity, ActivityContext, ActivityError};
    pub use crate::engine::{
        EngineConfig, EngineError, ExecutionSnapshot, SignalDelivery, WorkflowEngine,
        WorkflowRegistry,
    };
    pub use crate::persistence::{
        InMemoryWorkflowEventStore, PostgresWorkflowEventStore, StoreError, WorkflowEventStore,
        WorkflowStatus,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::workflow::{
        ActivityOptions, Workflow, WorkflowAction, WorkflowError, WorkflowEvent, WorkflowSignal,
    };
}

// Re-export key types at crate root
pub use activity::{Activity, ActivityContext, ActivityError};
pub use engine::{
    EngineConfig, EngineError, ExecutionSnapshot, RecoveryReport, SignalDelivery, WorkflowEngine,
    WorkflowRegistry,
};
pub use persistence::{
    EventRecord, InMemoryWorkflowEventStore, PostgresWorkflowEventStore, StoreError,
    WorkflowEventStore, WorkflowStatus,
};
pub use reliability::{RetryDecision, RetryPolicy};
pub use workflow::{
    ActivityOptions, Workflow, WorkflowAction, WorkflowError, WorkflowEvent, WorkflowSignal,
};
