//! Workflow execution engine
//!
//! The engine module provides the `WorkflowEngine`, which runs one driver task
//! per execution, folds every recorded event into the execution's state, and
//! rebuilds that state from the event log after a restart.

mod driver;
mod executions;
mod executor;
mod registry;
mod state;
mod timer;

pub use executor::{EngineConfig, EngineError, RecoveryReport, SignalDelivery, WorkflowEngine};
pub use registry::{AnyWorkflow, RegistryError, WorkflowFactory, WorkflowRegistry};
pub use state::{
    ActivityInvocation, ActivityView, ExecutionSnapshot, ExecutionState, InvocationStatus,
    PendingTimer, ReplayError,
};
pub use timer::{remaining, TimerService};
