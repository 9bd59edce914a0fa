//! # Transaction decision worker
//!
//! The transaction decision pipeline on top of the txflow durable engine:
//! the [`TransactionWorkflow`] state machine, its activities, the
//! collaborator interfaces they call and deterministic simulated
//! collaborators for local runs and tests.

pub mod activities;
pub mod collaborators;
pub mod commands;
pub mod config;
pub mod guards;
pub mod risk;
pub mod rules;
pub mod sim;
pub mod telemetry;
pub mod transaction_workflow;
pub mod types;

use txflow_durable::WorkflowEngine;

// Re-export main types
pub use activities::{activity_names, register_activities};
pub use collaborators::{CollaboratorError, Collaborators};
pub use commands::{Command, CommandError, CommandHandler};
pub use config::{ConfigError, PipelineConfig, WorkerConfig};
pub use guards::ReviewBranch;
pub use rules::{Rule, RuleEngine};
pub use sim::SimulatedBackends;
pub use transaction_workflow::{TransactionWorkflow, TransactionWorkflowInput};
pub use types::{
    signal_names, workflow_names, Decision, PipelineState, Transaction, TransactionOutcome,
    TransactionStatus, Verdict,
};

/// Register the transaction workflow and all of its activities
pub fn register_pipeline(engine: &WorkflowEngine, collaborators: &Collaborators) {
    engine.register_workflow::<TransactionWorkflow>();
    register_activities(engine, collaborators);
}
