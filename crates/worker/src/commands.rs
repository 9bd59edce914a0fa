// Worker command protocol
//
// The worker binary reads one JSON command per line and answers with one
// JSON response per line. Commands map directly onto engine operations:
// submit starts an execution, signal delivers a human review decision,
// query returns the execution snapshot, cancel aborts an execution.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};
use txflow_durable::{EngineError, WorkflowEngine, WorkflowSignal};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::transaction_workflow::{TransactionWorkflow, TransactionWorkflowInput};
use crate::types::{signal_names, HumanReviewSignal, Transaction, Verdict};

fn default_cancel_reason() -> String {
    "cancelled by operator".to_string()
}

/// One line of input
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Start a decision for a transaction
    Submit {
        transaction: Transaction,
        /// Caller-chosen id; a new one is generated when absent
        #[serde(default)]
        execution_id: Option<Uuid>,
    },

    /// Deliver a human review decision
    Signal {
        execution_id: Uuid,
        review_id: String,
        verdict: Verdict,
        #[serde(default)]
        comments: Option<String>,
    },

    Query {
        execution_id: Uuid,
    },

    Cancel {
        execution_id: Uuid,
        #[serde(default = "default_cancel_reason")]
        reason: String,
    },

    /// Resume executions found in the event store
    Recover,
}

/// Failure to carry out a command
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("malformed command: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Executes commands against an engine
#[derive(Clone)]
pub struct CommandHandler {
    engine: WorkflowEngine,
    pipeline: PipelineConfig,
}

impl CommandHandler {
    pub fn new(engine: WorkflowEngine, pipeline: PipelineConfig) -> Self {
        Self { engine, pipeline }
    }

    /// Parse and run one input line; errors become error responses
    pub async fn handle_line(&self, line: &str) -> Value {
        let result = match serde_json::from_str::<Command>(line) {
            Ok(command) => self.handle(command).await,
            Err(e) => Err(CommandError::from(e)),
        };

        match result {
            Ok(result) => json!({ "ok": true, "result": result }),
            Err(e) => {
                warn!(error = %e, "Command failed");
                json!({ "ok": false, "error": e.to_string() })
            }
        }
    }

    pub async fn handle(&self, command: Command) -> Result<Value, CommandError> {
        match command {
            Command::Submit {
                transaction,
                execution_id,
            } => {
                transaction
                    .validate()
                    .map_err(CommandError::InvalidTransaction)?;

                let transaction_id = transaction.transaction_id.clone();
                let input = TransactionWorkflowInput::new(transaction, self.pipeline.clone());
                let id = self
                    .engine
                    .start_workflow::<TransactionWorkflow>(
                        execution_id.unwrap_or_else(Uuid::now_v7),
                        input,
                    )
                    .await?;

                info!(execution_id = %id, transaction_id = %transaction_id, "Transaction submitted");
                Ok(json!({
                    "execution_id": id,
                    "transaction_id": transaction_id,
                    "submitted_at": Utc::now(),
                }))
            }

            Command::Signal {
                execution_id,
                review_id,
                verdict,
                comments,
            } => {
                let payload = HumanReviewSignal {
                    review_id,
                    verdict,
                    comments,
                };
                let delivery = self
                    .engine
                    .signal(
                        execution_id,
                        WorkflowSignal::new(signal_names::HUMAN_REVIEW_COMPLETE, json!(payload)),
                    )
                    .await?;
                Ok(serde_json::to_value(delivery)?)
            }

            Command::Query { execution_id } => {
                let snapshot = self.engine.query(execution_id).await?;
                Ok(serde_json::to_value(snapshot)?)
            }

            Command::Cancel {
                execution_id,
                reason,
            } => {
                let delivery = self.engine.cancel(execution_id, reason).await?;
                Ok(serde_json::to_value(delivery)?)
            }

            Command::Recover => {
                let report = self.engine.recover().await?;
                Ok(serde_json::to_value(report)?)
            }
        }
    }
}
