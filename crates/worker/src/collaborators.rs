// External collaborator interfaces
//
// Each pipeline step delegates its side effect to one of these traits. The
// activities own retry classification; collaborators only report what went
// wrong through CollaboratorError.

use std::sync::Arc;

use async_trait::async_trait;
use txflow_durable::ActivityError;

use crate::types::{
    AnalysisRequest, Decision, DecisionReceipt, ReviewRequest, ReviewTicket, RiskAssessment,
    RuleEvaluation, SimilarTransaction, Transaction, TransactionStatus,
};

/// Error type codes reported by collaborators
pub mod error_types {
    pub const UNAVAILABLE: &str = "unavailable";
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const UPSTREAM_TIMEOUT: &str = "upstream_timeout";
    pub const INVALID_REQUEST: &str = "invalid_request";
    pub const COMPLIANCE_VIOLATION: &str = "compliance_violation";
}

/// Failure of an external collaborator
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CollaboratorError {
    /// Network error or service down
    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("upstream timeout: {0}")]
    Timeout(String),

    /// The request itself is wrong; retrying cannot help
    #[error("invalid request: {0}")]
    Invalid(String),
}

impl CollaboratorError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, CollaboratorError::Invalid(_))
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            CollaboratorError::Unavailable(_) => error_types::UNAVAILABLE,
            CollaboratorError::RateLimited(_) => error_types::RATE_LIMITED,
            CollaboratorError::Timeout(_) => error_types::UPSTREAM_TIMEOUT,
            CollaboratorError::Invalid(_) => error_types::INVALID_REQUEST,
        }
    }
}

impl From<CollaboratorError> for ActivityError {
    fn from(err: CollaboratorError) -> Self {
        let error = if err.is_retryable() {
            ActivityError::retryable(err.to_string())
        } else {
            ActivityError::non_retryable(err.to_string())
        };
        error.with_type(err.error_type())
    }
}

/// Turns transaction text into a fixed-length vector
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model(&self) -> &str;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, CollaboratorError>;
}

/// Vector index of prior transactions
#[async_trait]
pub trait SimilarityIndex: Send + Sync {
    /// Ranked matches at or above `min_similarity`, excluding `transaction_id`
    async fn search(
        &self,
        transaction_id: &str,
        vector: &[f32],
        limit: usize,
        min_similarity: f64,
    ) -> Result<Vec<SimilarTransaction>, CollaboratorError>;

    /// Insert or replace the vector of a transaction
    async fn upsert(&self, transaction_id: &str, vector: Vec<f32>) -> Result<(), CollaboratorError>;
}

/// Business rules and compliance screening
#[async_trait]
pub trait RuleEvaluator: Send + Sync {
    async fn evaluate(&self, transaction: &Transaction) -> Result<RuleEvaluation, CollaboratorError>;
}

/// AI risk analysis
#[async_trait]
pub trait RiskAnalyzer: Send + Sync {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<RiskAssessment, CollaboratorError>;
}

/// Human review queue
#[async_trait]
pub trait ReviewQueue: Send + Sync {
    /// Open a review; repeated calls for one transaction return the same ticket
    async fn create_review(&self, request: &ReviewRequest) -> Result<ReviewTicket, CollaboratorError>;
}

/// Decision system of record
#[async_trait]
pub trait DecisionStore: Send + Sync {
    /// Persist a decision; idempotent by `decision_id`
    async fn save(&self, decision: &Decision) -> Result<DecisionReceipt, CollaboratorError>;
}

/// Transaction status system of record
#[async_trait]
pub trait TransactionStatusStore: Send + Sync {
    async fn update_status(
        &self,
        transaction_id: &str,
        status: TransactionStatus,
    ) -> Result<(), CollaboratorError>;
}

/// The full set of collaborators the pipeline needs
#[derive(Clone)]
pub struct Collaborators {
    pub embeddings: Arc<dyn EmbeddingProvider>,
    pub similarity: Arc<dyn SimilarityIndex>,
    pub rules: Arc<dyn RuleEvaluator>,
    pub analyzer: Arc<dyn RiskAnalyzer>,
    pub reviews: Arc<dyn ReviewQueue>,
    pub decisions: Arc<dyn DecisionStore>,
    pub statuses: Arc<dyn TransactionStatusStore>,
}
