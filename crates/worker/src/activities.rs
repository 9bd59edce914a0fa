// Pipeline step implementations
//
// Activities are the units of side-effecting work scheduled by the
// transaction workflow. Each one wraps a single collaborator call and turns
// its failure into a classified ActivityError.
// Decision: activities hold trait objects, never concrete clients, so the
// same registration serves the simulated backends and real integrations.
//
// Every activity may run more than once; the collaborators they call are
// idempotent by transaction id or decision id.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, warn};
use txflow_durable::activity::error_types as engine_error_types;
use txflow_durable::{Activity, ActivityContext, ActivityError, WorkflowEngine};

use crate::collaborators::{
    error_types, Collaborators, DecisionStore, EmbeddingProvider, ReviewQueue, RiskAnalyzer,
    RuleEvaluator, SimilarityIndex, TransactionStatusStore,
};
use crate::types::{
    AnalysisRequest, Decision, DecisionReceipt, Embedding, ReviewRequest, ReviewTicket,
    RiskAssessment, RuleEvaluation, SimilarTransaction, SimilaritySearchRequest, StatusUpdate,
    Transaction,
};

/// Constants for activity type names
pub mod activity_names {
    pub const GENERATE_EMBEDDING: &str = "generate_embedding";
    pub const SEARCH_SIMILAR_TRANSACTIONS: &str = "search_similar_transactions";
    pub const APPLY_BUSINESS_RULES: &str = "apply_business_rules";
    pub const ANALYZE_TRANSACTION_WITH_AI: &str = "analyze_transaction_with_ai";
    pub const CREATE_HUMAN_REVIEW: &str = "create_human_review";
    pub const SAVE_DECISION: &str = "save_decision";
    pub const UPDATE_TRANSACTION_STATUS: &str = "update_transaction_status";
}

/// Text representation of a transaction fed to the embedding provider
pub fn embedding_text(transaction: &Transaction) -> String {
    let mut parts = vec![
        transaction.transaction_type.clone(),
        format!("{:.2}", transaction.amount),
        transaction.currency.clone(),
        transaction.sender.name.clone(),
        transaction.recipient.name.clone(),
    ];
    parts.extend(transaction.sender.country.iter().cloned());
    parts.extend(transaction.recipient.country.iter().cloned());
    if !transaction.reference_number.is_empty() {
        parts.push(transaction.reference_number.clone());
    }
    parts.extend(transaction.risk_flags.iter().cloned());
    parts.join(" ")
}

// ============================================================================
// Activity Implementations
// ============================================================================

/// Vectorize a transaction for the similarity search
pub struct GenerateEmbeddingActivity {
    embeddings: Arc<dyn EmbeddingProvider>,
}

impl GenerateEmbeddingActivity {
    pub fn new(embeddings: Arc<dyn EmbeddingProvider>) -> Self {
        Self { embeddings }
    }
}

#[async_trait]
impl Activity for GenerateEmbeddingActivity {
    const TYPE: &'static str = activity_names::GENERATE_EMBEDDING;
    type Input = Transaction;
    type Output = Embedding;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        transaction: Transaction,
    ) -> Result<Embedding, ActivityError> {
        transaction.validate().map_err(|reason| {
            ActivityError::non_retryable(format!("invalid transaction: {reason}"))
                .with_type(engine_error_types::MALFORMED_INPUT)
        })?;

        debug!(
            transaction_id = %transaction.transaction_id,
            attempt = ctx.attempt,
            "Generating embedding"
        );

        let vector = self.embeddings.embed(&embedding_text(&transaction)).await?;
        Ok(Embedding {
            vector,
            model: self.embeddings.model().to_string(),
        })
    }
}

/// Find prior transactions close to this one, then index this one
pub struct SearchSimilarTransactionsActivity {
    index: Arc<dyn SimilarityIndex>,
}

impl SearchSimilarTransactionsActivity {
    pub fn new(index: Arc<dyn SimilarityIndex>) -> Self {
        Self { index }
    }
}

#[async_trait]
impl Activity for SearchSimilarTransactionsActivity {
    const TYPE: &'static str = activity_names::SEARCH_SIMILAR_TRANSACTIONS;
    type Input = SimilaritySearchRequest;
    type Output = Vec<SimilarTransaction>;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        request: SimilaritySearchRequest,
    ) -> Result<Vec<SimilarTransaction>, ActivityError> {
        let similar = self
            .index
            .search(
                &request.transaction_id,
                &request.vector,
                request.limit,
                request.min_similarity,
            )
            .await?;

        self.index
            .upsert(&request.transaction_id, request.vector)
            .await?;

        debug!(
            transaction_id = %request.transaction_id,
            matches = similar.len(),
            "Similarity search complete"
        );
        Ok(similar)
    }
}

/// Evaluate business rules and compliance checks
pub struct ApplyBusinessRulesActivity {
    rules: Arc<dyn RuleEvaluator>,
}

impl ApplyBusinessRulesActivity {
    pub fn new(rules: Arc<dyn RuleEvaluator>) -> Self {
        Self { rules }
    }
}

#[async_trait]
impl Activity for ApplyBusinessRulesActivity {
    const TYPE: &'static str = activity_names::APPLY_BUSINESS_RULES;
    type Input = Transaction;
    type Output = RuleEvaluation;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        transaction: Transaction,
    ) -> Result<RuleEvaluation, ActivityError> {
        let evaluation = self.rules.evaluate(&transaction).await?;

        if let Some(violation) = &evaluation.hard_violation {
            warn!(
                transaction_id = %transaction.transaction_id,
                violation = %violation,
                "Compliance violation"
            );
            // Terminal: no retry can make a blocked transaction compliant
            return Err(
                ActivityError::non_retryable(format!("compliance violation: {violation}"))
                    .with_type(error_types::COMPLIANCE_VIOLATION)
                    .with_details(json!(evaluation)),
            );
        }

        debug!(
            transaction_id = %transaction.transaction_id,
            triggered = evaluation.triggered_rules.len(),
            "Business rules applied"
        );
        Ok(evaluation)
    }
}

/// Long-running AI risk analysis with liveness heartbeats
pub struct AnalyzeTransactionActivity {
    analyzer: Arc<dyn RiskAnalyzer>,
}

impl AnalyzeTransactionActivity {
    pub fn new(analyzer: Arc<dyn RiskAnalyzer>) -> Self {
        Self { analyzer }
    }
}

#[async_trait]
impl Activity for AnalyzeTransactionActivity {
    const TYPE: &'static str = activity_names::ANALYZE_TRANSACTION_WITH_AI;
    type Input = AnalysisRequest;
    type Output = RiskAssessment;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        request: AnalysisRequest,
    ) -> Result<RiskAssessment, ActivityError> {
        let interval = Duration::from_millis(request.heartbeat_interval_ms.max(1));
        let mut ticker = tokio::time::interval(interval);
        let analysis = self.analyzer.analyze(&request);
        tokio::pin!(analysis);

        let mut beats = 0u64;
        loop {
            tokio::select! {
                biased;
                _ = ctx.cancelled() => {
                    return Err(ActivityError::non_retryable("analysis cancelled")
                        .with_type(engine_error_types::CANCELLED));
                }
                result = &mut analysis => {
                    let assessment = result?;
                    info!(
                        transaction_id = %request.transaction.transaction_id,
                        verdict = %assessment.verdict,
                        confidence = assessment.confidence,
                        risk_score = assessment.risk_score,
                        heartbeats = beats,
                        "AI analysis complete"
                    );
                    return Ok(assessment);
                }
                _ = ticker.tick() => {
                    beats += 1;
                    ctx.heartbeat(Some(json!({ "beats": beats }))).await?;
                }
            }
        }
    }
}

/// Open a human review for the transaction
pub struct CreateHumanReviewActivity {
    reviews: Arc<dyn ReviewQueue>,
}

impl CreateHumanReviewActivity {
    pub fn new(reviews: Arc<dyn ReviewQueue>) -> Self {
        Self { reviews }
    }
}

#[async_trait]
impl Activity for CreateHumanReviewActivity {
    const TYPE: &'static str = activity_names::CREATE_HUMAN_REVIEW;
    type Input = ReviewRequest;
    type Output = ReviewTicket;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        request: ReviewRequest,
    ) -> Result<ReviewTicket, ActivityError> {
        let ticket = self.reviews.create_review(&request).await?;
        info!(
            transaction_id = %request.transaction_id,
            review_id = %ticket.review_id,
            priority = ?ticket.priority,
            "Human review created"
        );
        Ok(ticket)
    }
}

/// Persist the decision to the system of record
pub struct SaveDecisionActivity {
    decisions: Arc<dyn DecisionStore>,
}

impl SaveDecisionActivity {
    pub fn new(decisions: Arc<dyn DecisionStore>) -> Self {
        Self { decisions }
    }
}

#[async_trait]
impl Activity for SaveDecisionActivity {
    const TYPE: &'static str = activity_names::SAVE_DECISION;
    type Input = Decision;
    type Output = DecisionReceipt;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        decision: Decision,
    ) -> Result<DecisionReceipt, ActivityError> {
        let receipt = self.decisions.save(&decision).await.inspect_err(|e| {
            warn!(
                decision_id = %decision.decision_id,
                attempt = ctx.attempt,
                max_attempts = ctx.max_attempts,
                error = %e,
                "Failed to save decision"
            );
        })?;

        info!(
            decision_id = %receipt.decision_id,
            verdict = %decision.verdict,
            created = receipt.created,
            "Decision saved"
        );
        Ok(receipt)
    }
}

/// Write the transaction status to the system of record
pub struct UpdateTransactionStatusActivity {
    statuses: Arc<dyn TransactionStatusStore>,
}

impl UpdateTransactionStatusActivity {
    pub fn new(statuses: Arc<dyn TransactionStatusStore>) -> Self {
        Self { statuses }
    }
}

#[async_trait]
impl Activity for UpdateTransactionStatusActivity {
    const TYPE: &'static str = activity_names::UPDATE_TRANSACTION_STATUS;
    type Input = StatusUpdate;
    type Output = StatusUpdate;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        update: StatusUpdate,
    ) -> Result<StatusUpdate, ActivityError> {
        self.statuses
            .update_status(&update.transaction_id, update.status)
            .await?;

        info!(
            transaction_id = %update.transaction_id,
            status = %update.status,
            "Transaction status updated"
        );
        Ok(update)
    }
}

/// Register every pipeline activity on the engine
pub fn register_activities(engine: &WorkflowEngine, collaborators: &Collaborators) {
    engine.register_activity(GenerateEmbeddingActivity::new(
        collaborators.embeddings.clone(),
    ));
    engine.register_activity(SearchSimilarTransactionsActivity::new(
        collaborators.similarity.clone(),
    ));
    engine.register_activity(ApplyBusinessRulesActivity::new(collaborators.rules.clone()));
    engine.register_activity(AnalyzeTransactionActivity::new(
        collaborators.analyzer.clone(),
    ));
    engine.register_activity(CreateHumanReviewActivity::new(
        collaborators.reviews.clone(),
    ));
    engine.register_activity(SaveDecisionActivity::new(collaborators.decisions.clone()));
    engine.register_activity(UpdateTransactionStatusActivity::new(
        collaborators.statuses.clone(),
    ));
}
