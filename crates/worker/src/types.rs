// Transaction pipeline types
//
// Inputs and outputs of the transaction workflow and its activities.
// Everything here is recorded in the event log, so all types are serde
// round-trippable and carry no wall-clock values.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Constants for workflow names
pub mod workflow_names {
    pub const TRANSACTION_DECISION: &str = "transaction_decision";
}

/// Constants for signal names
pub mod signal_names {
    pub const HUMAN_REVIEW_COMPLETE: &str = "human_review_complete";
}

// =============================================================================
// Transaction
// =============================================================================

/// One side of a transaction
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Party {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kyc_status: Option<String>,
}

impl Party {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    pub fn with_account(mut self, account_number: impl Into<String>) -> Self {
        self.account_number = Some(account_number.into());
        self
    }
}

/// Submitted transaction record, immutable once accepted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_id: String,
    /// ach, wire_transfer, international, ...
    pub transaction_type: String,
    pub amount: f64,
    pub currency: String,
    pub sender: Party,
    pub recipient: Party,
    #[serde(default)]
    pub reference_number: String,
    #[serde(default)]
    pub risk_flags: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Transaction {
    pub fn new(
        transaction_id: impl Into<String>,
        transaction_type: impl Into<String>,
        amount: f64,
        sender: Party,
        recipient: Party,
    ) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            transaction_type: transaction_type.into(),
            amount,
            currency: "USD".to_string(),
            sender,
            recipient,
            reference_number: String::new(),
            risk_flags: Vec::new(),
            metadata: Map::new(),
        }
    }

    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.risk_flags.push(flag.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Check the record is well-formed enough to process
    pub fn validate(&self) -> Result<(), String> {
        if self.transaction_id.trim().is_empty() {
            return Err("transaction_id is empty".to_string());
        }
        if !self.amount.is_finite() || self.amount <= 0.0 {
            return Err(format!("amount must be positive, got {}", self.amount));
        }
        if self.currency.len() != 3 {
            return Err(format!("currency must be an ISO code, got {:?}", self.currency));
        }
        Ok(())
    }

    /// JSON document the rule engine evaluates field paths against
    pub fn document(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

// =============================================================================
// Verdicts and statuses
// =============================================================================

/// Decision verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approve,
    Reject,
    Escalate,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Approve => write!(f, "approve"),
            Verdict::Reject => write!(f, "reject"),
            Verdict::Escalate => write!(f, "escalate"),
        }
    }
}

/// Status written to the system of record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Approved,
    Rejected,
    PendingReview,
    /// Needs manual reconciliation after a critical write failed
    ProcessingError,
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionStatus::Approved => write!(f, "approved"),
            TransactionStatus::Rejected => write!(f, "rejected"),
            TransactionStatus::PendingReview => write!(f, "pending_review"),
            TransactionStatus::ProcessingError => write!(f, "processing_error"),
        }
    }
}

/// Risk level band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    VeryHigh,
}

/// Review queue priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewPriority {
    Low,
    Medium,
    High,
    Urgent,
}

/// Action a business rule recommends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Approve,
    Flag,
    Hold,
    Escalate,
    Reject,
    /// Hard compliance violation; the transaction must not proceed
    Block,
}

impl RuleAction {
    /// Verdict a rule recommendation maps onto
    pub fn verdict(self) -> Verdict {
        match self {
            RuleAction::Approve => Verdict::Approve,
            RuleAction::Flag | RuleAction::Hold | RuleAction::Escalate => Verdict::Escalate,
            RuleAction::Reject | RuleAction::Block => Verdict::Reject,
        }
    }
}

// =============================================================================
// Pipeline state
// =============================================================================

/// Logical state of a transaction execution
///
/// Variants are declared in visiting order; progression never goes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    Initialized,
    EmbeddingGenerated,
    SimilaritySearched,
    RulesApplied,
    AiAnalyzed,
    HumanReviewPending,
    HumanReviewResolved,
    DecisionSaved,
    StatusUpdated,
    Completed,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Completed | PipelineState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Initialized => "INITIALIZED",
            PipelineState::EmbeddingGenerated => "EMBEDDING_GENERATED",
            PipelineState::SimilaritySearched => "SIMILARITY_SEARCHED",
            PipelineState::RulesApplied => "RULES_APPLIED",
            PipelineState::AiAnalyzed => "AI_ANALYZED",
            PipelineState::HumanReviewPending => "HUMAN_REVIEW_PENDING",
            PipelineState::HumanReviewResolved => "HUMAN_REVIEW_RESOLVED",
            PipelineState::DecisionSaved => "DECISION_SAVED",
            PipelineState::StatusUpdated => "STATUS_UPDATED",
            PipelineState::Completed => "COMPLETED",
            PipelineState::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Activity payloads
// =============================================================================

/// Output of generate_embedding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub vector: Vec<f32>,
    pub model: String,
}

/// Input of search_similar_transactions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilaritySearchRequest {
    pub transaction_id: String,
    pub vector: Vec<f32>,
    pub limit: usize,
    pub min_similarity: f64,
}

/// A prior transaction close to the one being processed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarTransaction {
    pub transaction_id: String,
    pub similarity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
}

/// Output of apply_business_rules
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleEvaluation {
    pub triggered_rules: Vec<String>,
    pub risk_flags: Vec<String>,
    pub recommended_action: Option<RuleAction>,
    /// Reason of a hard compliance violation, if any rule blocked
    pub hard_violation: Option<String>,
}

impl RuleEvaluation {
    pub fn is_violation(&self) -> bool {
        self.hard_violation.is_some()
    }
}

/// Input of analyze_transaction_with_ai
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub transaction: Transaction,
    pub similar: Vec<SimilarTransaction>,
    pub rules: RuleEvaluation,
    /// Cadence of liveness heartbeats while the analysis runs
    pub heartbeat_interval_ms: u64,
}

/// Output of analyze_transaction_with_ai
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub verdict: Verdict,
    /// 0-100
    pub confidence: f64,
    /// 0-100
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub reasoning: String,
    #[serde(default)]
    pub risk_factors: Vec<String>,
}

/// Input of create_human_review
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub transaction_id: String,
    pub amount: f64,
    pub assessment: RiskAssessment,
}

/// Output of create_human_review
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewTicket {
    pub review_id: String,
    pub priority: ReviewPriority,
}

/// Payload of the human_review_complete signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanReviewSignal {
    pub review_id: String,
    pub verdict: Verdict,
    #[serde(default)]
    pub comments: Option<String>,
}

/// How the human review step ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewOutcome {
    pub review_id: String,
    pub verdict: Verdict,
    pub timed_out: bool,
    #[serde(default)]
    pub comments: Option<String>,
}

/// Terminal decision artifact, persisted through save_decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// Stable per transaction, the idempotency key of the decision store
    pub decision_id: String,
    pub transaction_id: String,
    pub verdict: Verdict,
    pub confidence: f64,
    pub risk_score: f64,
    pub reasoning: String,
    pub risk_factors: Vec<String>,
    pub rules_triggered: Vec<String>,
    pub similar_cases: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<ReviewOutcome>,
}

/// Output of save_decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionReceipt {
    pub decision_id: String,
    /// False when the decision was already stored
    pub created: bool,
}

/// Input and output of update_transaction_status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub transaction_id: String,
    pub status: TransactionStatus,
}

/// Result of a completed transaction execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionOutcome {
    pub transaction_id: String,
    pub decision_id: String,
    pub verdict: Verdict,
    pub confidence: f64,
    pub risk_score: f64,
    pub reasoning: String,
    pub status: TransactionStatus,
    pub reviewed: bool,
    /// Workflow time from start to completion
    #[serde(default)]
    pub processing_time_ms: u64,
}
