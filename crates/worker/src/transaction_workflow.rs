// Transaction decision workflow
//
// State machine that takes one submitted transaction through embedding,
// similarity search, business rules and AI analysis to a persisted decision,
// optionally pausing for a human reviewer.
//
// Decision: the workflow only reacts to recorded events and never performs
// I/O itself; all effects are activities, so a replay of the event log
// rebuilds exactly the same state.
// Decision: the review deadline is a durable timer raced against the
// human_review_complete signal. Whichever is recorded first wins and the
// other mechanism is cancelled.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use txflow_durable::{
    ActivityError, ActivityOptions, RetryPolicy, Workflow, WorkflowAction, WorkflowError,
    WorkflowSignal,
};

use crate::activities::activity_names;
use crate::collaborators::error_types;
use crate::config::PipelineConfig;
use crate::guards::{apply_rule_override, review_branch, status_for, ReviewBranch};
use crate::types::{
    signal_names, workflow_names, AnalysisRequest, Decision, DecisionReceipt, Embedding,
    HumanReviewSignal, PipelineState, ReviewOutcome, ReviewRequest, ReviewTicket,
    RiskAssessment, RuleEvaluation, SimilarTransaction, SimilaritySearchRequest, StatusUpdate,
    Transaction, TransactionOutcome, TransactionStatus, Verdict,
};

/// Activity id of the best-effort status write after a critical failure
pub const COMPENSATION_ACTIVITY_ID: &str = "compensate_status";

/// Timer id of the human review deadline
pub const REVIEW_DEADLINE_TIMER: &str = "human_review_deadline";

/// Reasoning recorded when the review deadline passes without a decision
pub const REVIEW_TIMEOUT_REASON: &str = "human_review_timeout";

/// Failure reason of a blocked transaction
pub const COMPLIANCE_VIOLATION_REASON: &str = "compliance_violation";

/// Input for starting a transaction decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionWorkflowInput {
    pub transaction: Transaction,
    /// Thresholds in effect for this execution
    #[serde(default)]
    pub config: PipelineConfig,
}

impl TransactionWorkflowInput {
    pub fn new(transaction: Transaction, config: PipelineConfig) -> Self {
        Self {
            transaction,
            config,
        }
    }
}

// =============================================================================
// Step options
// =============================================================================

/// Retry and timeout settings per pipeline step
///
/// The critical persistence steps get the most attempts; the compensating
/// write gets exactly one.
pub mod step_options {
    use super::*;

    fn retrying(config: &PipelineConfig, max_attempts: u32, timeout: Duration) -> ActivityOptions {
        ActivityOptions::default()
            .with_retry(
                RetryPolicy::exponential()
                    .with_max_attempts(max_attempts)
                    .with_initial_interval(config.retry_initial_interval)
                    .with_max_interval(config.retry_max_interval),
            )
            .with_start_to_close_timeout(timeout)
    }

    pub fn embedding(config: &PipelineConfig) -> ActivityOptions {
        retrying(config, 3, Duration::from_secs(30))
    }

    pub fn similarity_search(config: &PipelineConfig) -> ActivityOptions {
        retrying(config, 3, Duration::from_secs(30))
    }

    pub fn business_rules(config: &PipelineConfig) -> ActivityOptions {
        let max_interval = (config.retry_max_interval / 2).max(config.retry_initial_interval);
        ActivityOptions::default()
            .with_retry(
                RetryPolicy::exponential()
                    .with_max_attempts(2)
                    .with_initial_interval(config.retry_initial_interval)
                    .with_max_interval(max_interval)
                    .with_non_retryable_error(error_types::COMPLIANCE_VIOLATION),
            )
            .with_start_to_close_timeout(Duration::from_secs(20))
    }

    pub fn ai_analysis(config: &PipelineConfig) -> ActivityOptions {
        ActivityOptions::default()
            .with_retry(
                RetryPolicy::exponential()
                    .with_max_attempts(3)
                    .with_initial_interval(config.retry_initial_interval * 2)
                    .with_max_interval(config.retry_max_interval * 3),
            )
            .with_start_to_close_timeout(Duration::from_secs(90))
            .with_heartbeat(config.ai_heartbeat_timeout())
    }

    pub fn human_review(config: &PipelineConfig) -> ActivityOptions {
        retrying(config, 2, Duration::from_secs(30))
    }

    pub fn save_decision(config: &PipelineConfig) -> ActivityOptions {
        retrying(config, 5, Duration::from_secs(30))
    }

    pub fn status_update(config: &PipelineConfig) -> ActivityOptions {
        retrying(config, 5, Duration::from_secs(30))
    }

    pub fn compensation() -> ActivityOptions {
        ActivityOptions::default()
            .with_retry(RetryPolicy::no_retry())
            .with_start_to_close_timeout(Duration::from_secs(30))
    }
}

/// Result of the best-effort compensating write
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Compensation {
    Pending,
    Applied,
    Failed { error: String },
}

fn to_json<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn decode<T: DeserializeOwned>(activity_id: &str, value: Value) -> Result<T, WorkflowError> {
    serde_json::from_value(value).map_err(|e| {
        WorkflowError::new(format!("malformed result from {activity_id}: {e}"))
            .with_code("malformed_result")
    })
}

// =============================================================================
// Workflow
// =============================================================================

/// Transaction decision pipeline
///
/// Flow:
/// ```text
/// INITIALIZED -> EMBEDDING_GENERATED -> SIMILARITY_SEARCHED -> RULES_APPLIED
///   -> AI_ANALYZED -> [HUMAN_REVIEW_PENDING -> HUMAN_REVIEW_RESOLVED]
///   -> DECISION_SAVED -> STATUS_UPDATED -> COMPLETED
/// ```
/// Any state may end in FAILED.
pub struct TransactionWorkflow {
    transaction: Transaction,
    config: PipelineConfig,

    state: PipelineState,
    stages_completed: Vec<PipelineState>,

    embedding: Option<Embedding>,
    similar: Vec<SimilarTransaction>,
    rules: Option<RuleEvaluation>,
    assessment: Option<RiskAssessment>,
    rule_override: bool,
    branch: Option<ReviewBranch>,
    ticket: Option<ReviewTicket>,
    review: Option<ReviewOutcome>,
    decision: Option<Decision>,
    receipt: Option<DecisionReceipt>,
    status: Option<TransactionStatus>,

    violation: Option<String>,
    compensation: Option<Compensation>,
    /// Failure held back while the compensating write runs
    pending_failure: Option<WorkflowError>,
    failure: Option<WorkflowError>,
    outcome: Option<TransactionOutcome>,

    started_at: Option<DateTime<Utc>>,
    now: Option<DateTime<Utc>>,
}

impl TransactionWorkflow {
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Milliseconds of workflow time since the execution started
    fn processing_time_ms(&self) -> u64 {
        match (self.started_at, self.now) {
            (Some(started), Some(now)) => (now - started).num_milliseconds().max(0) as u64,
            _ => 0,
        }
    }

    fn advance(&mut self, state: PipelineState) {
        debug_assert!(state >= self.state, "{} -> {}", self.state, state);
        self.state = state;
        self.stages_completed.push(state);
    }

    fn fail(&mut self, error: WorkflowError) -> Vec<WorkflowAction> {
        if self.state != PipelineState::Failed {
            self.advance(PipelineState::Failed);
        }
        self.failure = Some(error.clone());
        vec![WorkflowAction::fail(error)]
    }

    /// Enter FAILED and attempt a single processing_error status write
    fn compensate(&mut self, error: WorkflowError) -> Vec<WorkflowAction> {
        self.advance(PipelineState::Failed);
        self.pending_failure = Some(error);
        self.compensation = Some(Compensation::Pending);

        let update = StatusUpdate {
            transaction_id: self.transaction.transaction_id.clone(),
            status: TransactionStatus::ProcessingError,
        };
        vec![WorkflowAction::schedule_activity_with(
            COMPENSATION_ACTIVITY_ID,
            activity_names::UPDATE_TRANSACTION_STATUS,
            to_json(&update),
            step_options::compensation(),
        )]
    }

    /// Surface the original critical failure once compensation settled
    fn finish_compensation(&mut self, compensation: Compensation) -> Vec<WorkflowAction> {
        self.compensation = Some(compensation);
        let error = self.pending_failure.take().unwrap_or_else(|| {
            WorkflowError::new("critical step failed").with_code("critical_failure")
        });
        self.fail(error)
    }

    fn schedule_search(&self, embedding: &Embedding) -> WorkflowAction {
        let request = SimilaritySearchRequest {
            transaction_id: self.transaction.transaction_id.clone(),
            vector: embedding.vector.clone(),
            limit: self.config.max_similar_cases,
            min_similarity: self.config.similarity_threshold,
        };
        WorkflowAction::schedule_activity_with(
            activity_names::SEARCH_SIMILAR_TRANSACTIONS,
            activity_names::SEARCH_SIMILAR_TRANSACTIONS,
            to_json(&request),
            step_options::similarity_search(&self.config),
        )
    }

    fn schedule_analysis(&self, rules: &RuleEvaluation) -> WorkflowAction {
        let request = AnalysisRequest {
            transaction: self.transaction.clone(),
            similar: self.similar.clone(),
            rules: rules.clone(),
            heartbeat_interval_ms: self.config.ai_heartbeat_interval.as_millis() as u64,
        };
        WorkflowAction::schedule_activity_with(
            activity_names::ANALYZE_TRANSACTION_WITH_AI,
            activity_names::ANALYZE_TRANSACTION_WITH_AI,
            to_json(&request),
            step_options::ai_analysis(&self.config),
        )
    }

    /// Apply rule override, then branch to review or straight to the decision
    fn on_assessment(&mut self, mut assessment: RiskAssessment) -> Vec<WorkflowAction> {
        if let Some(rules) = &self.rules {
            self.rule_override = apply_rule_override(&mut assessment, rules);
        }
        let branch = review_branch(&assessment, self.transaction.amount, &self.config);
        self.branch = Some(branch);
        self.assessment = Some(assessment.clone());
        self.advance(PipelineState::AiAnalyzed);

        match branch {
            ReviewBranch::AutoDecide => self.decide(),
            ReviewBranch::HumanReview { .. } => {
                self.advance(PipelineState::HumanReviewPending);
                let request = ReviewRequest {
                    transaction_id: self.transaction.transaction_id.clone(),
                    amount: self.transaction.amount,
                    assessment,
                };
                vec![WorkflowAction::schedule_activity_with(
                    activity_names::CREATE_HUMAN_REVIEW,
                    activity_names::CREATE_HUMAN_REVIEW,
                    to_json(&request),
                    step_options::human_review(&self.config),
                )]
            }
        }
    }

    /// Build the decision and schedule its persistence
    fn decide(&mut self) -> Vec<WorkflowAction> {
        let Some(assessment) = self.assessment.clone() else {
            return self.fail(
                WorkflowError::new("no assessment to decide on").with_code("missing_assessment"),
            );
        };

        let (verdict, reasoning) = match &self.review {
            Some(review) if review.timed_out => (Verdict::Reject, REVIEW_TIMEOUT_REASON.to_string()),
            Some(review) => {
                let mut reasoning = format!(
                    "{} | human review {}: {}",
                    assessment.reasoning, review.review_id, review.verdict
                );
                if let Some(comments) = &review.comments {
                    reasoning.push_str(&format!(" ({comments})"));
                }
                (review.verdict, reasoning)
            }
            None => (assessment.verdict, assessment.reasoning.clone()),
        };

        let decision = Decision {
            decision_id: format!("DEC-{}", self.transaction.transaction_id),
            transaction_id: self.transaction.transaction_id.clone(),
            verdict,
            confidence: assessment.confidence,
            risk_score: assessment.risk_score,
            reasoning,
            risk_factors: assessment.risk_factors.clone(),
            rules_triggered: self
                .rules
                .as_ref()
                .map(|r| r.triggered_rules.clone())
                .unwrap_or_default(),
            similar_cases: self.similar.iter().map(|s| s.transaction_id.clone()).collect(),
            review: self.review.clone(),
        };

        let input = to_json(&decision);
        self.decision = Some(decision);
        vec![WorkflowAction::schedule_activity_with(
            activity_names::SAVE_DECISION,
            activity_names::SAVE_DECISION,
            input,
            step_options::save_decision(&self.config),
        )]
    }

    fn resolve_review(&mut self, outcome: ReviewOutcome) -> Vec<WorkflowAction> {
        self.review = Some(outcome);
        self.advance(PipelineState::HumanReviewResolved);
        self.decide()
    }

    fn handle_completed(
        &mut self,
        activity_id: &str,
        result: Value,
    ) -> Result<Vec<WorkflowAction>, WorkflowError> {
        let actions = match activity_id {
            activity_names::GENERATE_EMBEDDING => {
                let embedding: Embedding = decode(activity_id, result)?;
                self.advance(PipelineState::EmbeddingGenerated);
                let action = self.schedule_search(&embedding);
                self.embedding = Some(embedding);
                vec![action]
            }

            activity_names::SEARCH_SIMILAR_TRANSACTIONS => {
                self.similar = decode(activity_id, result)?;
                self.advance(PipelineState::SimilaritySearched);
                vec![WorkflowAction::schedule_activity_with(
                    activity_names::APPLY_BUSINESS_RULES,
                    activity_names::APPLY_BUSINESS_RULES,
                    to_json(&self.transaction),
                    step_options::business_rules(&self.config),
                )]
            }

            activity_names::APPLY_BUSINESS_RULES => {
                let rules: RuleEvaluation = decode(activity_id, result)?;
                self.advance(PipelineState::RulesApplied);
                let action = self.schedule_analysis(&rules);
                self.rules = Some(rules);
                vec![action]
            }

            activity_names::ANALYZE_TRANSACTION_WITH_AI => {
                let assessment: RiskAssessment = decode(activity_id, result)?;
                self.on_assessment(assessment)
            }

            activity_names::CREATE_HUMAN_REVIEW => {
                self.ticket = Some(decode(activity_id, result)?);
                vec![
                    WorkflowAction::timer(REVIEW_DEADLINE_TIMER, self.config.human_review_timeout),
                    WorkflowAction::await_signal(signal_names::HUMAN_REVIEW_COMPLETE),
                ]
            }

            activity_names::SAVE_DECISION => {
                let receipt: DecisionReceipt = decode(activity_id, result)?;
                self.receipt = Some(receipt);
                self.advance(PipelineState::DecisionSaved);

                let verdict = self
                    .decision
                    .as_ref()
                    .map(|d| d.verdict)
                    .unwrap_or(Verdict::Escalate);
                let update = StatusUpdate {
                    transaction_id: self.transaction.transaction_id.clone(),
                    status: status_for(verdict),
                };
                vec![WorkflowAction::schedule_activity_with(
                    activity_names::UPDATE_TRANSACTION_STATUS,
                    activity_names::UPDATE_TRANSACTION_STATUS,
                    to_json(&update),
                    step_options::status_update(&self.config),
                )]
            }

            activity_names::UPDATE_TRANSACTION_STATUS => {
                let update: StatusUpdate = decode(activity_id, result)?;
                self.status = Some(update.status);
                self.advance(PipelineState::StatusUpdated);
                self.complete(update.status)
            }

            COMPENSATION_ACTIVITY_ID => self.finish_compensation(Compensation::Applied),

            _ => vec![],
        };
        Ok(actions)
    }

    fn complete(&mut self, status: TransactionStatus) -> Vec<WorkflowAction> {
        let Some(decision) = &self.decision else {
            return self.fail(WorkflowError::new("no decision to report").with_code("missing_decision"));
        };

        let outcome = TransactionOutcome {
            transaction_id: self.transaction.transaction_id.clone(),
            decision_id: decision.decision_id.clone(),
            verdict: decision.verdict,
            confidence: decision.confidence,
            risk_score: decision.risk_score,
            reasoning: decision.reasoning.clone(),
            status,
            reviewed: self.review.is_some(),
            processing_time_ms: self.processing_time_ms(),
        };
        self.advance(PipelineState::Completed);
        self.outcome = Some(outcome.clone());
        vec![WorkflowAction::complete(to_json(&outcome))]
    }
}

impl Workflow for TransactionWorkflow {
    const TYPE: &'static str = workflow_names::TRANSACTION_DECISION;
    type Input = TransactionWorkflowInput;
    type Output = TransactionOutcome;

    fn new(input: Self::Input) -> Self {
        Self {
            transaction: input.transaction,
            config: input.config,
            state: PipelineState::Initialized,
            stages_completed: vec![PipelineState::Initialized],
            embedding: None,
            similar: Vec::new(),
            rules: None,
            assessment: None,
            rule_override: false,
            branch: None,
            ticket: None,
            review: None,
            decision: None,
            receipt: None,
            status: None,
            violation: None,
            compensation: None,
            pending_failure: None,
            failure: None,
            outcome: None,
            started_at: None,
            now: None,
        }
    }

    fn on_clock(&mut self, now: DateTime<Utc>) {
        self.started_at.get_or_insert(now);
        self.now = Some(now);
    }

    fn on_start(&mut self) -> Vec<WorkflowAction> {
        vec![WorkflowAction::schedule_activity_with(
            activity_names::GENERATE_EMBEDDING,
            activity_names::GENERATE_EMBEDDING,
            to_json(&self.transaction),
            step_options::embedding(&self.config),
        )]
    }

    fn on_activity_completed(&mut self, activity_id: &str, result: Value) -> Vec<WorkflowAction> {
        if self.is_completed() {
            return vec![];
        }
        match self.handle_completed(activity_id, result) {
            Ok(actions) => actions,
            Err(error) => self.fail(error),
        }
    }

    fn on_activity_failed(&mut self, activity_id: &str, error: &ActivityError) -> Vec<WorkflowAction> {
        if self.is_completed() {
            return vec![];
        }

        match activity_id {
            activity_names::APPLY_BUSINESS_RULES
                if error.is_type(error_types::COMPLIANCE_VIOLATION) =>
            {
                let evaluation = error
                    .details
                    .clone()
                    .and_then(|d| serde_json::from_value::<RuleEvaluation>(d).ok());
                self.violation = evaluation
                    .as_ref()
                    .and_then(|e| e.hard_violation.clone())
                    .or_else(|| Some(error.message.clone()));
                self.rules = evaluation;
                self.fail(
                    WorkflowError::new(COMPLIANCE_VIOLATION_REASON)
                        .with_code(COMPLIANCE_VIOLATION_REASON),
                )
            }

            activity_names::SAVE_DECISION | activity_names::UPDATE_TRANSACTION_STATUS => self
                .compensate(
                    WorkflowError::new(&error.message).with_code(format!("{activity_id}_failed")),
                ),

            // best effort: the original failure is what the execution reports
            COMPENSATION_ACTIVITY_ID => self.finish_compensation(Compensation::Failed {
                error: error.message.clone(),
            }),

            _ => self.fail(WorkflowError::new(&error.message).with_code(format!("{activity_id}_failed"))),
        }
    }

    fn on_timer_fired(&mut self, timer_id: &str) -> Vec<WorkflowAction> {
        if timer_id != REVIEW_DEADLINE_TIMER || self.state != PipelineState::HumanReviewPending {
            return vec![];
        }

        let review_id = self
            .ticket
            .as_ref()
            .map(|t| t.review_id.clone())
            .unwrap_or_default();
        let mut actions = vec![WorkflowAction::cancel_signal_wait(
            signal_names::HUMAN_REVIEW_COMPLETE,
        )];
        actions.extend(self.resolve_review(ReviewOutcome {
            review_id,
            verdict: Verdict::Reject,
            timed_out: true,
            comments: None,
        }));
        actions
    }

    fn on_signal(&mut self, signal: &WorkflowSignal) -> Vec<WorkflowAction> {
        if signal.signal_type != signal_names::HUMAN_REVIEW_COMPLETE
            || self.state != PipelineState::HumanReviewPending
        {
            return vec![];
        }

        let expected = self.ticket.as_ref().map(|t| t.review_id.as_str());
        let payload = serde_json::from_value::<HumanReviewSignal>(signal.payload.clone()).ok();
        let Some(payload) = payload.filter(|p| Some(p.review_id.as_str()) == expected) else {
            // not for this review: keep waiting
            return vec![WorkflowAction::await_signal(signal_names::HUMAN_REVIEW_COMPLETE)];
        };

        let mut actions = vec![WorkflowAction::cancel_timer(REVIEW_DEADLINE_TIMER)];
        actions.extend(self.resolve_review(ReviewOutcome {
            review_id: payload.review_id,
            verdict: payload.verdict,
            timed_out: false,
            comments: payload.comments,
        }));
        actions
    }

    fn on_cancelled(&mut self, _reason: &str) {
        if self.state != PipelineState::Failed {
            self.advance(PipelineState::Failed);
        }
        self.failure = Some(WorkflowError::new("cancelled").with_code("cancelled"));
    }

    fn is_completed(&self) -> bool {
        self.outcome.is_some() || self.failure.is_some()
    }

    fn result(&self) -> Option<TransactionOutcome> {
        self.outcome.clone()
    }

    fn error(&self) -> Option<WorkflowError> {
        self.failure.clone()
    }

    fn query(&self) -> Value {
        let reason = self
            .failure
            .as_ref()
            .map(|f| f.message.clone())
            .or_else(|| self.outcome.as_ref().map(|o| o.reasoning.clone()));
        let verdict = self
            .decision
            .as_ref()
            .map(|d| d.verdict)
            .or_else(|| self.assessment.as_ref().map(|a| a.verdict));

        json!({
            "state": self.state,
            "stages_completed": self.stages_completed,
            "transaction_id": self.transaction.transaction_id,
            "verdict": verdict,
            "confidence": self.assessment.as_ref().map(|a| a.confidence),
            "risk_score": self.assessment.as_ref().map(|a| a.risk_score),
            "similar_cases": self.similar.len(),
            "rules_triggered": self.rules.as_ref().map(|r| r.triggered_rules.clone()).unwrap_or_default(),
            "rule_override": self.rule_override,
            "needs_review": self.branch.map(|b| b.needs_review()),
            "review_id": self.ticket.as_ref().map(|t| t.review_id.clone()),
            "review_priority": self.ticket.as_ref().map(|t| t.priority),
            "review": self.review,
            "decision_id": self.decision.as_ref().map(|d| d.decision_id.clone()),
            "decision_created": self.receipt.as_ref().map(|r| r.created),
            "status": self.status,
            "violation": self.violation,
            "compensation": self.compensation,
            "reason": reason,
            "processing_time_ms": self.processing_time_ms(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Party, ReviewPriority, RiskLevel, RuleAction};

    fn transaction(amount: f64) -> Transaction {
        Transaction::new(
            "tx-1",
            "ach",
            amount,
            Party::new("Alice").with_country("US"),
            Party::new("Bob").with_country("US"),
        )
    }

    fn workflow(amount: f64) -> TransactionWorkflow {
        TransactionWorkflow::new(TransactionWorkflowInput::new(
            transaction(amount),
            PipelineConfig::default(),
        ))
    }

    fn scheduled(actions: &[WorkflowAction]) -> Vec<(String, String)> {
        actions
            .iter()
            .filter_map(|a| match a {
                WorkflowAction::ScheduleActivity {
                    activity_id,
                    activity_type,
                    ..
                } => Some((activity_id.clone(), activity_type.clone())),
                _ => None,
            })
            .collect()
    }

    fn assessment(verdict: Verdict, confidence: f64) -> Value {
        to_json(&RiskAssessment {
            verdict,
            confidence,
            risk_score: 45.0,
            risk_level: RiskLevel::Medium,
            reasoning: "model says so".to_string(),
            risk_factors: vec!["new_recipient".to_string()],
        })
    }

    /// Drive the workflow through the first three steps
    fn through_rules(wf: &mut TransactionWorkflow, rules: RuleEvaluation) -> Vec<WorkflowAction> {
        wf.on_start();
        wf.on_activity_completed(
            activity_names::GENERATE_EMBEDDING,
            json!({ "vector": [0.6, 0.8], "model": "test" }),
        );
        wf.on_activity_completed(activity_names::SEARCH_SIMILAR_TRANSACTIONS, json!([]));
        wf.on_activity_completed(activity_names::APPLY_BUSINESS_RULES, to_json(&rules))
    }

    fn to_review(wf: &mut TransactionWorkflow) {
        through_rules(wf, RuleEvaluation::default());
        wf.on_activity_completed(
            activity_names::ANALYZE_TRANSACTION_WITH_AI,
            assessment(Verdict::Approve, 60.0),
        );
        let actions = wf.on_activity_completed(
            activity_names::CREATE_HUMAN_REVIEW,
            to_json(&ReviewTicket {
                review_id: "REV-tx-1".to_string(),
                priority: ReviewPriority::Medium,
            }),
        );
        assert_eq!(actions.len(), 2);
    }

    #[test]
    fn test_start_schedules_embedding() {
        let mut wf = workflow(2500.0);
        let actions = wf.on_start();
        assert_eq!(
            scheduled(&actions),
            vec![(
                "generate_embedding".to_string(),
                "generate_embedding".to_string()
            )]
        );
        assert_eq!(wf.state(), PipelineState::Initialized);
    }

    #[test]
    fn test_similarity_request_uses_config() {
        let mut wf = workflow(2500.0);
        wf.on_start();
        let actions = wf.on_activity_completed(
            activity_names::GENERATE_EMBEDDING,
            json!({ "vector": [0.6, 0.8], "model": "test" }),
        );

        match &actions[0] {
            WorkflowAction::ScheduleActivity { input, .. } => {
                assert_eq!(input["limit"], 10);
                assert_eq!(input["min_similarity"], 0.75);
                assert_eq!(input["transaction_id"], "tx-1");
            }
            other => panic!("unexpected action {other:?}"),
        }
        assert_eq!(wf.state(), PipelineState::EmbeddingGenerated);
    }

    #[test]
    fn test_analysis_gets_heartbeat_window() {
        let mut wf = workflow(2500.0);
        let actions = through_rules(&mut wf, RuleEvaluation::default());

        match &actions[0] {
            WorkflowAction::ScheduleActivity {
                activity_type,
                options,
                input,
                ..
            } => {
                assert_eq!(activity_type, "analyze_transaction_with_ai");
                assert_eq!(options.heartbeat_timeout, Some(Duration::from_secs(15)));
                assert_eq!(options.start_to_close_timeout, Duration::from_secs(90));
                assert_eq!(input["heartbeat_interval_ms"], 5000);
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn test_confident_assessment_is_saved_directly() {
        let mut wf = workflow(2500.0);
        through_rules(&mut wf, RuleEvaluation::default());
        let actions = wf.on_activity_completed(
            activity_names::ANALYZE_TRANSACTION_WITH_AI,
            assessment(Verdict::Approve, 95.0),
        );

        assert_eq!(
            scheduled(&actions),
            vec![("save_decision".to_string(), "save_decision".to_string())]
        );
        assert_eq!(wf.state(), PipelineState::AiAnalyzed);
        assert_eq!(wf.query()["needs_review"], false);
    }

    #[test]
    fn test_rule_override_replaces_unsure_verdict() {
        let mut wf = workflow(2500.0);
        let rules = RuleEvaluation {
            triggered_rules: vec!["suspicious_round_amount".to_string()],
            recommended_action: Some(RuleAction::Reject),
            ..Default::default()
        };
        through_rules(&mut wf, rules);
        wf.on_activity_completed(
            activity_names::ANALYZE_TRANSACTION_WITH_AI,
            assessment(Verdict::Approve, 60.0),
        );

        let state = wf.query();
        assert_eq!(state["rule_override"], true);
        assert_eq!(state["verdict"], "reject");
        assert_eq!(state["state"], "HUMAN_REVIEW_PENDING");
    }

    #[test]
    fn test_review_waits_on_timer_and_signal() {
        let mut wf = workflow(75_000.0);
        through_rules(&mut wf, RuleEvaluation::default());
        let actions = wf.on_activity_completed(
            activity_names::ANALYZE_TRANSACTION_WITH_AI,
            assessment(Verdict::Approve, 95.0),
        );
        assert_eq!(
            scheduled(&actions),
            vec![(
                "create_human_review".to_string(),
                "create_human_review".to_string()
            )]
        );

        let actions = wf.on_activity_completed(
            activity_names::CREATE_HUMAN_REVIEW,
            to_json(&ReviewTicket {
                review_id: "REV-tx-1".to_string(),
                priority: ReviewPriority::Medium,
            }),
        );
        assert_eq!(
            actions,
            vec![
                WorkflowAction::timer(REVIEW_DEADLINE_TIMER, Duration::from_secs(604_800)),
                WorkflowAction::await_signal("human_review_complete"),
            ]
        );
        assert_eq!(wf.query()["review_id"], "REV-tx-1");
    }

    #[test]
    fn test_review_signal_resolves_review() {
        let mut wf = workflow(75_000.0);
        to_review(&mut wf);

        let actions = wf.on_signal(&WorkflowSignal::new(
            "human_review_complete",
            json!({ "review_id": "REV-tx-1", "verdict": "approve", "comments": "known customer" }),
        ));
        assert_eq!(actions[0], WorkflowAction::cancel_timer(REVIEW_DEADLINE_TIMER));
        assert_eq!(
            scheduled(&actions),
            vec![("save_decision".to_string(), "save_decision".to_string())]
        );
        assert_eq!(wf.state(), PipelineState::HumanReviewResolved);

        match &actions[1] {
            WorkflowAction::ScheduleActivity { input, .. } => {
                let decision: Decision = serde_json::from_value(input.clone()).unwrap();
                assert_eq!(decision.verdict, Verdict::Approve);
                assert_eq!(decision.decision_id, "DEC-tx-1");
                assert!(decision.reasoning.contains("known customer"));
                assert!(!decision.review.unwrap().timed_out);
            }
            other => panic!("unexpected action {other:?}"),
        }

        // a late deadline has no effect
        assert!(wf.on_timer_fired(REVIEW_DEADLINE_TIMER).is_empty());
    }

    #[test]
    fn test_mismatched_or_malformed_signal_keeps_waiting() {
        let mut wf = workflow(75_000.0);
        to_review(&mut wf);

        for payload in [
            json!({ "review_id": "REV-other", "verdict": "approve" }),
            json!({ "verdict": "maybe" }),
        ] {
            let actions = wf.on_signal(&WorkflowSignal::new("human_review_complete", payload));
            assert_eq!(actions, vec![WorkflowAction::await_signal("human_review_complete")]);
            assert_eq!(wf.state(), PipelineState::HumanReviewPending);
        }
    }

    #[test]
    fn test_deadline_forces_reject() {
        let mut wf = workflow(75_000.0);
        to_review(&mut wf);

        let actions = wf.on_timer_fired(REVIEW_DEADLINE_TIMER);
        assert_eq!(
            actions[0],
            WorkflowAction::cancel_signal_wait("human_review_complete")
        );
        match &actions[1] {
            WorkflowAction::ScheduleActivity { input, .. } => {
                assert_eq!(input["verdict"], "reject");
                assert_eq!(input["reasoning"], REVIEW_TIMEOUT_REASON);
            }
            other => panic!("unexpected action {other:?}"),
        }

        // a signal arriving afterwards changes nothing
        let late = wf.on_signal(&WorkflowSignal::new(
            "human_review_complete",
            json!({ "review_id": "REV-tx-1", "verdict": "approve" }),
        ));
        assert!(late.is_empty());
    }

    #[test]
    fn test_compliance_violation_fails_without_analysis() {
        let mut wf = workflow(2500.0);
        wf.on_start();
        wf.on_activity_completed(
            activity_names::GENERATE_EMBEDDING,
            json!({ "vector": [1.0], "model": "test" }),
        );
        wf.on_activity_completed(activity_names::SEARCH_SIMILAR_TRANSACTIONS, json!([]));

        let evaluation = RuleEvaluation {
            triggered_rules: vec!["sanctions_hit".to_string()],
            recommended_action: Some(RuleAction::Block),
            hard_violation: Some("Sanctions list match".to_string()),
            ..Default::default()
        };
        let error = ActivityError::non_retryable("compliance violation: Sanctions list match")
            .with_type(error_types::COMPLIANCE_VIOLATION)
            .with_details(to_json(&evaluation));
        let actions = wf.on_activity_failed(activity_names::APPLY_BUSINESS_RULES, &error);

        assert_eq!(
            actions,
            vec![WorkflowAction::fail(
                WorkflowError::new("compliance_violation").with_code("compliance_violation")
            )]
        );
        assert!(wf.is_completed());
        assert_eq!(wf.state(), PipelineState::Failed);
        assert_eq!(wf.query()["violation"], "Sanctions list match");
        assert_eq!(wf.query()["reason"], "compliance_violation");
    }

    #[test]
    fn test_critical_failure_compensates_then_fails() {
        let mut wf = workflow(2500.0);
        through_rules(&mut wf, RuleEvaluation::default());
        wf.on_activity_completed(
            activity_names::ANALYZE_TRANSACTION_WITH_AI,
            assessment(Verdict::Approve, 95.0),
        );

        let error = ActivityError::retryable("db down").exhausted(5);
        let actions = wf.on_activity_failed(activity_names::SAVE_DECISION, &error);
        assert_eq!(
            scheduled(&actions),
            vec![(
                COMPENSATION_ACTIVITY_ID.to_string(),
                "update_transaction_status".to_string()
            )]
        );
        match &actions[0] {
            WorkflowAction::ScheduleActivity { input, options, .. } => {
                assert_eq!(input["status"], "processing_error");
                assert_eq!(options.retry_policy.max_attempts, 1);
            }
            other => panic!("unexpected action {other:?}"),
        }
        assert_eq!(wf.state(), PipelineState::Failed);
        assert!(!wf.is_completed());

        // the compensating write fails too: the original error still wins
        let actions = wf.on_activity_failed(
            COMPENSATION_ACTIVITY_ID,
            &ActivityError::retryable("still down").exhausted(1),
        );
        match &actions[..] {
            [WorkflowAction::FailWorkflow { error }] => {
                assert_eq!(error.code.as_deref(), Some("save_decision_failed"));
                assert!(error.message.contains("db down"));
            }
            other => panic!("unexpected actions {other:?}"),
        }
        assert_eq!(wf.query()["compensation"]["outcome"], "failed");
    }

    #[test]
    fn test_happy_path_completes_with_outcome() {
        let mut wf = workflow(2500.0);
        through_rules(&mut wf, RuleEvaluation::default());
        wf.on_activity_completed(
            activity_names::ANALYZE_TRANSACTION_WITH_AI,
            assessment(Verdict::Approve, 95.0),
        );
        let actions = wf.on_activity_completed(
            activity_names::SAVE_DECISION,
            json!({ "decision_id": "DEC-tx-1", "created": true }),
        );
        match &actions[0] {
            WorkflowAction::ScheduleActivity { input, .. } => {
                assert_eq!(input["status"], "approved");
            }
            other => panic!("unexpected action {other:?}"),
        }

        let actions = wf.on_activity_completed(
            activity_names::UPDATE_TRANSACTION_STATUS,
            json!({ "transaction_id": "tx-1", "status": "approved" }),
        );
        assert!(matches!(actions[..], [WorkflowAction::CompleteWorkflow { .. }]));
        assert!(wf.is_completed());

        let outcome = wf.result().unwrap();
        assert_eq!(outcome.verdict, Verdict::Approve);
        assert_eq!(outcome.status, TransactionStatus::Approved);
        assert!(!outcome.reviewed);

        let stages: Vec<PipelineState> =
            serde_json::from_value(wf.query()["stages_completed"].clone()).unwrap();
        assert_eq!(
            stages,
            vec![
                PipelineState::Initialized,
                PipelineState::EmbeddingGenerated,
                PipelineState::SimilaritySearched,
                PipelineState::RulesApplied,
                PipelineState::AiAnalyzed,
                PipelineState::DecisionSaved,
                PipelineState::StatusUpdated,
                PipelineState::Completed,
            ]
        );
    }

    #[test]
    fn test_processing_time_comes_from_workflow_clock() {
        let started = Utc::now();
        let mut wf = workflow(2500.0);
        wf.on_clock(started);
        through_rules(&mut wf, RuleEvaluation::default());
        wf.on_activity_completed(
            activity_names::ANALYZE_TRANSACTION_WITH_AI,
            assessment(Verdict::Approve, 95.0),
        );
        wf.on_clock(started + chrono::TimeDelta::milliseconds(900));
        wf.on_activity_completed(
            activity_names::SAVE_DECISION,
            json!({ "decision_id": "DEC-tx-1", "created": true }),
        );
        assert_eq!(wf.query()["processing_time_ms"], 900);

        wf.on_clock(started + chrono::TimeDelta::milliseconds(1500));
        wf.on_activity_completed(
            activity_names::UPDATE_TRANSACTION_STATUS,
            json!({ "transaction_id": "tx-1", "status": "approved" }),
        );

        assert_eq!(wf.result().unwrap().processing_time_ms, 1500);
    }

    #[test]
    fn test_malformed_result_fails_execution() {
        let mut wf = workflow(2500.0);
        wf.on_start();
        let actions =
            wf.on_activity_completed(activity_names::GENERATE_EMBEDDING, json!({ "nope": 1 }));
        match &actions[..] {
            [WorkflowAction::FailWorkflow { error }] => {
                assert_eq!(error.code.as_deref(), Some("malformed_result"));
            }
            other => panic!("unexpected actions {other:?}"),
        }
    }

    #[test]
    fn test_critical_steps_get_the_most_attempts() {
        let config = PipelineConfig::default();
        let critical = [
            step_options::save_decision(&config),
            step_options::status_update(&config),
        ];
        let others = [
            step_options::embedding(&config),
            step_options::similarity_search(&config),
            step_options::business_rules(&config),
            step_options::ai_analysis(&config),
            step_options::human_review(&config),
        ];

        let least_critical = critical
            .iter()
            .map(|o| o.retry_policy.max_attempts)
            .min()
            .unwrap();
        for options in &others {
            assert!(options.retry_policy.max_attempts < least_critical);
        }
        assert_eq!(step_options::compensation().retry_policy.max_attempts, 1);
        assert!(!step_options::business_rules(&config)
            .retry_policy
            .should_retry(Some(error_types::COMPLIANCE_VIOLATION)));
    }

    #[test]
    fn test_cancel_marks_failed() {
        let mut wf = workflow(75_000.0);
        to_review(&mut wf);
        wf.on_cancelled("operator request");

        assert_eq!(wf.state(), PipelineState::Failed);
        assert_eq!(wf.error().unwrap().code.as_deref(), Some("cancelled"));
        assert_eq!(wf.query()["reason"], "cancelled");
    }
}
