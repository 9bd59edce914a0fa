// Transition guards of the transaction workflow
//
// Pure functions over recorded data and explicit configuration. The
// workflow calls them while folding its history, so they must stay free of
// clocks, randomness and I/O.

use serde::{Deserialize, Serialize};

use crate::config::PipelineConfig;
use crate::types::{
    ReviewPriority, RiskAssessment, RuleEvaluation, TransactionStatus, Verdict,
};

/// AI confidence below which a rule recommendation replaces the AI verdict
pub const RULE_OVERRIDE_CONFIDENCE: f64 = 70.0;

/// Branch taken after the AI analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "branch", rename_all = "snake_case")]
pub enum ReviewBranch {
    /// Persist the AI verdict directly
    AutoDecide,
    /// Wait for a human reviewer
    HumanReview {
        low_confidence: bool,
        over_limit: bool,
    },
}

impl ReviewBranch {
    pub fn needs_review(&self) -> bool {
        matches!(self, ReviewBranch::HumanReview { .. })
    }
}

/// Decide whether the assessment needs a human
///
/// `needs_review = confidence < confidence_threshold_approve OR amount > auto_approval_limit`
pub fn review_branch(
    assessment: &RiskAssessment,
    amount: f64,
    config: &PipelineConfig,
) -> ReviewBranch {
    let low_confidence = assessment.confidence < config.confidence_threshold_approve;
    let over_limit = amount > config.auto_approval_limit;

    if low_confidence || over_limit {
        ReviewBranch::HumanReview {
            low_confidence,
            over_limit,
        }
    } else {
        ReviewBranch::AutoDecide
    }
}

/// Status written for a final verdict
pub fn status_for(verdict: Verdict) -> TransactionStatus {
    match verdict {
        Verdict::Approve => TransactionStatus::Approved,
        Verdict::Reject => TransactionStatus::Rejected,
        Verdict::Escalate => TransactionStatus::PendingReview,
    }
}

/// Queue priority of a review from the assessed risk score
pub fn review_priority(risk_score: f64) -> ReviewPriority {
    if risk_score > 80.0 {
        ReviewPriority::Urgent
    } else if risk_score > 60.0 {
        ReviewPriority::High
    } else if risk_score > 40.0 {
        ReviewPriority::Medium
    } else {
        ReviewPriority::Low
    }
}

/// Let the rule recommendation win over a low-confidence AI verdict
///
/// Returns true when the verdict was replaced.
pub fn apply_rule_override(assessment: &mut RiskAssessment, rules: &RuleEvaluation) -> bool {
    let Some(action) = rules.recommended_action else {
        return false;
    };
    if assessment.confidence >= RULE_OVERRIDE_CONFIDENCE {
        return false;
    }

    let verdict = action.verdict();
    assessment.reasoning = format!(
        "{} | overridden by rule engine: {:?} (mapped to {verdict})",
        assessment.reasoning, action
    );
    let changed = assessment.verdict != verdict;
    assessment.verdict = verdict;
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RiskLevel, RuleAction};

    fn assessment(verdict: Verdict, confidence: f64) -> RiskAssessment {
        RiskAssessment {
            verdict,
            confidence,
            risk_score: 20.0,
            risk_level: RiskLevel::Low,
            reasoning: "model".to_string(),
            risk_factors: vec![],
        }
    }

    #[test]
    fn test_confident_small_transaction_is_auto_decided() {
        let config = PipelineConfig::default();
        let branch = review_branch(&assessment(Verdict::Approve, 95.0), 2500.0, &config);
        assert_eq!(branch, ReviewBranch::AutoDecide);
        assert!(!branch.needs_review());
    }

    #[test]
    fn test_amount_over_limit_needs_review() {
        let config = PipelineConfig::default();
        let branch = review_branch(&assessment(Verdict::Approve, 95.0), 75_000.0, &config);
        assert_eq!(
            branch,
            ReviewBranch::HumanReview {
                low_confidence: false,
                over_limit: true
            }
        );
    }

    #[test]
    fn test_low_confidence_needs_review() {
        let config = PipelineConfig::default();
        let branch = review_branch(&assessment(Verdict::Approve, 84.9), 100.0, &config);
        assert_eq!(
            branch,
            ReviewBranch::HumanReview {
                low_confidence: true,
                over_limit: false
            }
        );

        // boundaries: threshold itself auto-approves, the limit itself too
        let at_edges = review_branch(&assessment(Verdict::Approve, 85.0), 50_000.0, &config);
        assert_eq!(at_edges, ReviewBranch::AutoDecide);
    }

    #[test]
    fn test_thresholds_come_from_config() {
        let config = PipelineConfig {
            confidence_threshold_approve: 50.0,
            auto_approval_limit: 100_000.0,
            ..PipelineConfig::default()
        };
        let branch = review_branch(&assessment(Verdict::Approve, 60.0), 75_000.0, &config);
        assert_eq!(branch, ReviewBranch::AutoDecide);
    }

    #[test]
    fn test_status_for_verdicts() {
        assert_eq!(status_for(Verdict::Approve), TransactionStatus::Approved);
        assert_eq!(status_for(Verdict::Reject), TransactionStatus::Rejected);
        assert_eq!(status_for(Verdict::Escalate), TransactionStatus::PendingReview);
    }

    #[test]
    fn test_review_priority_bands() {
        assert_eq!(review_priority(95.0), ReviewPriority::Urgent);
        assert_eq!(review_priority(80.0), ReviewPriority::High);
        assert_eq!(review_priority(61.0), ReviewPriority::High);
        assert_eq!(review_priority(60.0), ReviewPriority::Medium);
        assert_eq!(review_priority(40.0), ReviewPriority::Low);
        assert_eq!(review_priority(0.0), ReviewPriority::Low);
    }

    #[test]
    fn test_rule_override_applies_only_below_confidence_floor() {
        let rules = RuleEvaluation {
            triggered_rules: vec!["high_amount_wire".to_string()],
            recommended_action: Some(RuleAction::Flag),
            ..Default::default()
        };

        let mut unsure = assessment(Verdict::Approve, 60.0);
        assert!(apply_rule_override(&mut unsure, &rules));
        assert_eq!(unsure.verdict, Verdict::Escalate);
        assert!(unsure.reasoning.contains("overridden by rule engine"));

        let mut sure = assessment(Verdict::Approve, 70.0);
        assert!(!apply_rule_override(&mut sure, &rules));
        assert_eq!(sure.verdict, Verdict::Approve);

        let mut no_rule = assessment(Verdict::Approve, 10.0);
        assert!(!apply_rule_override(&mut no_rule, &RuleEvaluation::default()));
        assert_eq!(no_rule.verdict, Verdict::Approve);
    }
}
