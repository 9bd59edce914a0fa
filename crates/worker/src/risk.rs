// Rule-based risk scoring
//
// Base risk by transaction type and amount band, plus fixed adjustments for
// known risk flags. Scores are clamped to 0..=100.

use crate::types::{RiskLevel, Transaction};

/// Countries whose involvement raises the risk of a transaction
pub const HIGH_RISK_COUNTRIES: &[&str] = &["RU", "IR", "KP", "SY", "AF", "YE"];

/// Stateless risk scorer
pub struct RiskEngine;

impl RiskEngine {
    /// Base score from transaction type and amount
    pub fn base_risk(transaction_type: &str, amount: f64) -> f64 {
        let type_risk = match transaction_type {
            "ach" => 10.0,
            "wire_transfer" => 30.0,
            "international" => 50.0,
            _ => 25.0,
        };

        let amount_risk = if amount > 100_000.0 {
            30.0
        } else if amount > 50_000.0 {
            20.0
        } else if amount > 10_000.0 {
            10.0
        } else {
            0.0
        };

        f64::min(type_risk + amount_risk, 100.0)
    }

    /// Add the adjustment of each known flag
    pub fn apply_risk_factors<S: AsRef<str>>(base_score: f64, risk_flags: &[S]) -> f64 {
        let adjusted = risk_flags
            .iter()
            .map(|flag| match flag.as_ref() {
                "high_risk_country" => 25.0,
                "structuring" | "structuring_pattern" => 30.0,
                "rapid_movement" => 20.0,
                "new_recipient" => 15.0,
                "round_amount_below_threshold" => 15.0,
                "unusual_time" => 10.0,
                _ => 0.0,
            })
            .fold(base_score, |score, adjustment| score + adjustment);

        adjusted.clamp(0.0, 100.0)
    }

    /// Band a score into a level
    pub fn risk_level(risk_score: f64) -> RiskLevel {
        if risk_score <= 25.0 {
            RiskLevel::Low
        } else if risk_score <= 50.0 {
            RiskLevel::Medium
        } else if risk_score <= 75.0 {
            RiskLevel::High
        } else {
            RiskLevel::VeryHigh
        }
    }

    /// Flags derived from the record itself
    pub fn derived_flags(transaction: &Transaction) -> Vec<String> {
        let mut flags = Vec::new();

        if transaction.amount > 50_000.0 {
            flags.push("high_amount".to_string());
        }
        // just under the 5000 reporting threshold
        if (4900.0..5000.0).contains(&transaction.amount) {
            flags.push("structuring_pattern".to_string());
        }
        if transaction.transaction_type == "international" {
            flags.push("cross_border".to_string());
        }

        let high_risk = [&transaction.sender, &transaction.recipient]
            .iter()
            .filter_map(|party| party.country.as_deref())
            .any(|country| HIGH_RISK_COUNTRIES.contains(&country));
        if high_risk {
            flags.push("high_risk_country".to_string());
        }

        flags
    }

    /// Full score of a transaction with extra flags from other stages
    pub fn score(transaction: &Transaction, extra_flags: &[String]) -> f64 {
        let mut flags = Self::derived_flags(transaction);
        flags.extend(transaction.risk_flags.iter().cloned());
        flags.extend(extra_flags.iter().cloned());
        flags.sort();
        flags.dedup();

        let base = Self::base_risk(&transaction.transaction_type, transaction.amount);
        Self::apply_risk_factors(base, &flags)
    }
}
