// Declarative business rule engine
//
// Rules are data: a group of conditions (AND/OR, nestable) over dotted field
// paths of the transaction document, an action and a priority. When several
// rules trigger, the highest-priority action is the recommendation. A rule
// with the `block` action is a hard compliance violation.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::collaborators::{CollaboratorError, RuleEvaluator};
use crate::risk::HIGH_RISK_COUNTRIES;
use crate::types::{RuleAction, RuleEvaluation, Transaction};

// =============================================================================
// Rule model
// =============================================================================

/// Comparison applied to one field
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    #[default]
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    GreaterOrEqual,
    LessOrEqual,
    In,
    NotIn,
    Contains,
    Regex,
    Exists,
    NotExists,
}

/// How the conditions of a group combine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Logic {
    #[default]
    And,
    Or,
}

/// One field comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldCondition {
    /// Dotted path into the transaction document, e.g. `recipient.country`
    pub field: String,
    #[serde(default)]
    pub operator: Operator,
    #[serde(default)]
    pub value: Value,
}

/// Nested group of conditions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionGroup {
    #[serde(default)]
    pub operator: Logic,
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    Group(ConditionGroup),
    Field(FieldCondition),
}

impl Condition {
    pub fn field(field: &str, operator: Operator, value: Value) -> Self {
        Condition::Field(FieldCondition {
            field: field.to_string(),
            operator,
            value,
        })
    }

    pub fn all(conditions: Vec<Condition>) -> Self {
        Condition::Group(ConditionGroup {
            operator: Logic::And,
            conditions,
        })
    }

    pub fn any(conditions: Vec<Condition>) -> Self {
        Condition::Group(ConditionGroup {
            operator: Logic::Or,
            conditions,
        })
    }
}

/// A business rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub rule_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Triggered rules add a `rule_<category>` risk flag
    pub category: String,
    pub conditions: ConditionGroup,
    pub action: RuleAction,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

// =============================================================================
// Evaluation
// =============================================================================

fn lookup<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(document, |current, part| current.as_object()?.get(part))
        .filter(|value| !value.is_null())
}

/// Equality that treats `9999` and `9999.0` as the same number
fn loosely_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) if left.is_number() && right.is_number() => l == r,
        _ => left == right,
    }
}

fn compare(actual: Option<&Value>, expected: &Value, test: impl Fn(f64, f64) -> bool) -> bool {
    match (actual.and_then(Value::as_f64), expected.as_f64()) {
        (Some(actual), Some(expected)) => test(actual, expected),
        _ => false,
    }
}

fn member(actual: Option<&Value>, expected: &Value) -> bool {
    match (actual, expected.as_array()) {
        (Some(actual), Some(values)) => values.iter().any(|v| loosely_equal(actual, v)),
        _ => false,
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn evaluate_field(condition: &FieldCondition, document: &Value) -> bool {
    let actual = lookup(document, &condition.field);
    let expected = &condition.value;

    match condition.operator {
        Operator::Equals => actual.is_some_and(|a| loosely_equal(a, expected)),
        Operator::NotEquals => !actual.is_some_and(|a| loosely_equal(a, expected)),
        Operator::GreaterThan => compare(actual, expected, |a, e| a > e),
        Operator::LessThan => compare(actual, expected, |a, e| a < e),
        Operator::GreaterOrEqual => compare(actual, expected, |a, e| a >= e),
        Operator::LessOrEqual => compare(actual, expected, |a, e| a <= e),
        Operator::In => member(actual, expected),
        Operator::NotIn => !member(actual, expected),
        Operator::Contains => match actual {
            Some(Value::Array(items)) => items.iter().any(|item| loosely_equal(item, expected)),
            Some(value) => as_text(value).contains(&as_text(expected)),
            None => false,
        },
        Operator::Regex => {
            let Some(actual) = actual else {
                return false;
            };
            // anchored at the start of the field
            match Regex::new(&format!("^(?:{})", as_text(expected))) {
                Ok(pattern) => pattern.is_match(&as_text(actual)),
                Err(e) => {
                    warn!(field = %condition.field, error = %e, "Invalid rule pattern");
                    false
                }
            }
        }
        Operator::Exists => actual.is_some(),
        Operator::NotExists => actual.is_none(),
    }
}

fn evaluate_group(group: &ConditionGroup, document: &Value) -> bool {
    if group.conditions.is_empty() {
        return false;
    }

    let mut results = group.conditions.iter().map(|condition| match condition {
        Condition::Group(inner) => evaluate_group(inner, document),
        Condition::Field(field) => evaluate_field(field, document),
    });

    match group.operator {
        Logic::And => results.all(|matched| matched),
        Logic::Or => results.any(|matched| matched),
    }
}

/// Rule engine over a fixed rule set
#[derive(Debug, Clone)]
pub struct RuleEngine {
    rules: Vec<Rule>,
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new(default_rules())
    }
}

impl RuleEngine {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Check one rule against a document
    pub fn matches(rule: &Rule, document: &Value) -> bool {
        rule.enabled && evaluate_group(&rule.conditions, document)
    }

    /// Evaluate all enabled rules against a transaction document
    pub fn evaluate_document(&self, document: &Value) -> RuleEvaluation {
        let mut evaluation = RuleEvaluation::default();
        let mut winner: Option<&Rule> = None;

        for rule in self.rules.iter().filter(|rule| Self::matches(rule, document)) {
            debug!(rule_id = %rule.rule_id, name = %rule.name, "Rule triggered");
            evaluation.triggered_rules.push(rule.rule_id.clone());

            let flag = format!("rule_{}", rule.category);
            if !evaluation.risk_flags.contains(&flag) {
                evaluation.risk_flags.push(flag);
            }

            if rule.action == RuleAction::Block && evaluation.hard_violation.is_none() {
                evaluation.hard_violation = Some(rule.name.clone());
            }

            // first rule wins a priority tie
            let outranks = match winner {
                Some(current) => rule.priority > current.priority,
                None => true,
            };
            if outranks {
                winner = Some(rule);
            }
        }

        evaluation.recommended_action = winner.map(|rule| rule.action);
        evaluation
    }

    pub fn evaluate(&self, transaction: &Transaction) -> RuleEvaluation {
        self.evaluate_document(&transaction.document())
    }
}

#[async_trait]
impl RuleEvaluator for RuleEngine {
    async fn evaluate(&self, transaction: &Transaction) -> Result<RuleEvaluation, CollaboratorError> {
        Ok(RuleEngine::evaluate(self, transaction))
    }
}

// =============================================================================
// Default rule set
// =============================================================================

fn rule(
    rule_id: &str,
    name: &str,
    category: &str,
    condition: Condition,
    action: RuleAction,
    priority: i32,
) -> Rule {
    let conditions = match condition {
        Condition::Group(group) => group,
        field @ Condition::Field(_) => ConditionGroup {
            operator: Logic::And,
            conditions: vec![field],
        },
    };

    Rule {
        rule_id: rule_id.to_string(),
        name: name.to_string(),
        description: String::new(),
        category: category.to_string(),
        conditions,
        action,
        priority,
        enabled: true,
    }
}

/// Rules installed when no custom set is configured
pub fn default_rules() -> Vec<Rule> {
    use Operator as Op;

    vec![
        rule(
            "high_amount_wire",
            "High Amount Wire Transfer",
            "amount",
            Condition::all(vec![
                Condition::field("transaction_type", Op::Equals, json!("wire_transfer")),
                Condition::field("amount", Op::GreaterThan, json!(50_000)),
            ]),
            RuleAction::Escalate,
            50,
        ),
        rule(
            "high_risk_geography",
            "International High Risk Country",
            "geography",
            Condition::any(vec![
                Condition::field("recipient.country", Op::In, json!(HIGH_RISK_COUNTRIES)),
                Condition::field("sender.country", Op::In, json!(HIGH_RISK_COUNTRIES)),
            ]),
            RuleAction::Escalate,
            80,
        ),
        rule(
            "suspicious_round_amount",
            "Suspicious Round Amount",
            "pattern",
            Condition::any(vec![
                Condition::field("amount", Op::Equals, json!(9999)),
                Condition::field("amount", Op::Equals, json!(99999)),
            ]),
            RuleAction::Escalate,
            60,
        ),
        rule(
            "after_hours_large",
            "After Hours Large Transaction",
            "pattern",
            Condition::all(vec![
                Condition::field("amount", Op::GreaterThan, json!(25_000)),
                Condition::field("metadata.unusual_time", Op::Equals, json!(true)),
            ]),
            RuleAction::Escalate,
            70,
        ),
        rule(
            "rapid_movement",
            "Rapid Movement Pattern",
            "velocity",
            Condition::any(vec![
                Condition::all(vec![
                    Condition::field("metadata.velocity_1h", Op::GreaterThan, json!(2)),
                    Condition::field("amount", Op::GreaterThan, json!(20_000)),
                ]),
                Condition::field("metadata.total_amount_1h", Op::GreaterThan, json!(75_000)),
            ]),
            RuleAction::Escalate,
            90,
        ),
        rule(
            "structuring",
            "Structuring Pattern Detection",
            "pattern",
            Condition::all(vec![
                Condition::field("amount", Op::GreaterThan, json!(4900)),
                Condition::field("amount", Op::LessThan, json!(5000)),
                Condition::field("transaction_type", Op::Equals, json!("wire_transfer")),
            ]),
            RuleAction::Escalate,
            95,
        ),
        rule(
            "offshore_structuring",
            "Multiple Structuring Pattern",
            "pattern",
            Condition::all(vec![
                Condition::field("amount", Op::GreaterThan, json!(4800)),
                Condition::field("amount", Op::LessThan, json!(5000)),
                Condition::field("recipient.name", Op::Regex, json!("Offshore.*")),
            ]),
            RuleAction::Escalate,
            96,
        ),
        rule(
            "sanctions_hit",
            "Sanctions Screening Hit",
            "compliance",
            Condition::any(vec![
                Condition::field("risk_flags", Op::Contains, json!("sanctions_hit")),
                Condition::field("metadata.sanctions_hit", Op::Equals, json!(true)),
            ]),
            RuleAction::Block,
            100,
        ),
    ]
}
