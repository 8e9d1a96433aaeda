//! Rule model and compilation
//!
//! Rules arrive loosely typed (field paths and operators as strings, values as
//! arbitrary JSON). Compilation turns every condition into a closed, typed
//! [`CompiledCondition`] so the evaluator never inspects untyped data.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::errors::{FraudWatchError, Result};
use crate::utils::parse_window;

/// Ordinal used to arbitrate between matched rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    Block,
    Review,
    Notify,
}

impl RuleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleAction::Allow => "allow",
            RuleAction::Block => "block",
            RuleAction::Review => "review",
            RuleAction::Notify => "notify",
        }
    }
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A condition as authored by an administrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionSpec {
    pub field: String,
    pub operator: String,
    pub value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_window: Option<String>,
}

impl ConditionSpec {
    pub fn new(field: &str, operator: &str, value: serde_json::Value) -> Self {
        Self {
            field: field.to_string(),
            operator: operator.to_string(),
            value,
            aggregation: None,
            time_window: None,
        }
    }

    pub fn aggregated(mut self, aggregation: &str, time_window: &str) -> Self {
        self.aggregation = Some(aggregation.to_string());
        self.time_window = Some(time_window.to_string());
        self
    }
}

/// A stored rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub conditions: Vec<ConditionSpec>,
    pub severity: Severity,
    pub action: RuleAction,
    #[serde(default = "default_active")]
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_active() -> bool {
    true
}

/// Administrative input for creating or replacing a rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDraft {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub conditions: Vec<ConditionSpec>,
    pub severity: Severity,
    pub action: RuleAction,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

impl RuleDraft {
    pub fn new(name: &str, severity: Severity, action: RuleAction) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            conditions: Vec::new(),
            severity,
            action,
            is_active: true,
        }
    }

    pub fn describe(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn when(mut self, condition: ConditionSpec) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    /// Materialize the draft as a new rule
    pub fn into_rule(self, now: DateTime<Utc>) -> Rule {
        Rule {
            id: Uuid::new_v4(),
            name: self.name,
            description: self.description,
            conditions: self.conditions,
            severity: self.severity,
            action: self.action,
            is_active: self.is_active,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply the draft on top of an existing rule, keeping its identity
    pub fn apply_to(self, existing: &Rule, now: DateTime<Utc>) -> Rule {
        Rule {
            id: existing.id,
            name: self.name,
            description: self.description,
            conditions: self.conditions,
            severity: self.severity,
            action: self.action,
            is_active: self.is_active,
            created_at: existing.created_at,
            updated_at: now,
        }
    }
}

/// Event attribute a condition reads
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    Amount,
    UserId,
    RecipientId,
    Category,
    Country,
    TransactionType,
    HourOfDay,
    Metadata(String),
}

impl Field {
    pub fn parse(path: &str) -> Option<Field> {
        let field = match path.trim() {
            "amount" => Field::Amount,
            "userId" | "user_id" => Field::UserId,
            "recipientId" | "recipient_id" => Field::RecipientId,
            "category" => Field::Category,
            "country" => Field::Country,
            "type" | "transactionType" | "transaction_type" => Field::TransactionType,
            "hourOfDay" | "hour_of_day" | "hour" => Field::HourOfDay,
            other => {
                let key = other.strip_prefix("metadata.")?;
                if key.is_empty() {
                    return None;
                }
                Field::Metadata(key.to_string())
            }
        };
        Some(field)
    }

    fn is_numeric(&self) -> bool {
        matches!(self, Field::Amount | Field::HourOfDay | Field::Metadata(_))
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Amount => f.write_str("amount"),
            Field::UserId => f.write_str("userId"),
            Field::RecipientId => f.write_str("recipientId"),
            Field::Category => f.write_str("category"),
            Field::Country => f.write_str("country"),
            Field::TransactionType => f.write_str("type"),
            Field::HourOfDay => f.write_str("hourOfDay"),
            Field::Metadata(key) => write!(f, "metadata.{}", key),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationKind {
    Count,
    Sum,
    Avg,
}

impl AggregationKind {
    fn parse(raw: &str) -> Option<AggregationKind> {
        match raw.trim().to_lowercase().as_str() {
            "count" => Some(AggregationKind::Count),
            "sum" => Some(AggregationKind::Sum),
            "avg" | "average" => Some(AggregationKind::Avg),
            _ => None,
        }
    }
}

/// Aggregated subject of a condition
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    pub kind: AggregationKind,
    pub window: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
}

impl Comparison {
    pub fn holds(&self, subject: f64, threshold: f64) -> bool {
        match self {
            Comparison::GreaterThan => subject > threshold,
            Comparison::GreaterThanOrEqual => subject >= threshold,
            Comparison::LessThan => subject < threshold,
            Comparison::LessThanOrEqual => subject <= threshold,
        }
    }
}

/// Literal operand
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Number(f64),
    Text(String),
    Bool(bool),
}

impl Scalar {
    fn from_json(value: &serde_json::Value) -> Option<Scalar> {
        match value {
            serde_json::Value::Number(n) => n.as_f64().map(Scalar::Number),
            serde_json::Value::String(s) => Some(Scalar::Text(s.clone())),
            serde_json::Value::Bool(b) => Some(Scalar::Bool(*b)),
            _ => None,
        }
    }
}

/// Typed test applied to a field or aggregate value
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Compare { op: Comparison, threshold: f64 },
    Equals(Scalar),
    NotEquals(Scalar),
    In(Vec<Scalar>),
    NotIn(Vec<Scalar>),
    Contains(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledCondition {
    pub field: Field,
    pub predicate: Predicate,
    pub aggregation: Option<Aggregation>,
}

/// A rule that passed structural validation, ready for evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledRule {
    pub rule: Rule,
    pub conditions: Vec<CompiledCondition>,
    /// SHA-256 over the rule body, identifies the exact version evaluated
    pub fingerprint: String,
}

impl CompiledRule {
    pub fn id(&self) -> Uuid {
        self.rule.id
    }

    /// (field, window) pairs this rule reads from the aggregation window
    pub fn aggregated_windows(&self) -> impl Iterator<Item = (&Field, Duration)> {
        self.conditions
            .iter()
            .filter_map(|c| c.aggregation.as_ref().map(|a| (&c.field, a.window)))
    }
}

/// Validate a rule and produce its typed form
pub fn compile(rule: &Rule) -> Result<CompiledRule> {
    let fail = |reason: String| FraudWatchError::RuleCompile {
        rule_id: rule.id.to_string(),
        reason,
    };

    if rule.name.trim().is_empty() {
        return Err(fail("rule name must not be empty".to_string()));
    }

    if rule.conditions.is_empty() {
        return Err(fail("rule must have at least one condition".to_string()));
    }

    let conditions = rule
        .conditions
        .iter()
        .enumerate()
        .map(|(idx, spec)| {
            compile_condition(spec).map_err(|reason| fail(format!("condition {}: {}", idx + 1, reason)))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(CompiledRule {
        rule: rule.clone(),
        conditions,
        fingerprint: fingerprint(rule)?,
    })
}

fn compile_condition(spec: &ConditionSpec) -> std::result::Result<CompiledCondition, String> {
    let field = Field::parse(&spec.field).ok_or_else(|| format!("unknown field '{}'", spec.field))?;

    let aggregation = match (&spec.aggregation, &spec.time_window) {
        (None, None) => None,
        (None, Some(_)) => return Err("time window given without an aggregation".to_string()),
        (Some(_), None) => return Err("aggregation requires a time window".to_string()),
        (Some(kind), Some(window)) => {
            let kind = AggregationKind::parse(kind)
                .ok_or_else(|| format!("unknown aggregation '{}'", kind))?;
            let window =
                parse_window(window).ok_or_else(|| format!("invalid time window '{}'", window))?;
            if kind != AggregationKind::Count && !field.is_numeric() {
                return Err(format!("{:?} aggregation needs a numeric field, got '{}'", kind, field));
            }
            Some(Aggregation { kind, window })
        }
    };

    let predicate = compile_predicate(&spec.operator, &spec.value)?;

    if aggregation.is_some() {
        let numeric = match &predicate {
            Predicate::Compare { .. } => true,
            Predicate::Equals(Scalar::Number(_)) | Predicate::NotEquals(Scalar::Number(_)) => true,
            _ => false,
        };
        if !numeric {
            return Err("aggregated conditions only support numeric comparisons".to_string());
        }
    }

    Ok(CompiledCondition { field, predicate, aggregation })
}

fn compile_predicate(operator: &str, value: &serde_json::Value) -> std::result::Result<Predicate, String> {
    let comparison = match operator.trim() {
        "greaterThan" | "gt" | ">" => Some(Comparison::GreaterThan),
        "greaterThanOrEqual" | "gte" | ">=" => Some(Comparison::GreaterThanOrEqual),
        "lessThan" | "lt" | "<" => Some(Comparison::LessThan),
        "lessThanOrEqual" | "lte" | "<=" => Some(Comparison::LessThanOrEqual),
        _ => None,
    };

    if let Some(op) = comparison {
        let threshold = numeric_literal(value)
            .ok_or_else(|| format!("operator '{}' needs a numeric value, got {}", operator, value))?;
        return Ok(Predicate::Compare { op, threshold });
    }

    let scalar = || {
        Scalar::from_json(value).ok_or_else(|| format!("operator '{}' needs a scalar value, got {}", operator, value))
    };

    match operator.trim() {
        "equals" | "eq" | "==" => Ok(Predicate::Equals(scalar()?)),
        "notEquals" | "ne" | "!=" => Ok(Predicate::NotEquals(scalar()?)),
        "in" => Ok(Predicate::In(scalar_list(value)?)),
        "notIn" | "not_in" => Ok(Predicate::NotIn(scalar_list(value)?)),
        "contains" => match value {
            serde_json::Value::String(s) if !s.is_empty() => Ok(Predicate::Contains(s.clone())),
            _ => Err(format!("operator 'contains' needs a non-empty string, got {}", value)),
        },
        other => Err(format!("unknown operator '{}'", other)),
    }
}

fn numeric_literal(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|n| n.is_finite())
}

fn scalar_list(value: &serde_json::Value) -> std::result::Result<Vec<Scalar>, String> {
    let items = value
        .as_array()
        .ok_or_else(|| format!("expected a list of values, got {}", value))?;
    if items.is_empty() {
        return Err("value list must not be empty".to_string());
    }
    items
        .iter()
        .map(|item| Scalar::from_json(item).ok_or_else(|| format!("list item {} is not a scalar", item)))
        .collect()
}

#[derive(Serialize)]
struct FingerprintBody<'a> {
    name: &'a str,
    description: &'a str,
    conditions: &'a [ConditionSpec],
    severity: Severity,
    action: RuleAction,
}

fn fingerprint(rule: &Rule) -> Result<String> {
    let body = serde_json::to_vec(&FingerprintBody {
        name: &rule.name,
        description: &rule.description,
        conditions: &rule.conditions,
        severity: rule.severity,
        action: rule.action,
    })?;
    Ok(hex::encode(Sha256::digest(&body)))
}
