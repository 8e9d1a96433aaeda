//! Evaluation of a single compiled condition

use std::sync::Arc;
use std::time::Duration;

use crate::aggregation::AggregateSource;
use crate::rules::{CompiledCondition, Predicate, Scalar};
use crate::transaction::{FieldValue, TransactionEvent};

/// Result of one condition; degraded conditions never match
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionOutcome {
    Matched,
    NotMatched,
    Degraded(String),
}

impl ConditionOutcome {
    pub fn is_match(&self) -> bool {
        matches!(self, ConditionOutcome::Matched)
    }

    fn from_bool(matched: bool) -> Self {
        if matched {
            ConditionOutcome::Matched
        } else {
            ConditionOutcome::NotMatched
        }
    }
}

pub struct ConditionEvaluator {
    source: Arc<dyn AggregateSource>,
    timeout: Duration,
}

impl ConditionEvaluator {
    pub fn new(source: Arc<dyn AggregateSource>, timeout: Duration) -> Self {
        Self { source, timeout }
    }

    pub fn source(&self) -> &Arc<dyn AggregateSource> {
        &self.source
    }

    /// Evaluate against the raw event, or against the aggregate when the
    /// condition carries one. Lookups past the timeout degrade.
    pub async fn evaluate(&self, condition: &CompiledCondition, event: &TransactionEvent) -> ConditionOutcome {
        let Some(aggregation) = &condition.aggregation else {
            return match event.field_value(&condition.field) {
                Some(value) => ConditionOutcome::from_bool(test_value(&condition.predicate, &value)),
                None => ConditionOutcome::NotMatched,
            };
        };

        let lookup = self.source.aggregate(
            &event.user_id,
            &condition.field,
            aggregation.kind,
            aggregation.window,
        );

        match tokio::time::timeout(self.timeout, lookup).await {
            Ok(Ok(total)) => {
                ConditionOutcome::from_bool(test_value(&condition.predicate, &FieldValue::Number(total)))
            }
            Ok(Err(e)) => ConditionOutcome::Degraded(format!("aggregate lookup failed: {}", e)),
            Err(_) => ConditionOutcome::Degraded(format!(
                "aggregate lookup timed out after {}ms",
                self.timeout.as_millis()
            )),
        }
    }
}

/// Apply a predicate to a present value. Type mismatches never match.
pub fn test_value(predicate: &Predicate, value: &FieldValue<'_>) -> bool {
    match predicate {
        Predicate::Compare { op, threshold } => value
            .as_number()
            .map_or(false, |subject| op.holds(subject, *threshold)),
        Predicate::Equals(scalar) => scalar_eq(scalar, value) == Some(true),
        Predicate::NotEquals(scalar) => scalar_eq(scalar, value) == Some(false),
        Predicate::In(items) => items.iter().any(|s| scalar_eq(s, value) == Some(true)),
        Predicate::NotIn(items) => {
            let mut comparable = false;
            for item in items {
                match scalar_eq(item, value) {
                    Some(true) => return false,
                    Some(false) => comparable = true,
                    None => {}
                }
            }
            comparable
        }
        Predicate::Contains(needle) => match value {
            FieldValue::Text(text) => text.contains(needle.as_str()),
            _ => false,
        },
    }
}

/// `None` when the operands cannot be compared
fn scalar_eq(scalar: &Scalar, value: &FieldValue<'_>) -> Option<bool> {
    match (scalar, value) {
        (Scalar::Number(expected), value) => value.as_number().map(|n| n == *expected),
        (Scalar::Text(expected), FieldValue::Text(text)) => Some(*text == expected.as_str()),
        (Scalar::Bool(expected), FieldValue::Bool(b)) => Some(b == expected),
        _ => None,
    }
}
