//! Transaction events screened by the engine
//! Handles validation, attribute lookup for rule conditions and integrity digests

use std::collections::HashMap;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::errors::{FraudWatchError, Result};
use crate::rules::Field;

/// A financial transaction submitted for a decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionEvent {
    pub transaction_id: Uuid,
    pub user_id: String,
    pub amount: f64,
    #[serde(default)]
    pub recipient_id: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(rename = "type")]
    pub transaction_type: TransactionType,
    pub timestamp: DateTime<Utc>,
    /// Extra attributes addressable from rules as `metadata.<key>`
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Transfer,
    Payment,
    Withdrawal,
    Deposit,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Transfer => "transfer",
            TransactionType::Payment => "payment",
            TransactionType::Withdrawal => "withdrawal",
            TransactionType::Deposit => "deposit",
        }
    }
}

/// Attribute value read from an event
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue<'a> {
    Number(f64),
    Text(&'a str),
    Bool(bool),
}

impl FieldValue<'_> {
    /// Numeric view; numeric strings coerce, everything else does not
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            FieldValue::Text(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
            FieldValue::Bool(_) => None,
        }
    }
}

impl TransactionEvent {
    pub fn new(
        user_id: impl Into<String>,
        amount: f64,
        transaction_type: TransactionType,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            transaction_id: Uuid::new_v4(),
            user_id: user_id.into(),
            amount,
            recipient_id: None,
            category: None,
            country: None,
            transaction_type,
            timestamp,
            metadata: HashMap::new(),
        }
    }

    pub fn with_recipient(mut self, recipient_id: impl Into<String>) -> Self {
        self.recipient_id = Some(recipient_id.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Reject events that cannot be screened meaningfully
    pub fn validate(&self) -> Result<()> {
        if self.user_id.trim().is_empty() {
            return Err(FraudWatchError::validation("Transaction user id must not be empty"));
        }

        if !self.amount.is_finite() || self.amount <= 0.0 {
            return Err(FraudWatchError::validation(format!(
                "Transaction amount must be positive, got {}",
                self.amount
            )));
        }

        Ok(())
    }

    /// Look up the attribute a condition refers to; `None` when absent
    pub fn field_value(&self, field: &Field) -> Option<FieldValue<'_>> {
        match field {
            Field::Amount => Some(FieldValue::Number(self.amount)),
            Field::UserId => Some(FieldValue::Text(&self.user_id)),
            Field::RecipientId => self.recipient_id.as_deref().map(FieldValue::Text),
            Field::Category => self.category.as_deref().map(FieldValue::Text),
            Field::Country => self.country.as_deref().map(FieldValue::Text),
            Field::TransactionType => Some(FieldValue::Text(self.transaction_type.as_str())),
            Field::HourOfDay => Some(FieldValue::Number(self.timestamp.hour() as f64)),
            Field::Metadata(key) => match self.metadata.get(key)? {
                serde_json::Value::Number(n) => n.as_f64().map(FieldValue::Number),
                serde_json::Value::String(s) => Some(FieldValue::Text(s)),
                serde_json::Value::Bool(b) => Some(FieldValue::Bool(*b)),
                _ => None,
            },
        }
    }

    /// Integrity digest recorded with audit snapshots
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.transaction_id.as_bytes());
        hasher.update(self.user_id.as_bytes());
        hasher.update(self.amount.to_string().as_bytes());
        hasher.update(self.recipient_id.as_deref().unwrap_or("").as_bytes());
        hasher.update(self.timestamp.timestamp().to_string().as_bytes());

        hex::encode(hasher.finalize())
    }
}
