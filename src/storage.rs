//! Storage ports consumed by the engine, plus an in-memory implementation
//!
//! The engine never talks to a database directly. Every read and write goes
//! through one of the repository traits below with named, parameterized query
//! methods, so the core stays storage-agnostic and testable.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::errors::{FraudWatchError, Result};
use crate::fraud_detection::FraudEvent;
use crate::risk_profile::RiskProfile;
use crate::rules::{Rule, RuleAction};
use crate::transaction::{TransactionEvent, TransactionType};

/// Half-open time range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if end <= start {
            return Err(FraudWatchError::validation("Date range end must be after its start"));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

impl Page {
    pub fn new(limit: usize, offset: usize) -> Self {
        Self { limit, offset }
    }

    pub fn apply<T>(&self, items: impl IntoIterator<Item = T>) -> Vec<T> {
        items.into_iter().skip(self.offset).take(self.limit).collect()
    }
}

impl Default for Page {
    fn default() -> Self {
        Self { limit: 50, offset: 0 }
    }
}

/// Query over the fraud event audit trail; results are newest first
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub user_id: Option<String>,
    pub transaction_type: Option<TransactionType>,
    pub action: Option<RuleAction>,
    pub range: Option<DateRange>,
    /// `None` returns every matching event
    pub page: Option<Page>,
}

impl EventFilter {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self { user_id: Some(user_id.into()), ..Default::default() }
    }

    pub fn matches(&self, event: &FraudEvent) -> bool {
        self.user_id.as_ref().map_or(true, |u| *u == event.user_id)
            && self.transaction_type.map_or(true, |t| t == event.event_type)
            && self.action.map_or(true, |a| a == event.action)
            && self.range.map_or(true, |r| r.contains(event.created_at))
    }
}

/// Query over the transaction log; results are oldest first
#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    pub user_id: Option<String>,
    pub range: Option<DateRange>,
}

impl TransactionFilter {
    pub fn matches(&self, event: &TransactionEvent) -> bool {
        self.user_id.as_ref().map_or(true, |u| *u == event.user_id)
            && self.range.map_or(true, |r| r.contains(event.timestamp))
    }
}

#[async_trait]
pub trait RuleRepository: Send + Sync {
    /// Every stored rule, active or not
    async fn load_rules(&self) -> Result<Vec<Rule>>;
    async fn get_rule(&self, id: Uuid) -> Result<Option<Rule>>;
    async fn insert_rule(&self, rule: &Rule) -> Result<()>;
    async fn update_rule(&self, rule: &Rule) -> Result<()>;
    /// Returns whether a rule was removed
    async fn delete_rule(&self, id: Uuid) -> Result<bool>;
}

#[async_trait]
pub trait FraudEventStore: Send + Sync {
    async fn insert_event(&self, event: &FraudEvent) -> Result<()>;
    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<FraudEvent>>;
}

#[async_trait]
pub trait RiskProfileStore: Send + Sync {
    async fn get_profile(&self, user_id: &str) -> Result<Option<RiskProfile>>;
    async fn save_profile(&self, profile: &RiskProfile) -> Result<()>;
    async fn append_history(&self, snapshot: &RiskProfile) -> Result<()>;
    /// Snapshots newest first
    async fn list_history(&self, user_id: &str, page: Page) -> Result<Vec<RiskProfile>>;
}

#[async_trait]
pub trait TransactionHistory: Send + Sync {
    async fn append_transaction(&self, event: &TransactionEvent) -> Result<()>;
    async fn list_transactions(&self, filter: &TransactionFilter) -> Result<Vec<TransactionEvent>>;
}

/// A backend implementing every port
pub trait Storage: RuleRepository + FraudEventStore + RiskProfileStore + TransactionHistory {}

impl<T> Storage for T where T: RuleRepository + FraudEventStore + RiskProfileStore + TransactionHistory {}

/// Process-local storage used by tests, the CLI and embedded deployments
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    rules: RwLock<HashMap<Uuid, Rule>>,
    events: RwLock<Vec<FraudEvent>>,
    profiles: RwLock<HashMap<String, RiskProfile>>,
    history: RwLock<HashMap<String, Vec<RiskProfile>>>,
    transactions: RwLock<Vec<TransactionEvent>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RuleRepository for InMemoryStorage {
    async fn load_rules(&self) -> Result<Vec<Rule>> {
        Ok(self.rules.read().await.values().cloned().collect())
    }

    async fn get_rule(&self, id: Uuid) -> Result<Option<Rule>> {
        Ok(self.rules.read().await.get(&id).cloned())
    }

    async fn insert_rule(&self, rule: &Rule) -> Result<()> {
        let mut rules = self.rules.write().await;
        if rules.contains_key(&rule.id) {
            return Err(FraudWatchError::storage(format!("Rule {} already exists", rule.id)));
        }
        rules.insert(rule.id, rule.clone());
        Ok(())
    }

    async fn update_rule(&self, rule: &Rule) -> Result<()> {
        let mut rules = self.rules.write().await;
        match rules.get_mut(&rule.id) {
            Some(existing) => {
                *existing = rule.clone();
                Ok(())
            }
            None => Err(FraudWatchError::RuleNotFound { rule_id: rule.id.to_string() }),
        }
    }

    async fn delete_rule(&self, id: Uuid) -> Result<bool> {
        Ok(self.rules.write().await.remove(&id).is_some())
    }
}

#[async_trait]
impl FraudEventStore for InMemoryStorage {
    async fn insert_event(&self, event: &FraudEvent) -> Result<()> {
        let mut events = self.events.write().await;
        if events.iter().any(|e| e.id == event.id) {
            return Err(FraudWatchError::storage(format!("Fraud event {} already written", event.id)));
        }
        events.push(event.clone());
        Ok(())
    }

    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<FraudEvent>> {
        let events = self.events.read().await;
        let mut matching: Vec<FraudEvent> = events.iter().filter(|e| filter.matches(e)).cloned().collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(match filter.page {
            Some(page) => page.apply(matching),
            None => matching,
        })
    }
}

#[async_trait]
impl RiskProfileStore for InMemoryStorage {
    async fn get_profile(&self, user_id: &str) -> Result<Option<RiskProfile>> {
        Ok(self.profiles.read().await.get(user_id).cloned())
    }

    async fn save_profile(&self, profile: &RiskProfile) -> Result<()> {
        self.profiles
            .write()
            .await
            .insert(profile.user_id.clone(), profile.clone());
        Ok(())
    }

    async fn append_history(&self, snapshot: &RiskProfile) -> Result<()> {
        self.history
            .write()
            .await
            .entry(snapshot.user_id.clone())
            .or_default()
            .push(snapshot.clone());
        Ok(())
    }

    async fn list_history(&self, user_id: &str, page: Page) -> Result<Vec<RiskProfile>> {
        let history = self.history.read().await;
        Ok(history
            .get(user_id)
            .map(|snapshots| page.apply(snapshots.iter().rev().cloned()))
            .unwrap_or_default())
    }
}

#[async_trait]
impl TransactionHistory for InMemoryStorage {
    async fn append_transaction(&self, event: &TransactionEvent) -> Result<()> {
        self.transactions.write().await.push(event.clone());
        Ok(())
    }

    async fn list_transactions(&self, filter: &TransactionFilter) -> Result<Vec<TransactionEvent>> {
        let transactions = self.transactions.read().await;
        let mut matching: Vec<TransactionEvent> =
            transactions.iter().filter(|t| filter.matches(t)).cloned().collect();
        matching.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(matching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{ConditionSpec, RuleDraft, Severity};
    use chrono::Duration;
    use serde_json::json;

    fn sample_rule() -> Rule {
        RuleDraft::new("large amount", Severity::High, RuleAction::Review)
            .when(ConditionSpec::new("amount", "gt", json!(1000)))
            .into_rule(Utc::now())
    }

    #[test]
    fn test_date_range() {
        let start = Utc::now();
        let range = DateRange::new(start, start + Duration::days(1)).unwrap();
        assert!(range.contains(start));
        assert!(!range.contains(start + Duration::days(1)));
        assert!(DateRange::new(start, start).is_err());
    }

    #[test]
    fn test_page_apply() {
        let page = Page::new(2, 1);
        assert_eq!(page.apply(vec![1, 2, 3, 4]), vec![2, 3]);
        assert!(Page::new(5, 10).apply(vec![1, 2]).is_empty());
    }

    #[tokio::test]
    async fn test_rule_crud() {
        let storage = InMemoryStorage::new();
        let mut rule = sample_rule();

        storage.insert_rule(&rule).await.unwrap();
        assert!(storage.insert_rule(&rule).await.is_err());

        rule.name = "renamed".to_string();
        storage.update_rule(&rule).await.unwrap();
        assert_eq!(storage.get_rule(rule.id).await.unwrap().unwrap().name, "renamed");

        assert!(storage.delete_rule(rule.id).await.unwrap());
        assert!(!storage.delete_rule(rule.id).await.unwrap());
        assert!(matches!(
            storage.update_rule(&rule).await,
            Err(FraudWatchError::RuleNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_transactions_filtered_and_sorted() {
        let storage = InMemoryStorage::new();
        let base = Utc::now();

        for (user, offset) in [("a", 3), ("b", 1), ("a", 2)] {
            let event = TransactionEvent::new(user, 10.0, TransactionType::Payment, base + Duration::hours(offset));
            storage.append_transaction(&event).await.unwrap();
        }

        let filter = TransactionFilter { user_id: Some("a".to_string()), range: None };
        let listed = storage.list_transactions(&filter).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed[0].timestamp < listed[1].timestamp);
    }
}
