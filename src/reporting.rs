//! Read-only queries over the fraud event audit trail

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::fraud_detection::FraudEvent;
use crate::rules::{RuleAction, Severity};
use crate::storage::{DateRange, EventFilter, FraudEventStore, Page};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FraudStats {
    pub range: DateRange,
    pub total_events: usize,
    pub by_action: BTreeMap<String, usize>,
    pub by_severity: BTreeMap<String, usize>,
    pub unique_users: usize,
    /// Share of events routed to manual review, in percent
    pub review_rate: f64,
}

pub struct FraudReports {
    events: Arc<dyn FraudEventStore>,
}

impl FraudReports {
    pub fn new(events: Arc<dyn FraudEventStore>) -> Self {
        Self { events }
    }

    /// Events awaiting manual review, newest first
    pub async fn pending_reviews(&self, page: Page) -> Result<Vec<FraudEvent>> {
        let filter = EventFilter {
            action: Some(RuleAction::Review),
            page: Some(page),
            ..Default::default()
        };
        self.events.list_events(&filter).await
    }

    pub async fn list_events(&self, filter: &EventFilter) -> Result<Vec<FraudEvent>> {
        self.events.list_events(filter).await
    }

    pub async fn stats(&self, range: DateRange) -> Result<FraudStats> {
        let filter = EventFilter { range: Some(range), ..Default::default() };
        let events = self.events.list_events(&filter).await?;

        let mut by_action = BTreeMap::new();
        let mut by_severity = BTreeMap::new();
        let mut users = HashSet::new();
        for event in &events {
            *by_action.entry(event.action.as_str().to_string()).or_insert(0) += 1;
            *by_severity.entry(event.severity.as_str().to_string()).or_insert(0) += 1;
            users.insert(event.user_id.as_str());
        }

        let reviews = events.iter().filter(|e| e.action == RuleAction::Review).count();
        let review_rate = if events.is_empty() {
            0.0
        } else {
            reviews as f64 / events.len() as f64 * 100.0
        };

        Ok(FraudStats {
            range,
            total_events: events.len(),
            by_action,
            by_severity,
            unique_users: users.len(),
            review_rate,
        })
    }

    /// Number of events at or above `severity` in the range
    pub async fn count_at_least(&self, range: DateRange, severity: Severity) -> Result<usize> {
        let filter = EventFilter { range: Some(range), ..Default::default() };
        let events = self.events.list_events(&filter).await?;
        Ok(events.iter().filter(|e| e.severity >= severity).count())
    }
}
