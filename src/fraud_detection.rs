//! Rule engine for FraudWatch
//! Screens transactions against the active rule set and arbitrates a decision

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::condition::{ConditionEvaluator, ConditionOutcome};
use crate::config::FraudWatchConfig;
use crate::risk_profile::{ProfileUpdate, ProfileUpdateSender};
use crate::rule_store::{RuleSnapshot, RuleStore};
use crate::rules::{CompiledRule, RuleAction, Severity};
use crate::storage::FraudEventStore;
use crate::transaction::{TransactionEvent, TransactionType};
use crate::utils::{Clock, RetryPolicy};

/// Outcome of screening one transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: RuleAction,
    /// Absent on the default allow
    pub severity: Option<Severity>,
    pub matched_rule_id: Option<Uuid>,
}

impl Decision {
    pub fn allow() -> Self {
        Self { action: RuleAction::Allow, severity: None, matched_rule_id: None }
    }

    fn from_rule(rule: &CompiledRule) -> Self {
        Self {
            action: rule.rule.action,
            severity: Some(rule.rule.severity),
            matched_rule_id: Some(rule.id()),
        }
    }

    pub fn is_allow(&self) -> bool {
        self.action == RuleAction::Allow
    }
}

/// Append-only audit record written for every non-allow decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FraudEvent {
    pub id: Uuid,
    pub user_id: String,
    pub event_type: TransactionType,
    pub transaction_id: Uuid,
    pub rule_id: Option<Uuid>,
    pub rule_name: String,
    pub action: RuleAction,
    pub severity: Severity,
    pub context: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationStage {
    Received,
    ConditionsEvaluated,
    Arbitrated,
    Decided,
}

/// Whether the audit trail captured a decision
#[derive(Debug, Clone, PartialEq)]
pub enum AuditStatus {
    NotRequired,
    Recorded(Uuid),
    Degraded(String),
}

/// A condition that could not be evaluated and was treated as not matched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradedCondition {
    pub rule_id: Uuid,
    pub condition_index: usize,
    pub field: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub decision: Decision,
    pub audit: AuditStatus,
    /// Every rule whose conditions all held, oldest first
    pub matched_rules: Vec<Uuid>,
    pub degraded: Vec<DegradedCondition>,
}

#[derive(Debug, Default)]
pub struct EngineStatistics {
    evaluated: AtomicU64,
    allowed: AtomicU64,
    blocked: AtomicU64,
    reviewed: AtomicU64,
    notified: AtomicU64,
    degraded_conditions: AtomicU64,
    audit_failures: AtomicU64,
    profile_updates_dropped: AtomicU64,
}

impl EngineStatistics {
    fn record_decision(&self, action: RuleAction) {
        self.evaluated.fetch_add(1, Ordering::Relaxed);
        let counter = match action {
            RuleAction::Allow => &self.allowed,
            RuleAction::Block => &self.blocked,
            RuleAction::Review => &self.reviewed,
            RuleAction::Notify => &self.notified,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct RuleEngine {
    rules: Arc<RuleStore>,
    evaluator: ConditionEvaluator,
    events: Arc<dyn FraudEventStore>,
    profile_updates: Option<ProfileUpdateSender>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    applied_generation: AtomicU64,
    statistics: EngineStatistics,
}

impl RuleEngine {
    pub fn new(
        rules: Arc<RuleStore>,
        evaluator: ConditionEvaluator,
        events: Arc<dyn FraudEventStore>,
        clock: Arc<dyn Clock>,
        config: &FraudWatchConfig,
    ) -> Self {
        Self {
            rules,
            evaluator,
            events,
            profile_updates: None,
            retry: RetryPolicy::from_config(&config.persistence),
            clock,
            applied_generation: AtomicU64::new(0),
            statistics: EngineStatistics::default(),
        }
    }

    /// Queue risk profile updates for non-allow decisions
    pub fn with_profile_updates(mut self, sender: ProfileUpdateSender) -> Self {
        self.profile_updates = Some(sender);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Screen a transaction. Never fails: backend problems surface as
    /// degraded conditions or a degraded audit status.
    pub async fn evaluate(&self, event: &TransactionEvent) -> Evaluation {
        let snapshot = self.rules.get_active_rules();
        self.trace_stage(EvaluationStage::Received, event);

        self.sync_retention(&snapshot);
        self.record_aggregates(&snapshot, event).await;

        let mut matched: Vec<&Arc<CompiledRule>> = Vec::new();
        let mut degraded = Vec::new();
        for rule in &snapshot.rules {
            if self.rule_matches(rule, event, &mut degraded).await {
                matched.push(rule);
            }
        }
        self.trace_stage(EvaluationStage::ConditionsEvaluated, event);

        let winner = arbitrate(&matched);
        let decision = winner.map_or_else(Decision::allow, |rule| Decision::from_rule(rule));
        self.trace_stage(EvaluationStage::Arbitrated, event);

        let matched_rules: Vec<Uuid> = matched.iter().map(|r| r.id()).collect();
        let audit = match winner {
            Some(rule) if !decision.is_allow() => {
                let audit = self.record_fraud_event(event, rule, &matched_rules, &degraded).await;
                self.queue_profile_update(event, rule);
                audit
            }
            _ => AuditStatus::NotRequired,
        };

        self.statistics.record_decision(decision.action);
        self.statistics
            .degraded_conditions
            .fetch_add(degraded.len() as u64, Ordering::Relaxed);

        tracing::debug!(
            stage = ?EvaluationStage::Decided,
            transaction_id = %event.transaction_id,
            user_id = %event.user_id,
            action = decision.action.as_str(),
            matched = matched_rules.len(),
            "Transaction screened"
        );

        Evaluation { decision, audit, matched_rules, degraded }
    }

    fn trace_stage(&self, stage: EvaluationStage, event: &TransactionEvent) {
        tracing::debug!(stage = ?stage, transaction_id = %event.transaction_id, user_id = %event.user_id);
    }

    /// Push retention windows into the aggregate source once per rule set
    fn sync_retention(&self, snapshot: &RuleSnapshot) {
        let previous = self.applied_generation.swap(snapshot.generation, Ordering::AcqRel);
        if previous != snapshot.generation {
            self.evaluator.source().configure_retention(&snapshot.aggregated_fields);
        }
    }

    async fn record_aggregates(&self, snapshot: &RuleSnapshot, event: &TransactionEvent) {
        for field in snapshot.aggregated_fields.keys() {
            let Some(value) = event.field_value(field) else {
                continue;
            };
            // Non-numeric values are counted but never summed
            if let Err(e) = self
                .evaluator
                .source()
                .record(&event.user_id, field, value.as_number(), event.timestamp)
                .await
            {
                tracing::warn!(
                    user_id = %event.user_id,
                    field = %field,
                    error = %e,
                    "Failed to record transaction into aggregation window"
                );
            }
        }
    }

    /// All conditions must hold; stops at the first that does not
    async fn rule_matches(
        &self,
        rule: &CompiledRule,
        event: &TransactionEvent,
        degraded: &mut Vec<DegradedCondition>,
    ) -> bool {
        for (index, condition) in rule.conditions.iter().enumerate() {
            match self.evaluator.evaluate(condition, event).await {
                ConditionOutcome::Matched => {}
                ConditionOutcome::NotMatched => return false,
                ConditionOutcome::Degraded(reason) => {
                    tracing::warn!(
                        rule_id = %rule.id(),
                        user_id = %event.user_id,
                        field = %condition.field,
                        reason = %reason,
                        "Condition degraded, treated as not matched"
                    );
                    degraded.push(DegradedCondition {
                        rule_id: rule.id(),
                        condition_index: index,
                        field: condition.field.to_string(),
                        reason,
                    });
                    return false;
                }
            }
        }
        true
    }

    async fn record_fraud_event(
        &self,
        event: &TransactionEvent,
        rule: &CompiledRule,
        matched_rules: &[Uuid],
        degraded: &[DegradedCondition],
    ) -> AuditStatus {
        let fraud_event = FraudEvent {
            id: Uuid::new_v4(),
            user_id: event.user_id.clone(),
            event_type: event.transaction_type,
            transaction_id: event.transaction_id,
            rule_id: Some(rule.id()),
            rule_name: rule.rule.name.clone(),
            action: rule.rule.action,
            severity: rule.rule.severity,
            context: serde_json::json!({
                "transaction": event,
                "transactionDigest": event.digest(),
                "ruleFingerprint": rule.fingerprint,
                "matchedRuleIds": matched_rules,
                "degradedConditions": degraded,
            }),
            created_at: self.clock.now(),
        };

        match self
            .retry
            .run("insert fraud event", || self.events.insert_event(&fraud_event))
            .await
        {
            Ok(()) => AuditStatus::Recorded(fraud_event.id),
            Err(e) => {
                self.statistics.audit_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    transaction_id = %event.transaction_id,
                    user_id = %event.user_id,
                    rule_id = %rule.id(),
                    error = %e,
                    "Fraud event could not be persisted"
                );
                AuditStatus::Degraded(e.to_string())
            }
        }
    }

    fn queue_profile_update(&self, event: &TransactionEvent, rule: &CompiledRule) {
        let Some(sender) = &self.profile_updates else {
            return;
        };
        let queued = sender.enqueue(ProfileUpdate {
            user_id: event.user_id.clone(),
            rule_id: Some(rule.id()),
            rule_name: rule.rule.name.clone(),
            severity: rule.rule.severity,
            occurred_at: self.clock.now(),
        });
        if !queued {
            self.statistics.profile_updates_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Running counters, with percentages once anything was screened
    pub fn get_statistics(&self) -> HashMap<String, f64> {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed) as f64;
        let s = &self.statistics;

        let mut stats = HashMap::new();
        let total = load(&s.evaluated);
        stats.insert("total_evaluated".to_string(), total);
        stats.insert("allowed".to_string(), load(&s.allowed));
        stats.insert("blocked".to_string(), load(&s.blocked));
        stats.insert("reviewed".to_string(), load(&s.reviewed));
        stats.insert("notified".to_string(), load(&s.notified));
        stats.insert("degraded_conditions".to_string(), load(&s.degraded_conditions));
        stats.insert("audit_failures".to_string(), load(&s.audit_failures));
        stats.insert("profile_updates_dropped".to_string(), load(&s.profile_updates_dropped));

        if total > 0.0 {
            stats.insert("block_rate_percent".to_string(), load(&s.blocked) / total * 100.0);
            stats.insert("review_rate_percent".to_string(), load(&s.reviewed) / total * 100.0);
        }

        stats
    }
}

/// Highest severity wins; ties go to the earliest created rule
fn arbitrate<'a>(matched: &[&'a Arc<CompiledRule>]) -> Option<&'a Arc<CompiledRule>> {
    let mut best: Option<&'a Arc<CompiledRule>> = None;
    for &candidate in matched {
        best = match best {
            None => Some(candidate),
            Some(current) => {
                let (c, b) = (&candidate.rule, &current.rule);
                let wins = c.severity > b.severity
                    || (c.severity == b.severity && (c.created_at, c.id) < (b.created_at, b.id));
                Some(if wins { candidate } else { current })
            }
        };
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::{AggregateSource, AggregationWindow};
    use crate::errors::{FraudWatchError, Result};
    use crate::risk_profile::profile_channel;
    use crate::rules::{AggregationKind, ConditionSpec, Field, RuleDraft};
    use crate::storage::{EventFilter, InMemoryStorage};
    use crate::utils::ManualClock;
    use async_trait::async_trait;
    use chrono::Duration;
    use serde_json::json;
    use std::time::Duration as StdDuration;

    struct Harness {
        engine: RuleEngine,
        rules: Arc<RuleStore>,
        storage: Arc<InMemoryStorage>,
        clock: Arc<ManualClock>,
    }

    async fn harness_with(
        source: Option<Arc<dyn AggregateSource>>,
        events: Option<Arc<dyn FraudEventStore>>,
    ) -> Harness {
        let storage = Arc::new(InMemoryStorage::new());
        let clock = ManualClock::new(Utc::now());
        let rules = Arc::new(RuleStore::load(storage.clone(), clock.clone()).await.unwrap());
        let source: Arc<dyn AggregateSource> = match source {
            Some(source) => source,
            None => Arc::new(AggregationWindow::new(clock.clone())),
        };
        let events: Arc<dyn FraudEventStore> = match events {
            Some(events) => events,
            None => storage.clone(),
        };

        let engine = RuleEngine::new(
            rules.clone(),
            ConditionEvaluator::new(source, StdDuration::from_millis(50)),
            events,
            clock.clone(),
            &FraudWatchConfig::default(),
        )
        .with_retry_policy(RetryPolicy::none());

        Harness { engine, rules, storage, clock }
    }

    async fn harness() -> Harness {
        harness_with(None, None).await
    }

    fn txn(amount: f64) -> TransactionEvent {
        TransactionEvent::new("user-1", amount, TransactionType::Transfer, Utc::now()).with_country("NG")
    }

    fn amount_over(name: &str, threshold: f64, severity: Severity, action: RuleAction) -> RuleDraft {
        RuleDraft::new(name, severity, action).when(ConditionSpec::new("amount", "greaterThan", json!(threshold)))
    }

    struct FailingEvents;

    #[async_trait]
    impl FraudEventStore for FailingEvents {
        async fn insert_event(&self, _event: &FraudEvent) -> Result<()> {
            Err(FraudWatchError::storage("database unavailable"))
        }

        async fn list_events(&self, _filter: &EventFilter) -> Result<Vec<FraudEvent>> {
            Ok(Vec::new())
        }
    }

    struct StalledEvents;

    #[async_trait]
    impl FraudEventStore for StalledEvents {
        async fn insert_event(&self, _event: &FraudEvent) -> Result<()> {
            std::future::pending().await
        }

        async fn list_events(&self, _filter: &EventFilter) -> Result<Vec<FraudEvent>> {
            Ok(Vec::new())
        }
    }

    struct OfflineSource;

    #[async_trait]
    impl AggregateSource for OfflineSource {
        fn configure_retention(&self, _windows: &HashMap<Field, Duration>) {}

        async fn record(&self, _: &str, _: &Field, _: Option<f64>, _: DateTime<Utc>) -> Result<()> {
            Err(FraudWatchError::Aggregation { message: "offline".to_string() })
        }

        async fn aggregate(&self, _: &str, _: &Field, _: AggregationKind, _: Duration) -> Result<f64> {
            Err(FraudWatchError::Aggregation { message: "offline".to_string() })
        }
    }

    #[tokio::test]
    async fn test_no_rules_always_allows() {
        let h = harness().await;

        for amount in [0.01, 999.0, 1_000_000.0] {
            let evaluation = h.engine.evaluate(&txn(amount)).await;
            assert_eq!(evaluation.decision, Decision::allow());
            assert_eq!(evaluation.audit, AuditStatus::NotRequired);
            assert!(evaluation.matched_rules.is_empty());
        }
        assert!(h.storage.list_events(&EventFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_large_amount_goes_to_review() {
        let h = harness().await;
        let rule = h
            .rules
            .create_rule(amount_over("large amount", 1000.0, Severity::High, RuleAction::Review))
            .await
            .unwrap();

        let flagged = h.engine.evaluate(&txn(1500.0)).await;
        assert_eq!(flagged.decision.action, RuleAction::Review);
        assert_eq!(flagged.decision.severity, Some(Severity::High));
        assert_eq!(flagged.decision.matched_rule_id, Some(rule.id));

        let passed = h.engine.evaluate(&txn(900.0)).await;
        assert_eq!(passed.decision, Decision::allow());
    }

    #[tokio::test]
    async fn test_critical_beats_high_regardless_of_order() {
        for critical_first in [true, false] {
            let h = harness().await;
            let high = amount_over("high", 100.0, Severity::High, RuleAction::Review);
            let critical = amount_over("critical", 100.0, Severity::Critical, RuleAction::Block);

            let (first, second) = if critical_first { (critical, high) } else { (high, critical) };
            h.rules.create_rule(first).await.unwrap();
            h.clock.advance(Duration::seconds(1));
            h.rules.create_rule(second).await.unwrap();

            let evaluation = h.engine.evaluate(&txn(500.0)).await;
            assert_eq!(evaluation.decision.action, RuleAction::Block);
            assert_eq!(evaluation.decision.severity, Some(Severity::Critical));
            assert_eq!(evaluation.matched_rules.len(), 2);
        }
    }

    #[tokio::test]
    async fn test_equal_severity_prefers_earliest_rule() {
        let h = harness().await;
        let earliest = h
            .rules
            .create_rule(amount_over("first", 100.0, Severity::Medium, RuleAction::Notify))
            .await
            .unwrap();
        h.clock.advance(Duration::seconds(1));
        h.rules
            .create_rule(amount_over("second", 100.0, Severity::Medium, RuleAction::Review))
            .await
            .unwrap();

        let evaluation = h.engine.evaluate(&txn(500.0)).await;
        assert_eq!(evaluation.decision.matched_rule_id, Some(earliest.id));
        assert_eq!(evaluation.decision.action, RuleAction::Notify);
    }

    #[tokio::test]
    async fn test_conditions_combine_with_and() {
        let h = harness().await;
        h.rules
            .create_rule(
                RuleDraft::new("big transfer abroad", Severity::High, RuleAction::Block)
                    .when(ConditionSpec::new("amount", "gt", json!(1000)))
                    .when(ConditionSpec::new("country", "in", json!(["RU", "KP"]))),
            )
            .await
            .unwrap();

        assert!(h.engine.evaluate(&txn(5000.0)).await.decision.is_allow());
        let abroad = txn(5000.0).with_country("KP");
        assert_eq!(h.engine.evaluate(&abroad).await.decision.action, RuleAction::Block);
    }

    #[tokio::test]
    async fn test_non_allow_decision_is_audited() {
        let h = harness().await;
        let rule = h
            .rules
            .create_rule(amount_over("large amount", 1000.0, Severity::High, RuleAction::Review))
            .await
            .unwrap();

        let event = txn(2500.0);
        let evaluation = h.engine.evaluate(&event).await;
        let AuditStatus::Recorded(event_id) = evaluation.audit else {
            panic!("expected recorded audit, got {:?}", evaluation.audit);
        };

        let stored = h.storage.list_events(&EventFilter::for_user("user-1")).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, event_id);
        assert_eq!(stored[0].rule_id, Some(rule.id));
        assert_eq!(stored[0].transaction_id, event.transaction_id);
        assert_eq!(stored[0].event_type, TransactionType::Transfer);
        assert_eq!(stored[0].context["transaction"]["amount"], json!(2500.0));
    }

    #[tokio::test]
    async fn test_matched_allow_rule_is_not_audited() {
        let h = harness().await;
        let rule = h
            .rules
            .create_rule(amount_over("trusted", 0.0, Severity::Low, RuleAction::Allow))
            .await
            .unwrap();

        let evaluation = h.engine.evaluate(&txn(50.0)).await;
        assert_eq!(evaluation.decision.matched_rule_id, Some(rule.id));
        assert!(evaluation.decision.is_allow());
        assert_eq!(evaluation.audit, AuditStatus::NotRequired);
    }

    #[tokio::test]
    async fn test_audit_failure_still_returns_decision() {
        let h = harness_with(None, Some(Arc::new(FailingEvents) as Arc<dyn FraudEventStore>)).await;
        h.rules
            .create_rule(amount_over("large amount", 1000.0, Severity::High, RuleAction::Block))
            .await
            .unwrap();

        let evaluation = h.engine.evaluate(&txn(5000.0)).await;
        assert_eq!(evaluation.decision.action, RuleAction::Block);
        assert!(matches!(evaluation.audit, AuditStatus::Degraded(_)));
        assert_eq!(h.engine.get_statistics()["audit_failures"], 1.0);
    }

    #[tokio::test]
    async fn test_stalled_audit_write_is_bounded() {
        let h = harness_with(None, Some(Arc::new(StalledEvents) as Arc<dyn FraudEventStore>)).await;
        let engine = h.engine.with_retry_policy(RetryPolicy {
            attempt_timeout: StdDuration::from_millis(20),
            ..RetryPolicy::none()
        });
        h.rules
            .create_rule(amount_over("large amount", 1000.0, Severity::High, RuleAction::Block))
            .await
            .unwrap();

        let evaluation = tokio::time::timeout(StdDuration::from_secs(2), engine.evaluate(&txn(5000.0)))
            .await
            .expect("evaluation must not wait on a stalled store");
        assert_eq!(evaluation.decision.action, RuleAction::Block);
        match evaluation.audit {
            AuditStatus::Degraded(reason) => assert!(reason.contains("Timeout")),
            other => panic!("expected degraded audit, got {:?}", other),
        }
        assert_eq!(engine.get_statistics()["audit_failures"], 1.0);
    }

    #[tokio::test]
    async fn test_unavailable_aggregates_fail_closed() {
        let h = harness_with(Some(Arc::new(OfflineSource) as Arc<dyn AggregateSource>), None).await;
        h.rules
            .create_rule(
                RuleDraft::new("velocity", Severity::High, RuleAction::Block)
                    .when(ConditionSpec::new("amount", "gte", json!(1)).aggregated("count", "1h")),
            )
            .await
            .unwrap();

        let evaluation = h.engine.evaluate(&txn(100.0)).await;
        assert!(evaluation.decision.is_allow());
        assert_eq!(evaluation.degraded.len(), 1);
        assert_eq!(evaluation.degraded[0].field, "amount");
    }

    #[tokio::test]
    async fn test_velocity_window_includes_current_transaction() {
        let h = harness().await;
        h.rules
            .create_rule(
                RuleDraft::new("velocity", Severity::Medium, RuleAction::Review)
                    .when(ConditionSpec::new("amount", "gte", json!(3)).aggregated("count", "10m")),
            )
            .await
            .unwrap();

        let now = h.clock.now();
        let at = |offset: i64| {
            TransactionEvent::new("user-1", 20.0, TransactionType::Payment, now + Duration::seconds(offset))
        };

        assert!(h.engine.evaluate(&at(0)).await.decision.is_allow());
        assert!(h.engine.evaluate(&at(1)).await.decision.is_allow());
        assert_eq!(h.engine.evaluate(&at(2)).await.decision.action, RuleAction::Review);

        let other = TransactionEvent::new("user-2", 20.0, TransactionType::Payment, now);
        assert!(h.engine.evaluate(&other).await.decision.is_allow());
    }

    #[tokio::test]
    async fn test_non_numeric_values_never_feed_sums() {
        let h = harness().await;
        h.rules
            .create_rule(
                RuleDraft::new("fee volume", Severity::High, RuleAction::Block)
                    .when(ConditionSpec::new("metadata.fee", "gte", json!(3)).aggregated("sum", "1h")),
            )
            .await
            .unwrap();

        for _ in 0..3 {
            let event = txn(10.0).with_metadata("fee", json!("n/a"));
            assert!(h.engine.evaluate(&event).await.decision.is_allow());
        }

        let numeric = txn(10.0).with_metadata("fee", json!(3));
        assert_eq!(h.engine.evaluate(&numeric).await.decision.action, RuleAction::Block);
    }

    #[tokio::test]
    async fn test_profile_update_queued_for_flagged_transaction() {
        let h = harness().await;
        let (sender, mut rx) = profile_channel(4);
        let engine = h.engine.with_profile_updates(sender);
        h.rules
            .create_rule(amount_over("large amount", 1000.0, Severity::High, RuleAction::Review))
            .await
            .unwrap();

        engine.evaluate(&txn(10.0)).await;
        engine.evaluate(&txn(2000.0)).await;

        let update = rx.try_recv().unwrap();
        assert_eq!(update.user_id, "user-1");
        assert_eq!(update.severity, Severity::High);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_statistics_tracking() {
        let h = harness().await;
        h.rules
            .create_rule(amount_over("large amount", 1000.0, Severity::High, RuleAction::Block))
            .await
            .unwrap();

        h.engine.evaluate(&txn(10.0)).await;
        h.engine.evaluate(&txn(10.0)).await;
        h.engine.evaluate(&txn(10.0)).await;
        h.engine.evaluate(&txn(2000.0)).await;

        let stats = h.engine.get_statistics();
        assert_eq!(stats["total_evaluated"], 4.0);
        assert_eq!(stats["allowed"], 3.0);
        assert_eq!(stats["blocked"], 1.0);
        assert_eq!(stats["block_rate_percent"], 25.0);
    }
}
