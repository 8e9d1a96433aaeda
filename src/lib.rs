//! FraudWatch - A rule-based transaction fraud decision engine
//!
//! Screens transaction events against administrator-defined rules and returns
//! an allow, block, review or notify decision:
//! - Declarative rules compiled into typed conditions, swapped in atomically
//! - Sliding-window aggregates (count, sum, average) per user and field
//! - Audited decisions with bounded retry on persistence
//! - Per-user risk profiles updated in the background
//! - Trend bucketing with statistical anomaly flags

pub mod aggregation;
pub mod condition;
pub mod config;
pub mod errors;
pub mod fraud_detection;
pub mod reporting;
pub mod risk_profile;
pub mod rule_store;
pub mod rules;
pub mod storage;
pub mod transaction;
pub mod trends;
pub mod utils;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinHandle;

pub use config::FraudWatchConfig;
pub use errors::{FraudWatchError, Result};
pub use fraud_detection::{AuditStatus, Decision, Evaluation, FraudEvent, RuleEngine};
pub use risk_profile::{RiskLevel, RiskProfile};
pub use rules::{ConditionSpec, Rule, RuleAction, RuleDraft, Severity};
pub use storage::{InMemoryStorage, Storage};
pub use transaction::{TransactionEvent, TransactionType};
pub use trends::TimePeriod;

use aggregation::AggregationWindow;
use condition::ConditionEvaluator;
use reporting::FraudReports;
use risk_profile::{profile_channel, RiskProfileCalculator};
use rule_store::RuleStore;
use storage::TransactionHistory;
use trends::TrendAnalyzer;
use utils::{Clock, RetryPolicy};

/// Every component wired once over a shared storage backend
pub struct FraudWatch {
    config: FraudWatchConfig,
    rules: Arc<RuleStore>,
    engine: RuleEngine,
    aggregation: Arc<AggregationWindow>,
    profiles: Arc<RiskProfileCalculator>,
    reports: FraudReports,
    trends: TrendAnalyzer,
    transactions: Arc<dyn TransactionHistory>,
    profile_worker: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

impl FraudWatch {
    /// Validate configuration, build the components, load the active rules and
    /// start the profile worker and window sweep. Requires a Tokio runtime.
    pub async fn new<S: Storage + 'static>(
        config: FraudWatchConfig,
        storage: Arc<S>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let retry = RetryPolicy::from_config(&config.persistence);
        let rules = Arc::new(RuleStore::load(storage.clone(), clock.clone()).await?);

        let aggregation = Arc::new(AggregationWindow::new(clock.clone()));
        let sweeper = aggregation.spawn_sweeper(config.window_sweep_interval());

        let profiles = Arc::new(RiskProfileCalculator::new(
            storage.clone(),
            storage.clone(),
            config.risk.clone(),
            clock.clone(),
            retry.clone(),
        ));
        let (profile_updates, queue) = profile_channel(config.profile_queue_capacity);
        let profile_worker = profiles.clone().spawn_worker(queue);

        let evaluator = ConditionEvaluator::new(aggregation.clone(), config.condition_timeout());
        let engine = RuleEngine::new(rules.clone(), evaluator, storage.clone(), clock, &config)
            .with_retry_policy(retry)
            .with_profile_updates(profile_updates);

        let snapshot = rules.get_active_rules();
        tracing::info!(
            active_rules = snapshot.len(),
            rejected_rules = snapshot.failures.len(),
            "FraudWatch initialised"
        );

        Ok(Self {
            reports: FraudReports::new(storage.clone()),
            trends: TrendAnalyzer::new(storage.clone(), config.trends.clone()),
            transactions: storage,
            config,
            rules,
            engine,
            aggregation,
            profiles,
            profile_worker,
            sweeper,
        })
    }

    /// Validate, evaluate and log a transaction. Only invalid input is an
    /// error; storage problems degrade the evaluation instead.
    pub async fn screen_transaction(&self, event: &TransactionEvent) -> Result<Evaluation> {
        event.validate()?;

        let evaluation = self.engine.evaluate(event).await;

        if let Err(e) = self.transactions.append_transaction(event).await {
            tracing::warn!(
                transaction_id = %event.transaction_id,
                user_id = %event.user_id,
                error = %e,
                "Failed to append transaction to history"
            );
        }

        Ok(evaluation)
    }

    pub fn config(&self) -> &FraudWatchConfig {
        &self.config
    }

    pub fn rules(&self) -> &RuleStore {
        &self.rules
    }

    pub fn engine(&self) -> &RuleEngine {
        &self.engine
    }

    pub fn aggregation(&self) -> &AggregationWindow {
        &self.aggregation
    }

    pub fn profiles(&self) -> &RiskProfileCalculator {
        &self.profiles
    }

    pub fn reports(&self) -> &FraudReports {
        &self.reports
    }

    pub fn trends(&self) -> &TrendAnalyzer {
        &self.trends
    }

    /// Get engine statistics for monitoring
    pub fn get_statistics(&self) -> HashMap<String, f64> {
        let mut stats = self.engine.get_statistics();
        stats.insert("active_rules".to_string(), self.rules.get_active_rules().len() as f64);
        stats.insert("window_keys".to_string(), self.aggregation.key_count() as f64);
        stats.insert("profile_persist_failures".to_string(), self.profiles.persist_failures() as f64);
        stats
    }

    /// Stop background work after applying every queued profile update
    pub async fn shutdown(self) {
        let FraudWatch { engine, profile_worker, sweeper, .. } = self;

        sweeper.abort();
        drop(engine);
        if let Err(e) = profile_worker.await {
            tracing::error!(error = %e, "Risk profile worker ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ManualClock;
    use chrono::Utc;
    use serde_json::json;

    async fn framework() -> FraudWatch {
        let storage = Arc::new(InMemoryStorage::new());
        FraudWatch::new(FraudWatchConfig::default(), storage, ManualClock::new(Utc::now()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_framework_initialization() {
        let framework = framework().await;
        assert!(framework.config().condition_timeout_ms > 0);
        assert!(framework.rules().get_active_rules().is_empty());
        assert_eq!(framework.get_statistics()["active_rules"], 0.0);
        assert_eq!(framework.get_statistics()["profile_persist_failures"], 0.0);
        framework.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = FraudWatchConfig::default();
        config.risk.high_threshold = 10.0;

        let result = FraudWatch::new(config, Arc::new(InMemoryStorage::new()), ManualClock::new(Utc::now())).await;
        assert!(matches!(result, Err(FraudWatchError::Config { .. })));
    }

    #[tokio::test]
    async fn test_invalid_transaction_rejected() {
        let framework = framework().await;
        let event = TransactionEvent::new("", 10.0, TransactionType::Payment, Utc::now());
        assert!(matches!(
            framework.screen_transaction(&event).await,
            Err(FraudWatchError::Validation { .. })
        ));

        let event = TransactionEvent::new("user", -5.0, TransactionType::Payment, Utc::now());
        assert!(framework.screen_transaction(&event).await.is_err());
    }

    #[tokio::test]
    async fn test_screen_updates_profile_after_shutdown_drain() {
        let storage = Arc::new(InMemoryStorage::new());
        let clock = ManualClock::new(Utc::now());
        let framework = FraudWatch::new(FraudWatchConfig::default(), storage.clone(), clock.clone())
            .await
            .unwrap();

        framework
            .rules()
            .create_rule(
                RuleDraft::new("large amount", Severity::Critical, RuleAction::Block)
                    .when(ConditionSpec::new("amount", "greaterThan", json!(1000))),
            )
            .await
            .unwrap();

        let event = TransactionEvent::new("user-9", 5000.0, TransactionType::Withdrawal, clock.now());
        let evaluation = framework.screen_transaction(&event).await.unwrap();
        assert_eq!(evaluation.decision.action, RuleAction::Block);
        framework.shutdown().await;

        let calculator = RiskProfileCalculator::new(
            storage.clone(),
            storage.clone(),
            FraudWatchConfig::default().risk,
            clock.clone(),
            RetryPolicy::none(),
        );
        let profile = calculator.get_profile("user-9").await.unwrap();
        assert_eq!(profile.score, 30.0);
        assert_eq!(profile.trigger_count, 1);

        let logged = storage
            .list_transactions(&storage::TransactionFilter::default())
            .await
            .unwrap();
        assert_eq!(logged.len(), 1);
    }
}
