//! Active rule set with copy-on-write reloads
//!
//! Readers load the current [`RuleSnapshot`] through an [`ArcSwap`] and keep
//! it for the whole evaluation, so a concurrent reload never changes the rules
//! an in-flight transaction sees. Writers (rule CRUD) are rare; they serialize
//! on an async mutex while the next snapshot is compiled.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::errors::{FraudWatchError, Result};
use crate::rules::{compile, CompiledRule, Field, Rule, RuleDraft};
use crate::storage::RuleRepository;
use crate::utils::Clock;

/// A rule excluded from the active set
#[derive(Debug, Clone, PartialEq)]
pub struct RuleCompileFailure {
    pub rule_id: Uuid,
    pub name: String,
    pub reason: String,
}

/// Immutable view of the compiled, active rules
#[derive(Debug)]
pub struct RuleSnapshot {
    /// Oldest first
    pub rules: Vec<Arc<CompiledRule>>,
    /// Longest window configured per aggregated field
    pub aggregated_fields: HashMap<Field, Duration>,
    pub failures: Vec<RuleCompileFailure>,
    /// Increases on every reload
    pub generation: u64,
    pub loaded_at: DateTime<Utc>,
}

impl RuleSnapshot {
    fn empty(now: DateTime<Utc>) -> Self {
        Self {
            rules: Vec::new(),
            aggregated_fields: HashMap::new(),
            failures: Vec::new(),
            generation: 0,
            loaded_at: now,
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn get(&self, id: Uuid) -> Option<&Arc<CompiledRule>> {
        self.rules.iter().find(|r| r.id() == id)
    }
}

pub struct RuleStore {
    repository: Arc<dyn RuleRepository>,
    active: ArcSwap<RuleSnapshot>,
    writer: Mutex<()>,
    clock: Arc<dyn Clock>,
}

impl RuleStore {
    /// Create a store with an empty active set; call [`reload`](Self::reload) to populate it
    pub fn new(repository: Arc<dyn RuleRepository>, clock: Arc<dyn Clock>) -> Self {
        Self {
            active: ArcSwap::from_pointee(RuleSnapshot::empty(clock.now())),
            repository,
            writer: Mutex::new(()),
            clock,
        }
    }

    /// Create a store and load the active set from the repository
    pub async fn load(repository: Arc<dyn RuleRepository>, clock: Arc<dyn Clock>) -> Result<Self> {
        let store = Self::new(repository, clock);
        store.reload().await?;
        Ok(store)
    }

    /// Current snapshot; lock-free
    pub fn get_active_rules(&self) -> Arc<RuleSnapshot> {
        self.active.load_full()
    }

    /// Recompile the active set from the repository and swap it in. On a
    /// repository error the previous snapshot stays in place.
    pub async fn reload(&self) -> Result<Arc<RuleSnapshot>> {
        let _guard = self.writer.lock().await;
        self.rebuild().await
    }

    async fn rebuild(&self) -> Result<Arc<RuleSnapshot>> {
        let stored = self.repository.load_rules().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to load rules, keeping previous rule set");
            e
        })?;

        let mut rules = Vec::new();
        let mut failures = Vec::new();

        for rule in stored.iter().filter(|r| r.is_active) {
            match compile(rule) {
                Ok(compiled) => rules.push(Arc::new(compiled)),
                Err(e) => {
                    tracing::error!(
                        rule_id = %rule.id,
                        rule_name = %rule.name,
                        error = %e,
                        "Rule failed to compile, excluded from active set"
                    );
                    failures.push(RuleCompileFailure {
                        rule_id: rule.id,
                        name: rule.name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        rules.sort_by(|a, b| {
            a.rule
                .created_at
                .cmp(&b.rule.created_at)
                .then_with(|| a.rule.id.cmp(&b.rule.id))
        });

        let mut aggregated_fields: HashMap<Field, Duration> = HashMap::new();
        for rule in &rules {
            for (field, window) in rule.aggregated_windows() {
                let longest = aggregated_fields.entry(field.clone()).or_insert(window);
                if window > *longest {
                    *longest = window;
                }
            }
        }

        let snapshot = Arc::new(RuleSnapshot {
            rules,
            aggregated_fields,
            failures,
            generation: self.active.load().generation + 1,
            loaded_at: self.clock.now(),
        });
        self.active.store(snapshot.clone());

        tracing::info!(
            active = snapshot.rules.len(),
            rejected = snapshot.failures.len(),
            generation = snapshot.generation,
            "Rule set reloaded"
        );

        Ok(snapshot)
    }

    /// Validate and store a new rule, then reload
    pub async fn create_rule(&self, draft: RuleDraft) -> Result<Rule> {
        let rule = draft.into_rule(self.clock.now());
        validate(&rule)?;

        let _guard = self.writer.lock().await;
        self.repository.insert_rule(&rule).await?;
        tracing::info!(rule_id = %rule.id, rule_name = %rule.name, "Rule created");
        self.rebuild().await?;
        Ok(rule)
    }

    /// Replace the body of an existing rule, then reload
    pub async fn update_rule(&self, id: Uuid, draft: RuleDraft) -> Result<Rule> {
        let _guard = self.writer.lock().await;
        let existing = self
            .repository
            .get_rule(id)
            .await?
            .ok_or_else(|| FraudWatchError::RuleNotFound { rule_id: id.to_string() })?;

        let rule = draft.apply_to(&existing, self.clock.now());
        validate(&rule)?;

        self.repository.update_rule(&rule).await?;
        tracing::info!(rule_id = %rule.id, rule_name = %rule.name, "Rule updated");
        self.rebuild().await?;
        Ok(rule)
    }

    /// Remove a rule, then reload
    pub async fn delete_rule(&self, id: Uuid) -> Result<()> {
        let _guard = self.writer.lock().await;
        if !self.repository.delete_rule(id).await? {
            return Err(FraudWatchError::RuleNotFound { rule_id: id.to_string() });
        }
        tracing::info!(rule_id = %id, "Rule deleted");
        self.rebuild().await?;
        Ok(())
    }

    /// Every stored rule, oldest first, including inactive ones
    pub async fn list_rules(&self) -> Result<Vec<Rule>> {
        let mut rules = self.repository.load_rules().await?;
        rules.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(rules)
    }

    pub async fn get_rule(&self, id: Uuid) -> Result<Rule> {
        self.repository
            .get_rule(id)
            .await?
            .ok_or_else(|| FraudWatchError::RuleNotFound { rule_id: id.to_string() })
    }
}

/// Administrative input is rejected before anything is written
fn validate(rule: &Rule) -> Result<()> {
    match compile(rule) {
        Ok(_) => Ok(()),
        Err(FraudWatchError::RuleCompile { reason, .. }) => Err(FraudWatchError::Validation { message: reason }),
        Err(other) => Err(other),
    }
}
