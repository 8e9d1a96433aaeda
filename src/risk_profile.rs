//! Per-user risk profiles derived from triggered rules
//!
//! Profiles are updated off the decision path: the engine enqueues a
//! [`ProfileUpdate`] and a background worker applies it. Each update decays the
//! previous score linearly for the time elapsed, adds the severity increment,
//! persists the profile and appends an immutable history snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::RiskScoringConfig;
use crate::errors::Result;
use crate::rules::Severity;
use crate::storage::{EventFilter, FraudEventStore, Page, RiskProfileStore};
use crate::utils::{Clock, RetryPolicy};

const SECONDS_PER_DAY: f64 = 86_400.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// One trigger that contributed to a score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskFactor {
    pub rule_id: Option<Uuid>,
    pub description: String,
    pub severity: Severity,
    pub contribution: f64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskProfile {
    pub user_id: String,
    pub score: f64,
    pub level: RiskLevel,
    /// Most recent first
    pub factors: Vec<RiskFactor>,
    pub trigger_count: u64,
    pub last_updated: DateTime<Utc>,
}

impl RiskProfile {
    pub fn new(user_id: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            score: 0.0,
            level: RiskLevel::Low,
            factors: Vec::new(),
            trigger_count: 0,
            last_updated: at,
        }
    }
}

/// A triggered rule waiting to be folded into a profile
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileUpdate {
    pub user_id: String,
    pub rule_id: Option<Uuid>,
    pub rule_name: String,
    pub severity: Severity,
    pub occurred_at: DateTime<Utc>,
}

/// Non-blocking handle the engine uses to queue profile updates
#[derive(Debug, Clone)]
pub struct ProfileUpdateSender {
    tx: mpsc::Sender<ProfileUpdate>,
}

impl ProfileUpdateSender {
    /// Queue an update without waiting; returns false when it was dropped
    pub fn enqueue(&self, update: ProfileUpdate) -> bool {
        match self.tx.try_send(update) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(update)) => {
                tracing::warn!(user_id = %update.user_id, "Profile update queue full, update dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(update)) => {
                tracing::warn!(user_id = %update.user_id, "Profile worker stopped, update dropped");
                false
            }
        }
    }
}

pub fn profile_channel(capacity: usize) -> (ProfileUpdateSender, mpsc::Receiver<ProfileUpdate>) {
    let (tx, rx) = mpsc::channel(capacity);
    (ProfileUpdateSender { tx }, rx)
}

pub struct RiskProfileCalculator {
    profiles: Arc<dyn RiskProfileStore>,
    events: Arc<dyn FraudEventStore>,
    config: RiskScoringConfig,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    persist_failures: AtomicU64,
}

impl RiskProfileCalculator {
    pub fn new(
        profiles: Arc<dyn RiskProfileStore>,
        events: Arc<dyn FraudEventStore>,
        config: RiskScoringConfig,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
    ) -> Self {
        Self { profiles, events, config, clock, retry, persist_failures: AtomicU64::new(0) }
    }

    /// Profile or history writes that were given up on
    pub fn persist_failures(&self) -> u64 {
        self.persist_failures.load(Ordering::Relaxed)
    }

    /// Level for a score; monotonic in `score`
    pub fn level_for(&self, score: f64) -> RiskLevel {
        if score >= self.config.critical_threshold {
            RiskLevel::Critical
        } else if score >= self.config.high_threshold {
            RiskLevel::High
        } else if score >= self.config.medium_threshold {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    pub fn increment_for(&self, severity: Severity) -> f64 {
        match severity {
            Severity::Low => self.config.low_increment,
            Severity::Medium => self.config.medium_increment,
            Severity::High => self.config.high_increment,
            Severity::Critical => self.config.critical_increment,
        }
    }

    /// Score after linear decay between `from` and `to`
    pub fn decayed(&self, score: f64, from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
        let elapsed_days = (to - from).num_milliseconds().max(0) as f64 / 1000.0 / SECONDS_PER_DAY;
        (score - self.config.decay_per_day * elapsed_days).max(0.0)
    }

    /// Fold one trigger into a profile in memory
    fn accumulate(&self, profile: &mut RiskProfile, update: &ProfileUpdate) {
        let at = update.occurred_at.max(profile.last_updated);
        let base = self.decayed(profile.score, profile.last_updated, at);
        let score = (base + self.increment_for(update.severity)).min(self.config.max_score);

        profile.factors.insert(
            0,
            RiskFactor {
                rule_id: update.rule_id,
                description: update.rule_name.clone(),
                severity: update.severity,
                contribution: score - base,
                occurred_at: update.occurred_at,
            },
        );
        profile.factors.truncate(self.config.max_factors);

        profile.score = score;
        profile.level = self.level_for(score);
        profile.trigger_count += 1;
        profile.last_updated = at;
    }

    async fn persist(&self, profile: &RiskProfile) -> Result<()> {
        let saved = self
            .retry
            .run("save risk profile", || self.profiles.save_profile(profile))
            .await;
        if let Err(e) = saved {
            self.persist_failures.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }

        let appended = self
            .retry
            .run("append risk profile history", || self.profiles.append_history(profile))
            .await;
        if let Err(e) = &appended {
            self.persist_failures.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                user_id = %profile.user_id,
                score = profile.score,
                error = %e,
                "Risk profile saved without a history snapshot"
            );
        }
        appended
    }

    /// Apply a triggered rule to the user's profile and persist the result
    pub async fn apply_trigger(&self, update: &ProfileUpdate) -> Result<RiskProfile> {
        let mut profile = self
            .profiles
            .get_profile(&update.user_id)
            .await?
            .unwrap_or_else(|| RiskProfile::new(update.user_id.clone(), update.occurred_at));

        let previous_level = profile.level;
        self.accumulate(&mut profile, update);
        self.persist(&profile).await?;

        if profile.level != previous_level {
            tracing::info!(
                user_id = %profile.user_id,
                score = profile.score,
                from = ?previous_level,
                to = ?profile.level,
                "Risk level changed"
            );
        }

        Ok(profile)
    }

    /// Current profile with decay applied up to now; a zero profile for users
    /// never triggered. The decayed view is not persisted.
    pub async fn get_profile(&self, user_id: &str) -> Result<RiskProfile> {
        let now = self.clock.now();
        let Some(mut profile) = self.profiles.get_profile(user_id).await? else {
            return Ok(RiskProfile::new(user_id, now));
        };

        profile.score = self.decayed(profile.score, profile.last_updated, now);
        profile.level = self.level_for(profile.score);
        Ok(profile)
    }

    /// Prior snapshots, newest first
    pub async fn get_history(&self, user_id: &str, limit: usize, offset: usize) -> Result<Vec<RiskProfile>> {
        self.profiles.list_history(user_id, Page::new(limit, offset)).await
    }

    /// Rebuild a profile from the user's fraud event history
    pub async fn recalculate(&self, user_id: &str) -> Result<RiskProfile> {
        let mut events = self.events.list_events(&EventFilter::for_user(user_id)).await?;
        events.reverse();

        let start = events.first().map(|e| e.created_at).unwrap_or_else(|| self.clock.now());
        let mut profile = RiskProfile::new(user_id, start);

        for event in &events {
            let update = ProfileUpdate {
                user_id: event.user_id.clone(),
                rule_id: event.rule_id,
                rule_name: event.rule_name.clone(),
                severity: event.severity,
                occurred_at: event.created_at,
            };
            self.accumulate(&mut profile, &update);
        }

        self.persist(&profile).await?;
        tracing::info!(user_id, events = events.len(), score = profile.score, "Risk profile recalculated");
        Ok(profile)
    }

    /// Consume queued updates until every sender is dropped
    pub fn spawn_worker(self: Arc<Self>, mut rx: mpsc::Receiver<ProfileUpdate>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                if let Err(e) = self.apply_trigger(&update).await {
                    tracing::error!(user_id = %update.user_id, error = %e, "Risk profile update failed");
                }
            }
            tracing::debug!("Risk profile worker stopped");
        })
    }
}
