//! Sliding time-window aggregation per (user, field)
//!
//! Keys are sharded across a [`DashMap`], so transactions for different users
//! never contend on the same lock. Entries expire once they are older than the
//! longest window any active rule configures for their field; expiry happens
//! lazily on access and in a periodic sweep.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;

use crate::errors::Result;
use crate::rules::{AggregationKind, Field};
use crate::utils::Clock;

/// Backend serving aggregated values to the condition evaluator
#[async_trait]
pub trait AggregateSource: Send + Sync {
    /// Longest window per field; entries for fields missing here are dropped
    fn configure_retention(&self, windows: &HashMap<Field, Duration>);

    /// Record one occurrence; `value` is absent when the field is not numeric,
    /// in which case it counts but never contributes to sums or averages
    async fn record(&self, user_id: &str, field: &Field, value: Option<f64>, at: DateTime<Utc>) -> Result<()>;

    async fn aggregate(
        &self,
        user_id: &str,
        field: &Field,
        kind: AggregationKind,
        window: Duration,
    ) -> Result<f64>;
}

/// Timestamped occurrences for one key, kept sorted by time
#[derive(Debug, Default)]
struct KeyWindow {
    entries: VecDeque<(DateTime<Utc>, Option<f64>)>,
}

impl KeyWindow {
    fn insert(&mut self, at: DateTime<Utc>, value: Option<f64>) {
        match self.entries.back() {
            Some((last, _)) if *last > at => {
                let idx = self.entries.partition_point(|(ts, _)| *ts <= at);
                self.entries.insert(idx, (at, value));
            }
            _ => self.entries.push_back((at, value)),
        }
    }

    /// Drop entries strictly older than `retention`; returns how many went
    fn evict(&mut self, now: DateTime<Utc>, retention: Duration) -> usize {
        let before = self.entries.len();
        while let Some((ts, _)) = self.entries.front() {
            if now - *ts > retention {
                self.entries.pop_front();
            } else {
                break;
            }
        }
        before - self.entries.len()
    }

    fn aggregate(&self, now: DateTime<Utc>, kind: AggregationKind, window: Duration) -> f64 {
        let (count, numeric, sum) = self
            .entries
            .iter()
            .filter(|(ts, _)| now - *ts <= window)
            .fold((0usize, 0usize, 0.0f64), |(count, numeric, sum), (_, value)| match value {
                Some(v) => (count + 1, numeric + 1, sum + v),
                None => (count + 1, numeric, sum),
            });

        match kind {
            AggregationKind::Count => count as f64,
            AggregationKind::Sum => sum,
            AggregationKind::Avg if numeric == 0 => 0.0,
            AggregationKind::Avg => sum / numeric as f64,
        }
    }
}

#[derive(Debug)]
pub struct AggregationWindow {
    keys: DashMap<(String, Field), KeyWindow>,
    retention: ArcSwap<HashMap<Field, Duration>>,
    clock: Arc<dyn Clock>,
}

impl AggregationWindow {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            keys: DashMap::new(),
            retention: ArcSwap::from_pointee(HashMap::new()),
            clock,
        }
    }

    fn retention_for(&self, field: &Field) -> Duration {
        self.retention.load().get(field).copied().unwrap_or_else(Duration::zero)
    }

    /// Record an occurrence for (user, field)
    pub fn record_at(&self, user_id: &str, field: &Field, value: Option<f64>, at: DateTime<Utc>) {
        let retention = self.retention_for(field);
        let now = self.clock.now();

        let mut window = self
            .keys
            .entry((user_id.to_string(), field.clone()))
            .or_default();
        window.evict(now, retention);
        window.insert(at, value);
    }

    /// Current aggregate over the trailing `window` for (user, field)
    pub fn aggregate_now(&self, user_id: &str, field: &Field, kind: AggregationKind, window: Duration) -> f64 {
        let retention = self.retention_for(field);
        let now = self.clock.now();

        let key = (user_id.to_string(), field.clone());
        match self.keys.get_mut(&key) {
            Some(mut entry) => {
                entry.evict(now, retention.max(window));
                entry.aggregate(now, kind, window)
            }
            None => 0.0,
        }
    }

    /// Evict expired entries across every key; returns the number removed
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let retention = self.retention.load();
        let mut evicted = 0;

        self.keys.retain(|(_, field), window| {
            let keep_for = retention.get(field).copied().unwrap_or_else(Duration::zero);
            evicted += window.evict(now, keep_for);
            !window.entries.is_empty()
        });

        evicted
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    /// Run [`sweep`](Self::sweep) on a fixed interval; the task ends once the
    /// window itself is dropped
    pub fn spawn_sweeper(self: &Arc<Self>, interval: StdDuration) -> JoinHandle<()> {
        let window = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(window) = window.upgrade() else {
                    break;
                };
                let evicted = window.sweep();
                if evicted > 0 {
                    tracing::debug!(evicted, keys = window.key_count(), "Aggregation window swept");
                }
            }
        })
    }
}

#[async_trait]
impl AggregateSource for AggregationWindow {
    fn configure_retention(&self, windows: &HashMap<Field, Duration>) {
        self.retention.store(Arc::new(windows.clone()));
    }

    async fn record(&self, user_id: &str, field: &Field, value: Option<f64>, at: DateTime<Utc>) -> Result<()> {
        self.record_at(user_id, field, value, at);
        Ok(())
    }

    async fn aggregate(
        &self,
        user_id: &str,
        field: &Field,
        kind: AggregationKind,
        window: Duration,
    ) -> Result<f64> {
        Ok(self.aggregate_now(user_id, field, kind, window))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ManualClock;

    fn window_with_retention(clock: Arc<ManualClock>, field: Field, retention: Duration) -> AggregationWindow {
        let window = AggregationWindow::new(clock);
        window.configure_retention(&HashMap::from([(field, retention)]));
        window
    }

    #[test]
    fn test_sum_then_expiry() {
        let clock = ManualClock::new(Utc::now());
        let w = Duration::minutes(10);
        let window = window_with_retention(clock.clone(), Field::Amount, w);

        for _ in 0..4 {
            window.record_at("user-1", &Field::Amount, Some(250.0), clock.now());
            clock.advance(Duration::seconds(30));
        }

        assert_eq!(window.aggregate_now("user-1", &Field::Amount, AggregationKind::Sum, w), 1000.0);
        assert_eq!(window.aggregate_now("user-1", &Field::Amount, AggregationKind::Count, w), 4.0);
        assert_eq!(window.aggregate_now("user-1", &Field::Amount, AggregationKind::Avg, w), 250.0);

        clock.advance(w + Duration::seconds(1));
        assert_eq!(window.aggregate_now("user-1", &Field::Amount, AggregationKind::Sum, w), 0.0);
        assert_eq!(window.aggregate_now("user-1", &Field::Amount, AggregationKind::Avg, w), 0.0);
    }

    #[test]
    fn test_non_numeric_entries_only_count() {
        let clock = ManualClock::new(Utc::now());
        let w = Duration::hours(1);
        let fee = Field::Metadata("fee".to_string());
        let window = window_with_retention(clock.clone(), fee.clone(), w);

        for _ in 0..3 {
            window.record_at("u", &fee, None, clock.now());
        }
        assert_eq!(window.aggregate_now("u", &fee, AggregationKind::Count, w), 3.0);
        assert_eq!(window.aggregate_now("u", &fee, AggregationKind::Sum, w), 0.0);
        assert_eq!(window.aggregate_now("u", &fee, AggregationKind::Avg, w), 0.0);

        window.record_at("u", &fee, Some(4.0), clock.now());
        assert_eq!(window.aggregate_now("u", &fee, AggregationKind::Count, w), 4.0);
        assert_eq!(window.aggregate_now("u", &fee, AggregationKind::Sum, w), 4.0);
        assert_eq!(window.aggregate_now("u", &fee, AggregationKind::Avg, w), 4.0);
    }

    #[test]
    fn test_entry_at_exact_window_edge_is_kept() {
        let clock = ManualClock::new(Utc::now());
        let w = Duration::minutes(5);
        let window = window_with_retention(clock.clone(), Field::Amount, w);

        window.record_at("u", &Field::Amount, Some(10.0), clock.now());
        clock.advance(w);
        assert_eq!(window.aggregate_now("u", &Field::Amount, AggregationKind::Sum, w), 10.0);

        clock.advance(Duration::milliseconds(1));
        assert_eq!(window.aggregate_now("u", &Field::Amount, AggregationKind::Sum, w), 0.0);
    }

    #[test]
    fn test_keys_are_isolated() {
        let clock = ManualClock::new(Utc::now());
        let window = window_with_retention(clock.clone(), Field::Amount, Duration::hours(1));

        window.record_at("a", &Field::Amount, Some(5.0), clock.now());
        window.record_at("b", &Field::Amount, Some(7.0), clock.now());

        let hour = Duration::hours(1);
        assert_eq!(window.aggregate_now("a", &Field::Amount, AggregationKind::Sum, hour), 5.0);
        assert_eq!(window.aggregate_now("b", &Field::Amount, AggregationKind::Sum, hour), 7.0);
        assert_eq!(window.aggregate_now("c", &Field::Amount, AggregationKind::Sum, hour), 0.0);
    }

    #[test]
    fn test_out_of_order_records() {
        let clock = ManualClock::new(Utc::now());
        let window = window_with_retention(clock.clone(), Field::Amount, Duration::hours(2));
        let now = clock.now();

        window.record_at("u", &Field::Amount, Some(1.0), now);
        window.record_at("u", &Field::Amount, Some(2.0), now - Duration::minutes(90));
        window.record_at("u", &Field::Amount, Some(4.0), now - Duration::minutes(10));

        assert_eq!(window.aggregate_now("u", &Field::Amount, AggregationKind::Sum, Duration::hours(1)), 5.0);
        assert_eq!(window.aggregate_now("u", &Field::Amount, AggregationKind::Sum, Duration::hours(2)), 7.0);
    }

    #[test]
    fn test_sweep_evicts_and_drops_empty_keys() {
        let clock = ManualClock::new(Utc::now());
        let window = window_with_retention(clock.clone(), Field::Amount, Duration::minutes(1));

        window.record_at("a", &Field::Amount, Some(1.0), clock.now());
        window.record_at("b", &Field::Country, None, clock.now());
        assert_eq!(window.key_count(), 2);

        clock.advance(Duration::minutes(2));
        assert_eq!(window.sweep(), 2);
        assert_eq!(window.key_count(), 0);
    }

    #[tokio::test]
    async fn test_sweeper_stops_when_window_dropped() {
        let clock = ManualClock::new(Utc::now());
        let window = Arc::new(window_with_retention(clock.clone(), Field::Amount, Duration::minutes(1)));
        window.record_at("a", &Field::Amount, Some(1.0), clock.now());
        clock.advance(Duration::minutes(5));

        let sweeper = window.spawn_sweeper(StdDuration::from_millis(5));
        tokio::time::sleep(StdDuration::from_millis(30)).await;
        assert_eq!(window.key_count(), 0);

        drop(window);
        tokio::time::timeout(StdDuration::from_secs(1), sweeper)
            .await
            .expect("sweeper should stop")
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers() {
        let clock = ManualClock::new(Utc::now());
        let window = Arc::new(window_with_retention(clock.clone(), Field::Amount, Duration::hours(1)));

        let mut handles = Vec::new();
        for user in 0..8 {
            let window = window.clone();
            let at = clock.now();
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    window.record(&format!("user-{}", user), &Field::Amount, Some(1.0), at).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        for user in 0..8 {
            let total = window
                .aggregate(&format!("user-{}", user), &Field::Amount, AggregationKind::Count, Duration::hours(1))
                .await
                .unwrap();
            assert_eq!(total, 100.0);
        }
    }
}
