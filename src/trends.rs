//! Transaction trend analysis over the persisted transaction log
//!
//! Transactions are grouped into calendar buckets. A bucket is anomalous when
//! its count or volume exceeds the mean plus `k` population standard
//! deviations of all buckets in the queried range. Every operation is
//! read-only, so repeating a query over the same data yields the same result.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::config::TrendConfig;
use crate::errors::{FraudWatchError, Result};
use crate::storage::{DateRange, TransactionFilter, TransactionHistory};
use crate::transaction::TransactionEvent;
use crate::utils::format_currency;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimePeriod {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Yearly,
}

impl TimePeriod {
    /// Start of the bucket containing `at`; weeks start on Monday
    pub fn bucket_start(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let date = at.date_naive();
        let start = match self {
            TimePeriod::Daily => date,
            TimePeriod::Weekly => date - Duration::days(date.weekday().num_days_from_monday() as i64),
            TimePeriod::Monthly => first_day(date.year(), date.month()).unwrap_or(date),
            TimePeriod::Quarterly => {
                let month = (date.month0() / 3) * 3 + 1;
                first_day(date.year(), month).unwrap_or(date)
            }
            TimePeriod::Yearly => first_day(date.year(), 1).unwrap_or(date),
        };
        Utc.from_utc_datetime(&start.and_time(NaiveTime::MIN))
    }

    /// Human-readable bucket name, e.g. `2024-W07` or `2024-Q2`
    pub fn label(&self, start: DateTime<Utc>) -> String {
        match self {
            TimePeriod::Daily => start.format("%Y-%m-%d").to_string(),
            TimePeriod::Weekly => {
                let week = start.iso_week();
                format!("{}-W{:02}", week.year(), week.week())
            }
            TimePeriod::Monthly => start.format("%Y-%m").to_string(),
            TimePeriod::Quarterly => format!("{}-Q{}", start.year(), start.month0() / 3 + 1),
            TimePeriod::Yearly => start.year().to_string(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimePeriod::Daily => "daily",
            TimePeriod::Weekly => "weekly",
            TimePeriod::Monthly => "monthly",
            TimePeriod::Quarterly => "quarterly",
            TimePeriod::Yearly => "yearly",
        }
    }
}

fn first_day(year: i32, month: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, 1)
}

impl FromStr for TimePeriod {
    type Err = FraudWatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "daily" | "day" => Ok(TimePeriod::Daily),
            "weekly" | "week" => Ok(TimePeriod::Weekly),
            "monthly" | "month" => Ok(TimePeriod::Monthly),
            "quarterly" | "quarter" => Ok(TimePeriod::Quarterly),
            "yearly" | "year" => Ok(TimePeriod::Yearly),
            other => Err(FraudWatchError::validation(format!("Unknown time period: {}", other))),
        }
    }
}

impl fmt::Display for TimePeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendMetric {
    TransactionCount,
    TotalVolume,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub metric: TrendMetric,
    pub period_label: String,
    pub observed: f64,
    pub mean: f64,
    pub std_dev: f64,
    pub threshold: f64,
    pub z_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionTrend {
    pub period_start: DateTime<Utc>,
    pub label: String,
    pub transaction_count: u64,
    pub total_volume: f64,
    pub avg_amount: f64,
    pub unique_users: usize,
    pub unique_recipients: usize,
    pub anomalies: Vec<Anomaly>,
    pub insights: Vec<String>,
}

/// Population mean and standard deviation of a series
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeriesStats {
    pub mean: f64,
    pub std_dev: f64,
}

impl SeriesStats {
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        Some(Self { mean, std_dev: variance.sqrt() })
    }

    pub fn threshold(&self, std_devs: f64) -> f64 {
        self.mean + std_devs * self.std_dev
    }

    /// An anomaly when `observed` strictly exceeds the threshold
    fn check(&self, metric: TrendMetric, label: &str, observed: f64, std_devs: f64) -> Option<Anomaly> {
        let threshold = self.threshold(std_devs);
        if observed <= threshold || self.std_dev == 0.0 {
            return None;
        }
        Some(Anomaly {
            metric,
            period_label: label.to_string(),
            observed,
            mean: self.mean,
            std_dev: self.std_dev,
            threshold,
            z_score: (observed - self.mean) / self.std_dev,
        })
    }
}

#[derive(Default)]
struct BucketAccumulator<'a> {
    count: u64,
    volume: f64,
    users: HashSet<&'a str>,
    recipients: HashSet<&'a str>,
}

/// Group transactions into chronologically ordered buckets; empty buckets are omitted
pub fn bucketize(transactions: &[TransactionEvent], period: TimePeriod) -> Vec<TransactionTrend> {
    let mut buckets: BTreeMap<DateTime<Utc>, BucketAccumulator<'_>> = BTreeMap::new();

    for txn in transactions {
        let bucket = buckets.entry(period.bucket_start(txn.timestamp)).or_default();
        bucket.count += 1;
        bucket.volume += txn.amount;
        bucket.users.insert(&txn.user_id);
        if let Some(recipient) = txn.recipient_id.as_deref() {
            bucket.recipients.insert(recipient);
        }
    }

    buckets
        .into_iter()
        .map(|(start, bucket)| TransactionTrend {
            period_start: start,
            label: period.label(start),
            transaction_count: bucket.count,
            total_volume: bucket.volume,
            avg_amount: bucket.volume / bucket.count as f64,
            unique_users: bucket.users.len(),
            unique_recipients: bucket.recipients.len(),
            anomalies: Vec::new(),
            insights: Vec::new(),
        })
        .collect()
}

pub struct TrendAnalyzer {
    history: Arc<dyn TransactionHistory>,
    config: TrendConfig,
}

impl TrendAnalyzer {
    pub fn new(history: Arc<dyn TransactionHistory>, config: TrendConfig) -> Self {
        Self { history, config }
    }

    /// Trends across every user
    pub async fn get_trends(&self, range: DateRange, period: TimePeriod) -> Result<Vec<TransactionTrend>> {
        self.compute(None, range, period).await
    }

    /// Trends restricted to one user's transactions
    pub async fn get_user_trends(
        &self,
        user_id: &str,
        range: DateRange,
        period: TimePeriod,
    ) -> Result<Vec<TransactionTrend>> {
        self.compute(Some(user_id), range, period).await
    }

    pub async fn get_anomalies(
        &self,
        user_id: Option<&str>,
        range: DateRange,
        period: TimePeriod,
    ) -> Result<Vec<Anomaly>> {
        let trends = self.compute(user_id, range, period).await?;
        Ok(trends.into_iter().flat_map(|t| t.anomalies).collect())
    }

    /// Per-bucket insights preceded by a summary of the whole range
    pub async fn get_insights(
        &self,
        user_id: Option<&str>,
        range: DateRange,
        period: TimePeriod,
    ) -> Result<Vec<String>> {
        let trends = self.compute(user_id, range, period).await?;
        if trends.is_empty() {
            return Ok(vec!["No transactions in the selected range".to_string()]);
        }

        let count: u64 = trends.iter().map(|t| t.transaction_count).sum();
        let volume: f64 = trends.iter().map(|t| t.total_volume).sum();
        let anomalies: usize = trends.iter().map(|t| t.anomalies.len()).sum();

        let mut insights = vec![format!(
            "{} {} periods: {} transactions totalling {}, {} anomalies",
            trends.len(),
            period,
            count,
            format_currency(volume, &self.config.currency),
            anomalies
        )];
        insights.extend(trends.into_iter().flat_map(|t| t.insights));
        Ok(insights)
    }

    async fn compute(
        &self,
        user_id: Option<&str>,
        range: DateRange,
        period: TimePeriod,
    ) -> Result<Vec<TransactionTrend>> {
        let filter = TransactionFilter {
            user_id: user_id.map(str::to_string),
            range: Some(range),
        };
        let transactions = self.history.list_transactions(&filter).await?;

        let mut trends = bucketize(&transactions, period);
        self.annotate(&mut trends);

        tracing::debug!(
            user_id = user_id.unwrap_or("*"),
            period = period.as_str(),
            transactions = transactions.len(),
            buckets = trends.len(),
            "Trends computed"
        );
        Ok(trends)
    }

    /// Attach anomalies and insight strings to computed buckets
    fn annotate(&self, trends: &mut [TransactionTrend]) {
        let counts: Vec<f64> = trends.iter().map(|t| t.transaction_count as f64).collect();
        let volumes: Vec<f64> = trends.iter().map(|t| t.total_volume).collect();
        let (Some(count_stats), Some(volume_stats)) =
            (SeriesStats::from_values(&counts), SeriesStats::from_values(&volumes))
        else {
            return;
        };

        let k = self.config.anomaly_std_devs;
        let currency = self.config.currency.as_str();
        let mut previous_volume: Option<f64> = None;

        for trend in trends.iter_mut() {
            let count_anomaly =
                count_stats.check(TrendMetric::TransactionCount, &trend.label, trend.transaction_count as f64, k);
            let volume_anomaly = volume_stats.check(TrendMetric::TotalVolume, &trend.label, trend.total_volume, k);
            trend.anomalies.extend(count_anomaly);
            trend.anomalies.extend(volume_anomaly);

            let mut insights = vec![
                format!(
                    "{}: {} transactions totalling {} (average {})",
                    trend.label,
                    trend.transaction_count,
                    format_currency(trend.total_volume, currency),
                    format_currency(trend.avg_amount, currency)
                ),
                format!(
                    "{}: {} unique users, {} unique recipients",
                    trend.label, trend.unique_users, trend.unique_recipients
                ),
            ];

            if let Some(prev) = previous_volume.filter(|v| *v > 0.0) {
                let change = (trend.total_volume - prev) / prev * 100.0;
                insights.push(format!("{}: volume {:+.1}% versus previous period", trend.label, change));
            }

            for anomaly in &trend.anomalies {
                insights.push(match anomaly.metric {
                    TrendMetric::TransactionCount => format!(
                        "{}: transaction count {} is {:.2} standard deviations above the mean of {:.2}",
                        anomaly.period_label, anomaly.observed, anomaly.z_score, anomaly.mean
                    ),
                    TrendMetric::TotalVolume => format!(
                        "{}: volume {} is {:.2} standard deviations above the mean of {}",
                        anomaly.period_label,
                        format_currency(anomaly.observed, currency),
                        anomaly.z_score,
                        format_currency(anomaly.mean, currency)
                    ),
                });
            }

            previous_volume = Some(trend.total_volume);
            trend.insights = insights;
        }
    }
}
