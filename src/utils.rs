//! Utility functions for the FraudWatch engine
//! Provides the injectable clock, retry with backoff and formatting helpers

use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};

use crate::config::{default_write_timeout_ms, PersistenceConfig};
use crate::errors::{ErrorSeverity, FraudWatchError, Result};

/// Format currency amount for insight text
pub fn format_currency(amount: f64, currency: &str) -> String {
    match currency.to_uppercase().as_str() {
        "USD" => format!("${:.2}", amount),
        "EUR" => format!("€{:.2}", amount),
        "GBP" => format!("£{:.2}", amount),
        "KES" => format!("KSh {:.2}", amount),
        "NGN" => format!("₦{:.2}", amount),
        "INR" => format!("₹{:.2}", amount),
        _ => format!("{} {:.2}", currency, amount),
    }
}

/// Parse a compact duration such as `90s`, `15m`, `24h` or `7d`
pub fn parse_window(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let (split, _) = raw.char_indices().last()?;
    let (value, unit) = raw.split_at(split);
    let value: i64 = value.parse().ok()?;
    if value <= 0 {
        return None;
    }
    // Out-of-range values yield None instead of overflowing
    match unit {
        "s" => Duration::try_seconds(value),
        "m" => Duration::try_minutes(value),
        "h" => Duration::try_hours(value),
        "d" => Duration::try_days(value),
        "w" => Duration::try_weeks(value),
        _ => None,
    }
}

/// Source of the current time
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self { now: RwLock::new(start) })
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.write().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        let mut now = self.now.write().unwrap_or_else(|e| e.into_inner());
        *now = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read().unwrap_or_else(|e| e.into_inner())
    }
}

/// Exponential backoff for writes that must eventually land. Each attempt is
/// cut off after `attempt_timeout`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: StdDuration,
    pub max_delay: StdDuration,
    pub factor: f64,
    pub attempt_timeout: StdDuration,
}

impl RetryPolicy {
    pub fn from_config(config: &PersistenceConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: StdDuration::from_millis(config.initial_backoff_ms),
            max_delay: StdDuration::from_millis(config.max_backoff_ms),
            factor: config.backoff_factor,
            attempt_timeout: StdDuration::from_millis(config.write_timeout_ms),
        }
    }

    /// No retries, for callers that handle failure themselves
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_delay: StdDuration::ZERO,
            max_delay: StdDuration::ZERO,
            factor: 1.0,
            attempt_timeout: StdDuration::from_millis(default_write_timeout_ms()),
        }
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> StdDuration {
        let multiplier = self.factor.powi(attempt as i32);
        let delay = StdDuration::from_secs_f64(self.initial_delay.as_secs_f64() * multiplier);
        delay.min(self.max_delay)
    }

    /// Run `f` until it succeeds, fails with a non-recoverable error, or the
    /// retry budget is spent.
    pub async fn run<F, Fut, T>(&self, operation: &str, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            let outcome = match tokio::time::timeout(self.attempt_timeout, f()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(FraudWatchError::Timeout { operation: operation.to_string() }),
            };
            match outcome {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::info!(operation, attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_recoverable() && attempt < self.max_retries => {
                    let delay = self.delay_for_attempt(attempt);
                    tracing::warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    match e.severity() {
                        ErrorSeverity::High | ErrorSeverity::Critical => {
                            tracing::error!(operation, attempts = attempt + 1, error = %e, "Operation failed");
                        }
                        ErrorSeverity::Medium | ErrorSeverity::Low => {
                            tracing::warn!(operation, attempts = attempt + 1, error = %e, "Operation failed");
                        }
                    }
                    return Err(FraudWatchError::Persistence {
                        message: format!("{}: {}", operation, e),
                        attempts: attempt + 1,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_currency_formatting() {
        assert_eq!(format_currency(100.50, "USD"), "$100.50");
        assert_eq!(format_currency(75.25, "KES"), "KSh 75.25");
        assert_eq!(format_currency(3.0, "CHF"), "CHF 3.00");
    }

    #[test]
    fn test_window_parsing() {
        assert_eq!(parse_window("90s"), Some(Duration::seconds(90)));
        assert_eq!(parse_window("15m"), Some(Duration::minutes(15)));
        assert_eq!(parse_window("24h"), Some(Duration::hours(24)));
        assert_eq!(parse_window("7d"), Some(Duration::days(7)));
        assert_eq!(parse_window("0h"), None);
        assert_eq!(parse_window("h"), None);
        assert_eq!(parse_window("12y"), None);
        assert_eq!(parse_window("1é"), None);
        assert_eq!(parse_window("é"), None);
        assert_eq!(parse_window(""), None);
        assert_eq!(parse_window("9999999999999999d"), None);
        assert_eq!(parse_window("9999999999999999w"), None);
    }

    #[test]
    fn test_manual_clock_advances() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        clock.advance(Duration::minutes(5));
        assert_eq!(clock.now(), start + Duration::minutes(5));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::from_config(&PersistenceConfig::default());
        assert_eq!(policy.delay_for_attempt(0), StdDuration::from_millis(25));
        assert_eq!(policy.delay_for_attempt(1), StdDuration::from_millis(50));
        assert_eq!(policy.delay_for_attempt(10), StdDuration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failure() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_retries: 3,
            initial_delay: StdDuration::from_millis(1),
            max_delay: StdDuration::from_millis(2),
            factor: 2.0,
            attempt_timeout: StdDuration::from_secs(1),
        };

        let result = policy
            .run("insert", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(FraudWatchError::storage("busy"))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let policy = RetryPolicy {
            max_retries: 2,
            initial_delay: StdDuration::from_millis(1),
            max_delay: StdDuration::from_millis(1),
            factor: 1.0,
            attempt_timeout: StdDuration::from_secs(1),
        };

        let result: Result<()> = policy
            .run("insert", || async { Err(FraudWatchError::storage("down")) })
            .await;

        match result {
            Err(FraudWatchError::Persistence { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_hanging_attempts_time_out() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_retries: 1,
            initial_delay: StdDuration::from_millis(1),
            max_delay: StdDuration::from_millis(1),
            factor: 1.0,
            attempt_timeout: StdDuration::from_millis(10),
        };

        let result: Result<()> = policy
            .run("insert", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                std::future::pending::<Result<()>>().await
            })
            .await;

        match result {
            Err(FraudWatchError::Persistence { attempts, message }) => {
                assert_eq!(attempts, 2);
                assert!(message.contains("Timeout"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
