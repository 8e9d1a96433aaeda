//! Configuration module for the FraudWatch engine
//! Every tunable constant of the decision path, the risk scoring model and the
//! trend analytics lives here so deployments can adjust them without rebuilding.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{FraudWatchError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FraudWatchConfig {
    /// Upper bound for a single aggregate lookup before the condition degrades
    #[serde(default = "default_condition_timeout_ms")]
    pub condition_timeout_ms: u64,

    /// Retry settings for audit trail writes
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// How often expired aggregation entries are swept
    #[serde(default = "default_window_sweep_interval_secs")]
    pub window_sweep_interval_secs: u64,

    /// Capacity of the queue feeding the risk profile worker
    #[serde(default = "default_profile_queue_capacity")]
    pub profile_queue_capacity: usize,

    #[serde(default)]
    pub risk: RiskScoringConfig,

    #[serde(default)]
    pub trends: TrendConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Upper bound for a single write attempt
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

/// Risk score increments, decay and level boundaries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskScoringConfig {
    #[serde(default = "default_low_increment")]
    pub low_increment: f64,
    #[serde(default = "default_medium_increment")]
    pub medium_increment: f64,
    #[serde(default = "default_high_increment")]
    pub high_increment: f64,
    #[serde(default = "default_critical_increment")]
    pub critical_increment: f64,

    /// Points removed per day without new triggers
    #[serde(default = "default_decay_per_day")]
    pub decay_per_day: f64,

    #[serde(default = "default_max_score")]
    pub max_score: f64,

    /// Lower bounds (inclusive) of the medium, high and critical levels
    #[serde(default = "default_medium_threshold")]
    pub medium_threshold: f64,
    #[serde(default = "default_high_threshold")]
    pub high_threshold: f64,
    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: f64,

    /// Contributing factors kept on a profile
    #[serde(default = "default_max_factors")]
    pub max_factors: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendConfig {
    /// A bucket is anomalous above mean + `anomaly_std_devs` * stddev
    #[serde(default = "default_anomaly_std_devs")]
    pub anomaly_std_devs: f64,

    /// Currency used when rendering insights
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_condition_timeout_ms() -> u64 {
    50
}

fn default_window_sweep_interval_secs() -> u64 {
    60
}

fn default_profile_queue_capacity() -> usize {
    1024
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    25
}

fn default_max_backoff_ms() -> u64 {
    1000
}

fn default_backoff_factor() -> f64 {
    2.0
}

pub(crate) fn default_write_timeout_ms() -> u64 {
    500
}

fn default_low_increment() -> f64 {
    1.0
}

fn default_medium_increment() -> f64 {
    5.0
}

fn default_high_increment() -> f64 {
    15.0
}

fn default_critical_increment() -> f64 {
    30.0
}

fn default_decay_per_day() -> f64 {
    1.0
}

fn default_max_score() -> f64 {
    100.0
}

fn default_medium_threshold() -> f64 {
    25.0
}

fn default_high_threshold() -> f64 {
    50.0
}

fn default_critical_threshold() -> f64 {
    75.0
}

fn default_max_factors() -> usize {
    20
}

fn default_anomaly_std_devs() -> f64 {
    2.0
}

fn default_currency() -> String {
    "USD".to_string()
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_factor: default_backoff_factor(),
            write_timeout_ms: default_write_timeout_ms(),
        }
    }
}

impl Default for RiskScoringConfig {
    fn default() -> Self {
        Self {
            low_increment: default_low_increment(),
            medium_increment: default_medium_increment(),
            high_increment: default_high_increment(),
            critical_increment: default_critical_increment(),
            decay_per_day: default_decay_per_day(),
            max_score: default_max_score(),
            medium_threshold: default_medium_threshold(),
            high_threshold: default_high_threshold(),
            critical_threshold: default_critical_threshold(),
            max_factors: default_max_factors(),
        }
    }
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            anomaly_std_devs: default_anomaly_std_devs(),
            currency: default_currency(),
        }
    }
}

impl Default for FraudWatchConfig {
    fn default() -> Self {
        Self {
            condition_timeout_ms: default_condition_timeout_ms(),
            persistence: PersistenceConfig::default(),
            window_sweep_interval_secs: default_window_sweep_interval_secs(),
            profile_queue_capacity: default_profile_queue_capacity(),
            risk: RiskScoringConfig::default(),
            trends: TrendConfig::default(),
        }
    }
}

impl FraudWatchConfig {
    /// Load configuration from a JSON file; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: FraudWatchConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn condition_timeout(&self) -> Duration {
        Duration::from_millis(self.condition_timeout_ms)
    }

    pub fn window_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.window_sweep_interval_secs)
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<()> {
        if self.condition_timeout_ms == 0 {
            return Err(config_error("Condition timeout must be greater than 0"));
        }

        if self.window_sweep_interval_secs == 0 {
            return Err(config_error("Window sweep interval must be greater than 0"));
        }

        if self.profile_queue_capacity == 0 {
            return Err(config_error("Profile queue capacity must be greater than 0"));
        }

        if self.persistence.backoff_factor < 1.0 {
            return Err(config_error("Backoff factor must be at least 1.0"));
        }

        if self.persistence.write_timeout_ms == 0 {
            return Err(config_error("Write timeout must be greater than 0"));
        }

        let risk = &self.risk;
        let increments = [
            risk.low_increment,
            risk.medium_increment,
            risk.high_increment,
            risk.critical_increment,
        ];
        if increments.iter().any(|i| *i < 0.0) {
            return Err(config_error("Score increments must not be negative"));
        }
        if increments.windows(2).any(|w| w[0] > w[1]) {
            return Err(config_error("Score increments must not decrease with severity"));
        }

        if risk.decay_per_day < 0.0 {
            return Err(config_error("Decay rate must not be negative"));
        }

        if !(0.0 < risk.medium_threshold
            && risk.medium_threshold < risk.high_threshold
            && risk.high_threshold < risk.critical_threshold
            && risk.critical_threshold <= risk.max_score)
        {
            return Err(config_error(
                "Level thresholds must be ascending and within the maximum score",
            ));
        }

        if self.trends.anomaly_std_devs <= 0.0 {
            return Err(config_error("Anomaly multiplier must be positive"));
        }

        Ok(())
    }
}

fn config_error(message: &str) -> FraudWatchError {
    FraudWatchError::Config { message: message.to_string() }
}
