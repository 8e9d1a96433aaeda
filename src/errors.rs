//! Error handling for the FraudWatch engine

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FraudWatchError {
    #[error("Rule {rule_id} failed to compile: {reason}")]
    RuleCompile { rule_id: String, reason: String },

    #[error("Validation failed: {message}")]
    Validation { message: String },

    #[error("Rule not found: {rule_id}")]
    RuleNotFound { rule_id: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Timeout occurred during operation: {operation}")]
    Timeout { operation: String },

    #[error("Persistence failed after {attempts} attempts: {message}")]
    Persistence { message: String, attempts: u32 },

    #[error("Aggregation backend error: {message}")]
    Aggregation { message: String },

    #[error("Data serialization error: {message}")]
    Serialization { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FraudWatchError {
    pub fn validation(message: impl Into<String>) -> Self {
        FraudWatchError::Validation { message: message.into() }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        FraudWatchError::Storage { message: message.into() }
    }

    /// Whether a retry of the failed operation can succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            FraudWatchError::Storage { .. }
            | FraudWatchError::Timeout { .. }
            | FraudWatchError::Aggregation { .. }
            | FraudWatchError::Io(_) => true,

            FraudWatchError::RuleCompile { .. }
            | FraudWatchError::Validation { .. }
            | FraudWatchError::RuleNotFound { .. }
            | FraudWatchError::Persistence { .. } => false,

            _ => false,
        }
    }

    /// Short message for operators using the CLI
    pub fn to_user_message(&self) -> String {
        match self {
            FraudWatchError::RuleCompile { reason, .. } | FraudWatchError::Validation { message: reason } => {
                format!("Rejected: {}", reason)
            }
            FraudWatchError::RuleNotFound { rule_id } => format!("No rule with id {}", rule_id),
            FraudWatchError::Storage { .. } | FraudWatchError::Persistence { .. } => {
                "Storage is unavailable. Please retry shortly.".to_string()
            }
            FraudWatchError::Timeout { .. } | FraudWatchError::Aggregation { .. } => {
                "A backend did not respond in time. Please retry.".to_string()
            }
            FraudWatchError::Serialization { message } => format!("Malformed input: {}", message),
            FraudWatchError::Config { message } => format!("Invalid configuration: {}", message),
            FraudWatchError::Io(e) => format!("Could not read file: {}", e),
        }
    }

    /// Get severity level for logging
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            FraudWatchError::Persistence { .. } => ErrorSeverity::Critical,

            FraudWatchError::Storage { .. }
            | FraudWatchError::Config { .. }
            | FraudWatchError::Io(_) => ErrorSeverity::High,

            FraudWatchError::RuleCompile { .. }
            | FraudWatchError::Timeout { .. }
            | FraudWatchError::Aggregation { .. } => ErrorSeverity::Medium,

            _ => ErrorSeverity::Low,
        }
    }
}

impl From<serde_json::Error> for FraudWatchError {
    fn from(err: serde_json::Error) -> Self {
        FraudWatchError::Serialization { message: err.to_string() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

// Convenience type alias
pub type Result<T> = std::result::Result<T, FraudWatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_recoverability() {
        let error = FraudWatchError::storage("connection reset");
        assert!(error.is_recoverable());

        let error = FraudWatchError::validation("empty conditions");
        assert!(!error.is_recoverable());

        let error = FraudWatchError::Persistence { message: "gave up".to_string(), attempts: 4 };
        assert!(!error.is_recoverable());
    }

    #[test]
    fn test_user_messages() {
        let error = FraudWatchError::validation("rule must have at least one condition");
        assert_eq!(error.to_user_message(), "Rejected: rule must have at least one condition");

        let error = FraudWatchError::storage("connection reset");
        assert!(error.to_user_message().contains("retry"));
    }

    #[test]
    fn test_error_severity() {
        let lost = FraudWatchError::Persistence { message: "disk full".to_string(), attempts: 3 };
        assert_eq!(lost.severity(), ErrorSeverity::Critical);

        let timeout = FraudWatchError::Timeout { operation: "aggregate".to_string() };
        assert_eq!(timeout.severity(), ErrorSeverity::Medium);

        assert_eq!(FraudWatchError::validation("x").severity(), ErrorSeverity::Low);
    }

    #[test]
    fn test_serde_error_conversion() {
        let err: FraudWatchError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, FraudWatchError::Serialization { .. }));
    }
}
