//! Error types for the Accrete message aggregator.
//!
//! Every failure an input message, a completed aggregate or the aggregator's
//! own startup can run into is described here. All errors implement
//! `std::error::Error` and are serializable so they can be logged as
//! structured data or returned to a calling pipeline.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using AccreteError as the error type.
pub type Result<T> = std::result::Result<T, AccreteError>;

/// Top-level error type for all Accrete operations.
#[derive(Debug, Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "details")]
pub enum AccreteError {
    /// The input message could not be correlated
    #[error("Correlation error: {0}")]
    Correlation(#[from] CorrelationError),

    /// The merge strategy failed
    #[error("Aggregation error: {0}")]
    Aggregation(#[from] AggregationError),

    /// Optimistic locking conflicts
    #[error("Optimistic locking error: {0}")]
    Locking(#[from] LockingError),

    /// Downstream delivery failures
    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    /// Configuration and startup errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The aggregator is not accepting work in its current lifecycle state
    #[error("Aggregator is not running (state: {state})")]
    NotRunning { state: String },

    /// Internal errors that shouldn't normally occur
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AccreteError {
    /// Returns true if this is an optimistic locking conflict that may be retried.
    pub fn is_locking_conflict(&self) -> bool {
        matches!(self, AccreteError::Locking(LockingError::Conflict { .. }))
    }
}

/// Input rejection errors.
///
/// These leave the group state untouched; only the offending message fails.
#[derive(Debug, Error, Serialize, Deserialize)]
pub enum CorrelationError {
    /// The correlation expression evaluated to nothing or an empty string
    #[error("Invalid correlation key for exchange {exchange_id}")]
    InvalidKey { exchange_id: String },

    /// The group for this key already completed and the key is closed
    #[error("The correlation key [{key}] has been closed (exchange {exchange_id})")]
    ClosedKey { key: String, exchange_id: String },
}

impl CorrelationError {
    /// Creates an invalid key error.
    pub fn invalid_key(exchange_id: impl ToString) -> Self {
        Self::InvalidKey {
            exchange_id: exchange_id.to_string(),
        }
    }

    /// Creates a closed key error.
    pub fn closed_key(key: impl Into<String>, exchange_id: impl ToString) -> Self {
        Self::ClosedKey {
            key: key.into(),
            exchange_id: exchange_id.to_string(),
        }
    }
}

/// Merge failures.
#[derive(Debug, Error, Serialize, Deserialize)]
pub enum AggregationError {
    /// The merge strategy returned an error
    #[error("Error occurred during aggregation of exchange {exchange_id}: {reason}")]
    StrategyFailed { exchange_id: String, reason: String },

    /// The pre-completion check failed
    #[error("Error occurred during pre-completion of exchange {exchange_id}: {reason}")]
    PreCompleteFailed { exchange_id: String, reason: String },
}

impl AggregationError {
    /// Creates a strategy failed error.
    pub fn strategy_failed(exchange_id: impl ToString, reason: impl Into<String>) -> Self {
        Self::StrategyFailed {
            exchange_id: exchange_id.to_string(),
            reason: reason.into(),
        }
    }
}

/// Failure raised by a merge strategy.
///
/// User strategies return this from `aggregate`; `anyhow` errors convert
/// into it so strategies can use `?` freely.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct StrategyError {
    pub message: String,
}

impl StrategyError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for StrategyError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{:#}", err))
    }
}

/// Optimistic locking errors.
#[derive(Debug, Error, Serialize, Deserialize)]
pub enum LockingError {
    /// The repository rejected a write because another writer won
    #[error("Optimistic locking conflict on correlation key [{key}]")]
    Conflict { key: String },

    /// All retry attempts were used up
    #[error("Exhausted optimistic locking retry attempts, tried {attempts} times")]
    Exhausted { attempts: u32 },
}

impl LockingError {
    /// Creates a conflict error.
    pub fn conflict(key: impl Into<String>) -> Self {
        Self::Conflict { key: key.into() }
    }
}

/// Downstream delivery errors.
#[derive(Debug, Error, Serialize, Deserialize)]
pub enum DeliveryError {
    /// The downstream sink reported a failure
    #[error("Error processing aggregated exchange {exchange_id}: {reason}")]
    SinkFailed { exchange_id: String, reason: String },

    /// Moving an exhausted exchange to the dead letter endpoint failed
    #[error("Failed to move recovered exchange {exchange_id} to dead letter endpoint {endpoint}: {reason}")]
    DeadLetterFailed {
        exchange_id: String,
        endpoint: String,
        reason: String,
    },

    /// The sink is closed and accepts no more exchanges
    #[error("Sink closed: {details}")]
    Closed { details: String },
}

impl DeliveryError {
    /// Creates a sink failed error.
    pub fn sink_failed(exchange_id: impl ToString, reason: impl Into<String>) -> Self {
        Self::SinkFailed {
            exchange_id: exchange_id.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors related to configuration and startup.
///
/// Startup errors are raised by `validate()` or by the engine's `start()`,
/// never lazily while messages are flowing.
#[derive(Debug, Error, Serialize, Deserialize)]
pub enum ConfigError {
    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {reason}")]
    LoadFailed { path: String, reason: String },

    /// Invalid configuration format
    #[error("Invalid configuration format: {reason}")]
    InvalidFormat { reason: String },

    /// Missing required configuration field
    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    /// No completion trigger configured
    #[error("At least one of the completion options [completion_timeout, completion_interval, completion_size, completion_predicate, completion_from_batch_consumer] must be set")]
    NoCompletionTrigger,

    /// Interval and timeout configured together
    #[error("Only one of completion_interval or completion_timeout can be used, not both")]
    IntervalAndTimeout,

    /// Optimistic locking requested with a repository that cannot do it
    #[error("Optimistic locking cannot be enabled without a repository that supports optimistic locking")]
    OptimisticLockingUnsupported,

    /// Recovery enabled with a non-positive interval
    #[error("Repository has recovery enabled and the recovery interval must be a positive number, was: {millis}")]
    InvalidRecoveryInterval { millis: u64 },

    /// Dead letter configured with a non-positive redelivery limit
    #[error("Option maximum_redeliveries must be a positive number, was: {value}")]
    InvalidMaximumRedeliveries { value: u32 },

    /// Dead letter endpoint is not registered
    #[error("No endpoint could be found for: {endpoint}")]
    NoSuchEndpoint { endpoint: String },

    /// Configuration validation failed
    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },
}

impl ConfigError {
    /// Creates a file not found error.
    pub fn file_not_found(path: impl Into<String>) -> Self {
        Self::FileNotFound { path: path.into() }
    }

    /// Creates a missing field error.
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    /// Creates an invalid value error.
    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Creates a validation failed error.
    pub fn validation_failed(reason: impl Into<String>) -> Self {
        Self::ValidationFailed {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locking_conflict_detection() {
        let err: AccreteError = LockingError::conflict("A").into();
        assert!(err.is_locking_conflict());

        let err: AccreteError = LockingError::Exhausted { attempts: 3 }.into();
        assert!(!err.is_locking_conflict());
    }

    #[test]
    fn test_error_serialization() {
        let err = AccreteError::Correlation(CorrelationError::closed_key("order-7", "abc"));
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("Correlation"));
        assert!(json.contains("order-7"));
    }

    #[test]
    fn test_exhausted_message() {
        let err = LockingError::Exhausted { attempts: 5 };
        assert_eq!(
            err.to_string(),
            "Exhausted optimistic locking retry attempts, tried 5 times"
        );
    }

    #[test]
    fn test_strategy_error_from_anyhow() {
        let err: StrategyError = anyhow::anyhow!("bad body").context("merging").into();
        assert!(err.message.contains("merging"));
        assert!(err.message.contains("bad body"));
    }

    #[test]
    fn test_config_error_helpers() {
        let err = ConfigError::missing_field("correlation");
        assert!(matches!(err, ConfigError::MissingField { .. }));

        let err = ConfigError::invalid_value("completion_size", "must be positive");
        assert!(err.to_string().contains("completion_size"));
    }
}
