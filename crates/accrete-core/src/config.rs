//! Configuration management for the Accrete aggregator.
//!
//! This module provides:
//! - Loading from YAML files
//! - Environment variable overrides (`ACCRETE__*`)
//! - Validation of the aggregator's completion settings
//! - Logging configuration

use crate::error::{ConfigError, Result};
use crate::expression::{Expression, Predicate};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Root configuration.
///
/// # Examples
///
/// ```no_run
/// use accrete_core::config::AppConfig;
///
/// let config = AppConfig::from_file("accrete.yaml").unwrap();
/// config.aggregator.validate(false).unwrap();
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Aggregator settings
    #[serde(default)]
    pub aggregator: AggregatorConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::file_not_found(path.display().to_string()).into());
        }
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        Self::from_yaml(&contents)
    }

    /// Loads configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| {
            ConfigError::InvalidFormat {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Loads configuration using the `config` crate, layering environment
    /// variable overrides such as `ACCRETE__AGGREGATOR__COMPLETION_SIZE=10`.
    pub fn from_config_builder<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = config::Config::builder()
            .add_source(config::File::from(path).required(true))
            .add_source(
                config::Environment::with_prefix("ACCRETE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigError::LoadFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        config.try_deserialize().map_err(|e| {
            ConfigError::InvalidFormat {
                reason: e.to_string(),
            }
            .into()
        })
    }
}

/// Built-in merge strategies selectable from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StrategyKind {
    /// Keep the newest message
    UseLatest,
    /// Keep the first message of the group
    UseOriginal,
    /// Collect every body into a JSON array
    GroupBodies,
    /// Concatenate bodies as text
    ConcatBodies {
        #[serde(default)]
        separator: String,
    },
}

impl Default for StrategyKind {
    fn default() -> Self {
        Self::UseLatest
    }
}

/// Retry policy for optimistic locking conflicts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimisticLockRetryPolicy {
    /// Maximum attempts; 0 retries forever
    #[serde(default)]
    pub maximum_retries: u32,

    /// Base delay between attempts in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Cap for the delay in milliseconds
    #[serde(default = "default_maximum_retry_delay_ms")]
    pub maximum_retry_delay_ms: u64,

    /// Double the delay on every attempt
    #[serde(default = "default_true")]
    pub exponential_backoff: bool,
}

fn default_retry_delay_ms() -> u64 {
    50
}

fn default_maximum_retry_delay_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

impl Default for OptimisticLockRetryPolicy {
    fn default() -> Self {
        Self {
            maximum_retries: 0,
            retry_delay_ms: default_retry_delay_ms(),
            maximum_retry_delay_ms: default_maximum_retry_delay_ms(),
            exponential_backoff: true,
        }
    }
}

impl OptimisticLockRetryPolicy {
    /// Whether another attempt is allowed after `attempt` failed attempts.
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.maximum_retries == 0 || attempt < self.maximum_retries
    }

    /// Delay before the attempt following `attempt` failed attempts.
    pub fn delay(&self, attempt: u32) -> Duration {
        if self.retry_delay_ms == 0 {
            return Duration::ZERO;
        }
        let millis = if self.exponential_backoff {
            let exponent = attempt.saturating_sub(1).min(31);
            self.retry_delay_ms.saturating_mul(1u64 << exponent)
        } else {
            self.retry_delay_ms
        };
        Duration::from_millis(millis.min(self.maximum_retry_delay_ms))
    }
}

/// Aggregator settings.
///
/// Every completion trigger is optional, but at least one must be set
/// unless the merge strategy supports pre-completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Expression computing the correlation key
    #[serde(default)]
    pub correlation: Option<Expression>,

    /// Built-in merge strategy
    #[serde(default)]
    pub strategy: StrategyKind,

    /// Complete when the merged exchange matches
    #[serde(default)]
    pub completion_predicate: Option<Predicate>,

    /// Static completion size
    #[serde(default)]
    pub completion_size: Option<usize>,

    /// Dynamic completion size, takes precedence over `completion_size`
    #[serde(default)]
    pub completion_size_expression: Option<Expression>,

    /// Inactivity timeout in milliseconds
    #[serde(default)]
    pub completion_timeout_ms: Option<u64>,

    /// Dynamic inactivity timeout in milliseconds, takes precedence over `completion_timeout_ms`
    #[serde(default)]
    pub completion_timeout_expression: Option<Expression>,

    /// Periodic sweep interval in milliseconds
    #[serde(default)]
    pub completion_interval_ms: Option<u64>,

    /// How often the timeout checker polls, in milliseconds
    #[serde(default = "default_timeout_checker_interval_ms")]
    pub completion_timeout_checker_interval_ms: u64,

    /// Complete all groups at batch consumer boundaries
    #[serde(default)]
    pub completion_from_batch_consumer: bool,

    /// Complete all other groups when a new correlation key appears
    #[serde(default)]
    pub completion_on_new_correlation_group: bool,

    /// Check completion on the incoming message before merging
    #[serde(default)]
    pub eager_check_completion: bool,

    /// Drop messages without a correlation key instead of failing them
    #[serde(default)]
    pub ignore_invalid_correlation_keys: bool,

    /// Close keys on completion: `Some(0)` unbounded, `Some(n)` keeps the latest n keys
    #[serde(default)]
    pub close_correlation_key_on_completion: Option<usize>,

    /// Use optimistic locking instead of the shared lock
    #[serde(default)]
    pub optimistic_locking: bool,

    /// Retry policy for optimistic locking conflicts
    #[serde(default)]
    pub optimistic_lock_retry: OptimisticLockRetryPolicy,

    /// Discard groups completed by timeout instead of emitting them
    #[serde(default)]
    pub discard_on_completion_timeout: bool,

    /// Discard the group when the merge strategy fails
    #[serde(default)]
    pub discard_on_aggregation_failure: bool,

    /// Force completion of all groups on graceful stop
    #[serde(default)]
    pub force_completion_on_stop: bool,

    /// Report open groups as pending work during shutdown
    #[serde(default)]
    pub complete_all_on_stop: bool,

    /// Deliver completed groups concurrently instead of one at a time
    #[serde(default)]
    pub parallel_processing: bool,

    /// Keep statistics counters
    #[serde(default = "default_true")]
    pub statistics_enabled: bool,
}

fn default_timeout_checker_interval_ms() -> u64 {
    1000
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            correlation: None,
            strategy: StrategyKind::default(),
            completion_predicate: None,
            completion_size: None,
            completion_size_expression: None,
            completion_timeout_ms: None,
            completion_timeout_expression: None,
            completion_interval_ms: None,
            completion_timeout_checker_interval_ms: default_timeout_checker_interval_ms(),
            completion_from_batch_consumer: false,
            completion_on_new_correlation_group: false,
            eager_check_completion: false,
            ignore_invalid_correlation_keys: false,
            close_correlation_key_on_completion: None,
            optimistic_locking: false,
            optimistic_lock_retry: OptimisticLockRetryPolicy::default(),
            discard_on_completion_timeout: false,
            discard_on_aggregation_failure: false,
            force_completion_on_stop: false,
            complete_all_on_stop: false,
            parallel_processing: false,
            statistics_enabled: true,
        }
    }
}

impl AggregatorConfig {
    /// Static completion size, ignoring zero.
    pub fn completion_size(&self) -> Option<usize> {
        self.completion_size.filter(|s| *s > 0)
    }

    /// Static inactivity timeout, ignoring zero.
    pub fn completion_timeout(&self) -> Option<Duration> {
        self.completion_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// Interval sweep period, ignoring zero.
    pub fn completion_interval(&self) -> Option<Duration> {
        self.completion_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn timeout_checker_interval(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_checker_interval_ms)
    }

    /// True if any inactivity timeout (static or dynamic) is configured.
    pub fn uses_timeout(&self) -> bool {
        self.completion_timeout().is_some() || self.completion_timeout_expression.is_some()
    }

    /// True if any completion trigger is configured.
    pub fn has_completion_trigger(&self) -> bool {
        self.uses_timeout()
            || self.completion_interval().is_some()
            || self.completion_size().is_some()
            || self.completion_size_expression.is_some()
            || self.completion_predicate.is_some()
            || self.completion_from_batch_consumer
    }

    /// Validates the configuration.
    ///
    /// `pre_completion` is true when the merge strategy can decide completion
    /// on its own, in which case no completion trigger is required.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self, pre_completion: bool) -> Result<()> {
        if self.correlation.is_none() {
            return Err(ConfigError::missing_field("correlation").into());
        }

        if !pre_completion && !self.has_completion_trigger() {
            return Err(ConfigError::NoCompletionTrigger.into());
        }

        if self.completion_interval().is_some() && self.completion_timeout().is_some() {
            return Err(ConfigError::IntervalAndTimeout.into());
        }

        if self.uses_timeout() && self.completion_timeout_checker_interval_ms == 0 {
            return Err(ConfigError::invalid_value(
                "completion_timeout_checker_interval_ms",
                "must be a positive number",
            )
            .into());
        }

        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: LogFormat,

    /// Whether to include file/line info
    #[serde(default)]
    pub file_line: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
            file_line: false,
        }
    }
}

impl LoggingConfig {
    /// Parses the log level string to a tracing Level.
    pub fn parse_level(&self) -> Result<Level> {
        self.level.parse().map_err(|_| {
            ConfigError::InvalidValue {
                field: "logging.level".to_string(),
                reason: format!("Invalid log level: {}", self.level),
            }
            .into()
        })
    }
}

/// Log format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format
    Text,
    /// JSON format for structured logging
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AccreteError;

    fn with_key() -> AggregatorConfig {
        AggregatorConfig {
            correlation: Some(Expression::Header("id".to_string())),
            ..Default::default()
        }
    }

    #[test]
    fn test_no_completion_trigger() {
        let err = with_key().validate(false).unwrap_err();
        assert!(matches!(
            err,
            AccreteError::Config(ConfigError::NoCompletionTrigger)
        ));
        assert!(with_key().validate(true).is_ok());
    }

    #[test]
    fn test_missing_correlation() {
        let config = AggregatorConfig {
            completion_size: Some(3),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(false),
            Err(AccreteError::Config(ConfigError::MissingField { .. }))
        ));
    }

    #[test]
    fn test_interval_and_timeout_conflict() {
        let config = AggregatorConfig {
            completion_timeout_ms: Some(1000),
            completion_interval_ms: Some(1000),
            ..with_key()
        };
        assert!(matches!(
            config.validate(false),
            Err(AccreteError::Config(ConfigError::IntervalAndTimeout))
        ));
    }

    #[test]
    fn test_zero_values_are_unset() {
        let config = AggregatorConfig {
            completion_size: Some(0),
            completion_timeout_ms: Some(0),
            ..with_key()
        };
        assert!(!config.has_completion_trigger());
    }

    #[test]
    fn test_retry_policy_backoff() {
        let policy = OptimisticLockRetryPolicy {
            maximum_retries: 4,
            retry_delay_ms: 50,
            maximum_retry_delay_ms: 150,
            exponential_backoff: true,
        };
        assert_eq!(policy.delay(1), Duration::from_millis(50));
        assert_eq!(policy.delay(2), Duration::from_millis(100));
        assert_eq!(policy.delay(3), Duration::from_millis(150));
        assert!(policy.should_retry(3));
        assert!(!policy.should_retry(4));

        let unlimited = OptimisticLockRetryPolicy::default();
        assert!(unlimited.should_retry(10_000));
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
aggregator:
  correlation:
    header: symbol
  strategy:
    kind: concat_bodies
    separator: ","
  completion_size: 3
  completion_predicate:
    body_contains: END
  close_correlation_key_on_completion: 0
logging:
  level: debug
  format: json
"#;
        let config = AppConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.aggregator.completion_size(), Some(3));
        assert_eq!(
            config.aggregator.strategy,
            StrategyKind::ConcatBodies {
                separator: ",".to_string()
            }
        );
        assert_eq!(config.aggregator.close_correlation_key_on_completion, Some(0));
        assert!(config.aggregator.statistics_enabled);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.parse_level().unwrap(), Level::DEBUG);
        assert!(config.aggregator.validate(false).is_ok());
    }

    #[test]
    fn test_invalid_yaml() {
        let err = AppConfig::from_yaml("aggregator: [").unwrap_err();
        assert!(matches!(
            err,
            AccreteError::Config(ConfigError::InvalidFormat { .. })
        ));
    }
}
