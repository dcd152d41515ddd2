//! # Accrete Core
//!
//! Core types, error handling, and configuration for the Accrete message aggregator.
//!
//! - **Exchange**: the message envelope (`Exchange`, `ExchangeId`) with its
//!   typed aggregation properties and the `CompletionReason` tag.
//! - **Expressions**: `Expression` and `Predicate`, used for correlation keys,
//!   dynamic completion sizes and timeouts, and completion predicates.
//! - **Errors**: `thiserror` enums covering input rejection, merge failures,
//!   optimistic locking, delivery and startup configuration.
//! - **Configuration**: YAML and environment-driven `AppConfig`.
//!
//! ## Example
//!
//! ```
//! use accrete_core::{Exchange, Expression};
//!
//! let exchange = Exchange::new("line item").with_header("invoice", "INV-1");
//! let key = Expression::Header("invoice".to_string()).evaluate_string(&exchange);
//! assert_eq!(key.as_deref(), Some("INV-1"));
//! ```

pub mod config;
pub mod error;
pub mod exchange;
pub mod expression;

pub use config::{AggregatorConfig, AppConfig, OptimisticLockRetryPolicy, StrategyKind};
pub use error::{AccreteError, Result, StrategyError};
pub use exchange::{headers, CompletionReason, Exchange, ExchangeId, ExchangeProperties, Headers};
pub use expression::{Expression, Predicate};
