//! Expressions and predicates evaluated against an exchange.
//!
//! These drive the correlation key, dynamic completion size, dynamic
//! completion timeout and the completion predicate. All variants except
//! `Custom` can be written in YAML configuration.

use crate::exchange::Exchange;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Closure evaluated against an exchange.
pub type ExpressionFn = Arc<dyn Fn(&Exchange) -> Option<Value> + Send + Sync>;

/// Closure deciding whether an exchange matches.
pub type PredicateFn = Arc<dyn Fn(&Exchange) -> bool + Send + Sync>;

/// A value computed from an exchange.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expression {
    /// Value of a header
    Header(String),
    /// Value of a free-form property
    Property(String),
    /// The whole body
    Body,
    /// A JSON pointer into the body, e.g. `/order/id`
    BodyPointer(String),
    /// A fixed value
    Constant(Value),
    /// Custom closure
    #[serde(skip)]
    Custom(ExpressionFn),
}

impl fmt::Debug for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Header(name) => f.debug_tuple("Header").field(name).finish(),
            Self::Property(name) => f.debug_tuple("Property").field(name).finish(),
            Self::Body => write!(f, "Body"),
            Self::BodyPointer(ptr) => f.debug_tuple("BodyPointer").field(ptr).finish(),
            Self::Constant(v) => f.debug_tuple("Constant").field(v).finish(),
            Self::Custom(_) => write!(f, "Custom(<function>)"),
        }
    }
}

impl Expression {
    /// Wraps a closure as an expression.
    pub fn custom<F>(func: F) -> Self
    where
        F: Fn(&Exchange) -> Option<Value> + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(func))
    }

    /// Evaluates to a raw JSON value. `Null` is reported as `None`.
    pub fn evaluate(&self, exchange: &Exchange) -> Option<Value> {
        let value = match self {
            Expression::Header(name) => exchange.headers.get(name).cloned(),
            Expression::Property(name) => exchange.properties.extra.get(name).cloned(),
            Expression::Body => Some(exchange.body.clone()),
            Expression::BodyPointer(ptr) => exchange.body.pointer(ptr).cloned(),
            Expression::Constant(v) => Some(v.clone()),
            Expression::Custom(func) => func(exchange),
        };
        value.filter(|v| !v.is_null())
    }

    /// Evaluates and coerces to a string. Strings are taken verbatim,
    /// other scalars are rendered, containers are rendered as JSON.
    pub fn evaluate_string(&self, exchange: &Exchange) -> Option<String> {
        self.evaluate(exchange).map(|v| match v {
            Value::String(s) => s,
            other => other.to_string(),
        })
    }

    /// Evaluates and coerces to an integer. Numeric strings are parsed.
    pub fn evaluate_i64(&self, exchange: &Exchange) -> Option<i64> {
        match self.evaluate(exchange)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// A condition over an exchange.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    /// Body text contains the given substring
    BodyContains(String),
    /// Header equals the given value
    HeaderEquals { name: String, value: Value },
    /// Header is present and not null
    HeaderExists(String),
    /// Negation
    Not(Box<Predicate>),
    /// Every predicate matches
    All(Vec<Predicate>),
    /// At least one predicate matches
    Any(Vec<Predicate>),
    /// Custom closure
    #[serde(skip)]
    Custom(PredicateFn),
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BodyContains(s) => f.debug_tuple("BodyContains").field(s).finish(),
            Self::HeaderEquals { name, value } => f
                .debug_struct("HeaderEquals")
                .field("name", name)
                .field("value", value)
                .finish(),
            Self::HeaderExists(name) => f.debug_tuple("HeaderExists").field(name).finish(),
            Self::Not(inner) => f.debug_tuple("Not").field(inner).finish(),
            Self::All(list) => f.debug_tuple("All").field(list).finish(),
            Self::Any(list) => f.debug_tuple("Any").field(list).finish(),
            Self::Custom(_) => write!(f, "Custom(<function>)"),
        }
    }
}

impl Predicate {
    /// Wraps a closure as a predicate.
    pub fn custom<F>(func: F) -> Self
    where
        F: Fn(&Exchange) -> bool + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(func))
    }

    /// Check if the exchange matches this predicate
    pub fn matches(&self, exchange: &Exchange) -> bool {
        match self {
            Predicate::BodyContains(needle) => exchange.body_text().contains(needle.as_str()),
            Predicate::HeaderEquals { name, value } => exchange.headers.get(name) == Some(value),
            Predicate::HeaderExists(name) => exchange
                .headers
                .get(name)
                .map(|v| !v.is_null())
                .unwrap_or(false),
            Predicate::Not(inner) => !inner.matches(exchange),
            Predicate::All(list) => list.iter().all(|p| p.matches(exchange)),
            Predicate::Any(list) => list.iter().any(|p| p.matches(exchange)),
            Predicate::Custom(func) => func(exchange),
        }
    }
}
