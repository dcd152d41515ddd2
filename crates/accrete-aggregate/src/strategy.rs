//! Merge Strategies
//!
//! A strategy folds an incoming exchange into the group's accumulated one.
//! It runs inside the aggregator's critical section, so it should be quick
//! and must not call back into the aggregator.

use accrete_core::{Exchange, StrategyError, StrategyKind};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Merge function plus optional lifecycle hooks.
pub trait AggregationStrategy: Send + Sync {
    /// Merges `new` into `old` (absent for the first message of a group).
    fn aggregate(&self, old: Option<Exchange>, new: Exchange) -> Result<Exchange, StrategyError>;

    /// Whether this strategy decides completion before merging.
    fn can_pre_complete(&self) -> bool {
        false
    }

    /// Returns true if the existing group must be completed before `new`
    /// is merged; `new` then starts a fresh group.
    fn pre_complete(&self, _old: Option<&Exchange>, _new: &Exchange) -> Result<bool, StrategyError> {
        Ok(false)
    }

    /// Called just before a completed group is handed downstream.
    fn on_completion(&self, _exchange: &Exchange) {}

    /// Called when a group completes by inactivity timeout.
    fn timeout(&self, _exchange: &Exchange, _timeout: Option<Duration>) {}

    /// Called when an optimistic write of the merged result lost a race.
    fn on_optimistic_lock_failure(&self, _old: Option<&Exchange>, _new: &Exchange) {}
}

/// Keeps the most recent exchange.
#[derive(Debug, Clone, Copy, Default)]
pub struct UseLatestStrategy;

impl AggregationStrategy for UseLatestStrategy {
    fn aggregate(&self, _old: Option<Exchange>, new: Exchange) -> Result<Exchange, StrategyError> {
        Ok(new)
    }
}

/// Keeps the first exchange of the group.
#[derive(Debug, Clone, Copy, Default)]
pub struct UseOriginalStrategy;

impl AggregationStrategy for UseOriginalStrategy {
    fn aggregate(&self, old: Option<Exchange>, new: Exchange) -> Result<Exchange, StrategyError> {
        Ok(old.unwrap_or(new))
    }
}

/// Collects every body into a JSON array on the first exchange.
#[derive(Debug, Clone, Copy, Default)]
pub struct GroupBodiesStrategy;

impl AggregationStrategy for GroupBodiesStrategy {
    fn aggregate(&self, old: Option<Exchange>, new: Exchange) -> Result<Exchange, StrategyError> {
        match old {
            None => {
                let mut first = new;
                let body = std::mem::take(&mut first.body);
                first.body = Value::Array(vec![body]);
                Ok(first)
            }
            Some(mut group) => {
                match &mut group.body {
                    Value::Array(items) => items.push(new.body),
                    other => {
                        return Err(StrategyError::new(format!(
                            "grouped body is not an array: {}",
                            other
                        )))
                    }
                }
                Ok(group)
            }
        }
    }
}

/// Concatenates bodies as text with a separator.
#[derive(Debug, Clone, Default)]
pub struct ConcatBodiesStrategy {
    separator: String,
}

impl ConcatBodiesStrategy {
    pub fn new(separator: impl Into<String>) -> Self {
        Self {
            separator: separator.into(),
        }
    }
}

impl AggregationStrategy for ConcatBodiesStrategy {
    fn aggregate(&self, old: Option<Exchange>, new: Exchange) -> Result<Exchange, StrategyError> {
        match old {
            None => Ok(new),
            Some(mut group) => {
                let text = format!("{}{}{}", group.body_text(), self.separator, new.body_text());
                group.body = Value::String(text);
                Ok(group)
            }
        }
    }
}

/// Merge closure signature.
pub type AggregateFn =
    Arc<dyn Fn(Option<Exchange>, Exchange) -> Result<Exchange, StrategyError> + Send + Sync>;

/// Adapts a plain closure to [`AggregationStrategy`].
#[derive(Clone)]
pub struct FnStrategy {
    func: AggregateFn,
}

impl FnStrategy {
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(Option<Exchange>, Exchange) -> Result<Exchange, StrategyError> + Send + Sync + 'static,
    {
        Self {
            func: Arc::new(func),
        }
    }
}

impl fmt::Debug for FnStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FnStrategy(<function>)")
    }
}

impl AggregationStrategy for FnStrategy {
    fn aggregate(&self, old: Option<Exchange>, new: Exchange) -> Result<Exchange, StrategyError> {
        (self.func)(old, new)
    }
}

/// Builds the strategy named in configuration.
pub fn from_kind(kind: &StrategyKind) -> Arc<dyn AggregationStrategy> {
    match kind {
        StrategyKind::UseLatest => Arc::new(UseLatestStrategy),
        StrategyKind::UseOriginal => Arc::new(UseOriginalStrategy),
        StrategyKind::GroupBodies => Arc::new(GroupBodiesStrategy),
        StrategyKind::ConcatBodies { separator } => {
            Arc::new(ConcatBodiesStrategy::new(separator.clone()))
        }
    }
}
