//! Accrete Aggregation Core
//!
//! Correlation-based message aggregation: exchanges sharing a correlation
//! key are merged into one group, and the group is released downstream when
//! a completion trigger fires (size, predicate, inactivity timeout, periodic
//! interval, batch boundary, strategy signal or explicit force).
//!
//! # Architecture
//!
//! ```text
//!   submit(exchange)
//!         │
//!   ┌─────▼─────────────────────────────────┐
//!   │        Aggregation Engine             │
//!   │  (engine.rs)                          │      ┌──────────────────┐
//!   │  - correlation key / closed keys      │◄─────┤ Timeout Tracker  │
//!   │  - shared lock or optimistic retry    │      │  (timeout.rs)    │
//!   │  - merge + completion triggers        │      └──────────────────┘
//!   │  - interval sweep, force ops          │      ┌──────────────────┐
//!   │                                       │◄─────┤  Recovery Task   │
//!   └───┬──────────────┬─────────────┬──────┘      │  (recovery.rs)   │
//!       │              │             │             └──────────────────┘
//!  ┌────▼───────┐ ┌────▼──────┐ ┌────▼─────────┐
//!  │ Repository │ │ Strategy  │ │  Statistics  │
//!  │(repository)│ │(strategy) │ │(statistics)  │
//!  └────────────┘ └───────────┘ └──────────────┘
//!       │
//!   completed groups ──► dispatcher (flume) ──► AggregateSink (sink.rs)
//! ```
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use accrete_aggregate::prelude::*;
//! use accrete_core::{AggregatorConfig, Exchange, Expression};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AggregatorConfig {
//!         correlation: Some(Expression::Header("invoice".to_string())),
//!         completion_size: Some(3),
//!         ..Default::default()
//!     };
//!
//!     let (sink, completed) = ChannelSink::unbounded();
//!     let engine = AggregationEngine::builder(config)
//!         .strategy(GroupBodiesStrategy)
//!         .sink(sink)
//!         .build()?;
//!     engine.start().await?;
//!
//!     for item in ["a", "b", "c"] {
//!         engine
//!             .submit(Exchange::new(item).with_header("invoice", "INV-1"))
//!             .await?;
//!     }
//!
//!     let invoice = completed.recv_async().await?;
//!     println!("{}", invoice.body);
//!
//!     engine.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod closed_keys;
pub mod engine;
pub mod recovery;
pub mod repository;
pub mod sink;
pub mod statistics;
pub mod strategy;
pub mod timeout;

// Re-export commonly used types
pub use closed_keys::ClosedKeyCache;
pub use engine::{AggregationEngine, AggregationEngineBuilder, EngineState};
pub use recovery::RedeliveryState;
pub use repository::{
    AggregationRepository, MemoryRecoverableRepository, MemoryRepository,
    OptimisticLockingRepository, RecoverableRepository, RecoverySettings, StoredExchange,
};
pub use sink::{AggregateSink, ChannelSink};
pub use statistics::{AggregationStatistics, StatisticsSnapshot};
pub use strategy::{
    from_kind, AggregationStrategy, ConcatBodiesStrategy, FnStrategy, GroupBodiesStrategy,
    UseLatestStrategy, UseOriginalStrategy,
};
pub use timeout::{TimeoutEntry, TimeoutTracker};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::engine::{AggregationEngine, EngineState};
    pub use crate::repository::{AggregationRepository, MemoryRepository};
    pub use crate::sink::{AggregateSink, ChannelSink};
    pub use crate::strategy::{AggregationStrategy, GroupBodiesStrategy, UseLatestStrategy};
}
