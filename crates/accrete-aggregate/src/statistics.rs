//! Aggregation Statistics
//!
//! Counters for messages in, groups completed (overall and per completion
//! reason) and groups discarded. Every counter is also exported through the
//! `metrics` facade so an installed recorder picks them up.

use accrete_core::CompletionReason;
use metrics::{counter, describe_counter};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Live statistics counters.
#[derive(Debug)]
pub struct AggregationStatistics {
    enabled: AtomicBool,
    total_in: AtomicU64,
    total_completed: AtomicU64,
    discarded: AtomicU64,
    by_reason: [AtomicU64; 7],
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatisticsSnapshot {
    pub total_in: u64,
    pub total_completed: u64,
    pub completed_by_size: u64,
    pub completed_by_predicate: u64,
    pub completed_by_consumer: u64,
    pub completed_by_strategy: u64,
    pub completed_by_interval: u64,
    pub completed_by_timeout: u64,
    pub completed_by_force: u64,
    pub discarded: u64,
}

fn reason_index(reason: CompletionReason) -> usize {
    match reason {
        CompletionReason::Size => 0,
        CompletionReason::Predicate => 1,
        CompletionReason::Consumer => 2,
        CompletionReason::Strategy => 3,
        CompletionReason::Interval => 4,
        CompletionReason::Timeout => 5,
        CompletionReason::Force => 6,
    }
}

impl AggregationStatistics {
    pub fn new(enabled: bool) -> Self {
        describe_counter!(
            "aggregator_exchanges_in_total",
            "Total exchanges submitted to the aggregator"
        );
        describe_counter!(
            "aggregator_completed_total",
            "Total groups completed, labelled by completion reason"
        );
        describe_counter!(
            "aggregator_discarded_total",
            "Total completed groups discarded instead of delivered"
        );

        Self {
            enabled: AtomicBool::new(enabled),
            total_in: AtomicU64::new(0),
            total_completed: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            by_reason: Default::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn record_in(&self) {
        if !self.is_enabled() {
            return;
        }
        self.total_in.fetch_add(1, Ordering::Relaxed);
        counter!("aggregator_exchanges_in_total").increment(1);
    }

    pub fn record_completed(&self, reason: CompletionReason) {
        if !self.is_enabled() {
            return;
        }
        self.total_completed.fetch_add(1, Ordering::Relaxed);
        self.by_reason[reason_index(reason)].fetch_add(1, Ordering::Relaxed);
        counter!("aggregator_completed_total", "reason" => reason.as_str()).increment(1);
    }

    pub fn record_discarded(&self) {
        if !self.is_enabled() {
            return;
        }
        self.discarded.fetch_add(1, Ordering::Relaxed);
        counter!("aggregator_discarded_total").increment(1);
    }

    pub fn completed_by(&self, reason: CompletionReason) -> u64 {
        self.by_reason[reason_index(reason)].load(Ordering::Relaxed)
    }

    /// Zeroes every counter.
    pub fn reset(&self) {
        self.total_in.store(0, Ordering::Relaxed);
        self.total_completed.store(0, Ordering::Relaxed);
        self.discarded.store(0, Ordering::Relaxed);
        for counter in &self.by_reason {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            total_in: self.total_in.load(Ordering::Relaxed),
            total_completed: self.total_completed.load(Ordering::Relaxed),
            completed_by_size: self.completed_by(CompletionReason::Size),
            completed_by_predicate: self.completed_by(CompletionReason::Predicate),
            completed_by_consumer: self.completed_by(CompletionReason::Consumer),
            completed_by_strategy: self.completed_by(CompletionReason::Strategy),
            completed_by_interval: self.completed_by(CompletionReason::Interval),
            completed_by_timeout: self.completed_by(CompletionReason::Timeout),
            completed_by_force: self.completed_by(CompletionReason::Force),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

impl Default for AggregationStatistics {
    fn default() -> Self {
        Self::new(true)
    }
}
