//! Common test utilities and helpers for integration tests

#![allow(dead_code)]

use accrete_aggregate::{AggregationRepository, MemoryRepository, OptimisticLockingRepository, StoredExchange};
use accrete_core::error::LockingError;
use accrete_core::{AggregatorConfig, Exchange, ExchangeId, Expression};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Get the path to test fixtures
pub fn fixtures_dir() -> PathBuf {
    let manifest_dir = env!("CARGO_MANIFEST_DIR");
    PathBuf::from(manifest_dir).join("tests").join("fixtures")
}

/// Installs a test-friendly subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "accrete_aggregate=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Exchange correlated by the `id` header
pub fn keyed(body: &str, key: &str) -> Exchange {
    Exchange::new(body).with_header("id", key)
}

/// Correlates on the `id` header, no completion trigger set
pub fn keyed_config() -> AggregatorConfig {
    AggregatorConfig {
        correlation: Some(Expression::Header("id".to_string())),
        ..Default::default()
    }
}

/// Waits up to five seconds for the next completed aggregate.
pub async fn recv(rx: &flume::Receiver<Exchange>) -> Exchange {
    tokio::time::timeout(Duration::from_secs(5), rx.recv_async())
        .await
        .expect("Timed out waiting for a completed aggregate")
        .expect("Sink channel closed")
}

/// Drains whatever has already been delivered.
pub fn drain(rx: &flume::Receiver<Exchange>) -> Vec<Exchange> {
    rx.try_iter().collect()
}

/// Optimistic repository that rejects the first `conflicts` versioned writes.
#[derive(Debug)]
pub struct ContendedRepository {
    inner: MemoryRepository,
    conflicts: AtomicUsize,
    rejected: AtomicUsize,
}

impl ContendedRepository {
    pub fn new(conflicts: usize) -> Self {
        Self {
            inner: MemoryRepository::with_optimistic_locking(),
            conflicts: AtomicUsize::new(conflicts),
            rejected: AtomicUsize::new(0),
        }
    }

    /// Writes rejected so far
    pub fn rejected(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }
}

impl AggregationRepository for ContendedRepository {
    fn get(&self, key: &str) -> Option<StoredExchange> {
        self.inner.get(key)
    }

    fn add(&self, key: &str, exchange: Exchange) -> Option<Exchange> {
        self.inner.add(key, exchange)
    }

    fn remove(&self, key: &str, exchange: &Exchange) {
        self.inner.remove(key, exchange)
    }

    fn confirm(&self, exchange_id: &ExchangeId) {
        self.inner.confirm(exchange_id)
    }

    fn keys(&self) -> Vec<String> {
        self.inner.keys()
    }

    fn as_optimistic(&self) -> Option<&dyn OptimisticLockingRepository> {
        Some(self)
    }
}

impl OptimisticLockingRepository for ContendedRepository {
    fn add_if(
        &self,
        key: &str,
        expected: Option<u64>,
        exchange: Exchange,
    ) -> Result<u64, LockingError> {
        let remaining = self.conflicts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.conflicts.store(remaining - 1, Ordering::SeqCst);
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(LockingError::conflict(key));
        }
        self.inner.add_if(key, expected, exchange)
    }

    fn remove_if(&self, key: &str, exchange: &Exchange, expected: u64) -> Result<(), LockingError> {
        self.inner.remove_if(key, exchange, expected)
    }
}
