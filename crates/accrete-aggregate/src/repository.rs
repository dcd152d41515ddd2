//! Aggregation Repository
//!
//! Keyed store mapping correlation key to the group's accumulated exchange.
//!
//! Three capability levels:
//! - [`AggregationRepository`]: plain get/add/remove/confirm/keys.
//! - [`OptimisticLockingRepository`]: versioned compare-and-swap writes.
//! - [`RecoverableRepository`]: completed-but-unconfirmed exchanges survive
//!   until confirmed, so the recovery task can redeliver them.
//!
//! Every stored group carries a version drawn from a repository-wide
//! monotonic counter. Optimistic writes compare versions, never object
//! identity, so a strategy returning a copy of the old exchange cannot
//! defeat the check, and a key that is removed and recreated never reuses
//! an old version.

use accrete_core::error::LockingError;
use accrete_core::{Exchange, ExchangeId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::trace;

/// A group as stored in the repository.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredExchange {
    pub exchange: Exchange,
    pub version: u64,
}

/// Keyed store for in-flight groups.
pub trait AggregationRepository: Send + Sync {
    /// Current group for `key`.
    fn get(&self, key: &str) -> Option<StoredExchange>;

    /// Stores (or replaces) the group for `key`, returning the previous exchange.
    fn add(&self, key: &str, exchange: Exchange) -> Option<Exchange>;

    /// Removes the group for `key`. `exchange` is the completed aggregate.
    fn remove(&self, key: &str, exchange: &Exchange);

    /// Acknowledges that a completed exchange was processed downstream.
    fn confirm(&self, exchange_id: &ExchangeId);

    /// Snapshot of the keys currently stored.
    fn keys(&self) -> Vec<String>;

    /// Optimistic locking surface, if supported.
    fn as_optimistic(&self) -> Option<&dyn OptimisticLockingRepository> {
        None
    }

    /// Recovery surface, if supported.
    fn as_recoverable(&self) -> Option<&dyn RecoverableRepository> {
        None
    }
}

/// Versioned writes where exactly one concurrent writer wins.
pub trait OptimisticLockingRepository: Send + Sync {
    /// Stores `exchange` only if the current version equals `expected`
    /// (`None` meaning the key must be absent). Returns the new version.
    fn add_if(
        &self,
        key: &str,
        expected: Option<u64>,
        exchange: Exchange,
    ) -> Result<u64, LockingError>;

    /// Removes the group only if its version equals `expected`.
    fn remove_if(&self, key: &str, exchange: &Exchange, expected: u64)
        -> Result<(), LockingError>;
}

/// Recovery settings advertised by a recoverable repository.
#[derive(Debug, Clone)]
pub struct RecoverySettings {
    /// Run the recovery task
    pub use_recovery: bool,
    /// Delay between recovery scans
    pub recovery_interval: Duration,
    /// Redeliveries before moving to the dead letter endpoint; 0 means unlimited
    pub maximum_redeliveries: u32,
    /// Name of the dead letter endpoint
    pub dead_letter_uri: Option<String>,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            use_recovery: true,
            recovery_interval: Duration::from_secs(5),
            maximum_redeliveries: 0,
            dead_letter_uri: None,
        }
    }
}

/// Repository that keeps completed exchanges until they are confirmed.
pub trait RecoverableRepository: Send + Sync {
    /// Ids of completed exchanges awaiting confirmation.
    fn scan(&self) -> Vec<ExchangeId>;

    /// Loads a completed exchange for redelivery.
    fn recover(&self, exchange_id: &ExchangeId) -> Option<Exchange>;

    /// Confirms a completed exchange, reporting whether it was actually removed.
    fn confirm_with_result(&self, exchange_id: &ExchangeId) -> bool;

    fn settings(&self) -> &RecoverySettings;
}

/// Versioned map shared by the in-memory repositories.
#[derive(Debug, Default)]
struct VersionedStore {
    groups: DashMap<String, StoredExchange>,
    next_version: AtomicU64,
}

impl VersionedStore {
    fn next_version(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn get(&self, key: &str) -> Option<StoredExchange> {
        self.groups.get(key).map(|entry| entry.value().clone())
    }

    fn add(&self, key: &str, exchange: Exchange) -> Option<Exchange> {
        let version = self.next_version();
        self.groups
            .insert(key.to_string(), StoredExchange { exchange, version })
            .map(|previous| previous.exchange)
    }

    fn remove(&self, key: &str) -> Option<StoredExchange> {
        self.groups.remove(key).map(|(_, stored)| stored)
    }

    fn add_if(
        &self,
        key: &str,
        expected: Option<u64>,
        exchange: Exchange,
    ) -> Result<u64, LockingError> {
        let version = self.next_version();
        match (self.groups.entry(key.to_string()), expected) {
            (Entry::Occupied(mut entry), Some(expected)) if entry.get().version == expected => {
                entry.insert(StoredExchange { exchange, version });
                Ok(version)
            }
            (Entry::Vacant(entry), None) => {
                entry.insert(StoredExchange { exchange, version });
                Ok(version)
            }
            (entry, expected) => {
                let found = match &entry {
                    Entry::Occupied(e) => Some(e.get().version),
                    Entry::Vacant(_) => None,
                };
                trace!(key, ?expected, ?found, "Optimistic add rejected");
                Err(LockingError::conflict(key))
            }
        }
    }

    fn remove_if(&self, key: &str, expected: u64) -> Result<StoredExchange, LockingError> {
        self.groups
            .remove_if(key, |_, stored| stored.version == expected)
            .map(|(_, stored)| stored)
            .ok_or_else(|| LockingError::conflict(key))
    }

    fn keys(&self) -> Vec<String> {
        self.groups.iter().map(|entry| entry.key().clone()).collect()
    }
}

/// Default in-memory repository.
///
/// A single concurrent map. Confirmation is a no-op because nothing
/// outlives the process.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    store: VersionedStore,
    optimistic_locking: bool,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a repository that advertises optimistic locking support.
    pub fn with_optimistic_locking() -> Self {
        Self {
            store: VersionedStore::default(),
            optimistic_locking: true,
        }
    }

    pub fn len(&self) -> usize {
        self.store.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.groups.is_empty()
    }
}

impl AggregationRepository for MemoryRepository {
    fn get(&self, key: &str) -> Option<StoredExchange> {
        self.store.get(key)
    }

    fn add(&self, key: &str, exchange: Exchange) -> Option<Exchange> {
        self.store.add(key, exchange)
    }

    fn remove(&self, key: &str, _exchange: &Exchange) {
        self.store.remove(key);
    }

    fn confirm(&self, _exchange_id: &ExchangeId) {}

    fn keys(&self) -> Vec<String> {
        self.store.keys()
    }

    fn as_optimistic(&self) -> Option<&dyn OptimisticLockingRepository> {
        if self.optimistic_locking {
            Some(self)
        } else {
            None
        }
    }
}

impl OptimisticLockingRepository for MemoryRepository {
    fn add_if(
        &self,
        key: &str,
        expected: Option<u64>,
        exchange: Exchange,
    ) -> Result<u64, LockingError> {
        self.store.add_if(key, expected, exchange)
    }

    fn remove_if(
        &self,
        key: &str,
        _exchange: &Exchange,
        expected: u64,
    ) -> Result<(), LockingError> {
        self.store.remove_if(key, expected).map(|_| ())
    }
}

/// In-memory repository with recovery semantics.
///
/// Removing a group moves the completed exchange into a "completed" store
/// where it stays until confirmed. It models the contract durable
/// repositories implement; it does not itself survive a restart.
#[derive(Debug, Default)]
pub struct MemoryRecoverableRepository {
    store: VersionedStore,
    completed: DashMap<ExchangeId, Exchange>,
    settings: RecoverySettings,
}

impl MemoryRecoverableRepository {
    pub fn new(settings: RecoverySettings) -> Self {
        Self {
            store: VersionedStore::default(),
            completed: DashMap::new(),
            settings,
        }
    }

    /// Number of completed exchanges awaiting confirmation.
    pub fn completed_len(&self) -> usize {
        self.completed.len()
    }

    fn mark_completed(&self, exchange: &Exchange) {
        self.completed.insert(exchange.id(), exchange.clone());
    }
}

impl AggregationRepository for MemoryRecoverableRepository {
    fn get(&self, key: &str) -> Option<StoredExchange> {
        self.store.get(key)
    }

    fn add(&self, key: &str, exchange: Exchange) -> Option<Exchange> {
        self.store.add(key, exchange)
    }

    fn remove(&self, key: &str, exchange: &Exchange) {
        self.store.remove(key);
        self.mark_completed(exchange);
    }

    fn confirm(&self, exchange_id: &ExchangeId) {
        self.completed.remove(exchange_id);
    }

    fn keys(&self) -> Vec<String> {
        self.store.keys()
    }

    fn as_optimistic(&self) -> Option<&dyn OptimisticLockingRepository> {
        Some(self)
    }

    fn as_recoverable(&self) -> Option<&dyn RecoverableRepository> {
        Some(self)
    }
}

impl OptimisticLockingRepository for MemoryRecoverableRepository {
    fn add_if(
        &self,
        key: &str,
        expected: Option<u64>,
        exchange: Exchange,
    ) -> Result<u64, LockingError> {
        self.store.add_if(key, expected, exchange)
    }

    fn remove_if(
        &self,
        key: &str,
        exchange: &Exchange,
        expected: u64,
    ) -> Result<(), LockingError> {
        self.store.remove_if(key, expected)?;
        self.mark_completed(exchange);
        Ok(())
    }
}

impl RecoverableRepository for MemoryRecoverableRepository {
    fn scan(&self) -> Vec<ExchangeId> {
        self.completed.iter().map(|entry| *entry.key()).collect()
    }

    fn recover(&self, exchange_id: &ExchangeId) -> Option<Exchange> {
        self.completed.get(exchange_id).map(|entry| entry.value().clone())
    }

    fn confirm_with_result(&self, exchange_id: &ExchangeId) -> bool {
        self.completed.remove(exchange_id).is_some()
    }

    fn settings(&self) -> &RecoverySettings {
        &self.settings
    }
}
