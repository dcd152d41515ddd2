//! Completion Timeout Tracker
//!
//! Tracks an inactivity deadline per correlation key. Refreshing a key
//! replaces its previous deadline, so the timer restarts on every message.
//! A background poller periodically asks the owner to purge; the owner
//! takes its shared lock first and then drains expired keys from here.

use accrete_core::ExchangeId;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// A tracked key's deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutEntry {
    /// Exchange that last refreshed the deadline
    pub exchange_id: ExchangeId,
    /// Inactivity window
    pub timeout: Duration,
    /// When the window elapses
    pub deadline: Instant,
}

/// Key to deadline map with a background poller.
#[derive(Default)]
pub struct TimeoutTracker {
    entries: Mutex<HashMap<String, TimeoutEntry>>,
    task: RwLock<Option<JoinHandle<()>>>,
}

impl TimeoutTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts or refreshes the inactivity window for `key`.
    pub fn put(&self, key: &str, exchange_id: ExchangeId, timeout: Duration) {
        let entry = TimeoutEntry {
            exchange_id,
            timeout,
            deadline: Instant::now() + timeout,
        };
        trace!(key, timeout_ms = timeout.as_millis() as u64, "Updating completion timeout");
        self.entries.lock().insert(key.to_string(), entry);
    }

    /// Stops tracking `key`.
    pub fn remove(&self, key: &str) -> Option<TimeoutEntry> {
        self.entries.lock().remove(key)
    }

    pub fn get(&self, key: &str) -> Option<TimeoutEntry> {
        self.entries.lock().get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Removes and returns every key whose deadline is at or before `now`,
    /// earliest deadline first.
    pub fn take_expired(&self, now: Instant) -> Vec<(String, TimeoutEntry)> {
        let mut entries = self.entries.lock();
        let mut expired: Vec<(String, TimeoutEntry)> = entries
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(key, entry)| (key.clone(), *entry))
            .collect();
        for (key, _) in &expired {
            entries.remove(key);
        }
        expired.sort_by_key(|(_, entry)| entry.deadline);
        expired
    }

    /// Starts the poller. `purge` runs every `poll_interval` and returns
    /// false once its owner is gone, which ends the poller.
    pub fn start<F>(&self, poll_interval: Duration, purge: F)
    where
        F: Fn() -> bool + Send + 'static,
    {
        let task = tokio::spawn(async move {
            debug!(poll_ms = poll_interval.as_millis() as u64, "Timeout checker started");
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !purge() {
                    break;
                }
            }
            debug!("Timeout checker stopped");
        });

        if let Some(previous) = self.task.write().replace(task) {
            previous.abort();
        }
    }

    /// Stops the poller and forgets every deadline.
    pub fn stop(&self) {
        if let Some(task) = self.task.write().take() {
            task.abort();
        }
        self.entries.lock().clear();
    }
}

impl Drop for TimeoutTracker {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}
