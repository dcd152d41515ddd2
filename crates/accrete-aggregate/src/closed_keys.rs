//! Closed Correlation Keys
//!
//! Remembers keys whose groups already completed so late arrivals can be
//! rejected. A capacity of zero keeps every key; a positive capacity keeps
//! only the most recently closed ones.

use dashmap::DashSet;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Set of closed keys with optional LRU bound.
#[derive(Debug)]
pub struct ClosedKeyCache {
    entries: DashSet<String>,
    /// Insertion order for eviction, only used when bounded
    queue: Mutex<VecDeque<String>>,
    /// Maximum number of keys; 0 is unbounded
    capacity: usize,
}

impl ClosedKeyCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashSet::new(),
            queue: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    /// Closes `key`. Re-closing an already closed key is a no-op.
    pub fn close(&self, key: &str) {
        if !self.entries.insert(key.to_string()) {
            return;
        }
        if self.capacity == 0 {
            return;
        }

        let mut queue = self.queue.lock();
        queue.push_back(key.to_string());
        while queue.len() > self.capacity {
            if let Some(oldest) = queue.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Reopens every key.
    pub fn clear(&self) {
        let mut queue = self.queue.lock();
        self.entries.clear();
        queue.clear();
    }
}
