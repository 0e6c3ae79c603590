//! Named mutex registry.
//!
//! Serializes work on the same allocation, challenge or write marker across tasks. Each
//! key maps to a lazily created async mutex; the entry is removed again once the last
//! guard for the key is released so the registry does not grow with every allocation the
//! node has ever touched.

use dashmap::DashMap;
use log::trace;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
pub struct LockRegistry {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

/// Holds the named mutex until dropped.
pub struct KeyLock {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until the mutex for `table:key` is free and takes it.
    ///
    /// Blocks for as long as the current holder keeps it; this is a correctness lock.
    pub async fn lock(&self, table: &str, key: &str) -> KeyLock {
        let name = format!("{}:{}", table, key);
        let mutex = self
            .locks
            .entry(name.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        trace!("Waiting for lock {}", name);
        let guard = mutex.lock_owned().await;
        trace!("Acquired lock {}", name);
        KeyLock {
            key: name,
            guard: Some(guard),
            locks: self.locks.clone(),
        }
    }

    /// Number of keys with a live mutex.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl KeyLock {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the registry itself still references the mutex: nobody holds or waits.
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
        trace!("Released lock {}", self.key);
    }
}
