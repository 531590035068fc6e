//! In-process keyed mutex.

use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per key, created on first use.
pub struct KeyedLock<K> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Clone> KeyedLock<K> {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Waits until no other holder of `key` remains, then returns the guard.
    ///
    /// The entry is dropped again when the last guard or waiter for `key` goes away.
    pub async fn lock(&self, key: K) -> KeyedGuard<'_, K> {
        let mutex = Arc::clone(&self.locks.entry(key.clone()).or_default());
        let guard = mutex.lock_owned().await;
        KeyedGuard {
            locks: &self.locks,
            key,
            guard: Some(guard),
        }
    }

    /// Drops the mutex for `key`; current holders keep their guard.
    pub fn forget(&self, key: &K) {
        self.locks.remove(key);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Held lock for one key.
pub struct KeyedGuard<'a, K: Eq + Hash> {
    locks: &'a DashMap<K, Arc<Mutex<()>>>,
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash> Drop for KeyedGuard<'_, K> {
    fn drop(&mut self) {
        self.guard.take();
        // Waiters hold their own clone, so only the map's reference is left when idle.
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLock<K> {
    fn default() -> Self {
        Self::new()
    }
}
