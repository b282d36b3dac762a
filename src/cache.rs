//! Get-or-create cache with at most one initialisation in flight per key
//!
//! Each key owns a `tokio::sync::OnceCell`. Concurrent callers for the same
//! key await the single running initialiser; a failed initialiser leaves the
//! cell empty so the next caller retries. Entries are never evicted, only
//! removed by explicit invalidation.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::OnceCell;

pub struct AsyncCache<K, V> {
    entries: Mutex<HashMap<K, Arc<OnceCell<V>>>>,
}

impl<K, V> AsyncCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, Arc<OnceCell<V>>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the cached value for `key`, running `init` if there is none.
    ///
    /// Only one `init` runs per key at a time; other callers wait for it and
    /// share its result. Errors are returned to the caller that ran `init`
    /// and are not stored.
    pub async fn get_or_try_insert_with<F, Fut, E>(&self, key: K, init: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let cell = {
            let mut entries = self.lock();
            Arc::clone(
                entries
                    .entry(key)
                    .or_insert_with(|| Arc::new(OnceCell::new())),
            )
        };

        cell.get_or_try_init(init).await.cloned()
    }

    /// Cached value for `key`, if initialised.
    pub fn get(&self, key: &K) -> Option<V> {
        self.lock().get(key).and_then(|cell| cell.get().cloned())
    }

    /// Remove the entry for `key` if its current value satisfies `matches`.
    ///
    /// Callers pass the instance they saw fail, so a replacement created by a
    /// concurrent caller in the meantime is left alone.
    pub fn invalidate_if<P>(&self, key: &K, matches: P) -> Option<V>
    where
        P: FnOnce(&V) -> bool,
    {
        let mut entries = self.lock();
        let current = entries.get(key)?.get()?.clone();
        if !matches(&current) {
            return None;
        }
        entries.remove(key);
        Some(current)
    }

    /// Remove the entry for `key` whatever its value.
    ///
    /// An entry whose initialiser is still running is left alone, so its
    /// waiters and later callers keep sharing the one result.
    pub fn invalidate(&self, key: &K) -> Option<V> {
        self.invalidate_if(key, |_| true)
    }

    /// Number of initialised entries.
    pub fn len(&self) -> usize {
        self.lock()
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> Default for AsyncCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
