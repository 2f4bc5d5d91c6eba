use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::{CacheEntry, ResultStore, StoreError};

/// The default [`ResultStore`], keeping all entries in a single mutex-guarded map.
///
/// Expired entries stay in the map until the next [`cleanup_expired`](ResultStore::cleanup_expired)
/// sweep, which visits every entry.
#[derive(Debug)]
pub struct InMemoryStore<T> {
    results: Mutex<HashMap<String, CacheEntry<T>>>,
}

impl<T> Default for InMemoryStore<T> {
    fn default() -> Self {
        Self {
            results: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> InMemoryStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of entries currently held, including expired ones not yet swept.
    ///
    /// A poisoned store still reports the entries it holds.
    pub fn len(&self) -> usize {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, CacheEntry<T>>>, StoreError> {
        self.results.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl<T> ResultStore<T> for InMemoryStore<T>
where
    T: Clone + Send + Sync,
{
    fn get(&self, key: &str) -> Result<Option<CacheEntry<T>>, StoreError> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set_success(&self, key: &str, result: T, _ttl: Duration) -> Result<(), StoreError> {
        self.lock()?.insert(key.to_owned(), CacheEntry::success(result));
        Ok(())
    }

    fn cleanup_expired(&self, now: Instant, ttl: Duration) -> Result<usize, StoreError> {
        let mut results = self.lock()?;
        let before = results.len();
        results.retain(|_, entry| !entry.is_expired(now, ttl));
        Ok(before - results.len())
    }
}
