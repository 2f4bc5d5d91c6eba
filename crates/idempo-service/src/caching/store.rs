use std::time::{Duration, Instant};

use thiserror::Error;

/// An error that happens inside of a [`ResultStore`] backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// A thread panicked while holding the lock of the backend.
    #[error("result store lock poisoned")]
    Poisoned,
    /// The backend failed for a reason of its own.
    ///
    /// The attached string contains the backend's description of the problem.
    #[error("result store backend failed: {0}")]
    Backend(String),
}

/// A result remembered by a [`ResultStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry<T> {
    /// When the result was written.
    pub timestamp: Instant,
    /// The result of the action.
    pub result: T,
    /// Whether the action succeeded.
    pub success: bool,
}

impl<T> CacheEntry<T> {
    /// Creates a successful entry stamped with the current time.
    pub fn success(result: T) -> Self {
        Self {
            timestamp: Instant::now(),
            result,
            success: true,
        }
    }

    /// The age of this entry relative to `now`.
    ///
    /// Entries written after `now` have an age of zero.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.timestamp)
    }

    /// Whether this entry may still be served.
    pub fn is_fresh(&self, now: Instant, ttl: Duration) -> bool {
        self.success && self.age(now) <= ttl
    }

    /// Whether this entry is due for eviction.
    pub fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        self.age(now) > ttl
    }
}

/// A pluggable backend remembering the results of idempotent actions.
pub trait ResultStore<T>: Send + Sync {
    /// Returns the most recently written entry for `key`.
    fn get(&self, key: &str) -> Result<Option<CacheEntry<T>>, StoreError>;

    /// Overwrites the entry for `key` with a fresh successful entry.
    ///
    /// `ttl` is the validity window the processor will apply to this entry. Backends with
    /// native expiry may use it, the in-memory backend ignores it.
    fn set_success(&self, key: &str, result: T, ttl: Duration) -> Result<(), StoreError>;

    /// Removes every entry that is older than `ttl` at `now`.
    ///
    /// Returns the number of removed entries.
    fn cleanup_expired(&self, now: Instant, ttl: Duration) -> Result<usize, StoreError>;
}
