use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

/// The counters recorded by a [`Processor`](super::Processor).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    /// A fresh result was found without taking the per-key lock.
    CacheHit,
    /// The action was actually invoked.
    CacheMiss,
    /// A caller found another caller registered for the same key.
    ConcurrentWait,
}

impl Counter {
    /// The name of the statsd counter emitted alongside the in-memory one.
    pub(super) fn metric_name(self) -> &'static str {
        match self {
            Self::CacheHit => "processor.cache_hit",
            Self::CacheMiss => "processor.cache_miss",
            Self::ConcurrentWait => "processor.concurrent_wait",
        }
    }
}

impl AsRef<str> for Counter {
    fn as_ref(&self) -> &str {
        match self {
            Self::CacheHit => "cache_hit",
            Self::CacheMiss => "cache_miss",
            Self::ConcurrentWait => "concurrent_wait",
        }
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

/// A thread-safe registry of named, monotonically increasing counters.
#[derive(Debug, Default)]
pub struct Counters {
    table: Mutex<BTreeMap<String, u64>>,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, name: impl AsRef<str>) {
        // A panic can not leave a half-written count behind, so poisoning is ignored.
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let name = name.as_ref();
        match table.get_mut(name) {
            Some(count) => *count += 1,
            None => {
                table.insert(name.to_owned(), 1);
            }
        }
    }

    /// Returns a copy of all counters recorded so far.
    ///
    /// Counters that were never incremented are absent.
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
