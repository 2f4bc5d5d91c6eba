//! # Idempotent processing
//!
//! A [`Processor`] wraps side-effecting actions identified by an idempotency key. For every key,
//! the action runs at most once per TTL window, concurrent callers of the same key converge on a
//! single execution, and failures are never remembered so that a later attempt can succeed.
//!
//! A call to [`Processor::process`] goes through the following steps:
//!
//! - The [`ResultStore`] is consulted without any lock held. A fresh result is returned right
//!   away and counted as a `cache_hit`.
//! - Otherwise the caller registers itself with the [`Flights`] registry. If another caller is
//!   already registered for the key, a `concurrent_wait` is counted.
//! - The caller waits for the exclusive per-key lock.
//! - Holding the lock, the store is consulted again. A result written in the meantime by
//!   whoever held the lock before is returned without running the action.
//! - Only then the action runs, counted as a `cache_miss`. A successful result is written to
//!   the store; an error is handed back to the caller untouched.
//! - The lock and the registration are released on every path, including panics.
//!
//! Expired results are removed by the [`Janitor`], a background thread owned by the processor.
//! Stop it with [`Processor::shutdown`] when tearing down; dropping the processor only signals
//! the thread without waiting for it.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::caching::{InMemoryStore, ResultStore, StoreError};
use crate::config::ProcessorConfig;

mod counters;
mod flights;
mod janitor;

pub use counters::{Counter, Counters};
pub use flights::{Flight, Flights};
pub use janitor::Janitor;

/// The smallest allowed pause between two sweeps.
const MIN_CLEANUP_INTERVAL: Duration = Duration::from_millis(1);

/// Deduplicates actions by idempotency key, see the [module docs](self).
pub struct Processor<T> {
    ttl: Duration,
    cleanup_interval: Duration,
    storage: Arc<dyn ResultStore<T>>,
    flights: Flights,
    counters: Counters,
    janitor: Mutex<Option<Janitor>>,
}

impl<T> fmt::Debug for Processor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Processor")
            .field("ttl", &self.ttl)
            .field("cleanup_interval", &self.cleanup_interval)
            .field("keys in flight", &self.flights.len())
            .field("counters", &self.counters.snapshot())
            .finish_non_exhaustive()
    }
}

/// Configures and starts a [`Processor`].
pub struct ProcessorBuilder<T> {
    ttl: Duration,
    cleanup_interval: Duration,
    storage: Option<Arc<dyn ResultStore<T>>>,
}

impl<T> ProcessorBuilder<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// How long a successful result is reused.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// The pause between two sweeps of expired results.
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// The backend to keep results in. Defaults to an [`InMemoryStore`].
    pub fn storage(mut self, storage: Arc<dyn ResultStore<T>>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Creates the processor and starts its [`Janitor`].
    pub fn build(self) -> io::Result<Processor<T>> {
        // A zero interval would make the janitor spin.
        let cleanup_interval = self.cleanup_interval.max(MIN_CLEANUP_INTERVAL);
        let storage: Arc<dyn ResultStore<T>> = match self.storage {
            Some(storage) => storage,
            None => Arc::new(InMemoryStore::new()),
        };

        let janitor = Janitor::spawn(Arc::clone(&storage), self.ttl, cleanup_interval)?;

        Ok(Processor {
            ttl: self.ttl,
            cleanup_interval,
            storage,
            flights: Flights::new(),
            counters: Counters::new(),
            janitor: Mutex::new(Some(janitor)),
        })
    }
}

impl<T> Processor<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn builder() -> ProcessorBuilder<T> {
        let defaults = ProcessorConfig::default();
        ProcessorBuilder {
            ttl: defaults.ttl,
            cleanup_interval: defaults.cleanup_interval,
            storage: None,
        }
    }

    /// Creates a processor with an in-memory store.
    pub fn from_config(config: &ProcessorConfig) -> io::Result<Self> {
        Self::builder()
            .ttl(config.ttl)
            .cleanup_interval(config.cleanup_interval)
            .build()
    }

    /// Runs `action` unless a fresh result for `key` exists, and remembers its success.
    ///
    /// Concurrent calls for the same key are serialized, and all but the first one are served
    /// the result of the first successful execution. Any arguments of the action are captured
    /// by the closure.
    ///
    /// # Errors
    ///
    /// The error of a failed `action` is returned as is and nothing is remembered, so the next
    /// call for the key runs the action again. Failures of the [`ResultStore`] are converted
    /// into `E`.
    pub fn process<F, E>(&self, key: &str, action: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<StoreError>,
    {
        if let Some(result) = self.lookup(key)? {
            self.record(Counter::CacheHit);
            return Ok(result);
        }

        let flight = self.flights.enter(key);
        if flight.overlapped() {
            self.record(Counter::ConcurrentWait);
        }
        let _serialized = flight.serialize();

        if let Some(result) = self.lookup(key)? {
            tracing::trace!(key, "Result was computed by a concurrent caller");
            return Ok(result);
        }

        self.record(Counter::CacheMiss);
        let start = Instant::now();
        let outcome = action();
        metric!(
            timer("processor.execution") = start.elapsed(),
            "status" => if outcome.is_ok() { "success" } else { "failure" },
        );

        let result = outcome?;
        self.storage.set_success(key, result.clone(), self.ttl)?;
        Ok(result)
    }

    /// Returns a copy of the counters recorded so far.
    ///
    /// Counters that were never incremented are absent and count as zero.
    pub fn get_metrics(&self) -> BTreeMap<String, u64> {
        self.counters.snapshot()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn cleanup_interval(&self) -> Duration {
        self.cleanup_interval
    }

    /// Stops the [`Janitor`], waiting up to `timeout` for it to exit.
    ///
    /// Calling this more than once has no effect. Calls to [`process`](Self::process) that are
    /// still running are not affected and keep working after shutdown, without expired results
    /// being swept.
    pub fn shutdown(&self, timeout: Duration) {
        if let Some(janitor) = self.take_janitor() {
            if janitor.stop(timeout) {
                tracing::info!("Processor shutdown complete");
            }
        }
    }

    fn lookup(&self, key: &str) -> Result<Option<T>, StoreError> {
        let entry = self.storage.get(key)?;
        Ok(entry
            .filter(|entry| entry.is_fresh(Instant::now(), self.ttl))
            .map(|entry| entry.result))
    }

    fn record(&self, which: Counter) {
        self.counters.increment(which);
        metric!(counter(which.metric_name()) += 1);
    }
}

impl<T> Processor<T> {
    fn take_janitor(&self) -> Option<Janitor> {
        self.janitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl<T> Drop for Processor<T> {
    fn drop(&mut self) {
        if let Some(janitor) = self.take_janitor() {
            tracing::debug!("Processor dropped without shutdown, signalling janitor");
            janitor.signal();
        }
    }
}
