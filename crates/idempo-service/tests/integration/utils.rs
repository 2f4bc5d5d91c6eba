use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use idempo_service::caching::{CacheEntry, InMemoryStore, ResultStore, StoreError};
use idempo_service::processor::Processor;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
/// Installs a logger capturing logs of `idempo_service`, its output is collected by the test
/// runner.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("idempo_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// An error returned by the test actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeError {
    Declined(String),
    Store(StoreError),
}

impl From<StoreError> for ChargeError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

/// Sets up tests and creates a processor with a long cleanup interval.
pub fn setup_processor<T>(ttl: Duration) -> Processor<T>
where
    T: Clone + Send + Sync + 'static,
{
    setup();
    Processor::builder()
        .ttl(ttl)
        .cleanup_interval(Duration::from_secs(3600))
        .build()
        .unwrap()
}

/// A [`ResultStore`] forwarding to an [`InMemoryStore`] while counting accesses.
#[derive(Debug, Default)]
pub struct CountingStore {
    pub inner: InMemoryStore<String>,
    pub gets: AtomicUsize,
    pub sets: AtomicUsize,
}

impl CountingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn sets(&self) -> usize {
        self.sets.load(Ordering::SeqCst)
    }
}

impl ResultStore<String> for CountingStore {
    fn get(&self, key: &str) -> Result<Option<CacheEntry<String>>, StoreError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(key)
    }

    fn set_success(&self, key: &str, result: String, ttl: Duration) -> Result<(), StoreError> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        self.inner.set_success(key, result, ttl)
    }

    fn cleanup_expired(&self, now: Instant, ttl: Duration) -> Result<usize, StoreError> {
        self.inner.cleanup_expired(now, ttl)
    }
}
