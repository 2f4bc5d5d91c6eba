//! Per-tenant admission control with token buckets.
//!
//! Every tenant gets its own [`TokenBucket`], created full on the first request. Buckets refill
//! continuously and lazily: the balance is only brought up to date when the bucket is used.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;

/// A bucket of tokens refilling continuously up to its capacity.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: u32,
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a full bucket.
    ///
    /// A negative or NaN `refill_rate` is treated as zero, the bucket then never refills.
    pub fn new(capacity: u32, refill_rate: f64, now: Instant) -> Self {
        Self {
            capacity,
            refill_rate: refill_rate.max(0.0),
            tokens: f64::from(capacity),
            last_refill: now,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Deducts `tokens` if at least that many whole tokens are available at `now`.
    pub fn try_acquire_at(&mut self, tokens: u32, now: Instant) -> bool {
        self.refill(now);
        if self.tokens.floor() >= f64::from(tokens) {
            self.tokens -= f64::from(tokens);
            true
        } else {
            false
        }
    }

    /// The balance at `now`, including partially refilled tokens.
    pub fn available_at(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.tokens
    }

    fn refill(&mut self, now: Instant) {
        // Instants are monotonic, but callers may pass an older `now` after another thread
        // already refilled with a newer one.
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens =
            (self.tokens + elapsed.as_secs_f64() * self.refill_rate).min(f64::from(self.capacity));
        self.last_refill = self.last_refill.max(now);
    }
}

type SharedBucket = Arc<Mutex<TokenBucket>>;

/// Admits or rejects requests per tenant.
///
/// Buckets of tenants that have not sent a request for
/// [`idle_timeout`](RateLimitConfig::idle_timeout) are dropped. Such a tenant starts over with a
/// full bucket on its next request.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    capacity: u32,
    refill_rate: f64,
    buckets: moka::sync::Cache<String, SharedBucket>,
}

impl RateLimiter {
    pub fn from_config(config: &RateLimitConfig) -> Self {
        let mut builder = moka::sync::Cache::builder();
        if let Some(idle_timeout) = config.idle_timeout {
            builder = builder.time_to_idle(idle_timeout);
        }

        Self {
            capacity: config.capacity,
            refill_rate: config.refill_rate,
            buckets: builder.build(),
        }
    }

    /// Spends `tokens` from the bucket of `tenant`, creating it with the default shape.
    pub fn allow_request(&self, tenant: &str, tokens: u32) -> bool {
        self.allow_request_with(tenant, tokens, None, None)
    }

    /// Spends `tokens` from the bucket of `tenant`.
    ///
    /// `capacity` and `refill_rate` override the defaults when the bucket is created by this
    /// call. They are ignored for a bucket that already exists.
    pub fn allow_request_with(
        &self,
        tenant: &str,
        tokens: u32,
        capacity: Option<u32>,
        refill_rate: Option<f64>,
    ) -> bool {
        let now = Instant::now();
        let bucket = self
            .buckets
            .entry_by_ref(tenant)
            .or_insert_with(|| {
                let capacity = capacity.unwrap_or(self.capacity);
                let refill_rate = refill_rate.unwrap_or(self.refill_rate);
                tracing::trace!(tenant, capacity, refill_rate, "Creating token bucket");
                Arc::new(Mutex::new(TokenBucket::new(capacity, refill_rate, now)))
            })
            .into_value();

        let allowed = lock(&bucket).try_acquire_at(tokens, now);
        if !allowed {
            tracing::trace!(tenant, tokens, "Rejecting request");
        }
        allowed
    }

    /// The current balance of `tenant`, or `None` if it has no bucket.
    ///
    /// Reading the balance counts as an access, it keeps an idle bucket from being dropped just
    /// like a request does.
    pub fn tokens(&self, tenant: &str) -> Option<f64> {
        let bucket = self.buckets.get(tenant)?;
        let available = lock(&bucket).available_at(Instant::now());
        Some(available)
    }

    /// How long idle buckets are kept.
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.buckets.policy().time_to_idle()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::from_config(&RateLimitConfig::default())
    }
}

fn lock(bucket: &Mutex<TokenBucket>) -> std::sync::MutexGuard<'_, TokenBucket> {
    // A bucket is updated by plain float arithmetic that can not panic halfway.
    bucket.lock().unwrap_or_else(PoisonError::into_inner)
}
