//! # Result caching
//!
//! Every successful execution of an idempotent action is remembered in a [`ResultStore`] for
//! the configured time-to-live. The store is the only place where results live; the
//! [`Processor`](crate::processor::Processor) reads it twice per miss, once without any
//! serialization (the fast path) and once after it acquired the per-key lock, and writes it
//! after a successful execution.
//!
//! ## [`CacheEntry`]
//!
//! An entry records when a result was produced, the result itself and whether the execution
//! succeeded. An entry is *fresh* if it is successful and no older than the TTL. Stale entries
//! are treated as misses by the processor and are eventually removed by
//! [`ResultStore::cleanup_expired`].
//!
//! Failures are never cached. The `success` flag remains part of the entry so that pluggable
//! backends can hand out entries they did not write themselves, and the processor refuses to
//! serve anything but successes.
//!
//! ## Backends
//!
//! [`InMemoryStore`] is the default backend, a single mutex-guarded map. Other backends only
//! need to implement the three [`ResultStore`] operations. Each operation has to be atomic on
//! its own; composing them is the job of the processor.
//!
//! Errors of a backend are reported as [`StoreError`]. Errors during `get` or `set_success`
//! reach the caller of `process`, errors during the periodic sweep are only logged.

mod memory;
mod store;

pub use memory::InMemoryStore;
pub use store::{CacheEntry, ResultStore, StoreError};
