use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// The coordination state of one key.
#[derive(Debug, Default)]
struct KeyRecord {
    /// Serializes executions for this key.
    lock: Arc<Mutex<()>>,
    /// The number of [`Flight`]s currently alive for this key.
    ///
    /// Only used to detect overlapping callers, never for exclusion.
    waiters: usize,
}

/// A registry of per-key locks.
///
/// Records are created when the first caller for a key [`enter`](Self::enter)s and removed once
/// the last [`Flight`] for that key is dropped, so the registry only holds keys that are being
/// executed or waited upon.
///
/// The registry mutex is only held while looking up or updating a record, never while
/// waiting for a per-key lock.
#[derive(Debug, Default)]
pub struct Flights {
    records: Mutex<HashMap<String, KeyRecord>>,
}

impl Flights {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a caller for `key`.
    ///
    /// The returned [`Flight`] has to be kept alive for as long as the caller works on `key`.
    pub fn enter(&self, key: &str) -> Flight<'_> {
        let mut records = self.records();
        let record = records.entry(key.to_owned()).or_default();
        let overlapped = record.waiters > 0;
        record.waiters += 1;

        Flight {
            flights: self,
            key: key.to_owned(),
            lock: Arc::clone(&record.lock),
            overlapped,
        }
    }

    /// The number of keys that currently have registered callers.
    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn leave(&self, key: &str) {
        let mut records = self.records();
        if let Some(record) = records.get_mut(key) {
            record.waiters -= 1;
            if record.waiters == 0 {
                records.remove(key);
            }
        }
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, KeyRecord>> {
        // Records are updated in single statements and stay consistent across panics.
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A registered caller for one key, see [`Flights::enter`].
///
/// Dropping the flight unregisters the caller.
#[derive(Debug)]
pub struct Flight<'a> {
    flights: &'a Flights,
    key: String,
    lock: Arc<Mutex<()>>,
    overlapped: bool,
}

impl Flight<'_> {
    /// Whether another caller was registered for the same key when this one entered.
    pub fn overlapped(&self) -> bool {
        self.overlapped
    }

    /// Blocks until this caller holds the exclusive lock for its key.
    pub fn serialize(&self) -> MutexGuard<'_, ()> {
        // The lock guards no data, a panic of a previous holder is of no concern here.
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        self.flights.leave(&self.key);
    }
}
