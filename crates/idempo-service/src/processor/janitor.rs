use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::caching::ResultStore;

/// Notifies the owner of a [`Janitor`] once its thread exits, even by unwinding.
struct ExitNotifier(Sender<()>);

impl Drop for ExitNotifier {
    fn drop(&mut self) {
        let _ = self.0.send(());
    }
}

/// A background thread periodically removing expired results from a [`ResultStore`].
///
/// The first sweep happens right after the thread starts. Between sweeps the thread waits on a
/// channel, so a stop request wakes it up immediately rather than after the full interval.
#[derive(Debug)]
pub struct Janitor {
    stop: Sender<()>,
    exited: Receiver<()>,
    handle: JoinHandle<()>,
}

impl Janitor {
    pub fn spawn<T: 'static>(
        store: Arc<dyn ResultStore<T>>,
        ttl: Duration,
        interval: Duration,
    ) -> io::Result<Self> {
        let (stop, stop_rx) = mpsc::channel();
        let (exit_tx, exited) = mpsc::channel();

        let handle = thread::Builder::new()
            .name("idempo-janitor".into())
            .spawn(move || {
                let _notifier = ExitNotifier(exit_tx);
                run(&*store, ttl, interval, &stop_rx);
            })?;

        Ok(Self {
            stop,
            exited,
            handle,
        })
    }

    /// Stops the janitor and waits up to `timeout` for its thread to exit.
    ///
    /// Returns `false` if the thread did not exit in time. It is left running detached in that
    /// case and exits on its own once its current sweep completes.
    pub fn stop(self, timeout: Duration) -> bool {
        let _ = self.stop.send(());

        match self.exited.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if self.handle.join().is_err() {
                    tracing::error!("Janitor thread panicked");
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    timeout = ?timeout,
                    "Janitor did not exit in time, leaving it detached"
                );
                false
            }
        }
    }

    /// Asks the janitor to stop without waiting for it.
    pub fn signal(self) {
        let _ = self.stop.send(());
    }
}

fn run<T>(store: &dyn ResultStore<T>, ttl: Duration, interval: Duration, stop: &Receiver<()>) {
    tracing::debug!(interval = ?interval, ttl = ?ttl, "Janitor started");
    loop {
        sweep(store, ttl);

        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    tracing::debug!("Janitor stopped");
}

/// Runs a single sweep. Failures are logged and never propagated.
fn sweep<T>(store: &dyn ResultStore<T>, ttl: Duration) {
    // Backends are pluggable, a panicking one must not take the janitor down with it.
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        store.cleanup_expired(Instant::now(), ttl)
    }));

    match result {
        Ok(Ok(0)) => {}
        Ok(Ok(removed)) => {
            tracing::debug!(removed, "Removed expired results");
            metric!(counter("janitor.removed") += removed as i64);
        }
        Ok(Err(err)) => {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "Failed to clean up expired results"
            );
            metric!(counter("janitor.errors") += 1);
        }
        Err(_) => {
            tracing::error!("Cleaning up expired results panicked");
            metric!(counter("janitor.errors") += 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::caching::{CacheEntry, InMemoryStore, StoreError};
    use crate::test;

    use super::*;

    /// A store that counts sweeps, and fails or panics on every one of them.
    #[derive(Default)]
    struct BrokenStore {
        sweeps: AtomicUsize,
        panics: bool,
    }

    impl ResultStore<()> for BrokenStore {
        fn get(&self, _key: &str) -> Result<Option<CacheEntry<()>>, StoreError> {
            Ok(None)
        }

        fn set_success(&self, _key: &str, _result: (), _ttl: Duration) -> Result<(), StoreError> {
            Ok(())
        }

        fn cleanup_expired(&self, _now: Instant, _ttl: Duration) -> Result<usize, StoreError> {
            self.sweeps.fetch_add(1, Ordering::SeqCst);
            if self.panics {
                panic!("backend exploded");
            }
            Err(StoreError::Backend("disk on fire".into()))
        }
    }

    /// A store whose sweeps take far longer than callers are willing to wait.
    struct SlowStore;

    impl ResultStore<()> for SlowStore {
        fn get(&self, _key: &str) -> Result<Option<CacheEntry<()>>, StoreError> {
            Ok(None)
        }

        fn set_success(&self, _key: &str, _result: (), _ttl: Duration) -> Result<(), StoreError> {
            Ok(())
        }

        fn cleanup_expired(&self, _now: Instant, _ttl: Duration) -> Result<usize, StoreError> {
            std::thread::sleep(Duration::from_secs(2));
            Ok(0)
        }
    }

    #[test]
    fn test_sweeps_expired_entries() {
        test::setup();
        let store = Arc::new(InMemoryStore::new());
        let ttl = Duration::from_millis(50);
        store.set_success("key", 1, ttl).unwrap();

        let janitor =
            Janitor::spawn::<i32>(store.clone(), ttl, Duration::from_millis(20)).unwrap();
        std::thread::sleep(Duration::from_millis(300));

        assert!(store.is_empty());
        assert!(janitor.stop(Duration::from_secs(1)));
    }

    #[test]
    fn test_survives_failing_sweeps() {
        test::setup();
        let store = Arc::new(BrokenStore::default());

        let janitor = Janitor::spawn::<()>(
            store.clone(),
            Duration::from_secs(1),
            Duration::from_millis(10),
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(200));

        assert!(store.sweeps.load(Ordering::SeqCst) >= 2);
        assert!(janitor.stop(Duration::from_secs(1)));
    }

    #[test]
    fn test_survives_panicking_sweeps() {
        test::setup();
        let store = Arc::new(BrokenStore {
            panics: true,
            ..Default::default()
        });

        let janitor = Janitor::spawn::<()>(
            store.clone(),
            Duration::from_secs(1),
            Duration::from_millis(10),
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(200));

        assert!(store.sweeps.load(Ordering::SeqCst) >= 2);
        assert!(janitor.stop(Duration::from_secs(1)));
    }

    #[test]
    fn test_stop_interrupts_the_wait() {
        test::setup();
        let store: Arc<InMemoryStore<()>> = Arc::new(InMemoryStore::new());

        let janitor =
            Janitor::spawn::<()>(store, Duration::from_secs(60), Duration::from_secs(3600)).unwrap();
        // give the first sweep a chance to finish
        std::thread::sleep(Duration::from_millis(20));

        let start = Instant::now();
        assert!(janitor.stop(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_stop_times_out_during_slow_sweep() {
        test::setup();
        let janitor = Janitor::spawn::<()>(
            Arc::new(SlowStore),
            Duration::from_secs(60),
            Duration::from_secs(3600),
        )
        .unwrap();
        // let the first sweep start
        std::thread::sleep(Duration::from_millis(20));

        let start = Instant::now();
        assert!(!janitor.stop(Duration::from_millis(100)));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(1), "{elapsed:?}");
    }

    #[test]
    fn test_signal_stops_the_thread() {
        let store: Arc<InMemoryStore<()>> = Arc::new(InMemoryStore::new());
        let weak = Arc::downgrade(&store);

        let janitor =
            Janitor::spawn::<()>(store, Duration::from_secs(60), Duration::from_secs(3600)).unwrap();
        janitor.signal();

        // the thread owns the last reference to the store and drops it on exit
        let deadline = Instant::now() + Duration::from_secs(5);
        while weak.upgrade().is_some() {
            assert!(Instant::now() < deadline, "janitor did not exit");
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}
