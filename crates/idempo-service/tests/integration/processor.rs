use std::sync::Barrier;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use idempo_service::caching::{InMemoryStore, ResultStore};
use idempo_service::processor::Processor;

use crate::{ChargeError, CountingStore, setup, setup_processor};

#[test]
fn test_payment_is_charged_once_per_window() {
    let processor = setup_processor(Duration::from_secs(1));
    let calls = AtomicUsize::new(0);
    let charge = |amount: u32| {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok::<_, ChargeError>(format!("charged {amount}"))
    };

    let first = processor.process("pay_42", || charge(100));
    let second = processor.process("pay_42", || charge(100));
    assert_eq!(first, Ok("charged 100".to_owned()));
    assert_eq!(second, first);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    std::thread::sleep(Duration::from_millis(1100));
    let third = processor.process("pay_42", || charge(100));
    assert_eq!(third, first);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    processor.shutdown(Duration::from_secs(1));
}

#[test]
fn test_storm_of_retries() {
    let processor = setup_processor::<u64>(Duration::from_secs(60));
    let calls = AtomicUsize::new(0);
    let barrier = Barrier::new(50);

    std::thread::scope(|s| {
        for _ in 0..50 {
            s.spawn(|| {
                barrier.wait();
                let result = processor.process("k", || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(10));
                    Ok::<_, ChargeError>(42)
                });
                assert_eq!(result, Ok(42));
            });
        }
    });

    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let metrics = processor.get_metrics();
    assert_eq!(metrics["cache_miss"], 1);
    assert!(metrics.get("concurrent_wait").copied().unwrap_or(0) >= 1);
}

#[test]
fn test_declined_payment_is_retried() {
    let processor: Processor<String> = setup_processor(Duration::from_secs(60));
    let calls = AtomicUsize::new(0);
    let decline = || {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(ChargeError::Declined("declined".into()))
    };

    let first = processor.process("err", decline);
    let second = processor.process("err", decline);

    assert_eq!(first, Err(ChargeError::Declined("declined".into())));
    assert_eq!(second, first);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_custom_store() {
    setup();
    let store = CountingStore::new();
    let processor = Processor::<String>::builder()
        .ttl(Duration::from_secs(60))
        .cleanup_interval(Duration::from_secs(3600))
        .storage(store.clone())
        .build()
        .unwrap();

    for _ in 0..3 {
        let result = processor.process("key", || Ok::<_, ChargeError>("value".to_owned()));
        assert_eq!(result.unwrap(), "value");
    }

    // a miss looks up twice, each hit once
    assert_eq!(store.gets(), 4);
    assert_eq!(store.sets(), 1);
    assert_eq!(store.inner.len(), 1);
    processor.shutdown(Duration::from_secs(1));
}

#[test]
fn test_expired_results_are_swept() {
    setup();
    let store = std::sync::Arc::new(InMemoryStore::new());
    let processor = Processor::<u8>::builder()
        .ttl(Duration::from_millis(50))
        .cleanup_interval(Duration::from_millis(20))
        .storage(store.clone())
        .build()
        .unwrap();

    for key in ["a", "b", "c"] {
        processor.process(key, || Ok::<_, ChargeError>(1)).unwrap();
    }
    assert_eq!(store.len(), 3);

    std::thread::sleep(Duration::from_millis(300));
    assert!(store.is_empty());
    assert_eq!(store.cleanup_expired(Instant::now(), Duration::ZERO), Ok(0));

    let start = Instant::now();
    processor.shutdown(Duration::from_secs(5));
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn test_drop_without_shutdown() {
    let processor = setup_processor::<u8>(Duration::from_secs(60));
    processor.process("k", || Ok::<_, ChargeError>(1)).unwrap();
    drop(processor);
}
