use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use idempo_service::config::RateLimitConfig;
use idempo_service::ratelimit::RateLimiter;

use crate::{ChargeError, setup_processor};

#[test]
fn test_limiter_in_front_of_processor() {
    let processor = setup_processor::<String>(Duration::from_secs(60));
    let limiter = RateLimiter::from_config(&RateLimitConfig {
        capacity: 3,
        refill_rate: 0.0,
        idle_timeout: None,
    });
    let calls = AtomicUsize::new(0);

    let mut admitted = 0;
    let mut rejected = 0;
    for i in 0..5 {
        if !limiter.allow_request("shop", 1) {
            rejected += 1;
            continue;
        }
        admitted += 1;

        // the same order is retried, only the first attempt charges
        let result = processor.process("order_1", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ChargeError>(format!("charged by attempt {i}"))
        });
        assert_eq!(result.unwrap(), "charged by attempt 0");
    }

    assert_eq!((admitted, rejected), (3, 2));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    insta::assert_debug_snapshot!(processor.get_metrics(), @r###"
    {
        "cache_hit": 2,
        "cache_miss": 1,
    }
    "###);

    // other tenants are not affected by the exhausted one
    assert!(limiter.allow_request("other", 3));
}
