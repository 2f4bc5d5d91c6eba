use std::io::Write;
use std::time::Duration;

use idempo_service::config::Config;
use idempo_service::processor::Processor;
use idempo_service::ratelimit::RateLimiter;

#[test]
fn test_components_from_config_file() {
    crate::setup();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(
        br#"
processor:
  ttl: 200ms
  cleanup_interval: 50ms
  shutdown_timeout: 1s
rate_limits:
  capacity: 2
  refill_rate: 0.0
"#,
    )
    .unwrap();

    let config = Config::get(Some(file.path())).unwrap();
    let processor: Processor<u32> = Processor::from_config(&config.processor).unwrap();
    let limiter = RateLimiter::from_config(&config.rate_limits);

    assert_eq!(processor.ttl(), Duration::from_millis(200));
    assert_eq!(processor.cleanup_interval(), Duration::from_millis(50));
    assert_eq!(limiter.idle_timeout(), Some(Duration::from_secs(3600)));

    assert!(limiter.allow_request("tenant", 2));
    assert!(!limiter.allow_request("tenant", 1));

    processor.shutdown(config.processor.shutdown_timeout);
}
