use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use rand::Rng;
use sketches_ddsketch::DDSketch;

use idempo_service::config::Config;
use idempo_service::processor::Processor;
use idempo_service::ratelimit::RateLimiter;

use crate::workloads::{Workload, WorkloadsConfig};

/// What happened to a single request.
enum Outcome {
    Succeeded,
    Failed,
    Rejected,
}

/// The results collected for one workload.
#[derive(Default)]
struct Stats {
    durations: Mutex<DDSketch>,
    failed: AtomicUsize,
    rejected: AtomicUsize,
}

/// Issues a single request of workload `index`.
fn run_request(
    processor: &Processor<u64>,
    limiter: &RateLimiter,
    index: usize,
    workload: &Workload,
) -> Outcome {
    let mut rng = rand::rng();

    if let Some(tenants) = workload.tenants {
        let tenant = format!("workload-{index}-tenant-{}", rng.random_range(0..tenants));
        if !limiter.allow_request(&tenant, 1) {
            return Outcome::Rejected;
        }
    }

    let key = format!("workload-{index}-key-{}", rng.random_range(0..workload.keys));
    let fails = rng.random_bool(workload.failure_rate);
    let value = rng.random::<u64>();

    let result = processor.process(&key, || {
        thread::sleep(workload.latency);
        if fails {
            Err(anyhow!("simulated failure"))
        } else {
            Ok(value)
        }
    });

    match result {
        Ok(_) => Outcome::Succeeded,
        Err(_) => Outcome::Failed,
    }
}

pub fn perform_stresstest(
    config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    let processor = Processor::from_config(&config.processor)
        .context("failed to start idempotent processor")?;
    let limiter = RateLimiter::from_config(&config.rate_limits);
    let workloads = workloads.workloads;
    tracing::info!(workloads = workloads.len(), ?duration, "Starting stresstest");

    // warmup: run each workload once to make sure the threads and buckets exist
    {
        let start = Instant::now();

        thread::scope(|s| {
            for (i, workload) in workloads.iter().enumerate() {
                let processor = &processor;
                let limiter = &limiter;
                s.spawn(move || run_request(processor, limiter, i, workload));
            }
        });

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // run the workloads concurrently
    let deadline = Instant::now() + duration;
    let stats: Vec<Stats> = workloads.iter().map(|_| Stats::default()).collect();

    thread::scope(|s| {
        for (i, (workload, stats)) in workloads.iter().zip(&stats).enumerate() {
            for _ in 0..workload.concurrency {
                let processor = &processor;
                let limiter = &limiter;
                s.spawn(move || {
                    while Instant::now() < deadline {
                        let start = Instant::now();
                        match run_request(processor, limiter, i, workload) {
                            Outcome::Rejected => {
                                stats.rejected.fetch_add(1, Ordering::Relaxed);
                                continue;
                            }
                            Outcome::Failed => {
                                stats.failed.fetch_add(1, Ordering::Relaxed);
                            }
                            Outcome::Succeeded => {}
                        }

                        stats
                            .durations
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .add(start.elapsed().as_secs_f64());
                    }
                });
            }
        }
    });

    for (i, (workload, stats)) in workloads.iter().zip(stats).enumerate() {
        let concurrency = workload.concurrency;
        let durations = stats
            .durations
            .into_inner()
            .unwrap_or_else(|e| e.into_inner());

        let ops = durations.count();
        let ops_ps = ops as f64 / duration.as_secs_f64();
        println!("Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s");

        if let Some(sum) = durations.sum() {
            let avg = Duration::from_secs_f64(sum / ops as f64);
            let p50 = quantile(&durations, 0.5);
            let p90 = quantile(&durations, 0.9);
            let p99 = quantile(&durations, 0.99);
            println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
        }

        let failed = stats.failed.into_inner();
        let rejected = stats.rejected.into_inner();
        println!("  failed: {failed}; rejected: {rejected}");
    }

    println!();
    for (name, value) in processor.get_metrics() {
        println!("{name}: {value}");
    }

    processor.shutdown(config.processor.shutdown_timeout);
    Ok(())
}

fn quantile(sketch: &DDSketch, q: f64) -> Duration {
    let value = sketch.quantile(q).ok().flatten().unwrap_or_default();
    Duration::from_secs_f64(value)
}
