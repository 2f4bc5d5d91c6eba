use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use idempo_service::config::Config;

use crate::workloads::WorkloadsConfig;

mod logging;
mod stresstest;
mod workloads;

/// Drives an idempotent processor with concurrent, partially failing workloads.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = humantime::parse_duration)]
    duration: Duration,

    /// Emit logs and metrics the way production would.
    #[arg(long)]
    instrument: bool,
}

fn main() {
    match execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            idempo_service::logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}

/// Runs the stresstest.
fn execute() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads = WorkloadsConfig::read(&cli.workloads)?;
    let config = Config::get(cli.config.as_deref()).context("failed loading config")?;

    let logging = logging::Config {
        backtraces: config.logging.enable_backtraces,
        sentry_dsn: config.sentry_dsn.clone(),
        tracing: cli.instrument,
        metrics: cli.instrument || config.metrics.statsd.is_some(),
        statsd: config.metrics.statsd.clone(),
        metrics_prefix: config.metrics.prefix.clone(),
        custom_tags: config.metrics.custom_tags.clone(),
    };
    // SAFETY: No other threads have been spawned yet.
    let _guard = unsafe {
        if !cli.instrument {
            idempo_service::logging::init_logging(&config);
        }
        logging::init(logging)?
    };

    stresstest::perform_stresstest(config, workloads, cli.duration)
}
