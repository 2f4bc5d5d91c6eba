use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

impl WorkloadsConfig {
    pub fn read(path: &Path) -> Result<Self> {
        let file = fs::File::open(path).context("failed to open workloads file")?;
        let config: Self =
            serde_yaml::from_reader(file).context("failed to parse workloads YAML")?;
        for (i, workload) in config.workloads.iter().enumerate() {
            workload
                .validate()
                .with_context(|| format!("invalid workload {i}"))?;
        }
        Ok(config)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Workload {
    /// Number of worker threads hammering the processor.
    pub concurrency: usize,

    /// Number of distinct idempotency keys, chosen uniformly.
    #[serde(default = "default_keys")]
    pub keys: usize,

    /// How long the simulated action takes.
    #[serde(default, with = "humantime_serde")]
    pub latency: Duration,

    /// Probability of the simulated action failing.
    #[serde(default)]
    pub failure_rate: f64,

    /// Number of tenants to rate limit in front of the processor.
    ///
    /// Requests are not rate limited if this is missing.
    #[serde(default)]
    pub tenants: Option<usize>,
}

fn default_keys() -> usize {
    100
}

impl Workload {
    fn validate(&self) -> Result<()> {
        ensure!(self.concurrency > 0, "concurrency must be at least 1");
        ensure!(self.keys > 0, "keys must be at least 1");
        ensure!(
            (0.0..=1.0).contains(&self.failure_rate),
            "failure_rate must be between 0 and 1"
        );
        ensure!(
            self.tenants != Some(0),
            "tenants must be at least 1 when given"
        );
        Ok(())
    }
}
