use std::fs;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct StressConfig {
    /// number of racing threads, each count is run separately
    pub thread_counts: Vec<usize>,
    /// lock/increment/unlock rounds per thread
    pub iterations: usize,
    /// how often each thread count is repeated
    pub repetitions: usize,
    /// writer -> reader handoffs in the visibility check
    pub visibility_rounds: usize,
    /// timeout passed to the bounded acquire checks, in milliseconds
    pub timeout_ms: u64,
    /// how far past `timeout_ms` a bounded acquire may return, in milliseconds
    pub timeout_slack_ms: u64,
}

impl Default for StressConfig {
    fn default() -> Self {
        StressConfig {
            thread_counts: vec![2, 4, 16],
            iterations: 100_000,
            repetitions: 5,
            visibility_rounds: 100_000,
            timeout_ms: 50,
            timeout_slack_ms: 250,
        }
    }
}

impl StressConfig {
    pub fn validate(&self) -> Result<()> {
        if self.thread_counts.is_empty() {
            bail!("thread_counts must not be empty");
        }
        if self.thread_counts.contains(&0) {
            bail!("thread_counts must not contain 0, got {:?}", self.thread_counts);
        }
        if self.iterations == 0 {
            bail!("iterations must be at least 1");
        }
        if self.repetitions == 0 {
            bail!("repetitions must be at least 1");
        }
        Ok(())
    }
}

pub fn parse_config_str(config: &str) -> Result<StressConfig> {
    let config: StressConfig = toml::from_str(config).context("failed to parse config file")?;
    config.validate().context("invalid stress config")?;
    Ok(config)
}

pub fn parse_config(config_file_path: &str) -> Result<StressConfig> {
    let config = fs::read_to_string(config_file_path)
        .context(format!("failed to read config from {}", config_file_path))?;

    parse_config_str(&config)
}
