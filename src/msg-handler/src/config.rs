use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::ensure;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Ring storage of the host-to-NPU queue, in bytes.
    pub input_size: usize,
    /// Ring storage of the NPU-to-host queue, in bytes.
    pub output_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            input_size: 1000,
            output_size: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InferenceConfig {
    /// Pending inference requests accepted before new ones are rejected.
    pub queue_capacity: usize,
    /// Completed responses buffered between the worker and the message task.
    pub output_depth: usize,
    pub poll_interval_ms: u64,
}

impl InferenceConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Rejects limits under which the worker could stall on a full
    /// response channel.
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.queue_capacity >= 1,
            "inference.queue_capacity must be at least 1"
        );
        ensure!(
            self.output_depth > self.queue_capacity,
            "inference.output_depth ({}) must exceed inference.queue_capacity ({})",
            self.output_depth,
            self.queue_capacity
        );
        ensure!(
            self.poll_interval_ms >= 1,
            "inference.poll_interval_ms must be at least 1"
        );
        Ok(())
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        InferenceConfig {
            queue_capacity: 5,
            output_depth: 10,
            poll_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    pub timeout_ms: u64,
}

impl ClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig { timeout_ms: 60_000 }
    }
}

/// A model image registered at start-up, addressed by its position in
/// `Config::networks`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkEntry {
    pub path: PathBuf,
    pub description: String,
    pub input_sizes: Vec<u32>,
    pub output_sizes: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub log_level: String,
    pub log_file: Option<String>,
    pub queue: QueueConfig,
    pub inference: InferenceConfig,
    pub client: ClientConfig,
    pub networks: Vec<NetworkEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: "info".to_owned(),
            log_file: None,
            queue: QueueConfig::default(),
            inference: InferenceConfig::default(),
            client: ClientConfig::default(),
            networks: Vec::new(),
        }
    }
}

impl Config {
    pub fn new(config: Option<&str>) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(config.unwrap_or(""))?;
        config.inference.validate()?;
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::new(Some(&content))
    }
}
