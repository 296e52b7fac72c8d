//! Configuration management for the pipeline
//!
//! This module handles loading and validation of all pipeline configuration.

use crate::utils::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

/// Main configuration struct for the pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Worker pool configuration
    #[serde(default)]
    pub pool: PoolConfig,
    /// Progress emit throttling configuration
    #[serde(default)]
    pub registry: ThrottleConfig,
    /// Delivery gateway configuration
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Stall monitor configuration
    #[serde(default)]
    pub monitor: MonitorConfig,
}

/// Summarization worker pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of long-lived summarization workers
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Reuse a prior summary instead of dispatching, when one exists
    #[serde(default)]
    pub reuse_existing: bool,
}

/// Progress emit throttling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Minimum interval between progress emits for one item, in milliseconds
    #[serde(default = "default_min_emit_interval_ms")]
    pub min_emit_interval_ms: u64,
    /// Minimum overall-progress delta (percentage points) that forces an emit
    #[serde(default = "default_min_emit_delta_pp")]
    pub min_emit_delta_pp: f64,
    /// Aggregate progress bucket size (percentage points) that triggers a
    /// batch snapshot publish
    #[serde(default = "default_snapshot_bucket_pp")]
    pub snapshot_bucket_pp: f64,
}

/// Delivery gateway settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Buffered messages kept per batch while no subscriber is connected
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// Capacity of the cross-thread retry queue
    #[serde(default = "default_retry_capacity")]
    pub retry_capacity: usize,
    /// Delivery attempts before a retried message is dead-lettered
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    /// Base backoff between retry pump passes, in milliseconds
    #[serde(default = "default_retry_base_backoff_ms")]
    pub retry_base_backoff_ms: u64,
    /// How long a blocked input request waits for a response, in seconds
    #[serde(default = "default_input_timeout_secs")]
    pub input_timeout_secs: u64,
}

/// Stall monitor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Tick interval of the background watcher, in milliseconds
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Timeout for network-bound stages (loading, scraping, downloading)
    #[serde(default = "default_network_stage_timeout_secs")]
    pub network_stage_timeout_secs: u64,
    /// Timeout for compute-bound stages (queued, summarizing)
    #[serde(default = "default_compute_stage_timeout_secs")]
    pub compute_stage_timeout_secs: u64,
}

fn default_workers() -> usize {
    4
}

fn default_min_emit_interval_ms() -> u64 {
    200
}

fn default_min_emit_delta_pp() -> f64 {
    1.0
}

fn default_snapshot_bucket_pp() -> f64 {
    5.0
}

fn default_buffer_capacity() -> usize {
    256
}

fn default_retry_capacity() -> usize {
    512
}

fn default_retry_max_attempts() -> u32 {
    8
}

fn default_retry_base_backoff_ms() -> u64 {
    100
}

fn default_input_timeout_secs() -> u64 {
    300
}

fn default_tick_ms() -> u64 {
    1000
}

fn default_network_stage_timeout_secs() -> u64 {
    120
}

fn default_compute_stage_timeout_secs() -> u64 {
    60
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            reuse_existing: false,
        }
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            min_emit_interval_ms: default_min_emit_interval_ms(),
            min_emit_delta_pp: default_min_emit_delta_pp(),
            snapshot_bucket_pp: default_snapshot_bucket_pp(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            retry_capacity: default_retry_capacity(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_backoff_ms: default_retry_base_backoff_ms(),
            input_timeout_secs: default_input_timeout_secs(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            network_stage_timeout_secs: default_network_stage_timeout_secs(),
            compute_stage_timeout_secs: default_compute_stage_timeout_secs(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a YAML file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading configuration from: {:?}", path);

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| PipelineError::Config(format!("Failed to read config file: {}", e)))?;

        let config = Self::from_yaml(&content)?;

        debug!("Configuration loaded successfully");
        Ok(config)
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: PipelineConfig = serde_yaml::from_str(content)
            .map_err(|e| PipelineError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        if self.pool.workers == 0 {
            return Err(PipelineError::Config(
                "pool.workers must be at least 1".to_string(),
            ));
        }
        if self.gateway.buffer_capacity == 0 {
            return Err(PipelineError::Config(
                "gateway.buffer_capacity must be at least 1".to_string(),
            ));
        }
        if self.gateway.retry_capacity == 0 {
            return Err(PipelineError::Config(
                "gateway.retry_capacity must be at least 1".to_string(),
            ));
        }
        if self.monitor.tick_ms == 0 {
            return Err(PipelineError::Config(
                "monitor.tick_ms must be nonzero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.pool.workers, 4);
        assert_eq!(config.registry.min_emit_interval_ms, 200);
        assert_eq!(config.registry.min_emit_delta_pp, 1.0);
        assert_eq!(config.gateway.buffer_capacity, 256);
        assert_eq!(config.gateway.retry_max_attempts, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml_partial_override() {
        let config =
            PipelineConfig::from_yaml("pool:\n  workers: 8\ngateway:\n  buffer_capacity: 16\n")
                .unwrap();
        assert_eq!(config.pool.workers, 8);
        assert_eq!(config.gateway.buffer_capacity, 16);
        // Untouched sections keep their defaults
        assert_eq!(config.monitor.tick_ms, 1000);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let result = PipelineConfig::from_yaml("pool:\n  workers: 0\n");
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[tokio::test]
    async fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "pool:\n  workers: 2\n  reuse_existing: true").unwrap();

        let config = PipelineConfig::from_file(file.path()).await.unwrap();
        assert_eq!(config.pool.workers, 2);
        assert!(config.pool.reuse_existing);
    }

    #[tokio::test]
    async fn test_missing_file() {
        let result = PipelineConfig::from_file("/nonexistent/pipeline.yaml").await;
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }
}
