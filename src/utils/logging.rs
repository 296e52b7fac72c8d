//! Logging initialization
//!
//! Thin wrappers over `tracing_subscriber` so an embedding application can
//! bring up structured logging with one call.

use crate::utils::error::{PipelineError, Result};
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Initialize the global subscriber at a fixed level
pub fn init_logging(level: Level) -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .try_init()
        .map_err(|e| PipelineError::Config(format!("Failed to initialize logging: {}", e)))
}

/// Initialize the global subscriber from the `RUST_LOG` environment variable
pub fn init_logging_from_env() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .try_init()
        .map_err(|e| PipelineError::Config(format!("Failed to initialize logging: {}", e)))
}
