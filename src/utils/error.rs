//! Error handling for the pipeline
//!
//! This module defines all error types used throughout the engine.

use thiserror::Error;

/// Result type alias for the pipeline
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Main error type for the pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation errors (bad registration input, empty item lists)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Consistency errors (registered count exceeds expected total,
    /// updates targeting unregistered items)
    #[error("Consistency error: {0}")]
    Consistency(String),

    /// Delivery errors (subscriber send failures, dead-lettered messages)
    #[error("Delivery error: {0}")]
    Delivery(String),

    /// Timeout errors (bounded polls that did not resolve in budget)
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// Worker errors (external summarizer call failed)
    #[error("Worker error: {0}")]
    Worker(String),

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Whether the error is transient and the operation may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::Delivery(_) | PipelineError::Timeout(_)
        )
    }
}
