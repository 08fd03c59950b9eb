//! Error types for Flowlens

use thiserror::Error;

/// Errors that can occur in the friction pipeline
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Transport closed: {0}")]
    TransportClosed(String),

    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),
}
