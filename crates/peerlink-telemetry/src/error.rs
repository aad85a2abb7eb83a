//! Telemetry error types

use std::time::Duration;
use thiserror::Error;

/// Telemetry pipeline errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Export failed: {0}")]
    Export(String),

    #[error("Export timed out after {0:?}")]
    Timeout(Duration),

    #[error("Exporter is shut down")]
    ShutDown,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for telemetry operations
pub type Result<T> = std::result::Result<T, TelemetryError>;
