//! Error types for contrastive training operations.

use std::path::PathBuf;

use thiserror::Error;

/// Training-specific errors.
///
/// Every failure is fatal to the current step; nothing is retried.
#[derive(Debug, Error)]
pub enum TrainError {
    /// Tensor backend operation failed.
    #[error("Tensor operation failed: {message}")]
    Tensor { message: String },

    /// Configuration is missing or invalid.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Input validation failed.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Dimension mismatch.
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Base encoder weights could not be loaded.
    #[error("Failed to load weights from {path}: {message}")]
    WeightLoad { path: PathBuf, message: String },

    /// Loss scaler used out of protocol order.
    #[error("Loss scaler error: {message}")]
    Scaler { message: String },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TrainError {
    /// Wrap a candle error with the operation that produced it.
    pub fn tensor(context: &str, err: candle_core::Error) -> Self {
        TrainError::Tensor {
            message: format!("{}: {}", context, err),
        }
    }
}

impl From<config::ConfigError> for TrainError {
    fn from(err: config::ConfigError) -> Self {
        TrainError::Config {
            message: err.to_string(),
        }
    }
}

/// Result type for training operations.
pub type TrainResult<T> = Result<T, TrainError>;
