//! Error types for the world model.

use thiserror::Error;

/// Result type for world-model operations.
pub type JepaResult<T> = Result<T, JepaError>;

/// Errors surfaced by the encoder, predictor, loss assembly and training driver.
#[derive(Debug, Error)]
pub enum JepaError {
    /// Tensor backend failure, passed through unchanged
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Tensor rank or dimension does not match the contract
    #[error("Shape mismatch in {context}: expected {expected}, got {got}")]
    ShapeMismatch {
        context: String,
        expected: String,
        got: String,
    },

    /// Schedule name not in {linear, exponential}
    #[error("Unknown schedule mode: {0:?} (expected \"linear\" or \"exponential\")")]
    UnknownScheduleMode(String),

    /// Batch statistics need at least two examples
    #[error("Degenerate batch for {op}: batch size {batch}, need at least 2")]
    DegenerateBatch { op: &'static str, batch: usize },

    /// Loss turned NaN or infinite
    #[error("Non-finite loss at micro-step {step}: {value}")]
    NonFiniteLoss { step: u64, value: f32 },

    /// Online and target parameter sets cannot be paired
    #[error("Parameter mismatch: {0}")]
    ParameterMismatch(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Dataset loading error
    #[error("Data error: {0}")]
    Data(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl JepaError {
    /// Create a shape mismatch error
    pub fn shape_mismatch(
        context: impl Into<String>,
        expected: impl Into<String>,
        got: impl Into<String>,
    ) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected: expected.into(),
            got: got.into(),
        }
    }

    /// Create an invalid config error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a data loading error
    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    pub fn parameter_mismatch(msg: impl Into<String>) -> Self {
        Self::ParameterMismatch(msg.into())
    }
}
