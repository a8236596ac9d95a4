//! Error types for vgg-quant.

use thiserror::Error;

/// Result type alias for vgg-quant operations.
pub type Result<T> = std::result::Result<T, VggQuantError>;

/// Errors that can occur while building or running a quantized network.
#[derive(Debug, Error)]
pub enum VggQuantError {
    /// Invalid configuration parameter.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Shape mismatch between a layer and the tensor fed to it.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape. Free dimensions are reported with the actual value.
        expected: Vec<usize>,
        /// Actual shape.
        actual: Vec<usize>,
    },

    /// Quantization error.
    #[error("quantization error: {0}")]
    Quantization(String),

    /// Candle tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Configuration (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl VggQuantError {
    /// Create an invalid configuration error.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a shape mismatch error.
    pub fn shape_mismatch(expected: impl Into<Vec<usize>>, actual: impl Into<Vec<usize>>) -> Self {
        Self::ShapeMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Whether this error reports a shape mismatch.
    #[must_use]
    pub const fn is_shape_mismatch(&self) -> bool {
        matches!(self, Self::ShapeMismatch { .. })
    }

    /// Convert into a candle error for the `candle_nn::Module` boundary.
    #[must_use]
    pub fn into_candle(self) -> candle_core::Error {
        match self {
            Self::Tensor(e) => e,
            other => candle_core::Error::Msg(other.to_string()),
        }
    }
}
