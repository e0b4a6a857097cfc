//! Error types for calibration and fake quantization.

use thiserror::Error;

/// Result type alias for quantization operations.
pub type Result<T> = std::result::Result<T, QuantError>;

/// Errors that can occur while calibrating or quantizing.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QuantError {
    /// Granularity other than layerwise or channelwise.
    #[error("unsupported granularity: {0}")]
    UnsupportedGranularity(String),

    /// Bit-width outside the lookup tables of an estimator.
    #[error("unsupported bit-width {bit} for {estimator}")]
    UnsupportedBitWidth {
        /// Requested bit-width.
        bit: u32,
        /// Estimator that rejected it.
        estimator: &'static str,
    },

    /// Observer or quantizer name not present in the registry.
    #[error("unknown strategy: {0}")]
    UnknownStrategy(String),

    /// Invalid configuration parameter.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Shape mismatch between tensors, batches or parameters.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape.
        expected: Vec<usize>,
        /// Actual shape.
        actual: Vec<usize>,
    },

    /// Axis index past the tensor rank.
    #[error("axis {axis} out of range for tensor of rank {ndim}")]
    AxisOutOfRange {
        /// Requested axis.
        axis: usize,
        /// Tensor rank.
        ndim: usize,
    },

    /// Range requested before any calibration batch was cached.
    #[error("calibration cache is empty")]
    EmptyCache,

    /// Channel order that is not a bijection.
    #[error("invalid permutation: {0}")]
    InvalidPermutation(String),

    /// Quantizer used before its parameters were finalized.
    #[error("quantizer has not been calibrated")]
    NotCalibrated,
}
