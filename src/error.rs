//! Error types for bf16conv

use crate::dtype::DType;
use crate::simd::SimdLevel;
use thiserror::Error;

/// Result type alias using bf16conv's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building or running a convolution
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid argument provided to an operation
    #[error("Invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// The argument name
        arg: &'static str,
        /// Reason for invalidity
        reason: String,
    },

    /// Unsupported dtype for an operation
    #[error("Unsupported dtype {dtype:?} for operation '{op}'")]
    UnsupportedDType {
        /// The unsupported dtype
        dtype: DType,
        /// The operation name
        op: &'static str,
    },

    /// The descriptor is well formed but no variant can execute it
    #[error("Unsupported convolution shape: {reason}")]
    UnsupportedShape {
        /// Why the shape was rejected
        reason: String,
    },

    /// A caller slice is shorter than the declared tensor
    #[error("Shape mismatch for '{arg}': expected at least {expected} elements, got {got}")]
    ShapeMismatch {
        /// The argument name
        arg: &'static str,
        /// Minimum element count
        expected: usize,
        /// Actual element count
        got: usize,
    },

    /// External scratch buffer is too small for `forward`
    #[error("Scratch buffer too small: need {needed} bytes, got {got}")]
    BufferTooSmall {
        /// Required size in bytes
        needed: usize,
        /// Supplied size in bytes
        got: usize,
    },

    /// `forward` was called before `set_params`
    #[error("Weights are not set: call set_params before forward")]
    ParamsNotSet,

    /// `set_params` was called a second time
    #[error("Weights are already set for this convolution")]
    ParamsAlreadySet,

    /// Requested SIMD tier is not available on this CPU
    #[error("SIMD level {requested} is not supported (detected {detected})")]
    UnsupportedSimdLevel {
        /// The requested level
        requested: SimdLevel,
        /// The best level the CPU offers
        detected: SimdLevel,
    },

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an invalid argument error
    pub fn invalid_argument(arg: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            arg,
            reason: reason.into(),
        }
    }

    /// Create an unsupported dtype error
    pub fn unsupported_dtype(dtype: DType, op: &'static str) -> Self {
        Self::UnsupportedDType { dtype, op }
    }

    /// Create an unsupported shape error
    pub fn unsupported_shape(reason: impl Into<String>) -> Self {
        Self::UnsupportedShape {
            reason: reason.into(),
        }
    }

    /// Create a slice length error
    pub fn shape_mismatch(arg: &'static str, expected: usize, got: usize) -> Self {
        Self::ShapeMismatch { arg, expected, got }
    }
}
