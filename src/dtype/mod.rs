//! Data type system for bf16conv
//!
//! Convolutions read and write two element types: `f32` and `bf16`. All
//! accumulation happens in `f32`; `bf16` is a storage format only.
//!
//! # Rounding policy
//!
//! Every narrowing from `f32` to `bf16` (source packing, weight packing and
//! bf16 output) rounds to nearest, ties to even. NaN stays NaN. Widening from
//! `bf16` to `f32` is exact.

pub mod bf16;
mod element;

pub use element::Element;

use std::fmt;

/// Element type of a convolution source or destination tensor
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DType {
    /// 32-bit floating point
    F32 = 1,
    /// 16-bit brain floating point
    BF16 = 3,
}

impl DType {
    /// Returns the size of one element in bytes
    #[inline]
    pub const fn size_in_bytes(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::BF16 => 2,
        }
    }

    /// Returns true for the 16-bit storage format
    #[inline]
    pub const fn is_16bit(self) -> bool {
        matches!(self, Self::BF16)
    }

    /// Returns a short name for this dtype
    pub const fn short_name(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::BF16 => "bf16",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_sizes() {
        assert_eq!(DType::F32.size_in_bytes(), 4);
        assert_eq!(DType::BF16.size_in_bytes(), 2);
        assert!(DType::BF16.is_16bit());
        assert!(!DType::F32.is_16bit());
    }

    #[test]
    fn test_dtype_display() {
        assert_eq!(DType::F32.to_string(), "f32");
        assert_eq!(DType::BF16.to_string(), "bf16");
    }
}
