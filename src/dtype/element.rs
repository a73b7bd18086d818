//! Element trait for mapping Rust types to DType

use super::DType;
use bytemuck::{Pod, Zeroable};
use half::bf16;

/// Trait for types a convolution can read or write
///
/// This trait connects Rust's type system to the runtime dtype carried by
/// `ConvParam`. It is implemented for `f32` and `half::bf16`.
///
/// # Bounds
/// - `Copy + Send + Sync + 'static` - Basic trait requirements
/// - `Pod + Zeroable` - Safe casting of scratch memory (bytemuck)
pub trait Element: Copy + Send + Sync + Pod + Zeroable + PartialOrd + 'static {
    /// The corresponding DType for this Rust type
    const DTYPE: DType;

    /// Widen to f32 (exact for both implementors)
    fn to_f32(self) -> f32;

    /// Narrow from f32, rounding to nearest even for bf16
    fn from_f32(v: f32) -> Self;

    /// Convert to bf16, rounding to nearest even
    fn to_bf16(self) -> bf16;

    /// Zero value
    fn zero() -> Self;
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;

    #[inline]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline]
    fn from_f32(v: f32) -> Self {
        v
    }

    #[inline]
    fn to_bf16(self) -> bf16 {
        bf16::from_f32(self)
    }

    #[inline]
    fn zero() -> Self {
        0.0
    }
}

impl Element for bf16 {
    const DTYPE: DType = DType::BF16;

    #[inline]
    fn to_f32(self) -> f32 {
        bf16::to_f32(self)
    }

    #[inline]
    fn from_f32(v: f32) -> Self {
        bf16::from_f32(v)
    }

    #[inline]
    fn to_bf16(self) -> bf16 {
        self
    }

    #[inline]
    fn zero() -> Self {
        bf16::ZERO
    }
}
