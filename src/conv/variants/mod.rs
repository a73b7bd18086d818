//! Convolution algorithm variants
//!
//! Each variant owns its packed weights and tiling parameters and knows how
//! much scratch memory one `forward` needs. Variants are built once by the
//! selector and used through the object-safe [`ConvVariant`] trait; element
//! types are resolved per call by [`dispatch_io!`] into monomorphized
//! `run::<S, D>` bodies.

mod depthwise;
mod driver;
mod gemm;
mod nchw_gemm;
mod nhwc_gemm;
mod padded;
mod tile_gemm;

pub(crate) use depthwise::NhwcDepthwise;
pub(crate) use gemm::Gemm;
pub(crate) use nchw_gemm::NchwGemm;
pub(crate) use nhwc_gemm::NhwcGemm;
pub(crate) use padded::{PaddedConv, PaddedLayout};
pub(crate) use tile_gemm::TileGemm;

use std::fmt;

use super::alg::AlgParam;
use super::postprocess::Postprocess;
use super::tensor::{Scratch, ScratchLayout, TensorMut, TensorRef};
use crate::error::Result;

/// Algorithm family of a convolution instance
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum VariantKind {
    /// Generic im2col/im2row GEMM; valid for every shape
    Gemm,
    /// Row-packed GEMM over NHWC images
    NhwcGemm,
    /// Weight-row GEMM over NCHW images
    NchwGemm,
    /// Direct convolution over a channel-blocked padded image
    NhwcDirect,
    /// Stride-1 convolution over the padded grid, channel-blocked
    NhwcSpecV0,
    /// Stride-1 convolution over the padded grid, channel-interleaved
    NhwcSpecV1,
    /// Per-channel convolution
    NhwcDepthwise,
    /// GEMM on the matrix tile unit
    TileGemm,
}

impl VariantKind {
    /// Every variant
    pub const ALL: [Self; 8] = [
        Self::Gemm,
        Self::NhwcGemm,
        Self::NchwGemm,
        Self::NhwcDirect,
        Self::NhwcSpecV0,
        Self::NhwcSpecV1,
        Self::NhwcDepthwise,
        Self::TileGemm,
    ];

    /// Short name used by `info()`
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Gemm => "Gemm",
            Self::NhwcGemm => "NhwcGemm",
            Self::NchwGemm => "NchwGemm",
            Self::NhwcDirect => "NhwcDirect",
            Self::NhwcSpecV0 => "NhwcSpecV0",
            Self::NhwcSpecV1 => "NhwcSpecV1",
            Self::NhwcDepthwise => "NhwcDepthwise",
            Self::TileGemm => "TileGemm",
        }
    }
}

impl fmt::Display for VariantKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One convolution strategy bound to a shape
pub(crate) trait ConvVariant: Send + Sync + fmt::Debug {
    /// Algorithm family
    fn kind(&self) -> VariantKind;

    /// Tiling parameters, for the blocked variants
    fn alg(&self) -> Option<&AlgParam>;

    /// Scratch regions needed by one `forward`
    fn scratch(&self) -> ScratchLayout;

    /// Pack the caller's weights (layout per tensor format)
    fn set_weights(&mut self, weight: &[f32]);

    /// Run the convolution for the whole batch
    fn forward(
        &self,
        src: TensorRef<'_>,
        scratch: &mut Scratch<'_>,
        dst: TensorMut<'_>,
        post: &Postprocess<'_>,
    ) -> Result<()>;
}

/// Expand `$body` once per (source, destination) element type pair
macro_rules! dispatch_io {
    ($src:expr, $dst:expr, |$s:ident, $d:ident| $body:expr) => {
        match ($src, $dst) {
            ($crate::conv::tensor::TensorRef::F32($s), $crate::conv::tensor::TensorMut::F32($d)) => $body,
            ($crate::conv::tensor::TensorRef::F32($s), $crate::conv::tensor::TensorMut::Bf16($d)) => $body,
            ($crate::conv::tensor::TensorRef::Bf16($s), $crate::conv::tensor::TensorMut::F32($d)) => $body,
            ($crate::conv::tensor::TensorRef::Bf16($s), $crate::conv::tensor::TensorMut::Bf16($d)) => $body,
        }
    };
}

pub(crate) use dispatch_io;
