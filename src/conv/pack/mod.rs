//! Operand packing
//!
//! Source packers turn caller images into the bf16 layouts the micro-kernels
//! read; weight packers do the same once for the filter at `set_params`.
//! All packers are generic over the source element type: an f32 source is
//! rounded to bf16 (nearest, ties to even) while a bf16 source is only
//! reordered. Either way the output is zero-filled wherever the padded
//! layout has no source element, so padded lanes contribute nothing to any
//! dot product.

mod source;
mod weight;

pub(crate) use source::{as_bf16, im2col, im2row, pack_column_panels, pad_blocked, pad_interleaved};
pub(crate) use weight::{WeightView, pack_panels, pack_rows, panel_offset};

use crate::dtype::DType;

/// Name of the packing mode for a source type
pub(crate) fn mode_name(src: DType) -> &'static str {
    match src {
        DType::F32 => "convert",
        DType::BF16 => "reorder",
    }
}
