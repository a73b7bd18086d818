//! Convolution descriptor and validated parameters
//!
//! [`ConvDesc`] is what a caller fills in for one layer. [`ConvParam`] is the
//! validated, immutable form with the batch size and output extents resolved;
//! every other component reads shape information only from it.

use super::activation::ActivationKind;
use crate::config::Compatibility;
use crate::dtype::DType;
use crate::error::{Error, Result};
use std::fmt;

/// Memory layout of source, destination and weights
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum TensorFormat {
    /// Channels last. Weights are `[kernel_y][kernel_x][src_c / group][dst_c]`.
    #[default]
    Nhwc,
    /// Channels first. Weights are `[dst_c][src_c / group][kernel_y][kernel_x]`.
    Nchw,
}

/// Coarse shape family used by the variant selector
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ShapeClass {
    /// `group == src_c == dst_c`
    Depthwise,
    /// 1x1 kernel, unit stride, no padding, single group
    Pointwise,
    /// Any other single-group convolution
    Spatial,
    /// Several groups, not depthwise
    Grouped,
}

/// Layer description supplied by the caller
///
/// Build one with [`ConvDesc::new`] and the `with_*` methods; fields are public
/// for callers that map from another model format.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConvDesc {
    /// Input channels
    pub src_c: usize,
    /// Input height
    pub src_h: usize,
    /// Input width
    pub src_w: usize,
    /// Output channels
    pub dst_c: usize,
    /// Kernel height
    pub kernel_y: usize,
    /// Kernel width
    pub kernel_x: usize,
    /// Vertical stride
    pub stride_y: usize,
    /// Horizontal stride
    pub stride_x: usize,
    /// Vertical dilation
    pub dilation_y: usize,
    /// Horizontal dilation
    pub dilation_x: usize,
    /// Top padding
    pub pad_y: usize,
    /// Left padding
    pub pad_x: usize,
    /// Bottom padding
    pub pad_h: usize,
    /// Right padding
    pub pad_w: usize,
    /// Group count
    pub group: usize,
    /// Layout of source, destination and weights
    pub format: TensorFormat,
    /// Source element type
    pub src_type: DType,
    /// Destination element type
    pub dst_type: DType,
    /// Fused activation
    pub activation: ActivationKind,
}

impl ConvDesc {
    /// Square-kernel convolution with unit stride and dilation, no padding,
    /// one group, NHWC, f32 in and out, identity activation
    pub fn new(src_c: usize, src_h: usize, src_w: usize, dst_c: usize, kernel: usize) -> Self {
        Self {
            src_c,
            src_h,
            src_w,
            dst_c,
            kernel_y: kernel,
            kernel_x: kernel,
            stride_y: 1,
            stride_x: 1,
            dilation_y: 1,
            dilation_x: 1,
            pad_y: 0,
            pad_x: 0,
            pad_h: 0,
            pad_w: 0,
            group: 1,
            format: TensorFormat::Nhwc,
            src_type: DType::F32,
            dst_type: DType::F32,
            activation: ActivationKind::Identity,
        }
    }

    /// Set a rectangular kernel
    pub fn with_kernel(mut self, kernel_y: usize, kernel_x: usize) -> Self {
        self.kernel_y = kernel_y;
        self.kernel_x = kernel_x;
        self
    }

    /// Set strides
    pub fn with_stride(mut self, stride_y: usize, stride_x: usize) -> Self {
        self.stride_y = stride_y;
        self.stride_x = stride_x;
        self
    }

    /// Set dilations
    pub fn with_dilation(mut self, dilation_y: usize, dilation_x: usize) -> Self {
        self.dilation_y = dilation_y;
        self.dilation_x = dilation_x;
        self
    }

    /// Set explicit per-side padding
    pub fn with_pad(mut self, top: usize, left: usize, bottom: usize, right: usize) -> Self {
        self.pad_y = top;
        self.pad_x = left;
        self.pad_h = bottom;
        self.pad_w = right;
        self
    }

    /// Set the same padding on every side
    pub fn with_uniform_pad(self, pad: usize) -> Self {
        self.with_pad(pad, pad, pad, pad)
    }

    /// Set the group count
    pub fn with_group(mut self, group: usize) -> Self {
        self.group = group;
        self
    }

    /// Set the tensor layout
    pub fn with_format(mut self, format: TensorFormat) -> Self {
        self.format = format;
        self
    }

    /// Set source and destination element types
    pub fn with_types(mut self, src_type: DType, dst_type: DType) -> Self {
        self.src_type = src_type;
        self.dst_type = dst_type;
        self
    }

    /// Set the fused activation
    pub fn with_activation(mut self, activation: ActivationKind) -> Self {
        self.activation = activation;
        self
    }
}

/// Validated, immutable convolution parameters
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConvParam {
    /// Images per `forward` call
    pub batch: usize,
    /// Input channels
    pub src_c: usize,
    /// Input height
    pub src_h: usize,
    /// Input width
    pub src_w: usize,
    /// Output channels
    pub dst_c: usize,
    /// Output height
    pub dst_h: usize,
    /// Output width
    pub dst_w: usize,
    /// Kernel height
    pub kernel_y: usize,
    /// Kernel width
    pub kernel_x: usize,
    /// Vertical stride
    pub stride_y: usize,
    /// Horizontal stride
    pub stride_x: usize,
    /// Vertical dilation
    pub dilation_y: usize,
    /// Horizontal dilation
    pub dilation_x: usize,
    /// Top padding
    pub pad_y: usize,
    /// Left padding
    pub pad_x: usize,
    /// Bottom padding
    pub pad_h: usize,
    /// Right padding
    pub pad_w: usize,
    /// Group count
    pub group: usize,
    /// Layout
    pub format: TensorFormat,
    /// Source element type
    pub src_type: DType,
    /// Destination element type
    pub dst_type: DType,
    /// Fused activation
    pub activation: ActivationKind,
    /// Precision trade-offs
    pub compatibility: Compatibility,
}

/// Output extent of one spatial axis
///
/// `floor((input + pad_before + pad_after - dilation * (kernel - 1) - 1) / stride) + 1`,
/// or 0 when the padded input is smaller than the dilated kernel.
#[inline]
pub fn compute_output_size(
    input_size: usize,
    kernel_size: usize,
    stride: usize,
    dilation: usize,
    pad_before: usize,
    pad_after: usize,
) -> usize {
    let effective_kernel = dilation * (kernel_size - 1) + 1;
    let padded_size = input_size + pad_before + pad_after;
    if padded_size < effective_kernel {
        0
    } else {
        (padded_size - effective_kernel) / stride + 1
    }
}

#[inline]
fn validate_positive(value: usize, name: &'static str) -> Result<()> {
    if value == 0 {
        return Err(Error::invalid_argument(
            name,
            format!("convolution requires {} > 0, got 0", name),
        ));
    }
    Ok(())
}

#[inline]
fn validate_groups(src_c: usize, dst_c: usize, group: usize) -> Result<()> {
    if !src_c.is_multiple_of(group) {
        return Err(Error::invalid_argument(
            "group",
            format!("src_c ({}) must be divisible by group ({})", src_c, group),
        ));
    }
    if !dst_c.is_multiple_of(group) {
        return Err(Error::invalid_argument(
            "group",
            format!("dst_c ({}) must be divisible by group ({})", dst_c, group),
        ));
    }
    Ok(())
}

impl ConvParam {
    /// Validate `desc` for `batch` images and resolve the output extents
    pub fn new(batch: usize, desc: &ConvDesc, compatibility: Compatibility) -> Result<Self> {
        validate_positive(batch, "batch")?;
        validate_positive(desc.src_c, "src_c")?;
        validate_positive(desc.src_h, "src_h")?;
        validate_positive(desc.src_w, "src_w")?;
        validate_positive(desc.dst_c, "dst_c")?;
        validate_positive(desc.kernel_y, "kernel_y")?;
        validate_positive(desc.kernel_x, "kernel_x")?;
        validate_positive(desc.stride_y, "stride_y")?;
        validate_positive(desc.stride_x, "stride_x")?;
        validate_positive(desc.dilation_y, "dilation_y")?;
        validate_positive(desc.dilation_x, "dilation_x")?;
        validate_positive(desc.group, "group")?;
        validate_groups(desc.src_c, desc.dst_c, desc.group)?;

        let dst_h = compute_output_size(
            desc.src_h,
            desc.kernel_y,
            desc.stride_y,
            desc.dilation_y,
            desc.pad_y,
            desc.pad_h,
        );
        let dst_w = compute_output_size(
            desc.src_w,
            desc.kernel_x,
            desc.stride_x,
            desc.dilation_x,
            desc.pad_x,
            desc.pad_w,
        );

        Ok(Self {
            batch,
            src_c: desc.src_c,
            src_h: desc.src_h,
            src_w: desc.src_w,
            dst_c: desc.dst_c,
            dst_h,
            dst_w,
            kernel_y: desc.kernel_y,
            kernel_x: desc.kernel_x,
            stride_y: desc.stride_y,
            stride_x: desc.stride_x,
            dilation_y: desc.dilation_y,
            dilation_x: desc.dilation_x,
            pad_y: desc.pad_y,
            pad_x: desc.pad_x,
            pad_h: desc.pad_h,
            pad_w: desc.pad_w,
            group: desc.group,
            format: desc.format,
            src_type: desc.src_type,
            dst_type: desc.dst_type,
            activation: desc.activation,
            compatibility,
        })
    }

    /// Channels last
    #[inline]
    pub fn trans(&self) -> bool {
        self.format == TensorFormat::Nhwc
    }

    /// Reduction length of one output element: `src_c / group * kernel_y * kernel_x`
    #[inline]
    pub fn reduction_len(&self) -> usize {
        self.src_c / self.group * self.kernel_y * self.kernel_x
    }

    /// Square kernel of the given size
    #[inline]
    pub fn is_kernel(&self, k: usize) -> bool {
        self.kernel_y == k && self.kernel_x == k
    }

    /// Same stride on both axes
    #[inline]
    pub fn is_stride(&self, s: usize) -> bool {
        self.stride_y == s && self.stride_x == s
    }

    /// Same dilation on both axes
    #[inline]
    pub fn is_dilation(&self, d: usize) -> bool {
        self.dilation_y == d && self.dilation_x == d
    }

    /// No padding on any side
    #[inline]
    pub fn is_pad_zero(&self) -> bool {
        self.pad_y == 0 && self.pad_x == 0 && self.pad_h == 0 && self.pad_w == 0
    }

    /// 1x1 kernel that maps each source pixel to one output pixel
    #[inline]
    pub fn is_1x1(&self) -> bool {
        self.is_kernel(1) && self.is_stride(1) && self.is_dilation(1) && self.is_pad_zero()
    }

    /// Every output channel reads exactly one input channel
    #[inline]
    pub fn is_depthwise(&self) -> bool {
        self.src_c == self.group && self.dst_c == self.group
    }

    /// Output has no elements
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.dst_h == 0 || self.dst_w == 0
    }

    /// Shape family used for dispatch
    pub fn shape_class(&self) -> ShapeClass {
        if self.is_depthwise() {
            ShapeClass::Depthwise
        } else if self.group > 1 {
            ShapeClass::Grouped
        } else if self.is_1x1() {
            ShapeClass::Pointwise
        } else {
            ShapeClass::Spatial
        }
    }

    /// Source elements per `forward`
    #[inline]
    pub fn src_len(&self) -> usize {
        self.batch * self.src_c * self.src_h * self.src_w
    }

    /// Destination elements per `forward`
    #[inline]
    pub fn dst_len(&self) -> usize {
        self.batch * self.dst_c * self.dst_h * self.dst_w
    }

    /// Weight elements expected by `set_params`
    #[inline]
    pub fn weight_len(&self) -> usize {
        self.kernel_y * self.kernel_x * self.src_c / self.group * self.dst_c
    }

    /// Multiply-add count times two for one `forward`
    pub fn flop(&self) -> u64 {
        (self.batch * self.dst_c * self.dst_h * self.dst_w) as u64 * self.reduction_len() as u64 * 2
    }
}

impl fmt::Display for ConvParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}x{}x{}->{}x{}x{} k{}x{} s{}x{} d{}x{} p{}-{}-{}-{} g{} {:?} {}->{} {}",
            self.batch,
            self.src_c,
            self.src_h,
            self.src_w,
            self.dst_c,
            self.dst_h,
            self.dst_w,
            self.kernel_y,
            self.kernel_x,
            self.stride_y,
            self.stride_x,
            self.dilation_y,
            self.dilation_x,
            self.pad_y,
            self.pad_x,
            self.pad_h,
            self.pad_w,
            self.group,
            self.format,
            self.src_type,
            self.dst_type,
            self.activation,
        )
    }
}
