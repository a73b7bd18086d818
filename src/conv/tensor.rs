//! Tensor views and scratch memory
//!
//! Caller data enters the engine as [`TensorRef`] / [`TensorMut`] (a slice
//! tagged with its element type). `forward` checks each slice against the
//! layout described by [`ImageDims`] once, wraps it in a typed [`ImageView`]
//! or [`ImageViewMut`], and from then on components index through the view's
//! strides instead of recomputing offsets from raw lengths.
//!
//! Scratch memory is a caller-owned byte slice carved into typed, 64-byte
//! aligned regions by [`Scratch`]. [`ScratchLayout`] computes the byte size
//! that carving needs, so `external_buffer_size` and `forward` cannot disagree.

use super::param::{ConvParam, TensorFormat};
use crate::dtype::{DType, Element};
use crate::error::{Error, Result};
use bytemuck::Pod;
use half::bf16;

/// Alignment of every scratch region
pub const SCRATCH_ALIGN: usize = 64;

/// Read-only tensor data tagged with its element type
#[derive(Copy, Clone, Debug)]
pub enum TensorRef<'a> {
    /// f32 elements
    F32(&'a [f32]),
    /// bf16 elements
    Bf16(&'a [bf16]),
}

impl TensorRef<'_> {
    /// Element type
    pub fn dtype(&self) -> DType {
        match self {
            Self::F32(_) => DType::F32,
            Self::Bf16(_) => DType::BF16,
        }
    }

    /// Element count
    pub fn len(&self) -> usize {
        match self {
            Self::F32(s) => s.len(),
            Self::Bf16(s) => s.len(),
        }
    }

    /// True when there are no elements
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<'a> From<&'a [f32]> for TensorRef<'a> {
    fn from(s: &'a [f32]) -> Self {
        Self::F32(s)
    }
}

impl<'a> From<&'a [bf16]> for TensorRef<'a> {
    fn from(s: &'a [bf16]) -> Self {
        Self::Bf16(s)
    }
}

impl<'a> From<&'a Vec<f32>> for TensorRef<'a> {
    fn from(s: &'a Vec<f32>) -> Self {
        Self::F32(s)
    }
}

impl<'a> From<&'a Vec<bf16>> for TensorRef<'a> {
    fn from(s: &'a Vec<bf16>) -> Self {
        Self::Bf16(s)
    }
}

/// Writable tensor data tagged with its element type
#[derive(Debug)]
pub enum TensorMut<'a> {
    /// f32 elements
    F32(&'a mut [f32]),
    /// bf16 elements
    Bf16(&'a mut [bf16]),
}

impl TensorMut<'_> {
    /// Element type
    pub fn dtype(&self) -> DType {
        match self {
            Self::F32(_) => DType::F32,
            Self::Bf16(_) => DType::BF16,
        }
    }

    /// Element count
    pub fn len(&self) -> usize {
        match self {
            Self::F32(s) => s.len(),
            Self::Bf16(s) => s.len(),
        }
    }

    /// True when there are no elements
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<'a> From<&'a mut [f32]> for TensorMut<'a> {
    fn from(s: &'a mut [f32]) -> Self {
        Self::F32(s)
    }
}

impl<'a> From<&'a mut [bf16]> for TensorMut<'a> {
    fn from(s: &'a mut [bf16]) -> Self {
        Self::Bf16(s)
    }
}

impl<'a> From<&'a mut Vec<f32>> for TensorMut<'a> {
    fn from(s: &'a mut Vec<f32>) -> Self {
        Self::F32(s)
    }
}

impl<'a> From<&'a mut Vec<bf16>> for TensorMut<'a> {
    fn from(s: &'a mut Vec<bf16>) -> Self {
        Self::Bf16(s)
    }
}

/// Shape and layout of a batch of images
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ImageDims {
    /// Images
    pub batch: usize,
    /// Channels
    pub channels: usize,
    /// Rows
    pub height: usize,
    /// Columns
    pub width: usize,
    /// Memory order
    pub format: TensorFormat,
}

/// Element strides of an image batch: `(image, channel, row, column)`
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Strides {
    /// Between images
    pub image: usize,
    /// Between channels
    pub channel: usize,
    /// Between rows
    pub row: usize,
    /// Between columns
    pub col: usize,
}

impl ImageDims {
    /// Source geometry of `p`
    pub fn src(p: &ConvParam) -> Self {
        Self {
            batch: p.batch,
            channels: p.src_c,
            height: p.src_h,
            width: p.src_w,
            format: p.format,
        }
    }

    /// Destination geometry of `p`
    pub fn dst(p: &ConvParam) -> Self {
        Self {
            batch: p.batch,
            channels: p.dst_c,
            height: p.dst_h,
            width: p.dst_w,
            format: p.format,
        }
    }

    /// Elements of one image
    #[inline]
    pub fn image_len(&self) -> usize {
        self.channels * self.height * self.width
    }

    /// Elements of the whole batch
    #[inline]
    pub fn len(&self) -> usize {
        self.batch * self.image_len()
    }

    /// Strides in elements
    #[inline]
    pub fn strides(&self) -> Strides {
        match self.format {
            TensorFormat::Nhwc => Strides {
                image: self.image_len(),
                channel: 1,
                row: self.width * self.channels,
                col: self.channels,
            },
            TensorFormat::Nchw => Strides {
                image: self.image_len(),
                channel: self.height * self.width,
                row: self.width,
                col: 1,
            },
        }
    }
}

/// Bounds-checked read view over an image batch
#[derive(Copy, Clone, Debug)]
pub struct ImageView<'a, T> {
    data: &'a [T],
    dims: ImageDims,
    strides: Strides,
}

impl<'a, T: Element> ImageView<'a, T> {
    /// Wrap `data`, failing if it is shorter than `dims` requires
    pub fn new(arg: &'static str, data: &'a [T], dims: ImageDims) -> Result<Self> {
        if data.len() < dims.len() {
            return Err(Error::shape_mismatch(arg, dims.len(), data.len()));
        }
        Ok(Self {
            data: &data[..dims.len()],
            dims,
            strides: dims.strides(),
        })
    }

    /// The whole batch
    #[inline]
    pub fn data(&self) -> &'a [T] {
        self.data
    }

    /// All elements of image `n`
    #[inline]
    pub fn image(&self, n: usize) -> &'a [T] {
        let len = self.dims.image_len();
        &self.data[n * len..(n + 1) * len]
    }

    /// Channel run of one NHWC pixel
    #[inline]
    pub fn pixel(&self, n: usize, y: usize, x: usize) -> &'a [T] {
        debug_assert_eq!(self.dims.format, TensorFormat::Nhwc);
        let start = n * self.strides.image + y * self.strides.row + x * self.strides.col;
        &self.data[start..start + self.dims.channels]
    }

    /// One element
    #[inline]
    pub fn at(&self, n: usize, c: usize, y: usize, x: usize) -> T {
        self.data[n * self.strides.image
            + c * self.strides.channel
            + y * self.strides.row
            + x * self.strides.col]
    }
}

/// Bounds-checked write view over an image batch
#[derive(Debug)]
pub struct ImageViewMut<'a, T> {
    data: &'a mut [T],
    dims: ImageDims,
}

impl<'a, T: Element> ImageViewMut<'a, T> {
    /// Wrap `data`, failing if it is shorter than `dims` requires
    pub fn new(arg: &'static str, data: &'a mut [T], dims: ImageDims) -> Result<Self> {
        if data.len() < dims.len() {
            return Err(Error::shape_mismatch(arg, dims.len(), data.len()));
        }
        let len = dims.len();
        Ok(Self {
            data: &mut data[..len],
            dims,
        })
    }

    /// The whole batch
    #[inline]
    pub fn data_mut(&mut self) -> &mut [T] {
        &mut *self.data
    }

    /// All elements of image `n`
    #[inline]
    pub fn image_mut(&mut self, n: usize) -> &mut [T] {
        let len = self.dims.image_len();
        &mut self.data[n * len..(n + 1) * len]
    }
}

/// Byte budget of a sequence of scratch regions
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ScratchLayout {
    bytes: usize,
}

impl ScratchLayout {
    /// Empty layout
    pub const fn new() -> Self {
        Self { bytes: 0 }
    }

    /// Reserve a region of `count` elements of `T`
    pub const fn with<T>(self, count: usize) -> Self {
        let bytes = count * std::mem::size_of::<T>();
        Self {
            bytes: self.bytes + bytes.div_ceil(SCRATCH_ALIGN) * SCRATCH_ALIGN,
        }
    }

    /// Total bytes including slack for aligning the first region
    pub const fn size(&self) -> usize {
        if self.bytes == 0 {
            0
        } else {
            self.bytes + SCRATCH_ALIGN
        }
    }
}

/// Carves typed, aligned regions out of a byte slice
#[derive(Debug)]
pub struct Scratch<'a> {
    buf: &'a mut [u8],
    total: usize,
}

impl<'a> Scratch<'a> {
    /// Wrap a caller buffer
    pub fn new(buf: &'a mut [u8]) -> Self {
        let total = buf.len();
        Self { buf, total }
    }

    /// Take the next region of `count` elements of `T`
    pub fn take<T: Pod>(&mut self, count: usize) -> Result<&'a mut [T]> {
        if count == 0 {
            return Ok(&mut []);
        }
        let buf = std::mem::take(&mut self.buf);
        let pad = buf.as_ptr().align_offset(SCRATCH_ALIGN);
        let bytes = count * std::mem::size_of::<T>();
        if pad > buf.len() || buf.len() - pad < bytes {
            let used = self.total - buf.len();
            return Err(Error::BufferTooSmall {
                needed: used + pad.min(SCRATCH_ALIGN) + bytes,
                got: self.total,
            });
        }
        let (_, rest) = buf.split_at_mut(pad);
        let (head, tail) = rest.split_at_mut(bytes);
        self.buf = tail;
        bytemuck::try_cast_slice_mut(head)
            .map_err(|e| Error::Internal(format!("scratch cast failed: {}", e)))
    }
}
