//! Tiling parameter derivation
//!
//! [`AlgParam`] turns a [`ConvParam`] plus the tile constants of one hardware
//! tier and the cache estimates into concrete block sizes. Derivation is a
//! pure function: equal inputs always give equal parameters.
//!
//! # Blocking
//!
//! ```text
//! macro_k : reduction elements per pass; one micro_d-wide weight panel fills L1
//! macro_h : output rows per spatial block; their packed source fills half of L2
//! macro_d : output channels per block; their packed weights fill the other half
//! batch   : images packed together while the mini-batch still fits L2
//! ```
//!
//! Every tile dimension is a multiple of the tier's vector width, and the
//! padded lengths `buf_k >= k` and `buf_d >= dst_c` are aligned up to the
//! micro-tile granularity.

use super::param::ConvParam;
use crate::config::CacheSizes;
use crate::simd::SimdLevel;

/// Round `value` up to a multiple of `align`
#[inline]
pub(crate) const fn align_hi(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

/// Round `value` down to a multiple of `align`
#[inline]
pub(crate) const fn align_lo(value: usize, align: usize) -> usize {
    value / align * align
}

/// Largest micro-kernel row count of any tier
pub const MAX_MICRO_M: usize = 32;

/// Largest micro-kernel column count of any tier
pub const MAX_MICRO_D: usize = 32;

/// Fixed tile constants of one hardware tier
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TierConstants {
    /// Tier these constants describe
    pub level: SimdLevel,
    /// f32 lanes per vector register
    pub f: usize,
    /// Output columns per micro-tile (two vector registers wide)
    pub micro_d: usize,
    /// Output rows held in registers by the micro-kernel
    pub micro_m: usize,
    /// Reduction granularity
    pub micro_k: usize,
    /// Channel block of the channel-blocked source layouts
    pub micro_c: usize,
}

impl TierConstants {
    /// Portable kernels; tiles keep the 2-vector shape of a 4-lane machine
    pub const SCALAR: Self = Self {
        level: SimdLevel::Scalar,
        f: 4,
        micro_d: 8,
        micro_m: 4,
        micro_k: 2,
        micro_c: 8,
    };

    /// 32 NEON registers: 12 accumulators for 6 rows
    pub const NEON: Self = Self {
        level: SimdLevel::Neon,
        f: 4,
        micro_d: 8,
        micro_m: 6,
        micro_k: 2,
        micro_c: 8,
    };

    /// 16 ymm registers: 10 accumulators for 5 rows
    pub const AVX2: Self = Self {
        level: SimdLevel::Avx2Fma,
        f: 8,
        micro_d: 16,
        micro_m: 5,
        micro_k: 2,
        micro_c: 16,
    };

    /// 32 zmm registers: 24 accumulators for 12 rows
    pub const AVX512: Self = Self {
        level: SimdLevel::Avx512,
        f: 16,
        micro_d: 32,
        micro_m: 12,
        micro_k: 2,
        micro_c: 32,
    };

    /// Matrix tile unit: 2x2 tiles of 16x16 f32, 32 reduction elements deep
    pub const TILE: Self = Self {
        level: SimdLevel::AmxBf16,
        f: 16,
        micro_d: 32,
        micro_m: 32,
        micro_k: 32,
        micro_c: 32,
    };

    /// Vector-kernel constants for `level`
    ///
    /// The tile tier runs its non-tile variants on the AVX-512 kernels.
    pub const fn for_level(level: SimdLevel) -> Self {
        match level {
            SimdLevel::AmxBf16 | SimdLevel::Avx512 => Self::AVX512,
            SimdLevel::Avx2Fma => Self::AVX2,
            SimdLevel::Neon => Self::NEON,
            SimdLevel::Scalar => Self::SCALAR,
        }
    }
}

/// Derived tiling parameters
///
/// Field meanings are shared by all blocked variants; where a variant reads
/// a field differently the field doc says so.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct AlgParam {
    /// Images packed together (NHWC GEMM); 1 elsewhere
    pub batch: usize,
    /// Output positions per image (`dst_h * dst_w`), or computed grid
    /// positions for the padded-grid layouts
    pub m: usize,
    /// Logical reduction length
    pub k: usize,
    /// Micro-tile columns
    pub micro_d: usize,
    /// Micro-tile rows
    pub micro_m: usize,
    /// Reduction granularity
    pub micro_k: usize,
    /// Channel block of channel-blocked layouts
    pub micro_c: usize,
    /// Output channels per macro block (NCHW: channel rows per block)
    pub macro_d: usize,
    /// Output rows per spatial block (NCHW: spatial columns per block)
    pub macro_h: usize,
    /// Reduction elements per pass
    pub macro_k: usize,
    /// Output channels padded to `micro_d` (NCHW: spatial extent padded)
    pub buf_d: usize,
    /// Reduction length padded to `micro_k`
    pub buf_k: usize,
    /// Packed rows per mini-batch
    pub buf_m: usize,
    /// Source channels as stored in the padded layouts
    pub src_c: usize,
    /// Padded source height
    pub src_h: usize,
    /// Padded source width
    pub src_w: usize,
    /// Destination element size in bytes
    pub elem: usize,
}

impl AlgParam {
    /// Parameters for the row-packed NHWC GEMM (also the tile-unit GEMM)
    pub fn nhwc_gemm(p: &ConvParam, t: &TierConstants, cache: &CacheSizes) -> Self {
        let m = p.dst_h * p.dst_w;
        let k = p.reduction_len();
        let buf_d = align_hi(p.dst_c, t.micro_d);
        let buf_k = align_hi(k, t.micro_k);
        let macro_k = align_lo(cache.l1 / t.micro_d / 2, t.micro_k).clamp(t.micro_k, buf_k);

        let mut batch = 1;
        let buf_size = m * buf_k * 2;
        if buf_size * 2 <= cache.l2 && p.batch > 1 {
            for b in 1..=p.batch {
                if p.batch.is_multiple_of(b) && b * buf_size <= cache.l2 {
                    batch = b;
                }
            }
        }
        let buf_m = batch * m;

        let half_l2 = cache.l2 / 2;
        let macro_h = (half_l2 / (macro_k * 2) / p.dst_w.max(1)).clamp(1, (p.dst_h * batch).max(1));
        let macro_d = align_lo(half_l2 / (macro_k * 2), t.micro_d).clamp(t.micro_d, buf_d);

        Self {
            batch,
            m,
            k,
            micro_d: t.micro_d,
            micro_m: t.micro_m,
            micro_k: t.micro_k,
            micro_c: t.micro_c,
            macro_d,
            macro_h,
            macro_k,
            buf_d,
            buf_k,
            buf_m,
            src_c: p.src_c,
            src_h: p.src_h,
            src_w: p.src_w,
            elem: p.dst_type.size_in_bytes(),
        }
    }

    /// Parameters for the NCHW GEMM: rows are output channels, columns are
    /// output positions
    pub fn nchw_gemm(p: &ConvParam, t: &TierConstants, cache: &CacheSizes) -> Self {
        let m = p.dst_h * p.dst_w;
        let k = p.reduction_len();
        let buf_d = align_hi(m.max(1), t.micro_d);
        let buf_k = align_hi(k, t.micro_k);
        let macro_k = align_lo(cache.l1 / t.micro_d / 2, t.micro_k).clamp(t.micro_k, buf_k);
        let half_l2 = cache.l2 / 2;
        let macro_h = align_lo(half_l2 / (macro_k * 2), t.micro_d).clamp(t.micro_d, buf_d);
        let macro_d = align_lo(half_l2 / (macro_k * 2), t.micro_m)
            .clamp(t.micro_m, align_hi(p.dst_c, t.micro_m));

        Self {
            batch: 1,
            m,
            k,
            micro_d: t.micro_d,
            micro_m: t.micro_m,
            micro_k: t.micro_k,
            micro_c: t.micro_c,
            macro_d,
            macro_h,
            macro_k,
            buf_d,
            buf_k,
            buf_m: m,
            src_c: p.src_c,
            src_h: p.src_h,
            src_w: p.src_w,
            elem: p.dst_type.size_in_bytes(),
        }
    }

    /// Parameters for the zero-padded source layouts
    ///
    /// `channel_blocked` selects `micro_c`-wide channel blocks (`NhwcDirect`
    /// and `NhwcSpecV0`) over channel-interleaved rows (`NhwcSpecV1`). `grid`
    /// computes over every padded column instead of only the valid output
    /// positions.
    pub fn padded(
        p: &ConvParam,
        t: &TierConstants,
        cache: &CacheSizes,
        channel_blocked: bool,
        grid: bool,
    ) -> Self {
        let src_c = if channel_blocked {
            align_hi(p.src_c, t.micro_c)
        } else {
            align_hi(p.src_c, 2)
        };
        let src_h = p.src_h + p.pad_y + p.pad_h;
        let src_w = p.src_w + p.pad_x + p.pad_w;
        let k = p.reduction_len();
        let buf_k = src_c * p.kernel_y * p.kernel_x;
        let m = if grid && p.dst_h > 0 {
            (p.dst_h - 1) * src_w + p.dst_w
        } else {
            p.dst_h * p.dst_w
        };
        let buf_d = align_hi(p.dst_c, t.micro_d);
        let half_l2 = cache.l2 / 2;
        let row_bytes = src_w * src_c * 2 * p.stride_y;
        let macro_h = (half_l2 / row_bytes.max(1)).clamp(1, p.dst_h.max(1));
        let macro_d = align_lo(half_l2 / (buf_k * 2), t.micro_d).clamp(t.micro_d, buf_d);

        Self {
            batch: 1,
            m,
            k,
            micro_d: t.micro_d,
            micro_m: t.micro_m,
            micro_k: 2,
            micro_c: if channel_blocked { t.micro_c } else { src_c },
            macro_d,
            macro_h,
            macro_k: buf_k,
            buf_d,
            buf_k,
            buf_m: m,
            src_c,
            src_h,
            src_w,
            elem: p.dst_type.size_in_bytes(),
        }
    }

    /// Bytes of one packed padded image
    #[inline]
    pub fn padded_image_bytes(&self) -> usize {
        self.src_h * self.src_w * self.src_c * 2
    }

    /// Reduction passes per output block
    #[inline]
    pub fn k_passes(&self) -> usize {
        self.buf_k.div_ceil(self.macro_k)
    }
}
