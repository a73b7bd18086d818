//! bf16 pair-dot micro-kernels
//!
//! Every blocked variant reduces to the same inner operation:
//!
//! ```text
//! acc[i][j] (+)= sum over segments s, pairs p of
//!     a[rows[i] + s + 2p]     * b[2p][j]
//!   + a[rows[i] + s + 2p + 1] * b[2p + 1][j]
//! ```
//!
//! The broadcast operand `a` is addressed through per-row base offsets and a
//! table of segment offsets, which lets one kernel walk a packed im2row
//! matrix (one segment per K pass), a padded image (one segment per kernel
//! tap and channel block) or a weight matrix (NCHW) without copying.
//!
//! # Panel Layout
//!
//! The `b` operand is consumed linearly: for each segment, for each element
//! pair of the segment, `micro_d` packed pairs (`2 * micro_d` bf16). Column
//! `j` of pair `p` is the `u32` at `2 * j`: the even reduction element in its
//! low half, the odd one in its high half.
//!
//! ```text
//! [ (b[0][0], b[1][0]) (b[0][1], b[1][1]) ... (b[0][D-1], b[1][D-1]) ]  pair 0
//! [ (b[2][0], b[3][0]) ...                                           ]  pair 1
//! ```
//!
//! # Tiers
//!
//! | Tier     | Columns | Rows | Source           |
//! |----------|---------|------|------------------|
//! | Scalar   | 8       | 4    | [`scalar`]       |
//! | NEON     | 8       | 6    | `aarch64::neon`  |
//! | AVX2     | 16      | 5    | `avx2`           |
//! | AVX-512  | 32      | 12   | `avx512`         |
//!
//! The matrix tile unit has its own contract, see [`tile`].
//!
//! # Channel Sums
//!
//! Depthwise convolution has no reduction over channels, so it uses a
//! second, lane-parallel contract ([`ChannelArgs`]): for a run of up to
//! `micro_d` channels, sum `src[tap + j] * w[tap + j]` over the window taps.
//! The vector forms load `F` channels of bf16, widen them with one shift and
//! accumulate against the f32 weights; channels past the last full vector
//! take a scalar tail.

#[cfg(target_arch = "aarch64")]
pub(crate) mod aarch64;
#[cfg(target_arch = "x86_64")]
pub(crate) mod avx2;
#[cfg(target_arch = "x86_64")]
pub(crate) mod avx512;
#[cfg(target_arch = "x86_64")]
mod macros;
pub(crate) mod scalar;
pub(crate) mod tile;

use super::alg::TierConstants;
use crate::simd::SimdLevel;
use half::bf16;

/// Operands of one micro-kernel call
#[derive(Copy, Clone, Debug)]
pub(crate) struct MicroArgs<'a> {
    /// Broadcast operand
    pub a: &'a [bf16],
    /// Offset of each accumulator row's reduction start in `a`
    pub rows: &'a [usize],
    /// Reduction segment offsets added to every row offset
    pub segments: &'a [usize],
    /// Elements per segment (even)
    pub seg_len: usize,
    /// Packed panel, consumed linearly
    pub b: &'a [bf16],
    /// Valid columns; at most `micro_d`
    pub cols: usize,
    /// Start from zero instead of the accumulator contents
    pub zero: bool,
}

impl MicroArgs<'_> {
    /// Check that every access of a `micro_d`-wide kernel stays in bounds
    pub fn in_bounds(&self, micro_d: usize, acc_len: usize, ldacc: usize) -> bool {
        let Some(&max_row) = self.rows.iter().max() else {
            return true;
        };
        let max_seg = self.segments.iter().max().copied().unwrap_or(0);
        let a_ok = self.segments.is_empty()
            || self.seg_len == 0
            || max_row + max_seg + self.seg_len <= self.a.len();
        self.seg_len % 2 == 0
            && a_ok
            && self.b.len() >= self.segments.len() * self.seg_len * micro_d
            && self.cols <= micro_d
            && (self.rows.len() - 1) * ldacc + micro_d <= acc_len
    }

    /// The same operands restricted to rows `[from, to)`
    #[inline]
    pub fn row_range(&self, from: usize, to: usize) -> Self {
        Self {
            rows: &self.rows[from..to],
            ..*self
        }
    }
}

/// Operands of one depthwise channel-sum call
#[derive(Copy, Clone, Debug)]
pub(crate) struct ChannelArgs<'a> {
    /// bf16 image, channels innermost
    pub src: &'a [bf16],
    /// f32 weights, channels innermost
    pub weights: &'a [f32],
    /// `(source offset, weight offset)` of each tap, relative to the bases
    pub taps: &'a [(usize, usize)],
    /// Added to every source offset
    pub src_base: usize,
    /// Added to every weight offset
    pub w_base: usize,
    /// Channels; at most `micro_d`
    pub len: usize,
}

impl ChannelArgs<'_> {
    /// Check that every tap reads `len` channels inside both operands
    pub fn in_bounds(&self, micro_d: usize, acc_len: usize) -> bool {
        self.len <= micro_d
            && self.len <= acc_len
            && self.taps.iter().all(|&(s, w)| {
                self.src_base + s + self.len <= self.src.len()
                    && self.w_base + w + self.len <= self.weights.len()
            })
    }
}

/// A micro-kernel bound to one tier and one multiply-accumulate policy
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct MicroKernel {
    level: SimdLevel,
    micro_d: usize,
    micro_m: usize,
    fma: bool,
}

impl MicroKernel {
    /// Kernel for the tier constants `t`; `fma` is ignored by the scalar tier
    pub fn new(t: &TierConstants, fma: bool) -> Self {
        Self {
            level: t.level,
            micro_d: t.micro_d,
            micro_m: t.micro_m,
            fma,
        }
    }

    /// Columns per call
    #[inline]
    pub fn micro_d(&self) -> usize {
        self.micro_d
    }

    /// Rows per register block
    #[inline]
    pub fn micro_m(&self) -> usize {
        self.micro_m
    }

    /// Run one call
    ///
    /// `acc` holds `args.rows.len()` rows of stride `ldacc`, each at least
    /// `micro_d` wide. Row counts above `micro_m` are split into register
    /// blocks.
    ///
    /// Panics if an access would leave `args.a`, `args.b` or `acc`; the SIMD
    /// kernels read and write through raw pointers after this check.
    #[inline]
    pub fn run(&self, args: &MicroArgs<'_>, acc: &mut [f32], ldacc: usize) {
        assert!(
            args.in_bounds(self.micro_d, acc.len(), ldacc),
            "micro-kernel operands out of bounds: {} rows, ldacc {}, acc {}",
            args.rows.len(),
            ldacc,
            acc.len()
        );
        if args.rows.is_empty() {
            return;
        }
        match self.level {
            #[cfg(target_arch = "x86_64")]
            SimdLevel::Avx2Fma => unsafe { avx2::gemm(args, acc.as_mut_ptr(), ldacc, self.fma) },
            #[cfg(target_arch = "x86_64")]
            SimdLevel::Avx512 | SimdLevel::AmxBf16 => unsafe {
                avx512::gemm(args, acc.as_mut_ptr(), ldacc, self.fma)
            },
            #[cfg(target_arch = "aarch64")]
            SimdLevel::Neon => unsafe {
                aarch64::neon::gemm(args, acc.as_mut_ptr(), ldacc, self.fma)
            },
            _ => scalar::gemm(args, acc, ldacc, self.micro_d),
        }
    }

    /// Sum the window taps of `args.len` channels into `acc[..args.len]`
    ///
    /// `acc` is overwritten. Panics if a tap reads outside `args.src` or
    /// `args.weights`.
    #[inline]
    pub fn channels(&self, args: &ChannelArgs<'_>, acc: &mut [f32]) {
        assert!(
            args.in_bounds(self.micro_d, acc.len()),
            "channel-sum operands out of bounds: {} channels, {} taps",
            args.len,
            args.taps.len()
        );
        match self.level {
            #[cfg(target_arch = "x86_64")]
            SimdLevel::Avx2Fma => unsafe { avx2::channel_sum(args, acc, self.fma) },
            #[cfg(target_arch = "x86_64")]
            SimdLevel::Avx512 | SimdLevel::AmxBf16 => unsafe {
                avx512::channel_sum(args, acc, self.fma)
            },
            #[cfg(target_arch = "aarch64")]
            SimdLevel::Neon => unsafe { aarch64::neon::channel_sum(args, acc, self.fma) },
            _ => scalar::channel_sum(args, acc),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::bf16::round;
    use crate::simd::CpuCaps;

    struct Case {
        a: Vec<bf16>,
        rows: Vec<usize>,
        segments: Vec<usize>,
        seg_len: usize,
        b: Vec<bf16>,
    }

    fn case(micro_d: usize, n_rows: usize, segments: Vec<usize>, seg_len: usize) -> Case {
        let row_stride = 40;
        let a = (0..n_rows * row_stride + 64)
            .map(|i| round(((i * 7) % 13) as f32 * 0.25 - 1.5))
            .collect();
        let rows = (0..n_rows).map(|i| i * row_stride).collect();
        let b = (0..segments.len() * seg_len * micro_d)
            .map(|i| round(((i * 5) % 11) as f32 * 0.125 - 0.5))
            .collect();
        Case {
            a,
            rows,
            segments,
            seg_len,
            b,
        }
    }

    /// Direct evaluation of the panel contract
    fn reference(c: &Case, micro_d: usize, cols: usize) -> Vec<f32> {
        let mut out = vec![0.0f32; c.rows.len() * micro_d];
        for (i, &row) in c.rows.iter().enumerate() {
            for j in 0..cols {
                let mut sum = 0.0f32;
                let mut bi = 0;
                for &seg in &c.segments {
                    for p in (0..c.seg_len).step_by(2) {
                        let a0 = c.a[row + seg + p].to_f32();
                        let a1 = c.a[row + seg + p + 1].to_f32();
                        let b0 = c.b[bi + 2 * j].to_f32();
                        let b1 = c.b[bi + 2 * j + 1].to_f32();
                        sum = sum + a0 * b0;
                        sum = sum + a1 * b1;
                        bi += 2 * micro_d;
                    }
                }
                out[i * micro_d + j] = sum;
            }
        }
        out
    }

    fn run_case(t: &TierConstants, fma: bool, n_rows: usize, cols: usize) -> (Vec<f32>, Vec<f32>) {
        let c = case(t.micro_d, n_rows, vec![0, 6, 20], 4);
        let kernel = MicroKernel::new(t, fma);
        let mut acc = vec![0.0f32; n_rows * t.micro_d];
        let args = MicroArgs {
            a: &c.a,
            rows: &c.rows,
            segments: &c.segments,
            seg_len: c.seg_len,
            b: &c.b,
            cols,
            zero: true,
        };
        kernel.run(&args, &mut acc, t.micro_d);
        (acc, reference(&c, t.micro_d, cols))
    }

    fn available_tiers() -> Vec<TierConstants> {
        let detected = CpuCaps::detect().level();
        [
            TierConstants::SCALAR,
            TierConstants::NEON,
            TierConstants::AVX2,
            TierConstants::AVX512,
        ]
        .into_iter()
        .filter(|t| detected.supports(t.level))
        .collect()
    }

    #[test]
    fn test_kernels_match_contract() {
        for t in available_tiers() {
            for n_rows in [1, t.micro_m, t.micro_m + 3] {
                for cols in [t.micro_d, t.f, t.f + 1, 1] {
                    let (got, want) = run_case(&t, false, n_rows, cols);
                    for i in 0..n_rows {
                        for j in 0..cols {
                            let (g, w) = (got[i * t.micro_d + j], want[i * t.micro_d + j]);
                            assert_eq!(g, w, "{:?} rows={} cols={} at ({}, {})", t.level, n_rows, cols, i, j);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_fused_kernels_are_close() {
        for t in available_tiers() {
            let (got, want) = run_case(&t, true, t.micro_m, t.micro_d);
            for (g, w) in got.iter().zip(&want) {
                assert!((g - w).abs() <= 1e-4 * w.abs().max(1.0), "{:?}: {} vs {}", t.level, g, w);
            }
        }
    }

    #[test]
    fn test_accumulate_continues_sum() {
        for t in available_tiers() {
            let c = case(t.micro_d, 2, vec![0], 8);
            let kernel = MicroKernel::new(&t, false);
            let mut acc = vec![0.0f32; 2 * t.micro_d];
            let first = MicroArgs {
                a: &c.a,
                rows: &c.rows,
                segments: &c.segments,
                seg_len: 4,
                b: &c.b,
                cols: t.micro_d,
                zero: true,
            };
            kernel.run(&first, &mut acc, t.micro_d);
            let second = MicroArgs {
                segments: &[4],
                b: &c.b[4 * t.micro_d..],
                zero: false,
                ..first
            };
            kernel.run(&second, &mut acc, t.micro_d);
            let want = reference(&c, t.micro_d, t.micro_d);
            for (g, w) in acc.iter().zip(&want) {
                assert_eq!(g, w, "{:?}", t.level);
            }
        }
    }

    #[test]
    fn test_bounds_check() {
        let c = case(8, 2, vec![0], 4);
        let args = MicroArgs {
            a: &c.a,
            rows: &c.rows,
            segments: &c.segments,
            seg_len: 4,
            b: &c.b,
            cols: 8,
            zero: true,
        };
        assert!(args.in_bounds(8, 16, 8));
        assert!(!args.in_bounds(8, 15, 8));
        assert!(!MicroArgs { seg_len: 3, ..args }.in_bounds(8, 16, 8));
        assert!(!MicroArgs { cols: 9, ..args }.in_bounds(8, 16, 8));
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_run_rejects_short_accumulator() {
        for t in available_tiers() {
            let c = case(t.micro_d, 2, vec![0], 4);
            let args = MicroArgs {
                a: &c.a,
                rows: &c.rows,
                segments: &c.segments,
                seg_len: 4,
                b: &c.b,
                cols: t.micro_d,
                zero: true,
            };
            let mut acc = vec![0.0f32; 2 * t.micro_d - 1];
            MicroKernel::new(&t, true).run(&args, &mut acc, t.micro_d);
        }
    }

    /// Image of 5 pixels x 37 channels plus the taps of a 3-wide window
    fn channel_case() -> (Vec<bf16>, Vec<f32>, Vec<(usize, usize)>) {
        let c = 37;
        let src = (0..5 * c).map(|i| round(((i * 7) % 19) as f32 * 0.25 - 2.0)).collect();
        let weights = (0..3 * c).map(|i| round(((i * 3) % 7) as f32 * 0.5 - 1.5).to_f32()).collect();
        let taps = (0..3).map(|k| (k * c, k * c)).collect();
        (src, weights, taps)
    }

    #[test]
    fn test_channel_sums_match_scalar() {
        let (src, weights, taps) = channel_case();
        for t in available_tiers() {
            for len in [t.micro_d, t.f, t.f + 1, 3, 1] {
                let args = ChannelArgs {
                    src: &src,
                    weights: &weights,
                    taps: &taps,
                    src_base: 37 + 2,
                    w_base: 2,
                    len,
                };
                let mut want = vec![0.0f32; len];
                scalar::channel_sum(&args, &mut want);
                let mut got = vec![f32::NAN; len];
                MicroKernel::new(&t, false).channels(&args, &mut got);
                assert_eq!(got, want, "{:?} len={}", t.level, len);
                let mut fused = vec![f32::NAN; len];
                MicroKernel::new(&t, true).channels(&args, &mut fused);
                for (g, w) in fused.iter().zip(&want) {
                    assert!((g - w).abs() <= 1e-5 * w.abs().max(1.0), "{:?}: {} vs {}", t.level, g, w);
                }
            }
        }
    }

    #[test]
    fn test_channel_sum_without_taps_is_zero() {
        let (src, weights, _) = channel_case();
        for t in available_tiers() {
            let args = ChannelArgs {
                src: &src,
                weights: &weights,
                taps: &[],
                src_base: 0,
                w_base: 0,
                len: t.micro_d,
            };
            let mut acc = vec![1.0f32; t.micro_d];
            MicroKernel::new(&t, true).channels(&args, &mut acc);
            assert!(acc.iter().all(|&v| v == 0.0), "{:?}", t.level);
        }
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_channel_sum_rejects_tap_past_image() {
        let (src, weights, _) = channel_case();
        let t = TierConstants::SCALAR;
        let args = ChannelArgs {
            src: &src,
            weights: &weights,
            taps: &[(0, 0), (4 * 37 + 32, 0)],
            src_base: 0,
            w_base: 0,
            len: t.micro_d,
        };
        let mut acc = vec![0.0f32; t.micro_d];
        MicroKernel::new(&t, false).channels(&args, &mut acc);
    }
}
