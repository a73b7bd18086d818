//! NEON pair-dot and depthwise channel-sum kernels for ARM64
//!
//! # Microkernel Dimensions
//!
//! - 6x8: 6 rows x 8 columns (two 4-lane registers per row)
//! - channel sums: 4 channels per register, scalar tail

use std::arch::aarch64::*;

use crate::conv::kernel::{ChannelArgs, MicroArgs};
use crate::dtype::bf16::ODD_MASK;

const F: usize = 4;
const DF: usize = 2 * F;
const MAX_ROWS: usize = 6;

#[inline(always)]
unsafe fn mul_acc<const FMA: bool>(
    acc: float32x4_t,
    a: float32x4_t,
    b: float32x4_t,
) -> float32x4_t {
    unsafe {
        if FMA {
            vfmaq_f32(acc, a, b)
        } else {
            vaddq_f32(acc, vmulq_f32(a, b))
        }
    }
}

/// `acc[0..M][0..8] (+)= A . B` for `M` rows
///
/// # Safety
/// - `args.rows.len() == M` and `args` must satisfy
///   [`MicroArgs::in_bounds`] for 8 columns
/// - `acc` must be valid for `M` rows of stride `ldacc`, 8 wide
#[target_feature(enable = "neon")]
pub unsafe fn gemm_2xm<const M: usize, const FMA: bool>(
    args: &MicroArgs<'_>,
    acc: *mut f32,
    ldacc: usize,
) {
    unsafe {
        let two = args.cols > F;
        let mask = vdupq_n_u32(ODD_MASK);

        let a = args.a.as_ptr();
        let mut rows = [a; M];
        for i in 0..M {
            rows[i] = a.add(args.rows[i]);
        }

        let mut c0 = [vdupq_n_f32(0.0); M];
        let mut c1 = [vdupq_n_f32(0.0); M];
        if !args.zero {
            for i in 0..M {
                c0[i] = vld1q_f32(acc.add(i * ldacc));
                if two {
                    c1[i] = vld1q_f32(acc.add(i * ldacc + F));
                }
            }
        }

        let mut b = args.b.as_ptr();
        for &seg in args.segments {
            let mut k = 0;
            while k < args.seg_len {
                let w = vld1q_u32(b as *const u32);
                let w00 = vreinterpretq_f32_u32(vshlq_n_u32::<16>(w));
                let w01 = vreinterpretq_f32_u32(vandq_u32(w, mask));
                let w = vld1q_u32(b.add(DF) as *const u32);
                let w10 = vreinterpretq_f32_u32(vshlq_n_u32::<16>(w));
                let w11 = vreinterpretq_f32_u32(vandq_u32(w, mask));
                for i in 0..M {
                    let pair = (rows[i].add(seg + k) as *const u32).read_unaligned();
                    let s0 = vdupq_n_f32(f32::from_bits(pair << 16));
                    let s1 = vdupq_n_f32(f32::from_bits(pair & ODD_MASK));
                    c0[i] = mul_acc::<FMA>(c0[i], s0, w00);
                    c0[i] = mul_acc::<FMA>(c0[i], s1, w01);
                    if two {
                        c1[i] = mul_acc::<FMA>(c1[i], s0, w10);
                        c1[i] = mul_acc::<FMA>(c1[i], s1, w11);
                    }
                }
                b = b.add(2 * DF);
                k += 2;
            }
        }

        for i in 0..M {
            vst1q_f32(acc.add(i * ldacc), c0[i]);
            if two {
                vst1q_f32(acc.add(i * ldacc + F), c1[i]);
            }
        }
    }
}

/// Dispatch on the row count of `args`
///
/// # Safety
/// Same as [`gemm_2xm`] with `M = args.rows.len()`.
pub unsafe fn gemm(args: &MicroArgs<'_>, acc: *mut f32, ldacc: usize, fma: bool) {
    unsafe {
        match (args.rows.len(), fma) {
            (0, _) => {}
            (1, true) => gemm_2xm::<1, true>(args, acc, ldacc),
            (1, false) => gemm_2xm::<1, false>(args, acc, ldacc),
            (2, true) => gemm_2xm::<2, true>(args, acc, ldacc),
            (2, false) => gemm_2xm::<2, false>(args, acc, ldacc),
            (3, true) => gemm_2xm::<3, true>(args, acc, ldacc),
            (3, false) => gemm_2xm::<3, false>(args, acc, ldacc),
            (4, true) => gemm_2xm::<4, true>(args, acc, ldacc),
            (4, false) => gemm_2xm::<4, false>(args, acc, ldacc),
            (5, true) => gemm_2xm::<5, true>(args, acc, ldacc),
            (5, false) => gemm_2xm::<5, false>(args, acc, ldacc),
            (6, true) => gemm_2xm::<6, true>(args, acc, ldacc),
            (6, false) => gemm_2xm::<6, false>(args, acc, ldacc),
            (n, _) => {
                gemm(&args.row_range(0, MAX_ROWS), acc, ldacc, fma);
                gemm(&args.row_range(MAX_ROWS, n), acc.add(MAX_ROWS * ldacc), ldacc, fma);
            }
        }
    }
}

/// `acc[j] = sum over taps of src[tap + j] * w[tap + j]`
///
/// # Safety
/// `args` must satisfy [`ChannelArgs::in_bounds`] for `acc.len()`.
#[target_feature(enable = "neon")]
pub unsafe fn channel_sum_v<const FMA: bool>(args: &ChannelArgs<'_>, acc: &mut [f32]) {
    unsafe {
        let n = args.len;
        let full = n / F * F;
        let src = args.src.as_ptr().add(args.src_base) as *const u16;
        let w = args.weights.as_ptr().add(args.w_base);
        let out = acc.as_mut_ptr();

        let mut j = 0;
        while j < full {
            let mut sum = vdupq_n_f32(0.0);
            for &(so, wo) in args.taps {
                let s = vreinterpretq_f32_u32(vshll_n_u16::<16>(vld1_u16(src.add(so + j))));
                sum = mul_acc::<FMA>(sum, s, vld1q_f32(w.add(wo + j)));
            }
            vst1q_f32(out.add(j), sum);
            j += F;
        }
        for j in full..n {
            let mut sum = 0.0f32;
            for &(so, wo) in args.taps {
                let s = f32::from_bits((*src.add(so + j) as u32) << 16);
                let k = *w.add(wo + j);
                sum = if FMA { s.mul_add(k, sum) } else { sum + s * k };
            }
            *out.add(j) = sum;
        }
    }
}

/// Dispatch on the FMA policy
///
/// # Safety
/// Same as [`channel_sum_v`].
pub unsafe fn channel_sum(args: &ChannelArgs<'_>, acc: &mut [f32], fma: bool) {
    unsafe {
        if fma {
            channel_sum_v::<true>(args, acc)
        } else {
            channel_sum_v::<false>(args, acc)
        }
    }
}
