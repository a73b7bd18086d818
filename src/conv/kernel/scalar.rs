//! Portable micro-kernel
//!
//! Evaluates the panel contract with plain f32 arithmetic. Every step is a
//! separate multiply and add in the same order the vector kernels use when
//! fused multiply-add is avoided, so those kernels reproduce these results
//! bit for bit.

use super::{ChannelArgs, MicroArgs};
use crate::conv::alg::MAX_MICRO_D;
use crate::dtype::bf16::split_pair;

#[inline]
fn load_pair(a: &[half::bf16], at: usize) -> u32 {
    (a[at].to_bits() as u32) | ((a[at + 1].to_bits() as u32) << 16)
}

/// `acc[i][0..cols] (+)= A[rows[i]] . B` for every row of `args`
pub fn gemm(args: &MicroArgs<'_>, acc: &mut [f32], ldacc: usize, micro_d: usize) {
    let cols = args.cols;
    for (i, &row) in args.rows.iter().enumerate() {
        let mut sum = [0.0f32; MAX_MICRO_D];
        let out = &mut acc[i * ldacc..i * ldacc + cols];
        if !args.zero {
            sum[..cols].copy_from_slice(out);
        }
        let mut b = args.b;
        for &seg in args.segments {
            let base = row + seg;
            for k in (0..args.seg_len).step_by(2) {
                let (s0, s1) = split_pair(load_pair(args.a, base + k));
                let (panel, rest) = b.split_at(2 * micro_d);
                for (j, s) in sum[..cols].iter_mut().enumerate() {
                    let (w0, w1) = split_pair(load_pair(panel, 2 * j));
                    *s = *s + s0 * w0;
                    *s = *s + s1 * w1;
                }
                b = rest;
            }
        }
        out.copy_from_slice(&sum[..cols]);
    }
}

/// `acc[j] = sum over taps of src[tap + j] * w[tap + j]` for `args.len` channels
pub fn channel_sum(args: &ChannelArgs<'_>, acc: &mut [f32]) {
    let n = args.len;
    let acc = &mut acc[..n];
    acc.fill(0.0);
    for &(so, wo) in args.taps {
        let src = &args.src[args.src_base + so..][..n];
        let w = &args.weights[args.w_base + wo..][..n];
        for ((s, v), &w) in acc.iter_mut().zip(src).zip(w) {
            *s = *s + v.to_f32() * w;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::bf16::round;

    #[test]
    fn test_single_pair_dot() {
        // a = [1, 2], b columns: (3, 4) and (5, 6)
        let a = [round(1.0), round(2.0)];
        let b: Vec<_> = [3.0, 4.0, 5.0, 6.0]
            .iter()
            .chain([0.0f32; 12].iter())
            .map(|&v| round(v))
            .collect();
        let mut acc = [7.0f32; 8];
        let args = MicroArgs {
            a: &a,
            rows: &[0],
            segments: &[0],
            seg_len: 2,
            b: &b,
            cols: 2,
            zero: true,
        };
        gemm(&args, &mut acc, 8, 8);
        assert_eq!(&acc[..2], &[11.0, 17.0]);
        // columns past `cols` are left alone
        assert_eq!(acc[2], 7.0);

        gemm(&MicroArgs { zero: false, ..args }, &mut acc, 8, 8);
        assert_eq!(&acc[..2], &[22.0, 34.0]);
    }

    #[test]
    fn test_channel_sum_per_lane() {
        // two taps over three channels
        let src: Vec<_> = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0].iter().map(|&v| round(v)).collect();
        let weights = [0.5, 1.0, 2.0, -1.0, 0.0, 1.0];
        let args = ChannelArgs {
            src: &src,
            weights: &weights,
            taps: &[(0, 0), (3, 3)],
            src_base: 0,
            w_base: 0,
            len: 3,
        };
        let mut acc = [9.0f32; 4];
        channel_sum(&args, &mut acc);
        assert_eq!(acc, [-3.5, 2.0, 12.0, 9.0]);
    }
}
