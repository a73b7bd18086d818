//! Common test utilities
#![allow(dead_code)]

use bf16conv::prelude::*;
use bf16conv::dtype::bf16::quantize;
use half::bf16;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Naive convolution over bf16-rounded source and weights
///
/// Sums in f64 and returns, per output element, the finished value and
/// the sum of absolute products (the scale f32 accumulation error grows with).
pub struct Reference {
    pub out: Vec<f32>,
    pub scale: Vec<f32>,
}

pub fn reference_conv(
    p: &ConvParam,
    src: &[f32],
    weight: &[f32],
    bias: &[f32],
    act: &Activation,
) -> Reference {
    let nhwc = p.format == TensorFormat::Nhwc;
    let (cg, dg) = (p.src_c / p.group, p.dst_c / p.group);
    let mut out = vec![0.0f32; p.dst_len()];
    let mut scale = vec![0.0f32; p.dst_len()];

    let src_at = |n: usize, c: usize, y: usize, x: usize| {
        if nhwc {
            ((n * p.src_h + y) * p.src_w + x) * p.src_c + c
        } else {
            ((n * p.src_c + c) * p.src_h + y) * p.src_w + x
        }
    };
    let w_at = |ky: usize, kx: usize, c: usize, d: usize| {
        if nhwc {
            ((ky * p.kernel_x + kx) * cg + c) * p.dst_c + d
        } else {
            ((d * cg + c) * p.kernel_y + ky) * p.kernel_x + kx
        }
    };
    let dst_at = |n: usize, d: usize, y: usize, x: usize| {
        if nhwc {
            ((n * p.dst_h + y) * p.dst_w + x) * p.dst_c + d
        } else {
            ((n * p.dst_c + d) * p.dst_h + y) * p.dst_w + x
        }
    };

    for n in 0..p.batch {
        for d in 0..p.dst_c {
            let g = d / dg;
            for dy in 0..p.dst_h {
                for dx in 0..p.dst_w {
                    let mut sum = 0.0f64;
                    let mut abs = 0.0f64;
                    for ky in 0..p.kernel_y {
                        let sy = (dy * p.stride_y + ky * p.dilation_y) as isize - p.pad_y as isize;
                        if sy < 0 || sy >= p.src_h as isize {
                            continue;
                        }
                        for kx in 0..p.kernel_x {
                            let sx = (dx * p.stride_x + kx * p.dilation_x) as isize - p.pad_x as isize;
                            if sx < 0 || sx >= p.src_w as isize {
                                continue;
                            }
                            for c in 0..cg {
                                let s = quantize(src[src_at(n, g * cg + c, sy as usize, sx as usize)]);
                                let w = quantize(weight[w_at(ky, kx, c, d)]);
                                let t = s as f64 * w as f64;
                                sum += t;
                                abs += t.abs();
                            }
                        }
                    }
                    let at = dst_at(n, d, dy, dx);
                    out[at] = act.apply(sum as f32 + bias[d], d);
                    scale[at] = (abs + bias[d].abs() as f64) as f32;
                }
            }
        }
    }
    Reference { out, scale }
}

/// Deterministic values in `[-1, 1)` for a given seed
pub fn pseudo_random(len: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.random_range(-1.0f32..1.0)).collect()
}

/// Every tier the host can run, lowest first
pub fn available_caps() -> Vec<CpuCaps> {
    let detected = CpuCaps::detect();
    [
        SimdLevel::Scalar,
        SimdLevel::Neon,
        SimdLevel::Avx2Fma,
        SimdLevel::Avx512,
        SimdLevel::AmxBf16,
    ]
    .into_iter()
    .filter_map(|level| detected.with_level(level).ok())
    .collect()
}

/// Assert `got` matches a reference within f32 accumulation error
///
/// Element `i` may differ by `rtol * (scale[i] + 1)`; `rtol` covers the
/// reduction error plus any destination rounding.
pub fn assert_conv_close(got: &[f32], want: &Reference, rtol: f32, msg: &str) {
    assert_eq!(got.len(), want.out.len(), "{}: length mismatch", msg);
    for (i, ((&x, &y), &s)) in got.iter().zip(&want.out).zip(&want.scale).enumerate() {
        let diff = (x - y).abs();
        let tol = rtol * (s + 1.0);
        assert!(
            diff <= tol,
            "{}: element {} differs: {} vs {} (diff={}, tol={})",
            msg,
            i,
            x,
            y,
            diff,
            tol
        );
    }
}

/// Assert two f32 slices are close within tolerance
pub fn assert_allclose_f32(a: &[f32], b: &[f32], rtol: f32, atol: f32, msg: &str) {
    assert_eq!(a.len(), b.len(), "{}: length mismatch", msg);
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        let diff = (x - y).abs();
        let tol = atol + rtol * y.abs();
        assert!(
            diff <= tol,
            "{}: element {} differs: {} vs {} (diff={}, tol={})",
            msg,
            i,
            x,
            y,
            diff,
            tol
        );
    }
}

pub fn to_bf16(v: &[f32]) -> Vec<bf16> {
    v.iter().map(|&x| bf16::from_f32(x)).collect()
}

pub fn to_f32(v: &[bf16]) -> Vec<f32> {
    v.iter().map(|x| x.to_f32()).collect()
}

/// Build, bind and run one convolution with f32 tensors
///
/// `kind` forces a variant; `None` lets the selector choose. Returns the
/// instance next to its output so callers can inspect the selection.
pub fn run_f32(
    batch: usize,
    desc: &ConvDesc,
    compat: Compatibility,
    caps: &CpuCaps,
    kind: Option<VariantKind>,
    src: &[f32],
    weight: &[f32],
    bias: &[f32],
    params: Option<&[f32]>,
) -> Result<(Convolution16b, Vec<f32>)> {
    let mut conv = match kind {
        Some(kind) => Convolution16b::with_variant(batch, desc, compat, caps, kind)?,
        None => Convolution16b::new(batch, desc, compat, caps)?,
    };
    conv.set_params(weight, Some(bias), params)?;
    let mut dst = vec![0.0f32; conv.param().dst_len()];
    let mut scratch = vec![0u8; conv.external_buffer_size()];
    conv.forward(src.into(), Some(&mut scratch[..]), (&mut dst).into())?;
    Ok((conv, dst))
}
