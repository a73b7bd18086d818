//! AVX-512 pair-dot and depthwise channel-sum kernels
//!
//! # Microkernel Dimensions
//!
//! - 12x32: 12 rows x 32 columns (two 16-lane registers per row)
//! - channel sums: 16 channels per register, scalar tail
//!
//! # Register Usage
//!
//! - zmm0-zmm23: C accumulators
//! - zmm24-zmm27: widened weight pair (even, odd) for both halves
//! - zmm28-zmm29: broadcast source pair

use core::arch::x86_64::*;

use super::macros::{define_channel_kernel, define_pair_dot_kernel, mul_acc};
use super::{ChannelArgs, MicroArgs};
use crate::dtype::bf16::ODD_MASK;
use half::bf16;

define_pair_dot_kernel!(
    lanes = 16,
    features = ["avx512f", "fma"],
    rows = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12],
    max_rows = 12,
    loadu_ps = _mm512_loadu_ps,
    storeu_ps = _mm512_storeu_ps,
    setzero_ps = _mm512_setzero_ps,
    set1_ps = _mm512_set1_ps,
    loadu_si = _mm512_loadu_si512,
    slli_epi32 = _mm512_slli_epi32,
    and_si = _mm512_and_si512,
    set1_epi32 = _mm512_set1_epi32,
    cast_ps = _mm512_castsi512_ps,
    fmadd_ps = _mm512_fmadd_ps,
    mul_ps = _mm512_mul_ps,
    add_ps = _mm512_add_ps
);

/// Load 16 consecutive bf16 as f32 lanes
#[target_feature(enable = "avx512f")]
#[inline]
unsafe fn widen_bf16(p: *const bf16) -> __m512 {
    unsafe {
        let h = _mm256_loadu_si256(p as *const __m256i);
        _mm512_castsi512_ps(_mm512_slli_epi32::<16>(_mm512_cvtepu16_epi32(h)))
    }
}

define_channel_kernel!(
    lanes = 16,
    features = ["avx512f", "fma"],
    widen = widen_bf16,
    loadu_ps = _mm512_loadu_ps,
    storeu_ps = _mm512_storeu_ps,
    setzero_ps = _mm512_setzero_ps,
    fmadd_ps = _mm512_fmadd_ps,
    mul_ps = _mm512_mul_ps,
    add_ps = _mm512_add_ps
);
