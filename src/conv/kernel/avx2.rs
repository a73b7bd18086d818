//! AVX2 pair-dot and depthwise channel-sum kernels
//!
//! # Microkernel Dimensions
//!
//! - 5x16: 5 rows x 16 columns (two 8-lane registers per row)
//! - channel sums: 8 channels per register, scalar tail
//!
//! # Register Usage
//!
//! - ymm0-ymm9: C accumulators
//! - ymm10-ymm13: widened weight pair (even, odd) for both halves
//! - ymm14-ymm15: broadcast source pair

use core::arch::x86_64::*;

use super::macros::{define_channel_kernel, define_pair_dot_kernel, mul_acc};
use super::{ChannelArgs, MicroArgs};
use crate::dtype::bf16::ODD_MASK;
use half::bf16;

define_pair_dot_kernel!(
    lanes = 8,
    features = ["avx2", "fma"],
    rows = [1, 2, 3, 4, 5],
    max_rows = 5,
    loadu_ps = _mm256_loadu_ps,
    storeu_ps = _mm256_storeu_ps,
    setzero_ps = _mm256_setzero_ps,
    set1_ps = _mm256_set1_ps,
    loadu_si = _mm256_loadu_si256,
    slli_epi32 = _mm256_slli_epi32,
    and_si = _mm256_and_si256,
    set1_epi32 = _mm256_set1_epi32,
    cast_ps = _mm256_castsi256_ps,
    fmadd_ps = _mm256_fmadd_ps,
    mul_ps = _mm256_mul_ps,
    add_ps = _mm256_add_ps
);

/// Load 8 consecutive bf16 as f32 lanes
#[target_feature(enable = "avx2")]
#[inline]
unsafe fn widen_bf16(p: *const bf16) -> __m256 {
    unsafe {
        let h = _mm_loadu_si128(p as *const __m128i);
        _mm256_castsi256_ps(_mm256_slli_epi32::<16>(_mm256_cvtepu16_epi32(h)))
    }
}

define_channel_kernel!(
    lanes = 8,
    features = ["avx2", "fma"],
    widen = widen_bf16,
    loadu_ps = _mm256_loadu_ps,
    storeu_ps = _mm256_storeu_ps,
    setzero_ps = _mm256_setzero_ps,
    fmadd_ps = _mm256_fmadd_ps,
    mul_ps = _mm256_mul_ps,
    add_ps = _mm256_add_ps
);
