//! bf16 conversion helpers shared by the packers and kernels
//!
//! A bf16 value is the top half of an f32 bit pattern. Two bf16 values that sit
//! next to each other in memory form one little-endian `u32` word: the element
//! at the even index lands in the low half, the odd one in the high half. The
//! kernels use [`split_pair`] to widen both halves with one shift and one mask
//! instead of a separate unpack.

use super::Element;
use half::bf16;

/// Mask selecting the high (odd) bf16 of a packed pair
pub const ODD_MASK: u32 = 0xFFFF_0000;

/// Round an f32 to bf16 (nearest, ties to even)
#[inline]
pub fn round(v: f32) -> bf16 {
    bf16::from_f32(v)
}

/// Widen raw bf16 bits to f32
#[inline]
pub fn widen(bits: u16) -> f32 {
    f32::from_bits((bits as u32) << 16)
}

/// Round an f32 through bf16 and back
#[inline]
pub fn quantize(v: f32) -> f32 {
    round(v).to_f32()
}

/// Split a packed pair into its (even, odd) elements as f32
#[inline]
pub fn split_pair(pair: u32) -> (f32, f32) {
    (f32::from_bits(pair << 16), f32::from_bits(pair & ODD_MASK))
}

/// Pack two bf16 values into one word, `even` in the low half
#[inline]
pub fn make_pair(even: bf16, odd: bf16) -> u32 {
    (even.to_bits() as u32) | ((odd.to_bits() as u32) << 16)
}

/// Convert a run of source elements to bf16
///
/// Copies when the source already is bf16, rounds otherwise.
#[inline]
pub fn convert_run<S: Element>(src: &[S], dst: &mut [bf16]) {
    debug_assert!(dst.len() >= src.len());
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = s.to_bf16();
    }
}
