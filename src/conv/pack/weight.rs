//! Weight packing

use crate::conv::param::{ConvParam, TensorFormat};
use crate::dtype::bf16::round;
use half::bf16;

/// Caller weights in the layout matching the tensor format
///
/// - NHWC: `[kernel_y][kernel_x][src_c / group][dst_c]`
/// - NCHW: `[dst_c][src_c / group][kernel_y][kernel_x]`
#[derive(Copy, Clone, Debug)]
pub(crate) struct WeightView<'a> {
    data: &'a [f32],
    format: TensorFormat,
    kernel_y: usize,
    kernel_x: usize,
    channels: usize,
    dst_c: usize,
}

impl<'a> WeightView<'a> {
    /// View `data` as the filter of `p`; `data` must hold `p.weight_len()` values
    pub fn new(p: &ConvParam, data: &'a [f32]) -> Self {
        debug_assert!(data.len() >= p.weight_len());
        Self {
            data,
            format: p.format,
            kernel_y: p.kernel_y,
            kernel_x: p.kernel_x,
            channels: p.src_c / p.group,
            dst_c: p.dst_c,
        }
    }

    /// Weight of tap `(ky, kx)`, group-local input channel `c`, output channel `d`
    #[inline]
    pub fn at(&self, ky: usize, kx: usize, c: usize, d: usize) -> f32 {
        match self.format {
            TensorFormat::Nhwc => {
                self.data[((ky * self.kernel_x + kx) * self.channels + c) * self.dst_c + d]
            }
            TensorFormat::Nchw => {
                self.data[((d * self.channels + c) * self.kernel_y + ky) * self.kernel_x + kx]
            }
        }
    }

    /// Weight at reduction index `k` of the `(ky, kx, c)` order
    #[inline]
    pub fn at_hwc(&self, k: usize, d: usize) -> f32 {
        let c = k % self.channels;
        let tap = k / self.channels;
        self.at(tap / self.kernel_x, tap % self.kernel_x, c, d)
    }

    /// Weight at reduction index `k` of the `(c, ky, kx)` order
    #[inline]
    pub fn at_chw(&self, k: usize, d: usize) -> f32 {
        let taps = self.kernel_y * self.kernel_x;
        let tap = k % taps;
        self.at(tap / self.kernel_x, tap % self.kernel_x, k / taps, d)
    }
}

/// Offset of the panel holding column `col` (a multiple of `micro_d`),
/// starting at reduction index `k` (even)
#[inline]
pub(crate) fn panel_offset(col: usize, k: usize, buf_k: usize, micro_d: usize) -> usize {
    (col / micro_d) * buf_k * micro_d + k * micro_d
}

/// Pack a `k_len x n` matrix into `micro_d`-wide pair-interleaved panels
///
/// Panel `j` covers columns `j * micro_d ..` and all `buf_k` reduction
/// rows; element `(k, d)` lands at
/// `(k / 2) * 2 * micro_d + 2 * (d % micro_d) + k % 2` inside it. Rows past
/// `k_len` and columns past `n` are zero.
pub(crate) fn pack_panels<F>(k_len: usize, buf_k: usize, n: usize, micro_d: usize, get: F) -> Vec<bf16>
where
    F: Fn(usize, usize) -> f32,
{
    debug_assert!(buf_k % 2 == 0 && buf_k >= k_len);
    let panels = n.div_ceil(micro_d);
    let mut out = vec![bf16::ZERO; panels * buf_k * micro_d];
    for j in 0..panels {
        let panel = &mut out[j * buf_k * micro_d..(j + 1) * buf_k * micro_d];
        let width = micro_d.min(n - j * micro_d);
        for k in 0..k_len {
            let line = &mut panel[(k / 2) * 2 * micro_d..(k / 2 + 1) * 2 * micro_d];
            for d in 0..width {
                line[2 * d + k % 2] = round(get(k, j * micro_d + d));
            }
        }
    }
    out
}

/// Pack a `rows x k_len` matrix row-major with row stride `buf_k`
pub(crate) fn pack_rows<F>(rows: usize, k_len: usize, buf_k: usize, get: F) -> Vec<bf16>
where
    F: Fn(usize, usize) -> f32,
{
    let mut out = vec![bf16::ZERO; rows * buf_k];
    for (r, line) in out.chunks_exact_mut(buf_k.max(1)).enumerate().take(rows) {
        for (k, v) in line[..k_len].iter_mut().enumerate() {
            *v = round(get(r, k));
        }
    }
    out
}
