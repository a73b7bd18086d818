//! Source packing
//!
//! Bounds for padded taps are checked in signed arithmetic: a tap is read
//! only when `0 <= y < src_h` and `0 <= x < src_w`.

use std::ops::Range;

use crate::conv::alg::AlgParam;
use crate::conv::param::ConvParam;
use crate::conv::tensor::ImageView;
use crate::dtype::bf16::convert_run;
use crate::dtype::{DType, Element};
use crate::error::{Error, Result};
use half::bf16;

/// Source coordinate of output coordinate `dst` and tap `tap`, if inside
#[inline]
fn src_coord(dst: usize, tap: usize, stride: usize, dilation: usize, pad: usize, extent: usize) -> Option<usize> {
    let s = (dst * stride + tap * dilation) as isize - pad as isize;
    (s >= 0 && (s as usize) < extent).then_some(s as usize)
}

/// Reinterpret a source slice as bf16 when it already is bf16
pub(crate) fn as_bf16<S: Element>(data: &[S]) -> Result<Option<&[bf16]>> {
    if S::DTYPE != DType::BF16 {
        return Ok(None);
    }
    bytemuck::try_cast_slice(data)
        .map(Some)
        .map_err(|e| Error::Internal(format!("bf16 source cast failed: {}", e)))
}

/// NHWC im2row: one row of `buf_k` elements per output position
///
/// Positions `pos` index the whole batch (`n * dst_h * dst_w + y * dst_w + x`);
/// `channels` selects the group's input channels. Row order is
/// `(ky, kx, c)`; elements past the reduction length are zero.
///
/// Panics if `out` cannot hold one row per position.
pub(crate) fn im2row<S: Element>(
    src: &ImageView<'_, S>,
    p: &ConvParam,
    positions: Range<usize>,
    channels: Range<usize>,
    buf_k: usize,
    out: &mut [bf16],
) {
    assert!(
        out.len() >= positions.len() * buf_k,
        "im2row: {} rows of {} need {} elements, got {}",
        positions.len(),
        buf_k,
        positions.len() * buf_k,
        out.len()
    );
    let m = p.dst_h * p.dst_w;
    let cg = channels.len();
    let k_len = p.kernel_y * p.kernel_x * cg;
    for (row, pos) in out.chunks_exact_mut(buf_k).zip(positions) {
        let (n, rem) = (pos / m, pos % m);
        let (dy, dx) = (rem / p.dst_w, rem % p.dst_w);
        let mut k = 0;
        for ky in 0..p.kernel_y {
            let sy = src_coord(dy, ky, p.stride_y, p.dilation_y, p.pad_y, p.src_h);
            for kx in 0..p.kernel_x {
                let dst = &mut row[k..k + cg];
                let sx = src_coord(dx, kx, p.stride_x, p.dilation_x, p.pad_x, p.src_w);
                match (sy, sx) {
                    (Some(sy), Some(sx)) => convert_run(&src.pixel(n, sy, sx)[channels.clone()], dst),
                    _ => dst.fill(bf16::ZERO),
                }
                k += cg;
            }
        }
        row[k_len..].fill(bf16::ZERO);
    }
}

/// NCHW im2col for image `n`: `buf_k` rows in `(c, ky, kx)` order, `m`
/// columns (one per output position)
///
/// Panics if `out` cannot hold every row of `channels`.
pub(crate) fn im2col<S: Element>(
    src: &ImageView<'_, S>,
    p: &ConvParam,
    n: usize,
    channels: Range<usize>,
    out: &mut [bf16],
) {
    let m = p.dst_h * p.dst_w;
    let need = channels.len() * p.kernel_y * p.kernel_x * m;
    assert!(out.len() >= need, "im2col: need {} elements, got {}", need, out.len());
    let mut rows = out.chunks_exact_mut(m.max(1));
    for c in channels {
        for ky in 0..p.kernel_y {
            for kx in 0..p.kernel_x {
                let Some(row) = rows.next() else { return };
                for dy in 0..p.dst_h {
                    let sy = src_coord(dy, ky, p.stride_y, p.dilation_y, p.pad_y, p.src_h);
                    for dx in 0..p.dst_w {
                        let sx = src_coord(dx, kx, p.stride_x, p.dilation_x, p.pad_x, p.src_w);
                        row[dy * p.dst_w + dx] = match (sy, sx) {
                            (Some(sy), Some(sx)) => src.at(n, c, sy, sx).to_bf16(),
                            _ => bf16::ZERO,
                        };
                    }
                }
            }
        }
    }
}

/// NCHW column panels for image `n`
///
/// Covers output positions `positions` (the start a multiple of `micro_d`)
/// with `micro_d`-wide panels of all `buf_k` reduction rows, in the panel
/// layout of [`pack_panels`](super::pack_panels) with the reduction in
/// `(c, ky, kx)` order.
pub(crate) fn pack_column_panels<S: Element>(
    src: &ImageView<'_, S>,
    p: &ConvParam,
    n: usize,
    positions: Range<usize>,
    buf_k: usize,
    micro_d: usize,
    out: &mut [bf16],
) {
    out.fill(bf16::ZERO);
    let base = positions.start;
    let mut k = 0;
    for c in 0..p.src_c {
        for ky in 0..p.kernel_y {
            for kx in 0..p.kernel_x {
                let line = (k / 2) * 2 * micro_d + k % 2;
                for pos in positions.clone() {
                    let (dy, dx) = (pos / p.dst_w, pos % p.dst_w);
                    let sy = src_coord(dy, ky, p.stride_y, p.dilation_y, p.pad_y, p.src_h);
                    let sx = src_coord(dx, kx, p.stride_x, p.dilation_x, p.pad_x, p.src_w);
                    if let (Some(sy), Some(sx)) = (sy, sx) {
                        let j = pos - base;
                        out[(j / micro_d) * buf_k * micro_d + line + 2 * (j % micro_d)] =
                            src.at(n, c, sy, sx).to_bf16();
                    }
                }
                k += 1;
            }
        }
    }
}

/// Zero-padded, channel-blocked image `n`: `[c / micro_c][y][x][c % micro_c]`
/// over the padded extent of `a`
pub(crate) fn pad_blocked<S: Element>(
    src: &ImageView<'_, S>,
    p: &ConvParam,
    a: &AlgParam,
    n: usize,
    out: &mut [bf16],
) {
    out.fill(bf16::ZERO);
    let mc = a.micro_c;
    let plane = a.src_h * a.src_w * mc;
    for y in 0..p.src_h {
        for x in 0..p.src_w {
            let pixel = src.pixel(n, y, x);
            let at = ((y + p.pad_y) * a.src_w + x + p.pad_x) * mc;
            for (cb, chunk) in pixel.chunks(mc).enumerate() {
                let start = cb * plane + at;
                convert_run(chunk, &mut out[start..start + chunk.len()]);
            }
        }
    }
}

/// Zero-padded, channel-interleaved image `n`: `[y][x][c]` with `a.src_c`
/// channels per pixel
pub(crate) fn pad_interleaved<S: Element>(
    src: &ImageView<'_, S>,
    p: &ConvParam,
    a: &AlgParam,
    n: usize,
    out: &mut [bf16],
) {
    out.fill(bf16::ZERO);
    for y in 0..p.src_h {
        for x in 0..p.src_w {
            let at = ((y + p.pad_y) * a.src_w + x + p.pad_x) * a.src_c;
            convert_run(src.pixel(n, y, x), &mut out[at..at + p.src_c]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheSizes, Compatibility};
    use crate::conv::alg::TierConstants;
    use crate::conv::param::{ConvDesc, TensorFormat};
    use crate::conv::tensor::ImageDims;

    fn nhwc_src(p: &ConvParam) -> Vec<f32> {
        (0..p.src_len()).map(|v| v as f32).collect()
    }

    #[test]
    fn test_src_coord_signed_bounds() {
        assert_eq!(src_coord(0, 0, 1, 1, 1, 4), None);
        assert_eq!(src_coord(0, 1, 1, 1, 1, 4), Some(0));
        assert_eq!(src_coord(3, 2, 1, 1, 1, 4), None);
        assert_eq!(src_coord(1, 1, 2, 2, 0, 5), Some(4));
    }

    #[test]
    fn test_im2row_padding() {
        // 2 channels, 3x3 image, 3x3 kernel, pad 1
        let desc = ConvDesc::new(2, 3, 3, 1, 3).with_uniform_pad(1);
        let p = ConvParam::new(1, &desc, Compatibility::default()).unwrap();
        let data = nhwc_src(&p);
        let view = ImageView::new("src", &data, ImageDims::src(&p)).unwrap();
        let mut out = vec![bf16::ONE; 2 * 20];
        im2row(&view, &p, 0..2, 0..2, 20, &mut out);
        // position (0,0): taps with ky = 0 or kx = 0 are padding
        let row0: Vec<f32> = out[..20].iter().map(|v| v.to_f32()).collect();
        assert_eq!(&row0[..8], &[0.0; 8]);
        // tap (1,1) is pixel (0,0)
        assert_eq!(&row0[8..10], &[0.0, 1.0]);
        // tap (1,2) is pixel (0,1)
        assert_eq!(&row0[10..12], &[2.0, 3.0]);
        assert_eq!(&row0[18..], &[0.0, 0.0]);
        // position (0,1): tap (2,2) is pixel (1,2)
        let row1: Vec<f32> = out[20..].iter().map(|v| v.to_f32()).collect();
        assert_eq!(&row1[16..18], &[10.0, 11.0]);
    }

    #[test]
    #[should_panic(expected = "im2row")]
    fn test_im2row_short_buffer() {
        let desc = ConvDesc::new(2, 3, 3, 1, 3).with_uniform_pad(1);
        let p = ConvParam::new(1, &desc, Compatibility::default()).unwrap();
        let data = nhwc_src(&p);
        let view = ImageView::new("src", &data, ImageDims::src(&p)).unwrap();
        let mut out = vec![bf16::ZERO; 2 * 20 - 1];
        im2row(&view, &p, 0..2, 0..2, 20, &mut out);
    }

    #[test]
    #[should_panic(expected = "im2col")]
    fn test_im2col_short_buffer() {
        let desc = ConvDesc::new(2, 4, 5, 3, 3)
            .with_uniform_pad(1)
            .with_format(TensorFormat::Nchw);
        let p = ConvParam::new(1, &desc, Compatibility::default()).unwrap();
        let data: Vec<f32> = (0..p.src_len()).map(|v| v as f32).collect();
        let view = ImageView::new("src", &data, ImageDims::src(&p)).unwrap();
        // two channels of nine taps over 20 positions, one row short
        let mut out = vec![bf16::ZERO; (2 * 9 - 1) * 20];
        im2col(&view, &p, 0, 0..2, &mut out);
    }

    #[test]
    fn test_padded_layouts() {
        let desc = ConvDesc::new(3, 2, 2, 4, 3).with_uniform_pad(1);
        let p = ConvParam::new(1, &desc, Compatibility::default()).unwrap();
        let data = nhwc_src(&p);
        let view = ImageView::new("src", &data, ImageDims::src(&p)).unwrap();

        let t = TierConstants { micro_c: 2, ..TierConstants::SCALAR };
        let a = AlgParam::padded(&p, &t, &CacheSizes::DEFAULT, true, true);
        assert_eq!((a.src_c, a.src_h, a.src_w), (4, 4, 4));
        let mut out = vec![bf16::ONE; a.src_h * a.src_w * a.src_c];
        pad_blocked(&view, &p, &a, 0, &mut out);
        // pixel (0,0) sits at padded (1,1); channel 2 is in block 1
        // block plane = 4 * 4 * 2, padded pixel (1,1) = 5
        let plane = 16 * 2;
        assert_eq!(out[5 * 2].to_f32(), 0.0);
        assert_eq!(out[5 * 2 + 1].to_f32(), 1.0);
        assert_eq!(out[plane + 5 * 2].to_f32(), 2.0);
        assert_eq!(out[plane + 5 * 2 + 1].to_f32(), 0.0);
        assert_eq!(out[0].to_f32(), 0.0);

        let a = AlgParam::padded(&p, &t, &CacheSizes::DEFAULT, false, true);
        assert_eq!(a.src_c, 4);
        let mut out = vec![bf16::ONE; a.src_h * a.src_w * a.src_c];
        pad_interleaved(&view, &p, &a, 0, &mut out);
        // pixel (1,1) = [9, 10, 11] at padded (2,2)
        let at = (2 * 4 + 2) * 4;
        let px: Vec<f32> = out[at..at + 4].iter().map(|v| v.to_f32()).collect();
        assert_eq!(px, [9.0, 10.0, 11.0, 0.0]);
    }

    #[test]
    fn test_column_panels_match_im2col() {
        let desc = ConvDesc::new(2, 4, 5, 3, 3)
            .with_uniform_pad(1)
            .with_format(TensorFormat::Nchw);
        let p = ConvParam::new(1, &desc, Compatibility::default()).unwrap();
        let data: Vec<f32> = (0..p.src_len()).map(|v| (v % 17) as f32).collect();
        let view = ImageView::new("src", &data, ImageDims::src(&p)).unwrap();
        let m = p.dst_h * p.dst_w;
        let k = p.reduction_len();
        let mut cols = vec![bf16::ZERO; k * m];
        im2col(&view, &p, 0, 0..2, &mut cols);

        let (micro_d, buf_k) = (8, 18);
        let mut panels = vec![bf16::ONE; 3 * buf_k * micro_d];
        pack_column_panels(&view, &p, 0, 0..m, buf_k, micro_d, &mut panels);
        for kk in 0..k {
            for pos in 0..m {
                let at = (pos / micro_d) * buf_k * micro_d + (kk / 2) * 2 * micro_d + 2 * (pos % micro_d) + kk % 2;
                assert_eq!(panels[at], cols[kk * m + pos], "k={} pos={}", kk, pos);
            }
        }
    }

    #[test]
    fn test_as_bf16() {
        let f = [1.0f32];
        assert!(as_bf16(&f[..]).unwrap().is_none());
        let b = [bf16::ONE];
        assert_eq!(as_bf16(&b[..]).unwrap(), Some(&b[..]));
    }
}
