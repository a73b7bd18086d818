//! Depthwise convolution (group == src_c == dst_c) over NHWC images
//!
//! No GEMM: every output position sums its kernel window per channel, one
//! `micro_d`-wide channel run at a time, through the tier's channel-sum
//! kernel. An f32 source is rounded to a bf16 copy of the image first; a
//! bf16 source is read in place. Output positions whose window lies fully
//! inside the image reuse one precomputed tap table; border positions build
//! the list of their in-bounds taps.

use std::ops::Range;

use half::bf16;
use smallvec::SmallVec;

use super::{ConvVariant, VariantKind, dispatch_io};
use crate::conv::alg::{AlgParam, MAX_MICRO_D, TierConstants};
use crate::conv::kernel::{ChannelArgs, MicroKernel};
use crate::conv::pack::as_bf16;
use crate::conv::param::ConvParam;
use crate::conv::postprocess::Postprocess;
use crate::conv::tensor::{
    ImageDims, ImageView, ImageViewMut, Scratch, ScratchLayout, TensorMut, TensorRef,
};
use crate::dtype::bf16::{convert_run, quantize};
use crate::dtype::{DType, Element};
use crate::error::Result;

/// Output coordinates whose whole window is inside `[0, src)`
fn interior(dst: usize, src: usize, kernel: usize, stride: usize, dilation: usize, pad: usize) -> Range<usize> {
    let beg = pad.div_ceil(stride).min(dst);
    let span = (kernel - 1) * dilation;
    // last d with d * stride - pad + span < src
    let end = if src + pad > span {
        ((src + pad - span - 1) / stride + 1).min(dst)
    } else {
        0
    };
    beg..end.max(beg)
}

type Taps = SmallVec<[(usize, usize); 25]>;

#[derive(Debug)]
pub(crate) struct NhwcDepthwise {
    p: ConvParam,
    kernel: MicroKernel,
    chunk: usize,
    rows: Range<usize>,
    cols: Range<usize>,
    /// Offsets of every tap from the window origin
    window: Taps,
    /// `[ky][kx][c]`, rounded through bf16
    weights: Vec<f32>,
}

impl NhwcDepthwise {
    pub fn new(p: &ConvParam, t: &TierConstants) -> Self {
        let c = p.src_c;
        let mut window = Taps::new();
        for ky in 0..p.kernel_y {
            for kx in 0..p.kernel_x {
                let src = (ky * p.dilation_y * p.src_w + kx * p.dilation_x) * c;
                window.push((src, (ky * p.kernel_x + kx) * c));
            }
        }
        Self {
            p: p.clone(),
            kernel: MicroKernel::new(t, p.compatibility.use_fma()),
            chunk: t.micro_d.min(MAX_MICRO_D),
            rows: interior(p.dst_h, p.src_h, p.kernel_y, p.stride_y, p.dilation_y, p.pad_y),
            cols: interior(p.dst_w, p.src_w, p.kernel_x, p.stride_x, p.dilation_x, p.pad_x),
            window,
            weights: Vec::new(),
        }
    }

    fn image_len(&self) -> usize {
        self.p.src_h * self.p.src_w * self.p.src_c
    }

    /// In-bounds taps of output `(dy, dx)` as absolute pixel offsets
    fn edge_taps(&self, dy: usize, dx: usize, taps: &mut Taps) {
        let p = &self.p;
        taps.clear();
        let y0 = (dy * p.stride_y) as isize - p.pad_y as isize;
        let x0 = (dx * p.stride_x) as isize - p.pad_x as isize;
        for ky in 0..p.kernel_y {
            let y = y0 + (ky * p.dilation_y) as isize;
            if y < 0 || y >= p.src_h as isize {
                continue;
            }
            for kx in 0..p.kernel_x {
                let x = x0 + (kx * p.dilation_x) as isize;
                if x < 0 || x >= p.src_w as isize {
                    continue;
                }
                let src = (y as usize * p.src_w + x as usize) * p.src_c;
                taps.push((src, (ky * p.kernel_x + kx) * p.src_c));
            }
        }
    }

    fn run<S: Element, D: Element>(
        &self,
        src: &[S],
        scratch: &mut Scratch<'_>,
        dst: &mut [D],
        post: &Postprocess<'_>,
    ) -> Result<()> {
        let p = &self.p;
        let src = ImageView::new("src", src, ImageDims::src(p))?;
        let mut dst = ImageViewMut::new("dst", dst, ImageDims::dst(p))?;
        let (c, len) = (p.dst_c, self.image_len());
        let direct = as_bf16(src.data())?;
        let rounded: &mut [bf16] = match direct {
            Some(_) => &mut [],
            None => scratch.take(len)?,
        };
        let mut edge = Taps::new();

        for n in 0..p.batch {
            let img: &[bf16] = match direct {
                Some(s) => &s[n * len..(n + 1) * len],
                None => {
                    convert_run(src.image(n), &mut *rounded);
                    &*rounded
                }
            };
            let out = dst.image_mut(n);
            for dy in 0..p.dst_h {
                let row_inside = self.rows.contains(&dy);
                for dx in 0..p.dst_w {
                    let (taps, origin) = if row_inside && self.cols.contains(&dx) {
                        let y0 = dy * p.stride_y - p.pad_y;
                        let x0 = dx * p.stride_x - p.pad_x;
                        (&self.window[..], (y0 * p.src_w + x0) * c)
                    } else {
                        self.edge_taps(dy, dx, &mut edge);
                        (&edge[..], 0)
                    };
                    let o = (dy * p.dst_w + dx) * c;
                    for c0 in (0..c).step_by(self.chunk) {
                        let cn = self.chunk.min(c - c0);
                        let mut acc = [0.0f32; MAX_MICRO_D];
                        let args = ChannelArgs {
                            src: img,
                            weights: &self.weights,
                            taps,
                            src_base: origin + c0,
                            w_base: c0,
                            len: cn,
                        };
                        self.kernel.channels(&args, &mut acc[..cn]);
                        post.store_channels(&acc[..cn], c0, &mut out[o + c0..o + c0 + cn]);
                    }
                }
            }
        }
        Ok(())
    }
}

impl ConvVariant for NhwcDepthwise {
    fn kind(&self) -> VariantKind {
        VariantKind::NhwcDepthwise
    }

    fn alg(&self) -> Option<&AlgParam> {
        None
    }

    fn scratch(&self) -> ScratchLayout {
        match self.p.src_type {
            DType::BF16 => ScratchLayout::new(),
            _ => ScratchLayout::new().with::<bf16>(self.image_len()),
        }
    }

    fn set_weights(&mut self, weight: &[f32]) {
        // NHWC depthwise weights are already [ky][kx][c]
        let len = self.p.weight_len();
        self.weights = weight[..len].iter().map(|&w| quantize(w)).collect();
    }

    fn forward(
        &self,
        src: TensorRef<'_>,
        scratch: &mut Scratch<'_>,
        dst: TensorMut<'_>,
        post: &Postprocess<'_>,
    ) -> Result<()> {
        dispatch_io!(src, dst, |s, d| self.run(s, scratch, d, post))
    }
}
