//! Generic GEMM fallback
//!
//! Valid for every shape the descriptor accepts, including grouped
//! convolutions in either layout. Each group is unrolled (im2row for NHWC,
//! im2col for NCHW) and multiplied against its slice of the weight matrix
//! with plain f32 dot products, one rounding per step.

use half::bf16;

use super::{ConvVariant, VariantKind, dispatch_io};
use crate::conv::alg::AlgParam;
use crate::conv::pack::{WeightView, im2col, im2row};
use crate::conv::param::ConvParam;
use crate::conv::postprocess::Postprocess;
use crate::conv::tensor::{
    ImageDims, ImageView, ImageViewMut, Scratch, ScratchLayout, TensorMut, TensorRef,
};
use crate::dtype::Element;
use crate::dtype::bf16::quantize;
use crate::error::Result;

#[derive(Debug)]
pub(crate) struct Gemm {
    p: ConvParam,
    /// Reduction length of one group
    k: usize,
    /// `[dst_c][k]`, reduction in the layout's unroll order, rounded through bf16
    weights: Vec<f32>,
}

#[inline]
fn dot(a: &[bf16], w: &[f32]) -> f32 {
    a.iter().zip(w).fold(0.0f32, |s, (&a, &w)| s + a.to_f32() * w)
}

impl Gemm {
    pub fn new(p: &ConvParam) -> Self {
        Self {
            p: p.clone(),
            k: p.reduction_len(),
            weights: Vec::new(),
        }
    }

    fn run_nhwc<S: Element, D: Element>(
        &self,
        src: &ImageView<'_, S>,
        buf: &mut [bf16],
        acc: &mut [f32],
        dst: &mut [D],
        post: &Postprocess<'_>,
    ) {
        let p = &self.p;
        let (m, k) = (p.dst_h * p.dst_w, self.k);
        let (cg, dg) = (p.src_c / p.group, p.dst_c / p.group);
        for n in 0..p.batch {
            for g in 0..p.group {
                im2row(src, p, n * m..(n + 1) * m, g * cg..(g + 1) * cg, k, &mut buf[..m * k]);
                for (pos, row) in buf[..m * k].chunks_exact(k).enumerate() {
                    for (d, v) in acc[..dg].iter_mut().enumerate() {
                        let ch = g * dg + d;
                        *v = dot(row, &self.weights[ch * k..(ch + 1) * k]);
                    }
                    let at = (n * m + pos) * p.dst_c + g * dg;
                    post.store_channels(&acc[..dg], g * dg, &mut dst[at..at + dg]);
                }
            }
        }
    }

    fn run_nchw<S: Element, D: Element>(
        &self,
        src: &ImageView<'_, S>,
        buf: &mut [bf16],
        acc: &mut [f32],
        dst: &mut ImageViewMut<'_, D>,
        post: &Postprocess<'_>,
    ) {
        let p = &self.p;
        let (m, k) = (p.dst_h * p.dst_w, self.k);
        let (cg, dg) = (p.src_c / p.group, p.dst_c / p.group);
        for n in 0..p.batch {
            let image = dst.image_mut(n);
            for g in 0..p.group {
                im2col(src, p, n, g * cg..(g + 1) * cg, &mut buf[..k * m]);
                for d in 0..dg {
                    let ch = g * dg + d;
                    let sum = &mut acc[..m];
                    sum.fill(0.0);
                    let w = &self.weights[ch * k..(ch + 1) * k];
                    for (row, &w) in buf[..k * m].chunks_exact(m).zip(w) {
                        for (s, &a) in sum.iter_mut().zip(row) {
                            *s = *s + a.to_f32() * w;
                        }
                    }
                    post.store_positions(sum, ch, &mut image[ch * m..(ch + 1) * m]);
                }
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
        let m = p.dst_h * p.dst_w;
        let buf: &mut [bf16] = scratch.take(m * self.k)?;
        let acc: &mut [f32] = scratch.take((p.dst_c / p.group).max(m))?;

        if p.trans() {
            self.run_nhwc(&src, buf, acc, dst.data_mut(), post);
        } else {
            self.run_nchw(&src, buf, acc, &mut dst, post);
        }
        Ok(())
    }
}

impl ConvVariant for Gemm {
    fn kind(&self) -> VariantKind {
        VariantKind::Gemm
    }

    fn alg(&self) -> Option<&AlgParam> {
        None
    }

    fn scratch(&self) -> ScratchLayout {
        let p = &self.p;
        let m = p.dst_h * p.dst_w;
        ScratchLayout::new()
            .with::<bf16>(m * self.k)
            .with::<f32>((p.dst_c / p.group).max(m))
    }

    fn set_weights(&mut self, weight: &[f32]) {
        let p = &self.p;
        let w = WeightView::new(p, weight);
        let k = self.k;
        let trans = p.trans();
        let mut weights = vec![0.0f32; p.dst_c * k];
        for (d, row) in weights.chunks_exact_mut(k).enumerate() {
            for (i, v) in row.iter_mut().enumerate() {
                let raw = if trans { w.at_hwc(i, d) } else { w.at_chw(i, d) };
                *v = quantize(raw);
            }
        }
        self.weights = weights;
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
