//! Weight-row GEMM over NCHW images
//!
//! Output channels are accumulator rows and output positions are columns:
//! the weight matrix `[dst_c][buf_k]` is the broadcast operand and im2col
//! columns of the source are packed into `micro_d`-wide panels, one macro
//! block of positions at a time. Bias and activation index the row.

use half::bf16;

use super::driver::{RowPass, run_pass};
use super::{ConvVariant, VariantKind, dispatch_io};
use crate::config::CacheSizes;
use crate::conv::alg::{AlgParam, TierConstants};
use crate::conv::kernel::MicroKernel;
use crate::conv::pack::{WeightView, pack_column_panels, pack_rows};
use crate::conv::param::ConvParam;
use crate::conv::postprocess::{Postprocess, Term};
use crate::conv::tensor::{
    ImageDims, ImageView, ImageViewMut, Scratch, ScratchLayout, TensorMut, TensorRef,
};
use crate::dtype::Element;
use crate::error::Result;

#[derive(Debug)]
pub(crate) struct NchwGemm {
    p: ConvParam,
    a: AlgParam,
    kernel: MicroKernel,
    weights: Vec<bf16>,
}

impl NchwGemm {
    pub fn new(p: &ConvParam, t: &TierConstants, cache: &CacheSizes) -> Self {
        Self {
            p: p.clone(),
            a: AlgParam::nchw_gemm(p, t, cache),
            kernel: MicroKernel::new(t, p.compatibility.use_fma()),
            weights: Vec::new(),
        }
    }

    fn run<S: Element, D: Element>(
        &self,
        src: &[S],
        scratch: &mut Scratch<'_>,
        dst: &mut [D],
        post: &Postprocess<'_>,
    ) -> Result<()> {
        let (p, a) = (&self.p, &self.a);
        let src = ImageView::new("src", src, ImageDims::src(p))?;
        let mut dst = ImageViewMut::new("dst", dst, ImageDims::dst(p))?;

        let panels: &mut [bf16] = scratch.take(a.macro_h * a.buf_k)?;
        let mut sum: Option<&mut [f32]> = if a.k_passes() > 1 {
            Some(scratch.take(a.macro_d * a.macro_h)?)
        } else {
            None
        };
        let offsets: &mut [usize] = scratch.take(a.macro_d)?;

        for n in 0..p.batch {
            let image = dst.image_mut(n);
            for s0 in (0..a.m).step_by(a.macro_h) {
                let sn = a.macro_h.min(a.m - s0);
                let used = sn.div_ceil(a.micro_d) * a.micro_d * a.buf_k;
                pack_column_panels(&src, p, n, s0..s0 + sn, a.buf_k, a.micro_d, &mut panels[..used]);
                for dc in (0..p.dst_c).step_by(a.macro_d) {
                    let dn = a.macro_d.min(p.dst_c - dc);
                    for (r, o) in offsets[..dn].iter_mut().enumerate() {
                        *o = (dc + r) * a.buf_k;
                    }
                    for mak in (0..a.buf_k).step_by(a.macro_k) {
                        let mk = a.macro_k.min(a.buf_k - mak);
                        let segments = [mak];
                        let pass = RowPass {
                            a: &self.weights,
                            rows: &offsets[..dn],
                            segments: &segments,
                            seg_len: mk,
                            panels: &panels[..used],
                            buf_k: a.buf_k,
                            k_off: mak,
                            col: 0,
                            cols: sn,
                            zero: mak == 0,
                            term: Term::of_pass(mak, mk, a.buf_k),
                        };
                        let acc = sum.as_deref_mut().map(|s| (&mut s[..], a.macro_h));
                        run_pass(&self.kernel, &pass, acc, &mut |r, c, v: &[f32]| {
                            let ch = dc + r;
                            let at = ch * a.m + s0 + c;
                            post.store_positions(v, ch, &mut image[at..at + v.len()]);
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

impl ConvVariant for NchwGemm {
    fn kind(&self) -> VariantKind {
        VariantKind::NchwGemm
    }

    fn alg(&self) -> Option<&AlgParam> {
        Some(&self.a)
    }

    fn scratch(&self) -> ScratchLayout {
        let a = &self.a;
        let sum = if a.k_passes() > 1 { a.macro_d * a.macro_h } else { 0 };
        ScratchLayout::new()
            .with::<bf16>(a.macro_h * a.buf_k)
            .with::<f32>(sum)
            .with::<usize>(a.macro_d)
    }

    fn set_weights(&mut self, weight: &[f32]) {
        let w = WeightView::new(&self.p, weight);
        self.weights = pack_rows(self.p.dst_c, self.a.k, self.a.buf_k, |d, k| w.at_chw(k, d));
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
