//! Row-packed GEMM over NHWC images
//!
//! The source is unrolled into one `buf_k`-long row per output position
//! (im2row), packed lazily one macro block of output rows at a time; weights
//! are `micro_d`-wide pair panels. Loop nest:
//!
//! ```text
//! for mini-batch                      (images whose packed rows fit L2)
//!   for dc in output channels / macro_d
//!     for mak in reduction / macro_k  (zero on the first pass, finish on the last)
//!       for y in output rows / macro_h
//!         pack rows (first dc, first mak only)
//!         micro-kernels over micro_d columns x micro_m rows
//! ```

use half::bf16;
use tracing::trace;

use super::driver::{RowPass, run_pass};
use super::{ConvVariant, VariantKind, dispatch_io};
use crate::config::CacheSizes;
use crate::conv::alg::{AlgParam, TierConstants};
use crate::conv::kernel::MicroKernel;
use crate::conv::pack::{WeightView, as_bf16, im2row, pack_panels};
use crate::conv::param::ConvParam;
use crate::conv::postprocess::{Postprocess, Term};
use crate::conv::tensor::{
    ImageDims, ImageView, ImageViewMut, Scratch, ScratchLayout, TensorMut, TensorRef,
};
use crate::dtype::{DType, Element};
use crate::error::Result;

#[derive(Debug)]
pub(crate) struct NhwcGemm {
    p: ConvParam,
    a: AlgParam,
    kernel: MicroKernel,
    weights: Vec<bf16>,
    direct_src: bool,
}

impl NhwcGemm {
    pub fn new(p: &ConvParam, t: &TierConstants, cache: &CacheSizes) -> Self {
        let a = AlgParam::nhwc_gemm(p, t, cache);
        let direct_src = p.is_1x1()
            && p.src_type == DType::BF16
            && p.src_c % 2 == 0
            && a.k_passes() == 1;
        Self {
            p: p.clone(),
            a,
            kernel: MicroKernel::new(t, p.compatibility.use_fma()),
            weights: Vec::new(),
            direct_src,
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
        let dst = dst.data_mut();

        let direct = if self.direct_src { as_bf16(src.data())? } else { None };
        let packed: &mut [bf16] = match direct {
            Some(_) => &mut [],
            None => scratch.take(a.buf_m * a.buf_k)?,
        };
        let mut sum: Option<&mut [f32]> = if a.k_passes() > 1 {
            Some(scratch.take(a.buf_m * a.macro_d)?)
        } else {
            None
        };
        let offsets: &mut [usize] = scratch.take(a.buf_m)?;

        let rows_per_batch = a.batch * p.dst_h;
        for b0 in (0..p.batch).step_by(a.batch) {
            let first = b0 * a.m;
            trace!(images = b0, count = a.batch, "nhwc gemm mini-batch");
            for dc in (0..p.dst_c).step_by(a.macro_d) {
                let dn = a.macro_d.min(p.dst_c - dc);
                for mak in (0..a.buf_k).step_by(a.macro_k) {
                    let mk = a.macro_k.min(a.buf_k - mak);
                    let term = Term::of_pass(mak, mk, a.buf_k);
                    for y0 in (0..rows_per_batch).step_by(a.macro_h) {
                        let y1 = (y0 + a.macro_h).min(rows_per_batch);
                        let (p0, p1) = (y0 * p.dst_w, y1 * p.dst_w);
                        if direct.is_none() && dc == 0 && mak == 0 {
                            im2row(
                                &src,
                                p,
                                first + p0..first + p1,
                                0..p.src_c,
                                a.buf_k,
                                &mut packed[p0 * a.buf_k..p1 * a.buf_k],
                            );
                        }
                        let (a_buf, stride) = match direct {
                            Some(s) => (&s[first * p.src_c..(first + a.buf_m) * p.src_c], p.src_c),
                            None => (&packed[..], a.buf_k),
                        };
                        for (i, o) in offsets[p0..p1].iter_mut().enumerate() {
                            *o = (p0 + i) * stride;
                        }
                        let segments = [mak];
                        let pass = RowPass {
                            a: a_buf,
                            rows: &offsets[p0..p1],
                            segments: &segments,
                            seg_len: mk,
                            panels: &self.weights,
                            buf_k: a.buf_k,
                            k_off: mak,
                            col: dc,
                            cols: dn,
                            zero: mak == 0,
                            term,
                        };
                        let acc = sum
                            .as_deref_mut()
                            .map(|s| (&mut s[p0 * a.macro_d..p1 * a.macro_d], a.macro_d));
                        run_pass(&self.kernel, &pass, acc, &mut |r, c, v: &[f32]| {
                            let at = (first + p0 + r) * p.dst_c + dc + c;
                            post.store_channels(v, dc + c, &mut dst[at..at + v.len()]);
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

impl ConvVariant for NhwcGemm {
    fn kind(&self) -> VariantKind {
        VariantKind::NhwcGemm
    }

    fn alg(&self) -> Option<&AlgParam> {
        Some(&self.a)
    }

    fn scratch(&self) -> ScratchLayout {
        let a = &self.a;
        let packed = if self.direct_src { 0 } else { a.buf_m * a.buf_k };
        let sum = if a.k_passes() > 1 { a.buf_m * a.macro_d } else { 0 };
        ScratchLayout::new()
            .with::<bf16>(packed)
            .with::<f32>(sum)
            .with::<usize>(a.buf_m)
    }

    fn set_weights(&mut self, weight: &[f32]) {
        let w = WeightView::new(&self.p, weight);
        self.weights = pack_panels(self.a.k, self.a.buf_k, self.p.dst_c, self.a.micro_d, |k, d| {
            w.at_hwc(k, d)
        });
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
