//! Convolutions over a zero-padded copy of the source image
//!
//! Packing an image once with its padding materialized removes both the
//! im2row duplication and every bounds check: the kernel reads each tap
//! straight out of the padded image through a segment table, one segment
//! per (channel block, ky, kx).
//!
//! | Layout   | Packed image                         | Rows computed                      |
//! |----------|--------------------------------------|------------------------------------|
//! | `Direct` | `[c / micro_c][y][x][c % micro_c]`   | valid output positions, any stride |
//! | `SpecV0` | same                                 | every padded-grid column, stride 1 |
//! | `SpecV1` | `[y][x][c]` (`c` padded to even)     | every padded-grid column, stride 1 |
//!
//! The grid layouts address output `(dy, dx)` as row `dy * pad_w + dx`, so
//! a row's offset is a single multiply; the `pad_w - dst_w` gap columns per
//! output row are computed and dropped by the store.

use half::bf16;
use smallvec::SmallVec;
use tracing::trace;

use super::driver::{RowPass, run_pass};
use super::{ConvVariant, VariantKind, dispatch_io};
use crate::config::CacheSizes;
use crate::conv::alg::{AlgParam, TierConstants};
use crate::conv::kernel::MicroKernel;
use crate::conv::pack::{WeightView, pack_panels, pad_blocked, pad_interleaved};
use crate::conv::param::ConvParam;
use crate::conv::postprocess::{Postprocess, Term};
use crate::conv::tensor::{
    ImageDims, ImageView, ImageViewMut, Scratch, ScratchLayout, TensorMut, TensorRef,
};
use crate::dtype::Element;
use crate::error::Result;

/// Source layout and row addressing of a [`PaddedConv`]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum PaddedLayout {
    /// Channel-blocked, valid positions only
    Direct,
    /// Channel-blocked grid
    SpecV0,
    /// Channel-interleaved grid
    SpecV1,
}

impl PaddedLayout {
    fn channel_blocked(self) -> bool {
        self != Self::SpecV1
    }

    fn grid(self) -> bool {
        self != Self::Direct
    }
}

#[derive(Debug)]
pub(crate) struct PaddedConv {
    p: ConvParam,
    a: AlgParam,
    layout: PaddedLayout,
    kernel: MicroKernel,
    segments: SmallVec<[usize; 64]>,
    weights: Vec<bf16>,
}

impl PaddedConv {
    pub fn new(p: &ConvParam, t: &TierConstants, cache: &CacheSizes, layout: PaddedLayout) -> Self {
        let a = AlgParam::padded(p, t, cache, layout.channel_blocked(), layout.grid());
        let mc = a.micro_c;
        let plane = a.src_h * a.src_w * mc;
        let mut segments = SmallVec::new();
        for cb in 0..a.src_c / mc {
            for ky in 0..p.kernel_y {
                for kx in 0..p.kernel_x {
                    let tap = (ky * p.dilation_y * a.src_w + kx * p.dilation_x) * mc;
                    segments.push(cb * plane + tap);
                }
            }
        }
        Self {
            p: p.clone(),
            a,
            layout,
            kernel: MicroKernel::new(t, p.compatibility.use_fma()),
            segments,
            weights: Vec::new(),
        }
    }

    /// Packed-image offset of computed row `i`, and its output position if any
    #[inline]
    fn row(&self, i: usize) -> (usize, Option<usize>) {
        let (p, a) = (&self.p, &self.a);
        if self.layout.grid() {
            let (dy, dx) = (i / a.src_w, i % a.src_w);
            let pos = (dx < p.dst_w).then_some(dy * p.dst_w + dx);
            (i * a.micro_c, pos)
        } else {
            let (dy, dx) = (i / p.dst_w, i % p.dst_w);
            let at = (dy * p.stride_y * a.src_w + dx * p.stride_x) * a.micro_c;
            (at, Some(i))
        }
    }

    /// Computed rows per block of `macro_h` output rows
    #[inline]
    fn row_pitch(&self) -> usize {
        if self.layout.grid() { self.a.src_w } else { self.p.dst_w }
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

        let image: &mut [bf16] = scratch.take(a.src_h * a.src_w * a.src_c)?;
        let offsets: &mut [usize] = scratch.take(a.m)?;
        for (i, o) in offsets.iter_mut().enumerate() {
            *o = self.row(i).0;
        }

        let pitch = self.row_pitch();
        for n in 0..p.batch {
            match self.layout {
                PaddedLayout::SpecV1 => pad_interleaved(&src, p, a, n, image),
                _ => pad_blocked(&src, p, a, n, image),
            }
            let out = dst.image_mut(n);
            for dc in (0..p.dst_c).step_by(a.macro_d) {
                let dn = a.macro_d.min(p.dst_c - dc);
                for y0 in (0..p.dst_h).step_by(a.macro_h) {
                    let r0 = y0 * pitch;
                    let r1 = ((y0 + a.macro_h) * pitch).min(a.m);
                    trace!(n, dc, y0, rows = r1 - r0, "padded block");
                    let pass = RowPass {
                        a: &image[..],
                        rows: &offsets[r0..r1],
                        segments: &self.segments,
                        seg_len: a.micro_c,
                        panels: &self.weights,
                        buf_k: a.buf_k,
                        k_off: 0,
                        col: dc,
                        cols: dn,
                        zero: true,
                        term: Term::Last,
                    };
                    run_pass(&self.kernel, &pass, None, &mut |r, c, v: &[f32]| {
                        if let (_, Some(pos)) = self.row(r0 + r) {
                            let at = pos * p.dst_c + dc + c;
                            post.store_channels(v, dc + c, &mut out[at..at + v.len()]);
                        }
                    });
                }
            }
        }
        Ok(())
    }
}

impl ConvVariant for PaddedConv {
    fn kind(&self) -> VariantKind {
        match self.layout {
            PaddedLayout::Direct => VariantKind::NhwcDirect,
            PaddedLayout::SpecV0 => VariantKind::NhwcSpecV0,
            PaddedLayout::SpecV1 => VariantKind::NhwcSpecV1,
        }
    }

    fn alg(&self) -> Option<&AlgParam> {
        Some(&self.a)
    }

    fn scratch(&self) -> ScratchLayout {
        ScratchLayout::new()
            .with::<bf16>(self.a.src_h * self.a.src_w * self.a.src_c)
            .with::<usize>(self.a.m)
    }

    fn set_weights(&mut self, weight: &[f32]) {
        let (p, a) = (&self.p, &self.a);
        let w = WeightView::new(p, weight);
        let mc = a.micro_c;
        let taps = p.kernel_y * p.kernel_x;
        self.weights = pack_panels(a.buf_k, a.buf_k, p.dst_c, a.micro_d, |k, d| {
            let cb = k / (taps * mc);
            let tap = k / mc % taps;
            let c = cb * mc + k % mc;
            if c < p.src_c {
                w.at(tap / p.kernel_x, tap % p.kernel_x, c, d)
            } else {
                0.0
            }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Compatibility;
    use crate::conv::param::ConvDesc;

    #[test]
    fn test_segments_and_rows() {
        let desc = ConvDesc::new(20, 6, 6, 8, 3).with_uniform_pad(1);
        let p = ConvParam::new(1, &desc, Compatibility::default()).unwrap();
        let t = TierConstants::AVX2;
        let v0 = PaddedConv::new(&p, &t, &CacheSizes::DEFAULT, PaddedLayout::SpecV0);
        // two channel blocks of 16, nine taps each
        assert_eq!(v0.segments.len(), 18);
        assert_eq!(v0.segments[1], 16);
        assert_eq!(v0.segments[3], 8 * 16);
        assert_eq!(v0.segments[9], 8 * 8 * 16);
        // row 6 of the grid is a gap column, row 8 is output (1, 0)
        assert_eq!(v0.row(6), (6 * 16, None));
        assert_eq!(v0.row(8), (8 * 16, Some(6)));

        let strided = ConvParam::new(1, &desc.with_stride(2, 2), Compatibility::default()).unwrap();
        let direct = PaddedConv::new(&strided, &t, &CacheSizes::DEFAULT, PaddedLayout::Direct);
        // dst is 3x3; output (1, 2) reads padded (2, 4)
        assert_eq!(direct.row(5), ((2 * 8 + 4) * 16, Some(5)));

        let v1 = PaddedConv::new(&p, &t, &CacheSizes::DEFAULT, PaddedLayout::SpecV1);
        assert_eq!(v1.segments.len(), 9);
        assert_eq!(v1.segments[1], 20);
        assert_eq!(v1.row(9), (9 * 20, Some(7)));
    }
}
