//! NHWC GEMM on the matrix tile unit
//!
//! Same row packing and macro blocking as the vector NHWC GEMM, with the
//! reduction padded to whole 32-element tiles. Each 32x32 output block is
//! held in the unit's 2x2 accumulator tiles while the reduction pass streams
//! 16-row source tiles and 16-column weight tiles through it.

use half::bf16;
use tracing::trace;

use super::{ConvVariant, VariantKind, dispatch_io};
use crate::config::CacheSizes;
use crate::conv::alg::{AlgParam, TierConstants};
use crate::conv::kernel::tile::{TILE_COLS, TILE_K, TILE_ROWS, TileUnit};
use crate::conv::pack::{WeightView, im2row, pack_panels, panel_offset};
use crate::conv::param::ConvParam;
use crate::conv::postprocess::{Postprocess, Term};
use crate::conv::tensor::{
    ImageDims, ImageView, ImageViewMut, Scratch, ScratchLayout, TensorMut, TensorRef,
};
use crate::dtype::Element;
use crate::error::Result;

const BLOCK_M: usize = 2 * TILE_ROWS;
const BLOCK_D: usize = 2 * TILE_COLS;

#[derive(Debug)]
pub(crate) struct TileGemm {
    p: ConvParam,
    a: AlgParam,
    weights: Vec<bf16>,
}

impl TileGemm {
    pub fn new(p: &ConvParam, cache: &CacheSizes) -> Self {
        Self {
            p: p.clone(),
            a: AlgParam::nhwc_gemm(p, &TierConstants::TILE, cache),
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
        let dst = dst.data_mut();

        let packed: &mut [bf16] = scratch.take(a.buf_m * a.buf_k)?;
        let sum: &mut [f32] = scratch.take(if a.k_passes() > 1 { a.buf_m * a.macro_d } else { 0 })?;
        let mut unit = TileUnit::new();
        let mut line = [0.0f32; BLOCK_D];

        let rows_per_batch = a.batch * p.dst_h;
        for b0 in (0..p.batch).step_by(a.batch) {
            let first = b0 * a.m;
            for dc in (0..p.dst_c).step_by(a.macro_d) {
                let dn = a.macro_d.min(p.dst_c - dc);
                for mak in (0..a.buf_k).step_by(a.macro_k) {
                    let mk = a.macro_k.min(a.buf_k - mak);
                    let term = Term::of_pass(mak, mk, a.buf_k);
                    for y0 in (0..rows_per_batch).step_by(a.macro_h) {
                        let y1 = (y0 + a.macro_h).min(rows_per_batch);
                        let (p0, p1) = (y0 * p.dst_w, y1 * p.dst_w);
                        if dc == 0 && mak == 0 {
                            im2row(
                                &src,
                                p,
                                first + p0..first + p1,
                                0..p.src_c,
                                a.buf_k,
                                &mut packed[p0 * a.buf_k..p1 * a.buf_k],
                            );
                        }
                        trace!(dc, mak, y0, "tile gemm block");
                        for pr in (p0..p1).step_by(BLOCK_M) {
                            let rows = BLOCK_M.min(p1 - pr);
                            for jc in (0..dn).step_by(BLOCK_D) {
                                let cols = BLOCK_D.min(dn - jc);
                                if mak == 0 {
                                    unit.zero();
                                } else {
                                    unit.load(&sum[pr * a.macro_d + jc..], a.macro_d, rows, cols);
                                }
                                for kc in (mak..mak + mk).step_by(TILE_K) {
                                    for ti in 0..2 {
                                        let r = ti * TILE_ROWS;
                                        if r >= rows {
                                            break;
                                        }
                                        let a_tile = &packed[(pr + r) * a.buf_k + kc..];
                                        let a_rows = TILE_ROWS.min(rows - r);
                                        for tj in 0..2 {
                                            let c = tj * TILE_COLS;
                                            if c >= cols {
                                                break;
                                            }
                                            let at = panel_offset(dc + jc + c, kc, a.buf_k, TILE_COLS);
                                            unit.dpbf16ps(ti, tj, a_tile, a.buf_k, a_rows, &self.weights[at..]);
                                        }
                                    }
                                }
                                match term {
                                    Term::Interim => {
                                        unit.store(&mut sum[pr * a.macro_d + jc..], a.macro_d, rows, cols)
                                    }
                                    Term::Last => {
                                        for r in 0..rows {
                                            unit.row(r, &mut line[..cols]);
                                            let ch = dc + jc;
                                            let at = (first + pr + r) * p.dst_c + ch;
                                            post.store_channels(&line[..cols], ch, &mut dst[at..at + cols]);
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

impl ConvVariant for TileGemm {
    fn kind(&self) -> VariantKind {
        VariantKind::TileGemm
    }

    fn alg(&self) -> Option<&AlgParam> {
        Some(&self.a)
    }

    fn scratch(&self) -> ScratchLayout {
        let a = &self.a;
        let sum = if a.k_passes() > 1 { a.buf_m * a.macro_d } else { 0 };
        ScratchLayout::new().with::<bf16>(a.buf_m * a.buf_k).with::<f32>(sum)
    }

    fn set_weights(&mut self, weight: &[f32]) {
        let w = WeightView::new(&self.p, weight);
        self.weights = pack_panels(self.a.k, self.a.buf_k, self.p.dst_c, TILE_COLS, |k, d| w.at_hwc(k, d));
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
    use crate::conv::activation::Activation;
    use crate::conv::param::ConvDesc;
    use crate::conv::variants::Gemm;

    fn forward(v: &dyn ConvVariant, src: &[f32], dst_len: usize, bias: &[f32]) -> Vec<f32> {
        let mut buf = vec![0u8; v.scratch().size()];
        let mut scratch = Scratch::new(&mut buf);
        let act = Activation::Identity;
        let mut dst = vec![0.0f32; dst_len];
        v.forward(
            TensorRef::F32(src),
            &mut scratch,
            TensorMut::F32(&mut dst),
            &Postprocess::new(bias, &act),
        )
        .unwrap();
        dst
    }

    #[test]
    fn test_two_passes_match_fallback() {
        let desc = ConvDesc::new(64, 6, 5, 40, 3).with_uniform_pad(1);
        let p = ConvParam::new(2, &desc, Compatibility::default()).unwrap();
        let mut tile = TileGemm::new(&p, &CacheSizes::DEFAULT);
        assert_eq!(tile.a.k_passes(), 2);

        let weight: Vec<f32> = (0..p.weight_len()).map(|i| ((i * 7) % 13) as f32 / 8.0 - 0.75).collect();
        let src: Vec<f32> = (0..p.src_len()).map(|i| ((i * 5) % 11) as f32 / 4.0 - 1.25).collect();
        let bias: Vec<f32> = (0..p.dst_c).map(|d| d as f32 * 0.5).collect();
        tile.set_weights(&weight);
        let mut gemm = Gemm::new(&p);
        gemm.set_weights(&weight);

        let got = forward(&tile, &src, p.dst_len(), &bias);
        let want = forward(&gemm, &src, p.dst_len(), &bias);
        for (i, (x, y)) in got.iter().zip(&want).enumerate() {
            assert!((x - y).abs() <= 1e-3 * (1.0 + y.abs()), "element {}: {} vs {}", i, x, y);
        }
    }
}
