//! Variant selection
//!
//! Each hardware tier has a fixed candidate order. Selection walks it once,
//! at construction, and takes the first variant that is both legal for the
//! shape and preferable for it; [`VariantKind::Gemm`] is the default when
//! nothing matches.
//!
//! | Tier              | Candidates, in order                                                     |
//! |-------------------|--------------------------------------------------------------------------|
//! | AMX-BF16          | Depthwise, TileGemm, SpecV0, SpecV1, Direct, NhwcGemm, NchwGemm          |
//! | AVX-512/AVX2/NEON | Depthwise, SpecV0, SpecV1, Direct, NhwcGemm, NchwGemm                    |
//! | Scalar            | Depthwise, NhwcGemm, NchwGemm                                            |

use super::alg::{AlgParam, TierConstants};
use super::kernel::tile::TILE_K;
use super::param::ConvParam;
use super::variants::{
    ConvVariant, Gemm, NchwGemm, NhwcDepthwise, NhwcGemm, PaddedConv, PaddedLayout, TileGemm,
    VariantKind,
};
use crate::config::CacheSizes;
use crate::simd::SimdLevel;

const TILE_ORDER: &[VariantKind] = &[
    VariantKind::NhwcDepthwise,
    VariantKind::TileGemm,
    VariantKind::NhwcSpecV0,
    VariantKind::NhwcSpecV1,
    VariantKind::NhwcDirect,
    VariantKind::NhwcGemm,
    VariantKind::NchwGemm,
];

const VECTOR_ORDER: &[VariantKind] = &[
    VariantKind::NhwcDepthwise,
    VariantKind::NhwcSpecV0,
    VariantKind::NhwcSpecV1,
    VariantKind::NhwcDirect,
    VariantKind::NhwcGemm,
    VariantKind::NchwGemm,
];

const SCALAR_ORDER: &[VariantKind] = &[
    VariantKind::NhwcDepthwise,
    VariantKind::NhwcGemm,
    VariantKind::NchwGemm,
];

/// Candidate order of one tier plus its fallback
#[derive(Copy, Clone, Debug)]
pub(crate) struct DecisionTable {
    level: SimdLevel,
    order: &'static [VariantKind],
}

impl DecisionTable {
    /// Table for tier `level`
    pub fn for_level(level: SimdLevel) -> Self {
        let order = match level {
            SimdLevel::AmxBf16 => TILE_ORDER,
            SimdLevel::Avx512 | SimdLevel::Avx2Fma | SimdLevel::Neon => VECTOR_ORDER,
            SimdLevel::Scalar => SCALAR_ORDER,
        };
        Self { level, order }
    }

    /// Candidates in priority order, fallback excluded
    pub fn order(&self) -> &'static [VariantKind] {
        self.order
    }

    /// First legal, preferable candidate, or [`VariantKind::Gemm`]
    pub fn select(&self, p: &ConvParam, cache: &CacheSizes) -> VariantKind {
        let t = TierConstants::for_level(self.level);
        self.order
            .iter()
            .copied()
            .find(|&kind| valid(kind, p, self.level) && preferable(kind, p, &t, cache))
            .unwrap_or(VariantKind::Gemm)
    }
}

/// Whether `kind` can compute `p` at tier `level`
pub(crate) fn valid(kind: VariantKind, p: &ConvParam, level: SimdLevel) -> bool {
    let single = p.group == 1;
    let unit = p.is_stride(1) && p.is_dilation(1);
    match kind {
        VariantKind::Gemm => true,
        VariantKind::NhwcGemm | VariantKind::NhwcDirect => p.trans() && single,
        VariantKind::NchwGemm => !p.trans() && single,
        VariantKind::NhwcSpecV0 | VariantKind::NhwcSpecV1 => p.trans() && single && unit,
        VariantKind::NhwcDepthwise => p.trans() && p.is_depthwise(),
        VariantKind::TileGemm => p.trans() && single && level.has_tile_unit(),
    }
}

/// Whether `kind` is expected to beat the candidates after it
///
/// Only meaningful for shapes where [`valid`] holds.
pub(crate) fn preferable(kind: VariantKind, p: &ConvParam, t: &TierConstants, cache: &CacheSizes) -> bool {
    let k = p.reduction_len();
    match kind {
        VariantKind::Gemm => true,
        VariantKind::NhwcDepthwise => p.trans() && p.is_depthwise(),
        VariantKind::TileGemm => k >= TILE_K && p.dst_c >= 16,
        VariantKind::NhwcSpecV0 => spec_fits(p, t, cache, true) && p.src_c >= t.micro_c / 2,
        VariantKind::NhwcSpecV1 => spec_fits(p, t, cache, false) && p.src_c < t.micro_c / 2,
        VariantKind::NhwcDirect => {
            let a = AlgParam::padded(p, t, cache, true, false);
            !p.is_1x1()
                && p.src_c >= t.micro_c / 2
                && a.buf_k * a.micro_d * 2 <= cache.l2 / 2
                && a.padded_image_bytes() <= cache.l3
        }
        VariantKind::NhwcGemm | VariantKind::NchwGemm => k >= t.micro_k,
    }
}

/// Padded-grid layouts: few wasted gap columns, image in L3, one panel in half of L2
fn spec_fits(p: &ConvParam, t: &TierConstants, cache: &CacheSizes, channel_blocked: bool) -> bool {
    if p.is_1x1() {
        return false;
    }
    let a = AlgParam::padded(p, t, cache, channel_blocked, true);
    (a.src_w - p.dst_w) * 4 <= a.src_w
        && a.padded_image_bytes() <= cache.l3
        && a.buf_k * a.micro_d * 2 <= cache.l2 / 2
}

/// Instantiate `kind` for `p` at tier `level`
pub(crate) fn build(
    kind: VariantKind,
    p: &ConvParam,
    level: SimdLevel,
    cache: &CacheSizes,
) -> Box<dyn ConvVariant> {
    let t = TierConstants::for_level(level);
    match kind {
        VariantKind::Gemm => Box::new(Gemm::new(p)),
        VariantKind::NhwcGemm => Box::new(NhwcGemm::new(p, &t, cache)),
        VariantKind::NchwGemm => Box::new(NchwGemm::new(p, &t, cache)),
        VariantKind::NhwcDirect => Box::new(PaddedConv::new(p, &t, cache, PaddedLayout::Direct)),
        VariantKind::NhwcSpecV0 => Box::new(PaddedConv::new(p, &t, cache, PaddedLayout::SpecV0)),
        VariantKind::NhwcSpecV1 => Box::new(PaddedConv::new(p, &t, cache, PaddedLayout::SpecV1)),
        VariantKind::NhwcDepthwise => Box::new(NhwcDepthwise::new(p, &t)),
        VariantKind::TileGemm => Box::new(TileGemm::new(p, cache)),
    }
}
