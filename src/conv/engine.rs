//! bf16 convolution instance
//!
//! [`Convolution16b`] is built once per layer. Construction validates the
//! descriptor and selects a variant for the capability context; weights are
//! packed once by [`set_params`](Convolution16b::set_params); every
//! [`forward`](Convolution16b::forward) after that is a pure function of the
//! source and the packed weights.
//!
//! ```
//! use bf16conv::prelude::*;
//!
//! let desc = ConvDesc::new(4, 6, 6, 8, 3).with_uniform_pad(1);
//! let mut conv = Convolution16b::new(1, &desc, Compatibility::default(), &CpuCaps::detect())?;
//! conv.set_params(&vec![0.5; conv.param().weight_len()], None, None)?;
//!
//! let src = vec![1.0f32; conv.param().src_len()];
//! let mut dst = vec![0.0f32; conv.param().dst_len()];
//! conv.forward((&src).into(), None, (&mut dst).into())?;
//! // the center pixel sees all nine taps of all four channels
//! assert_eq!(dst[(3 * 6 + 3) * 8], 18.0);
//! # Ok::<(), bf16conv::Error>(())
//! ```

use tracing::{debug, debug_span};

use super::activation::Activation;
use super::alg::AlgParam;
use super::pack::mode_name;
use super::param::{ConvDesc, ConvParam};
use super::postprocess::Postprocess;
use super::selector::{DecisionTable, build, valid};
use super::tensor::{Scratch, TensorMut, TensorRef};
use super::variants::{ConvVariant, VariantKind};
use crate::config::{Compatibility, EngineConfig};
use crate::error::{Error, Result};
use crate::simd::{CpuCaps, SimdLevel};

#[derive(Debug)]
struct Bound {
    bias: Vec<f32>,
    activation: Activation,
}

/// One bf16 convolution layer
#[derive(Debug)]
pub struct Convolution16b {
    param: ConvParam,
    level: SimdLevel,
    info: String,
    variant: Box<dyn ConvVariant>,
    bound: Option<Bound>,
}

impl Convolution16b {
    /// Validate `desc` for `batch` images and select the best variant for `caps`
    ///
    /// Cache estimates come from [`EngineConfig::default`].
    pub fn new(batch: usize, desc: &ConvDesc, compatibility: Compatibility, caps: &CpuCaps) -> Result<Self> {
        Self::with_config(batch, desc, compatibility, caps, &EngineConfig::default())
    }

    /// Like [`new`](Self::new) with explicit cache estimates and tier cap
    pub fn with_config(
        batch: usize,
        desc: &ConvDesc,
        compatibility: Compatibility,
        caps: &CpuCaps,
        config: &EngineConfig,
    ) -> Result<Self> {
        let param = ConvParam::new(batch, desc, compatibility)?;
        let caps = config.apply(*caps);
        let kind = DecisionTable::for_level(caps.level()).select(&param, &config.cache);
        Self::build(param, caps.level(), kind, config)
    }

    /// Force variant `kind`, failing when it cannot compute `desc` at the
    /// tier of `caps`
    ///
    /// Cache estimates come from [`EngineConfig::default`]; use
    /// [`with_variant_config`](Self::with_variant_config) to apply
    /// environment overrides.
    pub fn with_variant(
        batch: usize,
        desc: &ConvDesc,
        compatibility: Compatibility,
        caps: &CpuCaps,
        kind: VariantKind,
    ) -> Result<Self> {
        Self::with_variant_config(batch, desc, compatibility, caps, &EngineConfig::default(), kind)
    }

    /// Like [`with_variant`](Self::with_variant) with explicit cache
    /// estimates and tier cap
    pub fn with_variant_config(
        batch: usize,
        desc: &ConvDesc,
        compatibility: Compatibility,
        caps: &CpuCaps,
        config: &EngineConfig,
        kind: VariantKind,
    ) -> Result<Self> {
        let param = ConvParam::new(batch, desc, compatibility)?;
        let caps = config.apply(*caps);
        if !valid(kind, &param, caps.level()) {
            return Err(Error::unsupported_shape(format!(
                "{} cannot run {} at {}",
                kind,
                param,
                caps.level()
            )));
        }
        Self::build(param, caps.level(), kind, config)
    }

    fn build(param: ConvParam, level: SimdLevel, kind: VariantKind, config: &EngineConfig) -> Result<Self> {
        config.cache.validate()?;
        let variant = build(kind, &param, level, &config.cache);
        let info = format!("{}::{}", level, kind);
        debug!(
            variant = %info,
            shape = ?param.shape_class(),
            param = %param,
            alg = ?variant.alg(),
            packing = mode_name(param.src_type),
            scratch = variant.scratch().size(),
            "convolution variant selected"
        );
        Ok(Self {
            param,
            level,
            info,
            variant,
            bound: None,
        })
    }

    /// Validated parameters
    #[inline]
    pub fn param(&self) -> &ConvParam {
        &self.param
    }

    /// `"<tier>::<variant>"`, e.g. `"Avx2::NhwcSpecV0"`
    #[inline]
    pub fn info(&self) -> &str {
        &self.info
    }

    /// Selected algorithm family
    #[inline]
    pub fn variant(&self) -> VariantKind {
        self.variant.kind()
    }

    /// Tier the kernels were selected for
    #[inline]
    pub fn level(&self) -> SimdLevel {
        self.level
    }

    /// Tiling parameters of the blocked variants
    #[inline]
    pub fn alg(&self) -> Option<&AlgParam> {
        self.variant.alg()
    }

    /// Bytes of scratch one [`forward`](Self::forward) needs, alignment slack included
    #[inline]
    pub fn external_buffer_size(&self) -> usize {
        self.variant.scratch().size()
    }

    /// Pack weights and bind bias and activation parameters
    ///
    /// `weight` is in the layout of the descriptor's [`TensorFormat`](super::TensorFormat).
    /// `bias` defaults to zeros; `params` are the activation's parameters
    /// (see [`Activation::resolve`]). May be called once.
    pub fn set_params(&mut self, weight: &[f32], bias: Option<&[f32]>, params: Option<&[f32]>) -> Result<()> {
        if self.bound.is_some() {
            return Err(Error::ParamsAlreadySet);
        }
        let p = &self.param;
        if weight.len() < p.weight_len() {
            return Err(Error::invalid_argument(
                "weight",
                format!("expected {} values, got {}", p.weight_len(), weight.len()),
            ));
        }
        let bias = match bias {
            Some(b) if b.len() < p.dst_c => {
                return Err(Error::invalid_argument(
                    "bias",
                    format!("expected {} values, got {}", p.dst_c, b.len()),
                ));
            }
            Some(b) => b[..p.dst_c].to_vec(),
            None => vec![0.0; p.dst_c],
        };
        let activation = Activation::resolve(p.activation, params, p.dst_c)?;
        self.variant.set_weights(&weight[..p.weight_len()]);
        self.bound = Some(Bound { bias, activation });
        Ok(())
    }

    /// Run the convolution over the whole batch
    ///
    /// `scratch` must hold at least [`external_buffer_size`](Self::external_buffer_size)
    /// bytes; `None` allocates internally.
    pub fn forward(&self, src: TensorRef<'_>, scratch: Option<&mut [u8]>, dst: TensorMut<'_>) -> Result<()> {
        let bound = self.bound.as_ref().ok_or(Error::ParamsNotSet)?;
        let p = &self.param;
        if src.dtype() != p.src_type {
            return Err(Error::unsupported_dtype(src.dtype(), "forward src"));
        }
        if dst.dtype() != p.dst_type {
            return Err(Error::unsupported_dtype(dst.dtype(), "forward dst"));
        }
        if src.len() < p.src_len() {
            return Err(Error::shape_mismatch("src", p.src_len(), src.len()));
        }
        if dst.len() < p.dst_len() {
            return Err(Error::shape_mismatch("dst", p.dst_len(), dst.len()));
        }
        if p.is_empty() {
            return Ok(());
        }

        let _span = debug_span!("forward", variant = %self.info).entered();
        let needed = self.external_buffer_size();
        let mut owned = Vec::new();
        let buf: &mut [u8] = match scratch {
            Some(buf) if buf.len() < needed => {
                return Err(Error::BufferTooSmall {
                    needed,
                    got: buf.len(),
                });
            }
            Some(buf) => buf,
            None => {
                owned.resize(needed, 0u8);
                &mut owned
            }
        };
        let mut scratch = Scratch::new(buf);
        let post = Postprocess::new(&bound.bias, &bound.activation);
        self.variant.forward(src, &mut scratch, dst, &post)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conv::activation::ActivationKind;
    use half::bf16;

    fn conv(desc: &ConvDesc) -> Convolution16b {
        Convolution16b::new(1, desc, Compatibility::default(), &CpuCaps::scalar()).unwrap()
    }

    #[test]
    fn test_lifecycle_errors() {
        let desc = ConvDesc::new(2, 4, 4, 3, 3).with_uniform_pad(1);
        let mut c = conv(&desc);
        let src = vec![1.0f32; c.param().src_len()];
        let mut dst = vec![0.0f32; c.param().dst_len()];

        let r = c.forward((&src).into(), None, (&mut dst).into());
        assert!(matches!(r, Err(Error::ParamsNotSet)));

        let w = vec![1.0f32; c.param().weight_len()];
        assert!(c.set_params(&w[..3], None, None).is_err());
        assert!(c.set_params(&w, Some(&[0.0; 2][..]), None).is_err());
        c.set_params(&w, None, None).unwrap();
        let again = c.set_params(&w, None, None);
        assert!(matches!(again, Err(Error::ParamsAlreadySet)));

        let r = c.forward((&src[..5]).into(), None, (&mut dst).into());
        assert!(matches!(r, Err(Error::ShapeMismatch { arg: "src", .. })));
        let bf: Vec<bf16> = vec![bf16::ONE; src.len()];
        let r = c.forward((&bf).into(), None, (&mut dst).into());
        assert!(matches!(r, Err(Error::UnsupportedDType { .. })));

        let mut small = vec![0u8; c.external_buffer_size().saturating_sub(1)];
        if c.external_buffer_size() > 0 {
            let r = c.forward((&src).into(), Some(&mut small[..]), (&mut dst).into());
            assert!(matches!(r, Err(Error::BufferTooSmall { .. })));
        }
        c.forward((&src).into(), None, (&mut dst).into()).unwrap();
        // corner output sees a 2x2 window of two channels
        assert_eq!(dst[0], 8.0);
    }

    #[test]
    fn test_info_and_forced_variant() {
        let desc = ConvDesc::new(4, 4, 4, 4, 1);
        let c = conv(&desc);
        assert_eq!(c.info(), "Scalar::NhwcGemm");
        assert_eq!(c.level(), SimdLevel::Scalar);

        let g = Convolution16b::with_variant(1, &desc, Compatibility::default(), &CpuCaps::scalar(), VariantKind::Gemm)
            .unwrap();
        assert_eq!(g.variant(), VariantKind::Gemm);
        assert!(g.alg().is_none());

        let tile = Convolution16b::with_variant(
            1,
            &desc,
            Compatibility::default(),
            &CpuCaps::scalar(),
            VariantKind::TileGemm,
        );
        assert!(matches!(tile, Err(Error::UnsupportedShape { .. })));
    }

    #[test]
    fn test_forced_variant_honors_config() {
        let desc = ConvDesc::new(8, 6, 6, 8, 3).with_uniform_pad(1);
        let capped = EngineConfig {
            simd: Some(SimdLevel::Scalar),
            ..EngineConfig::default()
        };
        let c = Convolution16b::with_variant_config(
            1,
            &desc,
            Compatibility::default(),
            &CpuCaps::detect(),
            &capped,
            VariantKind::NhwcDirect,
        )
        .unwrap();
        assert_eq!(c.info(), "Scalar::NhwcDirect");

        let bad_cache = EngineConfig {
            cache: crate::config::CacheSizes {
                l1: 1 << 20,
                l2: 1 << 10,
                l3: 1 << 21,
            },
            simd: None,
        };
        let r = Convolution16b::with_variant_config(
            1,
            &desc,
            Compatibility::default(),
            &CpuCaps::scalar(),
            &bad_cache,
            VariantKind::NhwcGemm,
        );
        assert!(matches!(r, Err(Error::InvalidArgument { .. })));
    }

    #[test]
    fn test_missing_prelu_slopes() {
        let desc = ConvDesc::new(2, 3, 3, 2, 1).with_activation(ActivationKind::Prelu);
        let mut c = conv(&desc);
        let w = vec![1.0; c.param().weight_len()];
        assert!(c.set_params(&w, None, None).is_err());
        c.set_params(&w, None, Some(&[0.1, 0.2][..])).unwrap();
    }
}
