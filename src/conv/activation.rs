//! Activation functions fused into the output store
//!
//! [`ActivationKind`] is what a layer descriptor names; [`Activation`] is the
//! resolved form with its parameters bound, produced once by `set_params` and
//! applied per output element by the postprocess stage. Every kind is a
//! closed-form scalar function evaluated in f32 (GELU's `erf` in f64), so the
//! fused result equals applying the same function after an unfused
//! convolution.

use crate::error::{Error, Result};
use std::fmt;

/// Activation named by a convolution descriptor
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ActivationKind {
    /// `x`
    #[default]
    Identity,
    /// `max(0, x)`
    Relu,
    /// `max(0, x) + slope * min(0, x)`
    LeakyRelu,
    /// `min(max(lower, x), upper)`
    RestrictRange,
    /// Leaky ReLU with one slope per output channel
    Prelu,
    /// `x >= 0 ? x : alpha * (e^x - 1)`
    Elu,
    /// `max(min(x, shift) + shift, 0) * scale * x`
    HardSwish,
    /// `x > threshold ? x : x * tanh(ln(1 + e^x))`
    Mish,
    /// `max(0, min(x * scale + shift, 1))`
    HardSigmoid,
    /// `x / (1 + e^(-slope * x))`
    Swish,
    /// `x * (erf(x / sqrt(2)) + 1) / 2`
    Gelu,
}

impl ActivationKind {
    /// All supported kinds
    pub const ALL: [ActivationKind; 11] = [
        Self::Identity,
        Self::Relu,
        Self::LeakyRelu,
        Self::RestrictRange,
        Self::Prelu,
        Self::Elu,
        Self::HardSwish,
        Self::Mish,
        Self::HardSigmoid,
        Self::Swish,
        Self::Gelu,
    ];

    /// Number of parameters the kind expects in `set_params`
    pub const fn param_count(self, dst_c: usize) -> usize {
        match self {
            Self::Identity | Self::Relu | Self::Gelu => 0,
            Self::LeakyRelu | Self::Elu | Self::Mish | Self::Swish => 1,
            Self::RestrictRange | Self::HardSwish | Self::HardSigmoid => 2,
            Self::Prelu => dst_c,
        }
    }

    /// Short name
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Relu => "relu",
            Self::LeakyRelu => "leaky_relu",
            Self::RestrictRange => "restrict_range",
            Self::Prelu => "prelu",
            Self::Elu => "elu",
            Self::HardSwish => "hswish",
            Self::Mish => "mish",
            Self::HardSigmoid => "hard_sigmoid",
            Self::Swish => "swish",
            Self::Gelu => "gelu",
        }
    }
}

impl fmt::Display for ActivationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Activation with its parameters bound
#[derive(Clone, Debug, PartialEq)]
pub enum Activation {
    /// `x`
    Identity,
    /// `max(0, x)`
    Relu,
    /// `max(0, x) + slope * min(0, x)`
    LeakyRelu {
        /// Negative-side slope
        slope: f32,
    },
    /// `min(max(lower, x), upper)`
    RestrictRange {
        /// Lower bound
        lower: f32,
        /// Upper bound
        upper: f32,
    },
    /// Per-channel leaky ReLU
    Prelu {
        /// One slope per output channel
        slopes: Vec<f32>,
    },
    /// Exponential linear unit
    Elu {
        /// Negative-side scale
        alpha: f32,
    },
    /// Hard swish
    HardSwish {
        /// Shift (3 in the usual definition)
        shift: f32,
        /// Scale (1/6 in the usual definition)
        scale: f32,
    },
    /// Mish with a linear pass-through above `threshold`
    Mish {
        /// Pass-through threshold
        threshold: f32,
    },
    /// Hard sigmoid
    HardSigmoid {
        /// Input scale
        scale: f32,
        /// Input shift
        shift: f32,
    },
    /// Swish (SiLU when `slope == 1`)
    Swish {
        /// Sigmoid slope
        slope: f32,
    },
    /// Exact (erf-based) GELU
    Gelu,
}

impl Activation {
    /// Bind parameters for `kind`
    ///
    /// `params` may be omitted for every kind except [`ActivationKind::Prelu`];
    /// missing parameters take the customary defaults.
    pub fn resolve(kind: ActivationKind, params: Option<&[f32]>, dst_c: usize) -> Result<Self> {
        let need = kind.param_count(dst_c);
        let p = match params {
            Some(p) if p.len() < need => {
                return Err(Error::invalid_argument(
                    "params",
                    format!("{} expects {} parameters, got {}", kind, need, p.len()),
                ));
            }
            Some(p) => Some(p),
            None if kind == ActivationKind::Prelu => {
                return Err(Error::invalid_argument(
                    "params",
                    format!("prelu requires {} per-channel slopes", dst_c),
                ));
            }
            None => None,
        };
        let at = |i: usize, default: f32| p.map_or(default, |p| p[i]);

        let act = match kind {
            ActivationKind::Identity => Self::Identity,
            ActivationKind::Relu => Self::Relu,
            ActivationKind::LeakyRelu => Self::LeakyRelu {
                slope: at(0, 0.01),
            },
            ActivationKind::RestrictRange => {
                let (lower, upper) = (at(0, 0.0), at(1, 6.0));
                if !(lower <= upper) {
                    return Err(Error::invalid_argument(
                        "params",
                        format!("restrict_range needs lower <= upper, got [{}, {}]", lower, upper),
                    ));
                }
                Self::RestrictRange { lower, upper }
            }
            ActivationKind::Prelu => Self::Prelu {
                slopes: p.map(|p| p[..dst_c].to_vec()).unwrap_or_default(),
            },
            ActivationKind::Elu => Self::Elu { alpha: at(0, 1.0) },
            ActivationKind::HardSwish => Self::HardSwish {
                shift: at(0, 3.0),
                scale: at(1, 1.0 / 6.0),
            },
            ActivationKind::Mish => Self::Mish {
                threshold: at(0, 20.0),
            },
            ActivationKind::HardSigmoid => Self::HardSigmoid {
                scale: at(0, 1.0 / 6.0),
                shift: at(1, 0.5),
            },
            ActivationKind::Swish => Self::Swish { slope: at(0, 1.0) },
            ActivationKind::Gelu => Self::Gelu,
        };
        Ok(act)
    }

    /// The kind this activation was resolved from
    pub fn kind(&self) -> ActivationKind {
        match self {
            Self::Identity => ActivationKind::Identity,
            Self::Relu => ActivationKind::Relu,
            Self::LeakyRelu { .. } => ActivationKind::LeakyRelu,
            Self::RestrictRange { .. } => ActivationKind::RestrictRange,
            Self::Prelu { .. } => ActivationKind::Prelu,
            Self::Elu { .. } => ActivationKind::Elu,
            Self::HardSwish { .. } => ActivationKind::HardSwish,
            Self::Mish { .. } => ActivationKind::Mish,
            Self::HardSigmoid { .. } => ActivationKind::HardSigmoid,
            Self::Swish { .. } => ActivationKind::Swish,
            Self::Gelu => ActivationKind::Gelu,
        }
    }

    /// Apply to one value of output channel `channel`
    #[inline]
    pub fn apply(&self, x: f32, channel: usize) -> f32 {
        match self {
            Self::Identity => x,
            Self::Relu => x.max(0.0),
            Self::LeakyRelu { slope } => x.max(0.0) + slope * x.min(0.0),
            Self::RestrictRange { lower, upper } => x.max(*lower).min(*upper),
            Self::Prelu { slopes } => x.max(0.0) + slopes[channel] * x.min(0.0),
            Self::Elu { alpha } => {
                if x >= 0.0 {
                    x
                } else {
                    alpha * x.exp_m1()
                }
            }
            Self::HardSwish { shift, scale } => (x.min(*shift) + shift).max(0.0) * scale * x,
            Self::Mish { threshold } => {
                if x > *threshold {
                    x
                } else {
                    x * x.exp().ln_1p().tanh()
                }
            }
            Self::HardSigmoid { scale, shift } => (x * scale + shift).min(1.0).max(0.0),
            Self::Swish { slope } => x / (1.0 + (-slope * x).exp()),
            Self::Gelu => {
                let x = x as f64;
                (x * (erf(x * std::f64::consts::FRAC_1_SQRT_2) + 1.0) * 0.5) as f32
            }
        }
    }

    /// Apply in place to a run of values starting at output channel `channel`
    #[inline]
    pub fn apply_run(&self, values: &mut [f32], channel: usize) {
        match self {
            Self::Identity => {}
            Self::Relu => values.iter_mut().for_each(|v| *v = v.max(0.0)),
            _ => {
                for (i, v) in values.iter_mut().enumerate() {
                    *v = self.apply(*v, channel + i);
                }
            }
        }
    }
}

/// Error function (Maclaurin series below 3, continued fraction below 6)
pub fn erf(x: f64) -> f64 {
    if x.is_nan() {
        return f64::NAN;
    }
    if x == 0.0 {
        return 0.0;
    }
    if x.is_infinite() {
        return x.signum();
    }

    let sign = x.signum();
    let a = x.abs();

    if a < 3.0 {
        let x2 = a * a;
        let mut term = a;
        let mut sum = a;
        for n in 1..60 {
            term *= -x2 / (n as f64);
            let contribution = term / (2 * n + 1) as f64;
            sum += contribution;
            if contribution.abs() < sum.abs() * 1e-16 {
                break;
            }
        }
        const TWO_OVER_SQRT_PI: f64 = 1.1283791670955126;
        sign * sum * TWO_OVER_SQRT_PI
    } else if a < 6.0 {
        let mut f = 0.0_f64;
        for n in (1..=50).rev() {
            f = (n as f64) * 0.5 / (a + f);
        }
        let cf = 1.0 / (a + f);
        const FRAC_1_SQRT_PI: f64 = 0.5641895835477563;
        let erfc = (-a * a).exp() * FRAC_1_SQRT_PI * cf;
        sign * (1.0 - erfc)
    } else {
        sign
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn act(kind: ActivationKind, params: Option<&[f32]>) -> Activation {
        Activation::resolve(kind, params, 2).unwrap()
    }

    #[test]
    fn test_param_counts() {
        assert_eq!(ActivationKind::Prelu.param_count(7), 7);
        assert_eq!(ActivationKind::HardSwish.param_count(7), 2);
        assert_eq!(ActivationKind::Gelu.param_count(7), 0);
        assert_eq!(ActivationKind::ALL.len(), 11);
    }

    #[test]
    fn test_resolve_defaults_and_errors() {
        assert_eq!(
            act(ActivationKind::HardSwish, None),
            Activation::HardSwish {
                shift: 3.0,
                scale: 1.0 / 6.0
            }
        );
        assert!(Activation::resolve(ActivationKind::Prelu, None, 4).is_err());
        assert!(Activation::resolve(ActivationKind::Prelu, Some(&[0.1; 3]), 4).is_err());
        assert!(Activation::resolve(ActivationKind::RestrictRange, Some(&[1.0]), 4).is_err());
        assert!(Activation::resolve(ActivationKind::RestrictRange, Some(&[2.0, 1.0]), 4).is_err());
        for kind in ActivationKind::ALL {
            let a = Activation::resolve(kind, Some(&[0.25, 0.75]), 2).unwrap();
            assert_eq!(a.kind(), kind);
        }
    }

    #[test]
    fn test_closed_forms() {
        assert_eq!(act(ActivationKind::Identity, None).apply(-1.5, 0), -1.5);
        assert_eq!(act(ActivationKind::Relu, None).apply(-1.5, 0), 0.0);
        assert_eq!(act(ActivationKind::Relu, None).apply(2.0, 0), 2.0);
        assert_eq!(act(ActivationKind::LeakyRelu, Some(&[0.1])).apply(-2.0, 0), -0.2);
        assert_eq!(
            act(ActivationKind::RestrictRange, Some(&[-1.0, 1.0])).apply(3.0, 0),
            1.0
        );
        let prelu = act(ActivationKind::Prelu, Some(&[0.5, 0.25]));
        assert_eq!(prelu.apply(-4.0, 0), -2.0);
        assert_eq!(prelu.apply(-4.0, 1), -1.0);
        assert_eq!(prelu.apply(4.0, 1), 4.0);

        let elu = act(ActivationKind::Elu, Some(&[1.0]));
        assert!((elu.apply(-1.0, 0) - ((-1.0f32).exp() - 1.0)).abs() < 1e-6);

        let hswish = act(ActivationKind::HardSwish, None);
        assert_eq!(hswish.apply(-4.0, 0), 0.0);
        assert!((hswish.apply(1.0, 0) - 4.0 / 6.0).abs() < 1e-6);
        assert!((hswish.apply(5.0, 0) - 5.0).abs() < 1e-6);

        let hsig = act(ActivationKind::HardSigmoid, None);
        assert_eq!(hsig.apply(-10.0, 0), 0.0);
        assert_eq!(hsig.apply(10.0, 0), 1.0);
        assert!((hsig.apply(0.0, 0) - 0.5).abs() < 1e-7);

        let swish = act(ActivationKind::Swish, None);
        assert!((swish.apply(1.0, 0) - 1.0 / (1.0 + (-1.0f32).exp())).abs() < 1e-6);

        let mish = act(ActivationKind::Mish, None);
        assert_eq!(mish.apply(25.0, 0), 25.0);
        assert!((mish.apply(1.0, 0) - 0.865_098_4).abs() < 1e-5);

        let gelu = act(ActivationKind::Gelu, None);
        assert_eq!(gelu.apply(0.0, 0), 0.0);
        assert!((gelu.apply(1.0, 0) - 0.841_344_75).abs() < 1e-6);
        assert!((gelu.apply(-1.0, 0) + 0.158_655_25).abs() < 1e-6);
    }

    #[test]
    fn test_erf_reference_values() {
        assert!((erf(0.5) - 0.520_499_877_813_046_5).abs() < 1e-14);
        assert!((erf(-1.0) + 0.842_700_792_949_714_9).abs() < 1e-14);
        assert!((erf(4.0) - 0.999_999_984_582_742_1).abs() < 1e-13);
        assert_eq!(erf(7.0), 1.0);
        assert_eq!(erf(f64::NEG_INFINITY), -1.0);
    }

    #[test]
    fn test_apply_run_matches_apply() {
        let prelu = act(ActivationKind::Prelu, Some(&[0.5, 0.25]));
        let mut v = [-1.0, -1.0];
        prelu.apply_run(&mut v, 0);
        assert_eq!(v, [-0.5, -0.25]);
    }
}
