//! # bf16conv
//!
//! **Convolution layers in bf16 on the CPU, tuned per SIMD tier.**
//!
//! bf16conv runs inference convolutions with sources and weights rounded to
//! bf16 and all accumulation in f32. One detection step picks the hardware
//! tier; each layer then selects the fastest legal algorithm for its shape
//! once, at construction.
//!
//! ## Features
//!
//! - **Tiers**: AMX-BF16 tile unit, AVX-512, AVX2+FMA, NEON, portable scalar
//! - **Variants**: row and column GEMM, direct and padded-grid convolution,
//!   depthwise, tile-unit GEMM, and a generic fallback valid for every shape
//! - **Layouts**: NHWC and NCHW, f32 or bf16 source and destination
//! - **Fused epilogue**: bias plus eleven activations applied at the store
//! - **Cache-aware blocking**: block sizes derived from L1/L2/L3 estimates
//!
//! ## Quick Start
//!
//! ```rust
//! use bf16conv::prelude::*;
//!
//! let desc = ConvDesc::new(16, 8, 8, 32, 1).with_activation(ActivationKind::Relu);
//! let mut conv = Convolution16b::new(1, &desc, Compatibility::default(), &CpuCaps::detect())?;
//! conv.set_params(&vec![0.25; conv.param().weight_len()], Some(&[1.0; 32][..]), None)?;
//!
//! let src = vec![1.0f32; conv.param().src_len()];
//! let mut dst = vec![0.0f32; conv.param().dst_len()];
//! let mut scratch = vec![0u8; conv.external_buffer_size()];
//! conv.forward((&src).into(), Some(&mut scratch[..]), (&mut dst).into())?;
//! assert!(dst.iter().all(|&v| v == 5.0));
//! # Ok::<(), bf16conv::Error>(())
//! ```
//!
//! ## Configuration
//!
//! [`EngineConfig::from_env`](config::EngineConfig::from_env) reads cache
//! estimates and an optional tier cap from `BF16CONV_*` variables; see
//! [`config`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod conv;
pub mod dtype;
pub mod error;
pub mod simd;

pub use error::{Error, Result};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{CacheSizes, Compatibility, EngineConfig, FmaMode};
    pub use crate::conv::{
        Activation, ActivationKind, ConvDesc, ConvParam, Convolution16b, TensorFormat, TensorMut,
        TensorRef, VariantKind,
    };
    pub use crate::dtype::{DType, Element};
    pub use crate::error::{Error, Result};
    pub use crate::simd::{CpuCaps, SimdLevel};
}
