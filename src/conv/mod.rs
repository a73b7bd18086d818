//! bf16 convolution engine
//!
//! A layer is described by a [`ConvDesc`], validated into a [`ConvParam`] and
//! bound to an algorithm variant by [`Convolution16b`]. Data flows as
//!
//! ```text
//! src ─ pack (round to bf16, reorder, zero-pad) ─┐
//!                                                ├─ micro-kernels (f32 accumulate) ─ postprocess ─ dst
//! weights ─ pack once at set_params ─────────────┘
//! ```
//!
//! Sources and destinations are `f32` or `bf16` independently, in NHWC or
//! NCHW. Accumulation is always `f32`; the destination precision is applied
//! once per element by the postprocess store.

mod activation;
mod alg;
mod engine;
pub(crate) mod kernel;
mod pack;
mod param;
mod postprocess;
mod selector;
mod tensor;
mod variants;

pub use activation::{Activation, ActivationKind, erf};
pub use alg::{AlgParam, MAX_MICRO_D, MAX_MICRO_M, TierConstants};
pub use engine::Convolution16b;
pub use param::{ConvDesc, ConvParam, ShapeClass, TensorFormat, compute_output_size};
pub use tensor::{SCRATCH_ALIGN, Scratch, ScratchLayout, TensorMut, TensorRef};
pub use variants::VariantKind;
