//! ARM64 micro-kernels

pub(crate) mod neon;
