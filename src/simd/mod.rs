//! CPU capability detection and the capability context
//!
//! Detection runs once, in [`CpuCaps::detect`], and produces a [`SimdLevel`].
//! The resulting [`CpuCaps`] value is passed explicitly into
//! [`Convolution16b::new`](crate::conv::Convolution16b::new); nothing in the
//! engine queries CPU features on its own.
//!
//! # Architecture Support
//!
//! | Architecture | Tier              | f32 lanes | Micro-kernel         |
//! |--------------|-------------------|-----------|----------------------|
//! | x86-64       | AMX-BF16 (+AVX-512)| 16       | 16x16 tile unit      |
//! | x86-64       | AVX-512F/BW + FMA | 16        | 12 rows x 32 columns |
//! | x86-64       | AVX2 + FMA        | 8         | 5 rows x 16 columns  |
//! | ARM64        | NEON              | 4         | 6 rows x 8 columns   |
//! | Any          | Scalar            | 4 (virtual)| 4 rows x 8 columns  |

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// SIMD capability level
///
/// Higher values indicate more capable instruction sets on the same
/// architecture. x86 and ARM levels are not interchangeable.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[allow(dead_code)] // Variants may not be constructed on all architectures
pub enum SimdLevel {
    /// AVX-512 plus the AMX tile unit with bf16 dot products
    AmxBf16 = 5,
    /// AVX-512F/BW with FMA support (512-bit vectors, 16 f32s)
    Avx512 = 4,
    /// AVX2 with FMA support (256-bit vectors, 8 f32s)
    Avx2Fma = 3,
    /// NEON baseline for AArch64 (128-bit vectors, 4 f32s)
    Neon = 1,
    /// Scalar fallback (no SIMD)
    Scalar = 0,
}

impl SimdLevel {
    /// Returns true if this is an x86-64 SIMD level
    #[inline]
    pub const fn is_x86(self) -> bool {
        matches!(self, Self::AmxBf16 | Self::Avx512 | Self::Avx2Fma)
    }

    /// Returns true if this is an ARM64 SIMD level
    #[inline]
    pub const fn is_arm64(self) -> bool {
        matches!(self, Self::Neon)
    }

    /// Returns true if this level supports 512-bit operations
    #[inline]
    pub const fn has_avx512(self) -> bool {
        matches!(self, Self::AmxBf16 | Self::Avx512)
    }

    /// Returns true if this level offers the matrix tile unit
    #[inline]
    pub const fn has_tile_unit(self) -> bool {
        matches!(self, Self::AmxBf16)
    }

    /// Returns the number of f32 elements per vector register
    ///
    /// The scalar tier reports 4 so that its tiles keep the same shape
    /// arithmetic as the vector tiers.
    #[inline]
    pub const fn f32_lanes(self) -> usize {
        match self {
            Self::AmxBf16 | Self::Avx512 => 16,
            Self::Avx2Fma => 8,
            Self::Neon | Self::Scalar => 4,
        }
    }

    /// Returns true when code built for `other` may run at this level
    pub const fn supports(self, other: SimdLevel) -> bool {
        if matches!(other, Self::Scalar) {
            return true;
        }
        let same_arch = (self.is_x86() && other.is_x86()) || (self.is_arm64() && other.is_arm64());
        same_arch && (other as u8) <= (self as u8)
    }

    /// Returns the name of this SIMD level as a string
    #[inline]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AmxBf16 => "AmxBf16",
            Self::Avx512 => "Avx512",
            Self::Avx2Fma => "Avx2",
            Self::Neon => "Neon",
            Self::Scalar => "Scalar",
        }
    }
}

impl fmt::Display for SimdLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SimdLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "amx" | "amx-bf16" | "amxbf16" => Ok(Self::AmxBf16),
            "avx512" | "avx-512" => Ok(Self::Avx512),
            "avx2" | "avx2fma" => Ok(Self::Avx2Fma),
            "neon" => Ok(Self::Neon),
            "scalar" | "none" => Ok(Self::Scalar),
            other => Err(Error::invalid_argument(
                "simd",
                format!("unknown SIMD level '{}'", other),
            )),
        }
    }
}

/// Capability context handed to the convolution factory
///
/// `level` is the tier kernels are selected for; `detected` is what the CPU
/// offers. `level` never exceeds `detected`, which is what makes calling the
/// `#[target_feature]` kernels sound.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CpuCaps {
    level: SimdLevel,
    detected: SimdLevel,
}

impl CpuCaps {
    /// Detect the best tier of the current CPU
    #[cold]
    pub fn detect() -> Self {
        let detected = detect_level();
        Self {
            level: detected,
            detected,
        }
    }

    /// A context that only runs portable code
    pub fn scalar() -> Self {
        Self {
            level: SimdLevel::Scalar,
            detected: SimdLevel::Scalar,
        }
    }

    /// Restrict kernel selection to `level`
    ///
    /// Fails if the CPU cannot run `level`.
    pub fn with_level(self, level: SimdLevel) -> Result<Self> {
        if !self.detected.supports(level) {
            return Err(Error::UnsupportedSimdLevel {
                requested: level,
                detected: self.detected,
            });
        }
        Ok(Self {
            level,
            detected: self.detected,
        })
    }

    /// Like [`with_level`](Self::with_level) but falls back to the detected tier
    pub fn clamped_to(self, level: SimdLevel) -> Self {
        match self.with_level(level) {
            Ok(caps) => caps,
            Err(_) => {
                tracing::warn!(
                    requested = %level,
                    detected = %self.detected,
                    "requested SIMD level not available, keeping detected level"
                );
                self
            }
        }
    }

    /// The tier kernels are selected for
    #[inline]
    pub fn level(&self) -> SimdLevel {
        self.level
    }

    /// The best tier the CPU offers
    #[inline]
    pub fn detected(&self) -> SimdLevel {
        self.detected
    }
}

/// Perform CPU feature detection
fn detect_level() -> SimdLevel {
    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx512f")
            && is_x86_feature_detected!("avx512bw")
            && is_x86_feature_detected!("fma")
        {
            if has_amx_bf16() {
                return SimdLevel::AmxBf16;
            }
            return SimdLevel::Avx512;
        }

        if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
            return SimdLevel::Avx2Fma;
        }
    }

    #[cfg(target_arch = "aarch64")]
    {
        // NEON is mandatory for AArch64
        return SimdLevel::Neon;
    }

    #[allow(unreachable_code)]
    SimdLevel::Scalar
}

/// CPUID leaf 7 reports AMX-BF16 in EDX bit 22 and AMX-TILE in bit 24
#[cfg(target_arch = "x86_64")]
#[allow(unused_unsafe)]
fn has_amx_bf16() -> bool {
    use std::arch::x86_64::{__cpuid_count, __get_cpuid_max};

    let (max_leaf, _) = unsafe { __get_cpuid_max(0) };
    if max_leaf < 7 {
        return false;
    }
    let info = unsafe { __cpuid_count(7, 0) };
    let amx_bf16 = (info.edx >> 22) & 1 == 1;
    let amx_tile = (info.edx >> 24) & 1 == 1;
    amx_bf16 && amx_tile
}
