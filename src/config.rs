//! Engine configuration
//!
//! Cache-size estimates drive the blocking arithmetic in
//! [`AlgParam`](crate::conv::AlgParam); the compatibility flags select between
//! faster and more reproducible arithmetic. Both can be overridden from the
//! environment, which is how benchmarks and CI pin a tier or a cache profile.
//!
//! | Variable        | Meaning                                   |
//! |-----------------|-------------------------------------------|
//! | `BF16CONV_L1`   | L1 data cache estimate in bytes           |
//! | `BF16CONV_L2`   | L2 cache estimate in bytes                |
//! | `BF16CONV_L3`   | L3 cache estimate in bytes (per core)     |
//! | `BF16CONV_SIMD` | Cap the SIMD tier (`scalar`, `avx2`, ...) |

use crate::error::{Error, Result};
use crate::simd::{CpuCaps, SimdLevel};

/// Environment variable overriding the L1 estimate
pub const L1_ENV: &str = "BF16CONV_L1";
/// Environment variable overriding the L2 estimate
pub const L2_ENV: &str = "BF16CONV_L2";
/// Environment variable overriding the L3 estimate
pub const L3_ENV: &str = "BF16CONV_L3";
/// Environment variable capping the SIMD tier
pub const SIMD_ENV: &str = "BF16CONV_SIMD";

/// Per-core cache capacity estimates in bytes
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheSizes {
    /// L1 data cache
    pub l1: usize,
    /// L2 cache
    pub l2: usize,
    /// L3 cache share of one core
    pub l3: usize,
}

impl CacheSizes {
    /// Conservative desktop-class estimates
    pub const DEFAULT: Self = Self {
        l1: 32 * 1024,
        l2: 256 * 1024,
        l3: 2 * 1024 * 1024,
    };

    /// Validate that the hierarchy is non-empty and non-decreasing
    pub fn validate(&self) -> Result<()> {
        if self.l1 == 0 || self.l2 == 0 || self.l3 == 0 {
            return Err(Error::invalid_argument(
                "cache",
                format!("cache sizes must be > 0, got {:?}", self),
            ));
        }
        if self.l1 > self.l2 || self.l2 > self.l3 {
            return Err(Error::invalid_argument(
                "cache",
                format!("expected l1 <= l2 <= l3, got {:?}", self),
            ));
        }
        Ok(())
    }
}

impl Default for CacheSizes {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// How the SIMD kernels combine a multiply with an accumulate
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum FmaMode {
    /// Use fused multiply-add (one rounding per step)
    #[default]
    Use,
    /// Separate multiply and add, matching the scalar kernel bit for bit
    Avoid,
}

/// Rounding and precision trade-offs requested by the caller
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Compatibility {
    /// Multiply-accumulate policy
    pub fma: FmaMode,
}

impl Compatibility {
    /// Compatibility with fused multiply-add disabled
    pub const fn no_fma() -> Self {
        Self {
            fma: FmaMode::Avoid,
        }
    }

    /// Returns true when kernels may fuse multiply and add
    #[inline]
    pub const fn use_fma(&self) -> bool {
        matches!(self.fma, FmaMode::Use)
    }
}

/// Configuration consumed by the convolution factory
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct EngineConfig {
    /// Cache estimates for blocking
    pub cache: CacheSizes,
    /// Optional cap on the SIMD tier
    pub simd: Option<SimdLevel>,
}

impl EngineConfig {
    /// Build a configuration from defaults plus environment overrides
    ///
    /// Unset variables keep their defaults; malformed values are an error.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(v) = lookup(L1_ENV) {
            cfg.cache.l1 = parse_bytes(L1_ENV, &v)?;
        }
        if let Some(v) = lookup(L2_ENV) {
            cfg.cache.l2 = parse_bytes(L2_ENV, &v)?;
        }
        if let Some(v) = lookup(L3_ENV) {
            cfg.cache.l3 = parse_bytes(L3_ENV, &v)?;
        }
        if let Some(v) = lookup(SIMD_ENV) {
            cfg.simd = Some(v.parse()?);
        }
        cfg.cache.validate()?;
        Ok(cfg)
    }

    /// Apply the tier cap to a detected capability context
    pub fn apply(&self, caps: CpuCaps) -> CpuCaps {
        match self.simd {
            Some(level) => caps.clamped_to(level),
            None => caps,
        }
    }
}

fn parse_bytes(key: &'static str, value: &str) -> Result<usize> {
    value
        .trim()
        .parse::<usize>()
        .map_err(|e| Error::invalid_argument(key, format!("'{}' is not a byte count: {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_defaults() {
        let cfg = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.cache, CacheSizes::DEFAULT);
        assert_eq!(cfg.simd, None);
        assert!(Compatibility::default().use_fma());
        assert!(!Compatibility::no_fma().use_fma());
    }

    #[test]
    fn test_env_overrides() {
        let cfg = EngineConfig::from_lookup(lookup(&[
            (L1_ENV, "49152"),
            (L2_ENV, "1048576"),
            (SIMD_ENV, "scalar"),
        ]))
        .unwrap();
        assert_eq!(cfg.cache.l1, 49152);
        assert_eq!(cfg.cache.l2, 1048576);
        assert_eq!(cfg.cache.l3, CacheSizes::DEFAULT.l3);
        assert_eq!(cfg.simd, Some(SimdLevel::Scalar));
        assert_eq!(cfg.apply(CpuCaps::detect()).level(), SimdLevel::Scalar);
    }

    #[test]
    fn test_bad_values_rejected() {
        assert!(EngineConfig::from_lookup(lookup(&[(L2_ENV, "lots")])).is_err());
        assert!(EngineConfig::from_lookup(lookup(&[(L1_ENV, "0")])).is_err());
        assert!(EngineConfig::from_lookup(lookup(&[(L1_ENV, "999999999")])).is_err());
    }
}
