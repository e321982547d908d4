//! Fixed-point difficulty and 256-bit target arithmetic.
//!
//! Spec §9 calls out that difficulty and per-block work aggregates must use
//! arbitrary-precision decimal arithmetic rather than floating point, since
//! PPLNS totals have to match the matured reward to the base unit. We use
//! [`rust_decimal::Decimal`] for difficulty/work and a big-endian 256-bit
//! integer (via `num-bigint`) for PoW targets, the same way a Bitcoin-style
//! "compact bits" target is represented as a big unsigned integer rather
//! than a float.

use num_bigint::BigUint;
use num_traits::{ToPrimitive, Zero};
use rust_decimal::Decimal;
use std::cmp::Ordering;

/// A 256-bit unsigned target, big-endian byte order (matches the pre-PoW
/// hash byte order used throughout the wire protocol).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target(pub [u8; 32]);

impl Target {
    pub fn from_bytes_be(bytes: [u8; 32]) -> Self {
        Target(bytes)
    }

    pub fn max() -> Self {
        Target([0xff; 32])
    }

    fn as_biguint(&self) -> BigUint {
        BigUint::from_bytes_be(&self.0)
    }
}

impl PartialOrd for Target {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Target {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_biguint().cmp(&other.as_biguint())
    }
}

/// A share/session difficulty, represented as an exact decimal rather than
/// a float so that vardiff adjustments and difficulty comparisons never
/// accumulate rounding error.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, serde::Serialize, serde::Deserialize)]
pub struct Difficulty(pub Decimal);

impl Difficulty {
    pub fn new(value: Decimal) -> Self {
        Difficulty(value)
    }

    pub fn from_f64(value: f64) -> Option<Self> {
        Decimal::from_f64_retain(value).map(Difficulty)
    }

    pub fn to_f64(self) -> f64 {
        self.0.to_f64().unwrap_or(0.0)
    }

    pub fn clamp(self, min: Difficulty, max: Difficulty) -> Difficulty {
        if self.0 < min.0 {
            min
        } else if self.0 > max.0 {
            max
        } else {
            self
        }
    }

    /// The implied target for this difficulty: `max_target / difficulty`,
    /// truncated to an integer. A share's reported target must be <= this
    /// value to meet the session's assigned difficulty (spec §4.C.3 step 5).
    pub fn implied_target(self, max_target: &Target) -> Target {
        if self.0 <= Decimal::ZERO {
            return Target::max();
        }
        let max_int = max_target.as_biguint();
        // Scale difficulty to an integer ratio to avoid floating division:
        // implied = floor(max_int * 10^scale / (difficulty * 10^scale)) = floor(max_int / difficulty)
        let scale = self.0.scale();
        let scale_factor = BigUint::from(10u64).pow(scale);
        let diff_scaled = BigUint::from((self.0 * Decimal::from(10u64.pow(scale))).to_u128().unwrap_or(1));
        if diff_scaled.is_zero() {
            return Target::max();
        }
        let numerator = max_int * scale_factor;
        let result = numerator / diff_scaled;
        let mut bytes = result.to_bytes_be();
        if bytes.len() > 32 {
            return Target::max();
        }
        let mut out = [0u8; 32];
        out[32 - bytes.len()..].copy_from_slice(&bytes);
        bytes.clear();
        Target(out)
    }
}

impl std::fmt::Display for Difficulty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn implied_target_shrinks_as_difficulty_grows() {
        let max = Target::max();
        let low = Difficulty::new(Decimal::from(1));
        let high = Difficulty::new(Decimal::from(1_000_000));
        assert!(low.implied_target(&max) > high.implied_target(&max));
    }

    #[test]
    fn clamp_bounds_to_range() {
        let min = Difficulty::new(Decimal::from(16));
        let max = Difficulty::new(Decimal::from(65536));
        let over = Difficulty::new(Decimal::from(1_000_000));
        let under = Difficulty::new(Decimal::from(1));
        assert_eq!(over.clamp(min, max).0, max.0);
        assert_eq!(under.clamp(min, max).0, min.0);
    }
}
