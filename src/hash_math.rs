//! Keyspace Hash Arithmetic
//!
//! This module implements the 128-bit hash keyspace math used by the shard
//! topology engine: keyspace-share percentages as fixed-scale decimals and
//! the fuzzy comparison that treats near-equal shares as balanced.

use std::cmp::Ordering;

use anyhow::{anyhow, Result};

/// Lowest hash key of the keyspace
pub const MIN_HASH_KEY: u128 = 0;

/// Highest hash key of the keyspace (2^128 - 1)
pub const MAX_HASH_KEY: u128 = u128::MAX;

/// Decimal scale for keyspace-share comparisons
pub const PCT_COMPARISON_SCALE: u32 = 10;

/// Number of scale-10 units in the full keyspace (10^10)
const FULL_SCALE_UNITS: u64 = 10_000_000_000;

/// Shares within one unit at scale `PCT_COMPARISON_SCALE - 1` (10^-9) are
/// deemed equal, i.e. 10 units at scale 10. Equally balanced shards of a
/// keyspace that does not divide evenly differ by one hash unit, which this
/// tolerance absorbs.
const COMPARISON_TOLERANCE_UNITS: u64 = 10;

const LOW_64: u128 = u64::MAX as u128;

/// A share of the 128-bit keyspace expressed as a fixed-scale decimal with
/// `PCT_COMPARISON_SCALE` fractional digits. The full keyspace is exactly
/// `KeyspacePct::FULL`; all constructions round HALF_DOWN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct KeyspacePct(u64);

impl KeyspacePct {
    /// Zero share of the keyspace
    pub const ZERO: KeyspacePct = KeyspacePct(0);

    /// The entire keyspace
    pub const FULL: KeyspacePct = KeyspacePct(FULL_SCALE_UNITS);

    /// Build a share from raw scale-10 units
    pub fn from_units(units: u64) -> Self {
        KeyspacePct(units)
    }

    /// Raw scale-10 units
    pub fn units(&self) -> u64 {
        self.0
    }

    /// The share `1/n` of the keyspace, rounded HALF_DOWN
    pub fn fraction(n: u64) -> Self {
        if n == 0 {
            return KeyspacePct::ZERO;
        }
        let q = FULL_SCALE_UNITS / n;
        let r = FULL_SCALE_UNITS % n;
        // HALF_DOWN: round up only when the remainder is strictly more than half
        let rounded = if r > n - r { q + 1 } else { q };
        KeyspacePct(rounded)
    }

    /// The share covered by the inclusive hash range `[start, end]`
    pub fn of_range(start: u128, end: u128) -> Self {
        debug_assert!(start <= end);
        // width = (end - start) + 1 can reach 2^128, so the multiplication by
        // the scale runs over a 256-bit intermediate: width * 10^10 / 2^128.
        let delta = end - start;
        let scale = FULL_SCALE_UNITS as u128;

        let lo_product = (delta & LOW_64) * scale;
        let mid_product = (delta >> 64) * scale;

        let mut hi = mid_product >> 64;
        let (mut lo, carry) = lo_product.overflowing_add((mid_product & LOW_64) << 64);
        hi += carry as u128;
        // account for the +1 of the inclusive width
        let (lo2, carry2) = lo.overflowing_add(scale);
        lo = lo2;
        hi += carry2 as u128;

        // dividing by 2^128 keeps the high half; HALF_DOWN on the low half
        let mut units = hi as u64;
        if lo > (1u128 << 127) {
            units += 1;
        }
        KeyspacePct(units)
    }

    /// Number of hash units this share spans, rounded HALF_DOWN. Saturates at
    /// `u128::MAX` for the full keyspace, whose true width does not fit.
    pub fn hash_units(&self) -> u128 {
        if self.0 >= FULL_SCALE_UNITS {
            return u128::MAX;
        }
        let scale = self.0 as u128 % FULL_SCALE_UNITS as u128;
        let divisor = FULL_SCALE_UNITS as u128;

        // (scale << 128) / divisor via two rounds of 64-bit long division
        let n1 = scale << 64;
        let q1 = n1 / divisor;
        let n2 = (n1 % divisor) << 64;
        let q2 = n2 / divisor;
        let r2 = n2 % divisor;

        let mut width = (q1 << 64) + q2;
        if r2 * 2 > divisor {
            width += 1;
        }
        width
    }

    /// Share as a plain float, for rendering and utilisation math
    pub fn as_f64(&self) -> f64 {
        self.0 as f64 / FULL_SCALE_UNITS as f64
    }

    /// Sum of two shares, saturating at the full keyspace
    pub fn saturating_add(&self, other: KeyspacePct) -> KeyspacePct {
        KeyspacePct(self.0.saturating_add(other.0).min(FULL_SCALE_UNITS))
    }

    /// Difference of two shares, saturating at zero
    pub fn saturating_sub(&self, other: KeyspacePct) -> KeyspacePct {
        KeyspacePct(self.0.saturating_sub(other.0))
    }
}

impl std::fmt::Display for KeyspacePct {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.4}%", self.as_f64() * 100.0)
    }
}

/// Compare two keyspace shares, treating values within the comparison
/// tolerance (10^-9) as equal.
pub fn soft_compare(a: KeyspacePct, b: KeyspacePct) -> Ordering {
    let diff = a.units().abs_diff(b.units());
    if diff < COMPARISON_TOLERANCE_UNITS {
        Ordering::Equal
    } else {
        a.units().cmp(&b.units())
    }
}

/// The `i`-th boundary when the inclusive range `[start, end]` is cut into
/// `n` even pieces: `start + floor(width * i / n)`, computed without
/// overflowing 128 bits.
pub fn even_split_point(start: u128, end: u128, i: u64, n: u64) -> u128 {
    debug_assert!(start <= end && n > 0 && i <= n);
    let width_minus_1 = end - start;
    let i = i as u128;
    let n = n as u128;
    let quotient = width_minus_1 / n;
    let remainder = width_minus_1 % n + 1;
    start + quotient * i + (remainder * i) / n
}

/// Parse a decimal hash-key string from the stream control plane
pub fn parse_hash_key(raw: &str) -> Result<u128> {
    raw.trim()
        .parse::<u128>()
        .map_err(|e| anyhow!("invalid hash key '{}': {}", raw, e))
}

/// Render a hash key in the decimal form the control plane expects
pub fn format_hash_key(key: u128) -> String {
    key.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_keyspace_is_exact() {
        let pct = KeyspacePct::of_range(MIN_HASH_KEY, MAX_HASH_KEY);
        assert_eq!(pct, KeyspacePct::FULL);
        assert_eq!(pct.as_f64(), 1.0);
    }

    #[test]
    fn test_half_keyspace() {
        let mid = MAX_HASH_KEY / 2;
        let lower = KeyspacePct::of_range(0, mid);
        let upper = KeyspacePct::of_range(mid + 1, MAX_HASH_KEY);

        assert_eq!(soft_compare(lower, KeyspacePct::fraction(2)), Ordering::Equal);
        assert_eq!(soft_compare(upper, KeyspacePct::fraction(2)), Ordering::Equal);
        assert_eq!(
            lower.units() + upper.units(),
            KeyspacePct::FULL.units()
        );
    }

    #[test]
    fn test_soft_compare_tolerance_law() {
        // equal whenever |a - b| < 10^-9, i.e. strictly fewer than 10 units
        let a = KeyspacePct::from_units(5_000_000_000);
        assert_eq!(
            soft_compare(a, KeyspacePct::from_units(5_000_000_009)),
            Ordering::Equal
        );
        assert_eq!(
            soft_compare(a, KeyspacePct::from_units(5_000_000_010)),
            Ordering::Less
        );
        assert_eq!(
            soft_compare(KeyspacePct::from_units(5_000_000_010), a),
            Ordering::Greater
        );
        assert_eq!(soft_compare(a, a), Ordering::Equal);
    }

    #[test]
    fn test_fraction_rounds_half_down() {
        // 1/3 = 0.3333333333... -> 3333333333 units, fraction below half
        assert_eq!(KeyspacePct::fraction(3).units(), 3_333_333_333);
        // 1/6 = 0.1666666666_6 -> remainder above half rounds up
        assert_eq!(KeyspacePct::fraction(6).units(), 1_666_666_667);
        // 1/8 = 0.125 exactly
        assert_eq!(KeyspacePct::fraction(8).units(), 1_250_000_000);
        // HALF_DOWN: exactly .5 stays down; 1/2^31 scaled lands mid-unit rarely,
        // so exercise via 1/20000000000 -> 0.5 units -> 0
        assert_eq!(KeyspacePct::fraction(20_000_000_000).units(), 0);
    }

    #[test]
    fn test_hash_units_round_trip() {
        for n in [2u64, 3, 4, 7, 10, 100, 1000] {
            let share = KeyspacePct::fraction(n);
            let width = share.hash_units();
            // a range of that width evaluates back to the same share
            let pct = KeyspacePct::of_range(0, width - 1);
            assert_eq!(
                soft_compare(pct, share),
                Ordering::Equal,
                "round trip failed for 1/{}",
                n
            );
        }
    }

    #[test]
    fn test_hash_units_full_saturates() {
        assert_eq!(KeyspacePct::FULL.hash_units(), u128::MAX);
    }

    #[test]
    fn test_single_hash_unit_is_negligible() {
        let pct = KeyspacePct::of_range(42, 42);
        assert_eq!(pct, KeyspacePct::ZERO);
        assert_eq!(soft_compare(pct, KeyspacePct::ZERO), Ordering::Equal);
    }

    #[test]
    fn test_adjacent_shares_sum_to_parent() {
        let split_at = u128::MAX / 3;
        let left = KeyspacePct::of_range(0, split_at);
        let right = KeyspacePct::of_range(split_at + 1, MAX_HASH_KEY);
        let total = left.saturating_add(right);
        assert_eq!(soft_compare(total, KeyspacePct::FULL), Ordering::Equal);
    }

    #[test]
    fn test_even_split_points_tile_the_range() {
        let n = 7u64;
        let mut previous = even_split_point(0, MAX_HASH_KEY, 0, n);
        assert_eq!(previous, 0);
        for i in 1..n {
            let boundary = even_split_point(0, MAX_HASH_KEY, i, n);
            assert!(boundary > previous);
            previous = boundary;
        }
        assert_eq!(even_split_point(0, 99, 1, 100), 1);
        assert_eq!(even_split_point(10, 19, 1, 2), 15);
    }

    #[test]
    fn test_parse_and_format_hash_keys() {
        assert_eq!(parse_hash_key("0").unwrap(), 0);
        assert_eq!(
            parse_hash_key("340282366920938463463374607431768211455").unwrap(),
            u128::MAX
        );
        assert_eq!(
            format_hash_key(u128::MAX),
            "340282366920938463463374607431768211455"
        );
        assert!(parse_hash_key("not-a-key").is_err());
        assert!(parse_hash_key("-1").is_err());
    }
}
