//! Cumulative proof-of-work.

use dashu_int::{ops::BitTest, UBig};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{
    fmt,
    iter::Sum,
    ops::{Add, AddAssign},
    str::FromStr,
};

/// Compact targets with the sign bit set are negative and never valid.
const COMPACT_SIGN_BIT: u32 = 0x0080_0000;
const COMPACT_MANTISSA: u32 = 0x007f_ffff;

/// Hashes are 256 bit numbers; no target may exceed this width.
const TARGET_BITS: usize = 256;

/// Expected number of hashes needed to produce a chain segment.
///
/// Arbitrary precision so that totals over long chains never saturate.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Work(UBig);

impl Default for Work {
    fn default() -> Self {
        Self::zero()
    }
}

impl Work {
    pub fn zero() -> Self {
        Self(UBig::ZERO)
    }

    pub fn from_u64(value: u64) -> Self {
        Self(UBig::from(value))
    }

    /// Work implied by a compact difficulty target: `2^256 / (target + 1)`.
    ///
    /// Returns `None` for targets that are negative, zero or wider than 256 bits.
    pub fn from_compact(bits: u32) -> Option<Self> {
        let target = target_from_compact(bits)?;
        Some(Self((UBig::ONE << TARGET_BITS) / (target + UBig::ONE)))
    }

    pub fn is_null(&self) -> bool {
        self.0 == UBig::ZERO
    }

    pub fn as_ubig(&self) -> &UBig {
        &self.0
    }
}

/// Expand a compact (`nBits`) target into its full value.
pub fn target_from_compact(bits: u32) -> Option<UBig> {
    if bits & COMPACT_SIGN_BIT != 0 {
        return None;
    }

    let exponent = (bits >> 24) as usize;
    let mantissa = UBig::from(bits & COMPACT_MANTISSA);
    let target = if exponent <= 3 {
        mantissa >> (8 * (3 - exponent))
    } else {
        mantissa << (8 * (exponent - 3))
    };

    if target == UBig::ZERO || target.bit_len() > TARGET_BITS {
        return None;
    }
    Some(target)
}

impl Add for Work {
    type Output = Work;

    fn add(self, rhs: Work) -> Work {
        Work(self.0 + rhs.0)
    }
}

impl<'a> Add<&'a Work> for &'a Work {
    type Output = Work;

    fn add(self, rhs: &'a Work) -> Work {
        Work(&self.0 + &rhs.0)
    }
}

impl AddAssign<&Work> for Work {
    fn add_assign(&mut self, rhs: &Work) {
        self.0 += &rhs.0;
    }
}

impl Sum for Work {
    fn sum<I: Iterator<Item = Work>>(iter: I) -> Self {
        iter.fold(Work::zero(), |acc, w| acc + w)
    }
}

impl From<u64> for Work {
    fn from(value: u64) -> Self {
        Self::from_u64(value)
    }
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Work").field(&format_args!("{}", self.0)).finish()
    }
}

impl fmt::Display for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

// Decimal strings keep stored values readable and independent of limb layout
impl Serialize for Work {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Work {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        UBig::from_str(&s).map(Work).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(0x1d00ffff, 4_295_032_833 ; "mainnet genesis difficulty")]
    #[test_case(0x207fffff, 2 ; "regtest minimum difficulty")]
    #[test_case(0x2000ffff, 256 ; "regtest harder difficulty")]
    fn work_from_compact_bits(bits: u32, expected: u64) {
        assert_eq!(Work::from_compact(bits), Some(Work::from(expected)));
    }

    #[test_case(0x0180_0000 ; "negative")]
    #[test_case(0x2100_0000 ; "zero mantissa")]
    #[test_case(0x2200_ffff ; "wider than 256 bits")]
    #[test_case(0x0100_00ff ; "shifted to zero")]
    fn invalid_compact_bits_are_rejected(bits: u32) {
        assert!(Work::from_compact(bits).is_none());
    }

    #[test]
    fn ordering_is_total_and_addition_grows() {
        let a = Work::from(5);
        let b = Work::from(7);
        assert!(a < b);
        assert!(&a + &b > a);
        assert_eq!(&a + &b, &b + &a);
        assert_eq!(
            (&a + &b) + Work::from(1),
            a.clone() + (&b + &Work::from(1))
        );
    }

    #[test]
    fn only_zero_is_null() {
        assert!(Work::zero().is_null());
        assert!(Work::default().is_null());
        assert!(!Work::from(1).is_null());
    }

    #[test]
    fn sum_accumulates_past_u64() {
        let total: Work = (0..4).map(|_| Work::from(u64::MAX)).sum();
        assert!(total > Work::from(u64::MAX));
        assert_eq!(total.to_string(), "73786976294838206460");
    }

    #[test]
    fn serde_keeps_full_precision() {
        let work = Work::from(u64::MAX) + Work::from(u64::MAX);
        let json = serde_json::to_string(&work).unwrap();
        assert_eq!(json, "\"36893488147419103230\"");
        let back: Work = serde_json::from_str(&json).unwrap();
        assert_eq!(back, work);
    }
}
