//! 32-bit wrapping checksum arithmetic.
//!
//! Bucket checksums are sums of per-operation checksums modulo 2^32. The
//! sync service computes the same sums, so these functions must reproduce
//! unsigned 32-bit wraparound exactly. Values are stored at 64-bit width
//! (SQLite integers) and masked on every operation.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Sub, SubAssign};

const MASK: i64 = 0xffff_ffff;
const MODULUS: i64 = 0x1_0000_0000;

/// Adds two checksums with 32-bit wraparound.
///
/// Both operands are masked to their low 32 bits first.
#[inline]
pub fn add(a: i64, b: i64) -> i64 {
    ((a & MASK) + (b & MASK)) & MASK
}

/// Subtracts `b` from `a` with 32-bit wraparound.
///
/// The difference is biased by 2^32 before masking so it never underflows.
#[inline]
pub fn subtract(a: i64, b: i64) -> i64 {
    ((a & MASK) - (b & MASK) + MODULUS) & MASK
}

/// A 32-bit bucket or operation checksum.
///
/// Deserializes from any JSON integer (the service may send signed
/// 32-bit values or unsigned ones) and keeps the low 32 bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Checksum(u32);

impl Checksum {
    /// The zero checksum.
    pub const ZERO: Checksum = Checksum(0);

    /// Creates a checksum from a 32-bit value.
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Creates a checksum from a 64-bit storage value, keeping the low 32 bits.
    #[must_use]
    pub const fn from_i64(value: i64) -> Self {
        Self((value & MASK) as u32)
    }

    /// Returns the checksum as a 32-bit value.
    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }

    /// Returns the checksum widened for storage.
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self.0 as i64
    }

    /// Sums the checksums of a sequence of values.
    pub fn of_entries<'a, T, I>(entries: I, checksum_of: impl Fn(&T) -> Checksum) -> Checksum
    where
        T: 'a,
        I: IntoIterator<Item = &'a T>,
    {
        entries.into_iter().map(checksum_of).sum()
    }
}

impl From<u32> for Checksum {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Checksum> for i64 {
    fn from(value: Checksum) -> Self {
        value.as_i64()
    }
}

impl Add for Checksum {
    type Output = Checksum;

    fn add(self, rhs: Checksum) -> Checksum {
        Checksum(self.0.wrapping_add(rhs.0))
    }
}

impl AddAssign for Checksum {
    fn add_assign(&mut self, rhs: Checksum) {
        *self = *self + rhs;
    }
}

impl Sub for Checksum {
    type Output = Checksum;

    fn sub(self, rhs: Checksum) -> Checksum {
        Checksum(self.0.wrapping_sub(rhs.0))
    }
}

impl SubAssign for Checksum {
    fn sub_assign(&mut self, rhs: Checksum) {
        *self = *self - rhs;
    }
}

impl Sum for Checksum {
    fn sum<I: Iterator<Item = Checksum>>(iter: I) -> Checksum {
        iter.fold(Checksum::ZERO, Add::add)
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for Checksum {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.0)
    }
}

impl<'de> Deserialize<'de> for Checksum {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = i64::deserialize(deserializer)?;
        Ok(Checksum::from_i64(value))
    }
}
