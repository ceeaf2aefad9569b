//! Identifier space types
//!
//! Identifiers live on a circular 128-bit space. Digits are counted from the
//! most significant end, so digit `i` of two identifiers differs first exactly
//! when they share an `i`-digit prefix.

use blake2::{Blake2b512, Digest};
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::error::{ProtocolError, Result};

/// Width of an identifier in bits
pub const ID_BIT_LENGTH: u32 = 128;

/// Size of an identifier in bytes
pub const ID_SIZE: usize = 16;

/// Largest supported digit width (256 slots per routing-table row)
pub const MAX_DIGIT_BITS: u32 = 8;

const HALF_RING: u128 = 1 << 127;

/// Validate a routing digit width
pub fn check_digit_bits(digit_bits: u32) -> Result<()> {
    if digit_bits == 0 || digit_bits > MAX_DIGIT_BITS {
        return Err(ProtocolError::InvalidDigitWidth(digit_bits));
    }
    Ok(())
}

/// A position on the identifier ring, shared by node identifiers and keys
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Id(u128);

impl Id {
    pub const ZERO: Id = Id(0);
    pub const MAX: Id = Id(u128::MAX);

    pub const fn from_u128(value: u128) -> Self {
        Id(value)
    }

    pub const fn as_u128(&self) -> u128 {
        self.0
    }

    /// Create an Id from big-endian bytes
    pub fn from_bytes(bytes: [u8; ID_SIZE]) -> Self {
        Id(u128::from_be_bytes(bytes))
    }

    pub fn to_bytes(&self) -> [u8; ID_SIZE] {
        self.0.to_be_bytes()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| ProtocolError::InvalidId(e.to_string()))?;
        if bytes.len() != ID_SIZE {
            return Err(ProtocolError::InvalidIdLength {
                expected: ID_SIZE,
                actual: bytes.len(),
            });
        }

        let mut arr = [0u8; ID_SIZE];
        arr.copy_from_slice(&bytes);
        Ok(Id::from_bytes(arr))
    }

    /// Draw a uniformly random identifier
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Id(rng.gen())
    }

    /// Derive an identifier from arbitrary key material
    ///
    /// Uses BLAKE2b-512 truncated to the first 16 bytes.
    pub fn hash_of(material: &[u8]) -> Self {
        let hash = Blake2b512::digest(material);
        let mut arr = [0u8; ID_SIZE];
        arr.copy_from_slice(&hash[..ID_SIZE]);
        Id::from_bytes(arr)
    }

    /// Number of whole digits of `digit_bits` width in an identifier
    ///
    /// Trailing bits that do not form a whole digit are ignored by routing.
    pub const fn num_digits(digit_bits: u32) -> usize {
        (ID_BIT_LENGTH / digit_bits) as usize
    }

    fn digit_shift(index: usize, digit_bits: u32) -> u32 {
        ID_BIT_LENGTH - (index as u32 + 1) * digit_bits
    }

    /// Value of digit `index`, counted from the most significant end
    pub fn digit(&self, index: usize, digit_bits: u32) -> usize {
        debug_assert!(index < Self::num_digits(digit_bits));
        let mask = (1u128 << digit_bits) - 1;
        ((self.0 >> Self::digit_shift(index, digit_bits)) & mask) as usize
    }

    /// Copy of this Id with digit `index` replaced by `value`
    pub fn with_digit(&self, index: usize, value: usize, digit_bits: u32) -> Result<Self> {
        check_digit_bits(digit_bits)?;
        let digits = Self::num_digits(digit_bits);
        if index >= digits {
            return Err(ProtocolError::DigitOutOfRange { index, digits });
        }

        let mask = (1u128 << digit_bits) - 1;
        let shift = Self::digit_shift(index, digit_bits);
        let cleared = self.0 & !(mask << shift);
        Ok(Id(cleared | ((value as u128 & mask) << shift)))
    }

    /// Shorter-arc distance between two identifiers
    pub fn distance(&self, other: &Id) -> Distance {
        let d = self.0.wrapping_sub(other.0);
        Distance(d.min(d.wrapping_neg()))
    }

    /// Longer-arc distance between two identifiers
    ///
    /// Used when a candidate lies across the ring from the side that measures it.
    pub fn long_distance(&self, other: &Id) -> Distance {
        let d = self.0.wrapping_sub(other.0);
        Distance(d.max(d.wrapping_neg()))
    }

    /// Whether `other` lies on the clockwise half-ring starting at `self`
    ///
    /// The antipode counts as clockwise from both sides; an Id is never
    /// clockwise of itself.
    pub fn clockwise(&self, other: &Id) -> bool {
        let d = other.0.wrapping_sub(self.0);
        d != 0 && d <= HALF_RING
    }

    /// Index of the most significant differing digit
    ///
    /// Equal to the number of leading digits the two identifiers share.
    /// Returns `None` when they agree on every whole digit.
    pub fn index_of_msdd(&self, other: &Id, digit_bits: u32) -> Option<usize> {
        let diff = self.0 ^ other.0;
        if diff == 0 {
            return None;
        }

        let index = (diff.leading_zeros() / digit_bits) as usize;
        if index >= Self::num_digits(digit_bits) {
            None
        } else {
            Some(index)
        }
    }

    /// Whether this Id lies on the clockwise arc from `ccw` to `cw`, inclusive
    pub fn is_between(&self, ccw: &Id, cw: &Id) -> bool {
        self.0.wrapping_sub(ccw.0) <= cw.0.wrapping_sub(ccw.0)
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self.to_hex())
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<0x{}..>", &self.to_hex()[..8])
    }
}

impl From<u128> for Id {
    fn from(value: u128) -> Self {
        Id(value)
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Id::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Numeric distance between two identifiers
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Distance(u128);

impl Distance {
    pub const ZERO: Distance = Distance(0);

    pub const fn as_u128(&self) -> u128 {
        self.0
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({:#x})", self.0)
    }
}
