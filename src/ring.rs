//! 256-bit ring arithmetic (C1).
//!
//! A [`Coord`] is a 32-byte big-endian unsigned integer modulo 2^256,
//! representing either a peer's position on the ring or a routing key.
//! Distance between two coordinates is measured byte-wise with XOR;
//! direction ("successor"/"predecessor") is resolved by lexicographic
//! compare, which agrees with numeric compare for big-endian bytes.

use std::fmt;

use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid coordinate length")]
    InvalidLength,
    #[error("invalid base64url encoding: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// A 32-byte ring coordinate (I1: always exactly 32 bytes).
#[derive(Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Coord([u8; 32]);

impl Coord {
    pub const ZERO: Coord = Coord([0u8; 32]);
    pub const MAX: Coord = Coord([0xffu8; 32]);

    /// Hash arbitrary bytes (a peer id or a key) into a ring coordinate via a
    /// collision-resistant 32-byte digest.
    pub fn hash(bytes: impl AsRef<[u8]>) -> Self {
        let digest = Sha256::digest(bytes.as_ref());
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Self(out)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Encode as unpadded base64url, per the wire format in spec §6.
    pub fn encode(&self) -> String {
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(self.0)
    }

    pub fn decode(s: &str) -> Result<Self, ParseError> {
        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(s)?;
        if bytes.len() != 32 {
            return Err(ParseError::InvalidLength);
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }

    /// Byte-wise XOR distance between two coordinates.
    pub fn xor_distance(&self, other: &Coord) -> Coord {
        let mut out = [0u8; 32];
        for i in 0..32 {
            out[i] = self.0[i] ^ other.0[i];
        }
        Coord(out)
    }

    /// Lexicographic compare, equivalent to numeric compare on big-endian bytes.
    pub fn lex_less(&self, other: &Coord) -> bool {
        self.0 < other.0
    }

    /// Count of leading zero bits.
    pub fn leading_zero_bits(&self) -> u32 {
        let mut count = 0u32;
        for byte in &self.0 {
            if *byte == 0 {
                count += 8;
            } else {
                count += byte.leading_zeros();
                break;
            }
        }
        count
    }

    /// Normalized log distance in [0, 1]: `1 - leading_zero_bits(xor(self,
    /// other)) / 256`, clamped to [0, 1]. Used by the relevance model and the
    /// cost-function selector (§4.1).
    pub fn normalized_log_distance(&self, other: &Coord) -> f64 {
        let lz = self.xor_distance(other).leading_zero_bits();
        (1.0 - (lz as f64) / 256.0).clamp(0.0, 1.0)
    }

    /// Add a (big-endian) u128 value to this coordinate, wrapping at 2^256.
    pub fn wrapping_add_u128(&self, amount: u128) -> Coord {
        let mut out = self.0;
        let bytes = amount.to_be_bytes();
        let mut carry: u16 = 0;
        for i in 0..16 {
            let idx = 31 - i;
            let sum = out[idx] as u16 + bytes[15 - i] as u16 + carry;
            out[idx] = (sum & 0xff) as u8;
            carry = sum >> 8;
        }
        let mut idx = 15i32;
        while carry > 0 && idx >= 0 {
            let sum = out[idx as usize] as u16 + carry;
            out[idx as usize] = (sum & 0xff) as u8;
            carry = sum >> 8;
            idx -= 1;
        }
        Coord(out)
    }

    /// Divide this coordinate (interpreted as an unsigned 256-bit integer) by
    /// a small positive divisor, used by the near-radius / near-zone
    /// computations in §4.7 (`2^256 / n`).
    pub fn div_u64(&self, divisor: u64) -> Coord {
        assert!(divisor > 0);
        let mut out = [0u8; 32];
        let mut rem: u64 = 0;
        for i in 0..32 {
            let cur = (rem << 8) | self.0[i] as u64;
            out[i] = (cur / divisor) as u8;
            rem = cur % divisor;
        }
        Coord(out)
    }

    /// Multiply this coordinate by a small scalar, saturating at [`Coord::MAX`].
    pub fn saturating_mul_u64(&self, factor: u64) -> Coord {
        let mut out = [0u16; 32];
        let mut carry: u64 = 0;
        for i in (0..32).rev() {
            let prod = self.0[i] as u64 * factor + carry;
            out[i] = (prod & 0xff) as u16;
            carry = prod >> 8;
        }
        if carry > 0 {
            return Coord::MAX;
        }
        let mut bytes = [0u8; 32];
        for i in 0..32 {
            bytes[i] = out[i] as u8;
        }
        Coord(bytes)
    }
}

impl AsRef<[u8]> for Coord {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Coord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Coord({})", self.encode())
    }
}

impl fmt::Display for Coord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

impl Serialize for Coord {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for Coord {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Coord::decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Direction of a ring walk, used by [`crate::digitree::Digitree`] neighbor
/// queries (§4.1, §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Enumerate coordinates greater than the probe, wrapping past 2^256
    /// back to 0 ("right"/successor walk).
    Right,
    /// Enumerate coordinates strictly less than the probe, wrapping from 0
    /// to 2^256 ("left"/predecessor walk).
    Left,
}

/// Tie-break comparator for entries sharing a coordinate: lexicographic on
/// id (§4.1).
pub fn tie_break<'a>(a: (&'a Coord, &'a str), b: (&'a Coord, &'a str)) -> std::cmp::Ordering {
    a.0.cmp(b.0).then_with(|| a.1.cmp(b.1))
}

#[cfg(test)]
mod test {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn test_xor_distance_identity() {
        let a = Coord::hash("peer-a");
        assert_eq!(a.xor_distance(&a), Coord::ZERO);
    }

    #[test]
    fn test_xor_distance_symmetric() {
        let a = Coord::hash("peer-a");
        let b = Coord::hash("peer-b");
        assert_eq!(a.xor_distance(&b), b.xor_distance(&a));
    }

    #[test]
    fn test_leading_zero_bits_zero_is_all() {
        assert_eq!(Coord::ZERO.leading_zero_bits(), 256);
    }

    #[test]
    fn test_leading_zero_bits_max_is_none() {
        assert_eq!(Coord::MAX.leading_zero_bits(), 0);
    }

    #[test]
    fn test_normalized_log_distance_bounds() {
        let a = Coord::hash("x");
        assert_eq!(a.normalized_log_distance(&a), 0.0);
        assert_eq!(Coord::ZERO.normalized_log_distance(&Coord::MAX), 1.0);
    }

    #[quickcheck]
    fn prop_normalized_log_distance_in_bounds(seed_a: u64, seed_b: u64) -> bool {
        let a = Coord::hash(seed_a.to_be_bytes());
        let b = Coord::hash(seed_b.to_be_bytes());
        let d = a.normalized_log_distance(&b);
        (0.0..=1.0).contains(&d)
    }

    #[test]
    fn test_base64url_round_trip() {
        let c = Coord::hash("round-trip");
        let encoded = c.encode();
        assert!(!encoded.contains('='));
        assert_eq!(Coord::decode(&encoded).unwrap(), c);
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        assert!(Coord::decode("YWJj").is_err());
    }

    #[test]
    fn test_div_u64_roundish() {
        // 2^256 / 4 should have its top two bits cleared relative to MAX scaled.
        let full = Coord::MAX;
        let quarter = full.div_u64(4);
        assert!(quarter.lex_less(&full));
    }
}
