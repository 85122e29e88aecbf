//! 256-bit node and value identifiers.
//!
//! Every object in the Boson overlay - nodes, values, peers - lives in one
//! 256-bit key space. Closeness is XOR distance interpreted as a big-endian
//! unsigned integer, which is what makes the k-bucket tree work.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::DhtError;

/// Identifier width in bytes.
pub const ID_BYTES: usize = 32;

/// Identifier width in bits.
pub const ID_BITS: usize = 256;

/// A 256-bit identifier in the Boson key space.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id([u8; ID_BYTES]);

impl Id {
    /// The all-zero identifier.
    pub const MIN: Id = Id([0u8; ID_BYTES]);

    /// The all-ones identifier.
    pub const MAX: Id = Id([0xff; ID_BYTES]);

    /// Build an id from exactly [`ID_BYTES`] bytes.
    pub fn of(bytes: &[u8]) -> Result<Self, DhtError> {
        if bytes.len() != ID_BYTES {
            return Err(DhtError::Protocol(format!(
                "id must be {} bytes, got {}",
                ID_BYTES,
                bytes.len()
            )));
        }
        let mut buf = [0u8; ID_BYTES];
        buf.copy_from_slice(bytes);
        Ok(Id(buf))
    }

    /// Build an id from an owned byte array.
    pub const fn from_bytes(bytes: [u8; ID_BYTES]) -> Self {
        Id(bytes)
    }

    /// A uniformly random identifier.
    pub fn random() -> Self {
        let mut buf = [0u8; ID_BYTES];
        rand::thread_rng().fill_bytes(&mut buf);
        Id(buf)
    }

    /// The SHA-256 digest of `data` as an identifier.
    ///
    /// This is how immutable values derive their id.
    pub fn sha256_of(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut buf = [0u8; ID_BYTES];
        buf.copy_from_slice(&digest);
        Id(buf)
    }

    /// Raw bytes of the identifier.
    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    /// XOR distance to `other`.
    pub fn distance(&self, other: &Id) -> Id {
        let mut buf = [0u8; ID_BYTES];
        for (i, b) in buf.iter_mut().enumerate() {
            *b = self.0[i] ^ other.0[i];
        }
        Id(buf)
    }

    /// The bit at position `index`, where bit 0 is the most significant
    /// bit of the first byte.
    pub fn bit_at(&self, index: usize) -> bool {
        debug_assert!(index < ID_BITS);
        let byte = index / 8;
        let mask = 0x80u8 >> (index % 8);
        self.0[byte] & mask != 0
    }

    /// Number of leading zero bits, 256 for the zero id.
    pub fn leading_zeros(&self) -> usize {
        for (i, b) in self.0.iter().enumerate() {
            if *b != 0 {
                return i * 8 + b.leading_zeros() as usize;
            }
        }
        ID_BITS
    }

    /// Compare `a` and `b` by XOR distance to `self`.
    ///
    /// Returns `Less` when `a` is closer to the target. Ids at equal
    /// distance order lexicographically, so the comparison is total.
    pub fn three_way_compare(&self, a: &Id, b: &Id) -> Ordering {
        for i in 0..ID_BYTES {
            let da = self.0[i] ^ a.0[i];
            let db = self.0[i] ^ b.0[i];
            if da != db {
                return da.cmp(&db);
            }
        }
        a.0.cmp(&b.0)
    }

    /// Hex rendering of the id, lowercase, no prefix.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps log lines readable.
        write!(f, "Id({}..)", &self.to_hex()[..8])
    }
}

impl FromStr for Id {
    type Err = DhtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)
            .map_err(|e| DhtError::Protocol(format!("invalid hex id: {}", e)))?;
        Id::of(&bytes)
    }
}

impl AsRef<[u8]> for Id {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_with_first_byte(b: u8) -> Id {
        let mut buf = [0u8; ID_BYTES];
        buf[0] = b;
        Id::from_bytes(buf)
    }

    #[test]
    fn test_of_rejects_wrong_length() {
        assert!(Id::of(&[0u8; 31]).is_err());
        assert!(Id::of(&[0u8; 33]).is_err());
        assert!(Id::of(&[0u8; 32]).is_ok());
    }

    #[test]
    fn test_distance_is_xor() {
        let a = id_with_first_byte(0b1010_0000);
        let b = id_with_first_byte(0b0110_0000);
        assert_eq!(a.distance(&b).as_bytes()[0], 0b1100_0000);
        assert_eq!(a.distance(&a), Id::MIN);
    }

    #[test]
    fn test_three_way_compare_orders_by_distance() {
        let target = id_with_first_byte(0);
        let near = id_with_first_byte(0x01);
        let far = id_with_first_byte(0x80);
        assert_eq!(target.three_way_compare(&near, &far), Ordering::Less);
        assert_eq!(target.three_way_compare(&far, &near), Ordering::Greater);
        assert_eq!(target.three_way_compare(&near, &near), Ordering::Equal);
    }

    #[test]
    fn test_three_way_compare_tie_breaks_lexicographically() {
        // Equal distance only happens for identical ids under XOR, so the
        // lexicographic branch is exercised via the total-order property.
        let target = Id::random();
        let a = Id::random();
        let b = Id::random();
        let ab = target.three_way_compare(&a, &b);
        let ba = target.three_way_compare(&b, &a);
        assert_eq!(ab, ba.reverse());
    }

    #[test]
    fn test_bit_at_msb_first() {
        let id = id_with_first_byte(0b1000_0001);
        assert!(id.bit_at(0));
        assert!(!id.bit_at(1));
        assert!(id.bit_at(7));
        assert!(!id.bit_at(8));
    }

    #[test]
    fn test_leading_zeros() {
        assert_eq!(Id::MIN.leading_zeros(), ID_BITS);
        assert_eq!(Id::MAX.leading_zeros(), 0);
        assert_eq!(id_with_first_byte(0x01).leading_zeros(), 7);
    }

    #[test]
    fn test_hex_round_trip() {
        let id = Id::random();
        let parsed: Id = id.to_hex().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_sha256_of_is_stable() {
        let a = Id::sha256_of(b"boson");
        let b = Id::sha256_of(b"boson");
        assert_eq!(a, b);
        assert_ne!(a, Id::sha256_of(b"bosons"));
    }
}
