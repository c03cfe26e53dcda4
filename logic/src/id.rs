use std::fmt;
use std::ops::BitXor;

use rand::distributions::{Distribution, Standard};
use rand::Rng;

use crate::consts::{ID_LEN, ID_LEN_BITS};

/// Fixed-width binary identifier.
///
/// Distance between two ids is their bitwise xor, compared as an
/// unsigned big-endian integer: the derived `Ord` on the xored value
/// gives exactly that order.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct Id(pub [u8; ID_LEN]);

impl Id {
    pub const ZERO: Id = Id([0u8; ID_LEN]);

    /// XOR metric, `distance(a, a) == Id::ZERO` and symmetric.
    pub fn distance(self, other: Id) -> Id {
        self ^ other
    }

    pub fn leading_zeros(&self) -> u32 {
        let mut res = 0u32;
        for x in self.0 {
            if x == 0 {
                res += 8;
            } else {
                res += x.leading_zeros();
                break;
            }
        }
        res
    }

    /// Bit at `index`, counting from the most significant one.
    pub fn bit(&self, index: usize) -> bool {
        debug_assert!(index < ID_LEN_BITS);
        let byte = self.0[index / 8];
        byte >> (7 - (index % 8)) & 1 == 1
    }

    /// Binary-string form ('0'/'1' chars, msb first), used for
    /// bucket-prefix matching.
    pub fn bits(&self) -> String {
        let mut res = String::with_capacity(ID_LEN_BITS);
        for i in 0..ID_LEN_BITS {
            res.push(if self.bit(i) { '1' } else { '0' });
        }
        res
    }

    /// Parses a hex string of any even length up to the id width,
    /// zero-filling the least significant bytes.
    pub fn from_hex(s: &str) -> Id {
        let raw = hex::decode(s).expect("invalid hex id");
        assert!(raw.len() <= ID_LEN, "hex id too long");
        let mut res = [0u8; ID_LEN];
        res[..raw.len()].copy_from_slice(&raw);
        Id(res)
    }

    pub fn as_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_short_hex(&self) -> String {
        let hex_id = self.as_hex();
        let trimmed = hex_id.trim_start_matches('0');
        if trimmed.is_empty() {
            "0".to_owned()
        } else {
            trimmed.to_owned()
        }
    }
}

impl BitXor for Id {
    type Output = Id;

    fn bitxor(self, rhs: Id) -> Id {
        let mut res = [0u8; ID_LEN];
        for (r, (a, b)) in res.iter_mut().zip(self.0.iter().zip(rhs.0.iter())) {
            *r = a ^ b;
        }
        Id(res)
    }
}

impl Distribution<Id> for Standard {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Id {
        let mut res = [0u8; ID_LEN];
        rng.fill_bytes(&mut res);
        Id(res)
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Id").field(&self.as_short_hex()).finish()
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_short_hex())
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Id {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_hex())
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for Id {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Id, D::Error> {
        use serde::de::Error;

        let text = String::deserialize(deserializer)?;
        let raw = hex::decode(&text).map_err(D::Error::custom)?;
        if raw.len() != ID_LEN {
            return Err(D::Error::custom("wrong id length"));
        }
        let mut res = [0u8; ID_LEN];
        res.copy_from_slice(&raw);
        Ok(Id(res))
    }
}

/// Stable ascending sort by xor distance from `target`.
pub fn sort_by_distance(ids: &mut [Id], target: Id) {
    ids.sort_by_key(|x| *x ^ target);
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;

    #[test]
    fn xor_metric() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..64 {
            let a: Id = rng.gen();
            let b: Id = rng.gen();
            assert_eq!(a.distance(a), Id::ZERO);
            assert_eq!(a.distance(b), b.distance(a));
            if a != b {
                assert!(a.distance(b) > Id::ZERO);
            }
        }
    }

    #[test]
    fn leading_zeros() {
        let mut a = Id::ZERO;
        a.0[9] = 2;
        assert_eq!(a.leading_zeros(), 9 * 8 + 6);
        a.0[0] = 1;
        assert_eq!(a.leading_zeros(), 7);
    }

    #[test]
    fn bits_round_trip() {
        let a = Id::from_hex("a003");
        let bits = a.bits();
        assert!(bits.starts_with("10100000000000000011"));
        assert_eq!(bits.len(), ID_LEN_BITS);
        assert!(a.bit(0));
        assert!(!a.bit(1));
        assert!(a.bit(2));
    }

    #[test]
    fn sorting_is_distance_ascending() {
        let target = Id::from_hex("aa");
        let mut ids = vec![
            Id::from_hex("00"),
            Id::from_hex("ab"),
            Id::from_hex("aa"),
            Id::from_hex("ff"),
        ];
        sort_by_distance(&mut ids, target);
        assert_eq!(ids[0], Id::from_hex("aa"));
        assert_eq!(ids[1], Id::from_hex("ab"));
    }
}
