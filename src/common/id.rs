//! Kademlia node Id, lookup target, or request token
use rand::Rng;
use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;

use crate::{Error, Result};

/// The size of node IDs in bytes.
pub const ID_SIZE: usize = 20;
/// The size of node IDs in bits.
pub const ID_BITS: usize = ID_SIZE * 8;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// Kademlia node Id, lookup target, or request token.
///
/// Also used as the random token correlating a request with its response.
pub struct Id(pub [u8; ID_SIZE]);

impl Id {
    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
    }

    /// Hash an arbitrary user key down to the 160 bit keyspace.
    pub fn hash<T: AsRef<[u8]>>(key: T) -> Id {
        Id(sha1_smol::Sha1::from(key.as_ref()).digest().bytes())
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(Error::InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp[..ID_SIZE].copy_from_slice(bytes);

        Ok(Id(tmp))
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    /// XOR metric. Distances compare as 160 bit big-endian unsigned integers,
    /// which [Ord] on the byte array already provides.
    pub fn xor(&self, other: &Id) -> Id {
        let mut result = [0; ID_SIZE];
        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        Id(result)
    }

    /// Returns the bit at `index`, where bit 0 is the most significant bit.
    pub fn bit(&self, index: usize) -> bool {
        debug_assert!(index < ID_BITS);

        self.0[index / 8] >> (7 - index % 8) & 1 == 1
    }

    /// Returns a copy of this Id with the bit at `index` flipped.
    pub fn with_flipped_bit(&self, index: usize) -> Id {
        debug_assert!(index < ID_BITS);

        let mut bytes = self.0;
        bytes[index / 8] ^= 1 << (7 - index % 8);

        Id(bytes)
    }

    /// Index of the most significant bit in which `self` and `other` differ,
    /// where bit 0 is the most significant. `None` for equal ids.
    pub fn highest_differing_bit(&self, other: &Id) -> Option<usize> {
        for (i, byte) in self.xor(other).0.iter().enumerate() {
            if *byte != 0 {
                return Some(i * 8 + byte.leading_zeros() as usize);
            }
        }

        None
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({self})")
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for Id {
    type Err = Error;

    fn from_str(s: &str) -> Result<Id> {
        if !s.is_ascii() {
            return Err(Error::InvalidIdEncoding);
        }
        if s.len() != ID_SIZE * 2 {
            return Err(Error::InvalidIdSize(s.len() / 2));
        }

        let mut bytes = [0; ID_SIZE];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| Error::InvalidIdEncoding)?;
        }

        Ok(Id(bytes))
    }
}
