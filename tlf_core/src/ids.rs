//! Fixed-size identifiers and revision numbers.

use minicbor::encode::Write;
use minicbor::{Decode, Decoder, Encode, Encoder, decode, encode};
use rand::Rng;
use std::fmt;
use std::str::FromStr;

macro_rules! fixed_bytes_id {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Default)]
        pub struct $name([u8; $len]);

        impl $name {
            pub const SIZE: usize = $len;

            pub const fn from_bytes(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                data_encoding::HEXLOWER.encode(&self.0)
            }

            pub fn is_zero(&self) -> bool {
                self.0.iter().all(|b| *b == 0)
            }

            pub fn random() -> Self {
                let mut bytes = [0u8; $len];
                rand::rng().fill(&mut bytes[..]);
                Self(bytes)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_tuple(stringify!($name)).field(&self.to_hex()).finish()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let bytes = data_encoding::HEXLOWER_PERMISSIVE.decode(s.as_bytes())?;
                let bytes: [u8; $len] = bytes.try_into().map_err(|v: Vec<u8>| {
                    anyhow::anyhow!(
                        "{}: expected {} bytes, got {}",
                        stringify!($name),
                        $len,
                        v.len()
                    )
                })?;
                Ok(Self(bytes))
            }
        }

        impl<C> Encode<C> for $name {
            fn encode<W: Write>(
                &self,
                e: &mut Encoder<W>,
                _: &mut C,
            ) -> Result<(), encode::Error<W::Error>> {
                e.bytes(&self.0)?;
                Ok(())
            }
        }

        impl<'b, C> Decode<'b, C> for $name {
            fn decode(d: &mut Decoder<'b>, _: &mut C) -> Result<Self, decode::Error> {
                let p = d.position();
                let bytes: [u8; $len] = d.bytes()?.try_into().map_err(|_| {
                    decode::Error::message(concat!(stringify!($name), " has wrong length")).at(p)
                })?;
                Ok(Self(bytes))
            }
        }
    };
}

fixed_bytes_id!(
    /// Identifies one top-level folder.
    TlfId,
    16
);

fixed_bytes_id!(
    /// Identifies a user (or team) acting as writer/reader.
    UserId,
    16
);

fixed_bytes_id!(
    /// Identifies an unmerged branch. The all-zero value is the mainline.
    BranchId,
    16
);

fixed_bytes_id!(
    /// BLAKE3 digest of a signed revision's encoded bare metadata.
    MdId,
    32
);

impl BranchId {
    /// The branch ID of the merged mainline.
    pub const NULL: BranchId = BranchId([0u8; 16]);

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }
}

impl MdId {
    /// Computes the ID of an encoded bare revision.
    pub fn of_encoded(buf: &[u8]) -> Self {
        Self(*blake3::hash(buf).as_bytes())
    }
}

/// A revision number within a folder-branch history.
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Default, Encode, Decode)]
#[cbor(transparent)]
pub struct Revision(#[n(0)] pub u64);

impl Revision {
    /// No revision has been observed yet.
    pub const UNINITIALIZED: Revision = Revision(0);
    /// The first revision of every folder.
    pub const INITIAL: Revision = Revision(1);

    pub fn next(self) -> Revision {
        Revision(self.0 + 1)
    }

    /// The previous revision, saturating at `UNINITIALIZED`.
    pub fn prev(self) -> Revision {
        Revision(self.0.saturating_sub(1))
    }

    pub fn is_initialized(self) -> bool {
        self != Self::UNINITIALIZED
    }
}

impl fmt::Debug for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Revision({})", self.0)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A generation of a folder's symmetric key.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Encode, Decode)]
#[cbor(transparent)]
pub struct KeyGen(#[n(0)] pub u32);

impl KeyGen {
    /// Public folders have no key generation.
    pub const PUBLIC: KeyGen = KeyGen(0);
    pub const FIRST: KeyGen = KeyGen(1);
}

impl Default for KeyGen {
    fn default() -> Self {
        KeyGen::FIRST
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trips_through_from_str() {
        let id = TlfId::random();
        let parsed: TlfId = id.to_hex().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("abcd".parse::<TlfId>().is_err());
    }

    #[test]
    fn null_branch_is_zero() {
        assert!(BranchId::NULL.is_null());
        assert!(BranchId::default().is_null());
        assert!(!BranchId::random().is_null());
    }

    #[test]
    fn revision_helpers() {
        assert_eq!(Revision::INITIAL.next(), Revision(2));
        assert_eq!(Revision::UNINITIALIZED.prev(), Revision::UNINITIALIZED);
        assert!(!Revision::UNINITIALIZED.is_initialized());
    }
}
