//! Block identifiers, pointers and reference bookkeeping.

use crate::TlfError;
use crate::ids::{KeyGen, UserId};
use minicbor::encode::Write;
use minicbor::{Decode, Decoder, Encode, Encoder, decode, encode};
use rand::Rng;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Hash type prefix for BLAKE3-256 content hashes of encrypted payloads.
pub const HASH_TYPE_BLAKE3: u8 = 0x1f;

/// Content hash of an encrypted block payload.
///
/// Serialized (and stored on disk) as the lowercase hex string of the
/// hash-type byte followed by the 32-byte digest.
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlockId {
    hash_type: u8,
    digest: [u8; 32],
}

impl BlockId {
    /// Computes the ID of an (already encrypted) payload.
    pub fn from_payload(buf: &[u8]) -> Self {
        Self {
            hash_type: HASH_TYPE_BLAKE3,
            digest: *blake3::hash(buf).as_bytes(),
        }
    }

    pub const fn from_parts(hash_type: u8, digest: [u8; 32]) -> Self {
        Self { hash_type, digest }
    }

    /// Returns an error unless `buf` hashes to this ID.
    pub fn verify(&self, buf: &[u8]) -> Result<(), TlfError> {
        if self.hash_type != HASH_TYPE_BLAKE3 {
            return Err(TlfError::InvalidBlockPut(format!(
                "unknown hash type {:#x}",
                self.hash_type
            )));
        }
        let actual = Self::from_payload(buf);
        if actual != *self {
            return Err(TlfError::HashMismatch {
                expected: *self,
                actual,
            });
        }
        Ok(())
    }

    pub fn digest(&self) -> &[u8; 32] {
        &self.digest
    }

    pub fn is_valid(&self) -> bool {
        self.hash_type != 0 && self.digest.iter().any(|b| *b != 0)
    }

    pub fn to_hex(&self) -> String {
        let mut buf = Vec::with_capacity(33);
        buf.push(self.hash_type);
        buf.extend_from_slice(&self.digest);
        data_encoding::HEXLOWER.encode(&buf)
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BlockId").field(&self.to_hex()).finish()
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for BlockId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = data_encoding::HEXLOWER_PERMISSIVE.decode(s.trim().as_bytes())?;
        if bytes.len() != 33 {
            anyhow::bail!("block id: expected 33 bytes, got {}", bytes.len());
        }
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&bytes[1..]);
        Ok(Self {
            hash_type: bytes[0],
            digest,
        })
    }
}

impl<C> Encode<C> for BlockId {
    fn encode<W: Write>(
        &self,
        e: &mut Encoder<W>,
        _: &mut C,
    ) -> Result<(), encode::Error<W::Error>> {
        let mut buf = [0u8; 33];
        buf[0] = self.hash_type;
        buf[1..].copy_from_slice(&self.digest);
        e.bytes(&buf)?;
        Ok(())
    }
}

impl<'b, C> Decode<'b, C> for BlockId {
    fn decode(d: &mut Decoder<'b>, _: &mut C) -> Result<Self, decode::Error> {
        let p = d.position();
        let bytes = d.bytes()?;
        if bytes.len() != 33 {
            return Err(decode::Error::message("block id has wrong length").at(p));
        }
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&bytes[1..]);
        Ok(Self {
            hash_type: bytes[0],
            digest,
        })
    }
}

/// Disambiguates independent references to the same block content.
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Default, Encode, Decode)]
#[cbor(transparent)]
pub struct RefNonce(#[n(0)] pub u64);

impl RefNonce {
    /// The nonce of the first reference to a block, created by `put`.
    pub const ZERO: RefNonce = RefNonce(0);

    pub fn random() -> Self {
        loop {
            let n: u64 = rand::rng().random();
            if n != 0 {
                return RefNonce(n);
            }
        }
    }
}

impl fmt::Debug for RefNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RefNonce({:016x})", self.0)
    }
}

/// Who created a reference, who wrote it, and which reference it is.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Encode, Decode)]
#[cbor(map)]
pub struct BlockContext {
    #[n(0)]
    pub creator: UserId,
    #[n(1)]
    pub writer: UserId,
    #[n(2)]
    pub ref_nonce: RefNonce,
}

impl BlockContext {
    /// Context for the first reference created by `uid`.
    pub fn first(uid: UserId) -> Self {
        Self {
            creator: uid,
            writer: uid,
            ref_nonce: RefNonce::ZERO,
        }
    }

    /// A new, independent reference to an existing block, written by `writer`.
    pub fn new_reference(&self, writer: UserId) -> Self {
        Self {
            creator: self.creator,
            writer,
            ref_nonce: RefNonce::random(),
        }
    }

    /// Checks a put of `buf` under this context. The first (regular) put
    /// of a block must come from its creator with the zero nonce.
    pub fn validate_put(&self, is_regular_put: bool, id: &BlockId, buf: &[u8]) -> Result<(), TlfError> {
        if is_regular_put {
            if self.creator != self.writer {
                return Err(TlfError::InvalidBlockPut(format!(
                    "writer {} is not the creator {} of block {id}",
                    self.writer, self.creator
                )));
            }
            if self.ref_nonce != RefNonce::ZERO {
                return Err(TlfError::InvalidBlockPut(format!(
                    "non-zero reference nonce for the first put of block {id}"
                )));
            }
        }
        id.verify(buf)
    }
}

/// Points at one reference of one block.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Encode, Decode)]
#[cbor(map)]
pub struct BlockPointer {
    #[n(0)]
    pub id: BlockId,
    #[n(1)]
    pub key_gen: KeyGen,
    #[n(2)]
    pub data_ver: u8,
    #[n(3)]
    pub context: BlockContext,
    /// Encoded (encrypted) size, used for disk-usage accounting.
    #[n(4)]
    pub encoded_size: u32,
}

impl BlockPointer {
    pub const DATA_VER: u8 = 1;

    pub fn is_valid(&self) -> bool {
        self.id.is_valid()
    }
}

/// The encrypted key server half stored next to each block.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct KeyServerHalf(pub [u8; 32]);

impl KeyServerHalf {
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::rng().fill(&mut bytes[..]);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for KeyServerHalf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyServerHalf(..)")
    }
}

/// Whether a reference still keeps its block alive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode)]
#[cbor(index_only)]
pub enum BlockRefStatus {
    #[n(1)]
    Live,
    #[n(2)]
    Archived,
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
#[cbor(map)]
pub struct BlockRefEntry {
    #[n(0)]
    pub status: BlockRefStatus,
    #[n(1)]
    pub context: BlockContext,
    /// Tag of the most recent call that touched this entry.
    #[n(2)]
    pub most_recent_tag: String,
}

impl BlockRefEntry {
    fn check_context(&self, context: &BlockContext) -> Result<(), TlfError> {
        if self.context != *context {
            return Err(TlfError::RefContextMismatch {
                expected: self.context,
                actual: *context,
            });
        }
        Ok(())
    }
}

/// All references of one block, keyed by reference nonce.
#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode)]
#[cbor(transparent)]
pub struct BlockRefMap(#[n(0)] pub BTreeMap<RefNonce, BlockRefEntry>);

impl BlockRefMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn has_non_archived_ref(&self) -> bool {
        self.0.values().any(|e| e.status == BlockRefStatus::Live)
    }

    pub fn live_count(&self) -> usize {
        self.0
            .values()
            .filter(|e| e.status == BlockRefStatus::Live)
            .count()
    }

    /// Fails with a mismatch error if an entry with the same nonce has a
    /// different context.
    pub fn check_exists(&self, context: &BlockContext) -> Result<bool, TlfError> {
        match self.0.get(&context.ref_nonce) {
            Some(entry) => {
                entry.check_context(context)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn get_statuses(&self) -> BTreeMap<RefNonce, BlockRefStatus> {
        self.0.iter().map(|(n, e)| (*n, e.status)).collect()
    }

    /// Inserts or overwrites the entry for `context`.
    pub fn put(
        &mut self,
        context: BlockContext,
        status: BlockRefStatus,
        tag: &str,
    ) -> Result<(), TlfError> {
        if let Some(existing) = self.0.get(&context.ref_nonce) {
            existing.check_context(&context)?;
        }
        self.0.insert(
            context.ref_nonce,
            BlockRefEntry {
                status,
                context,
                most_recent_tag: tag.to_string(),
            },
        );
        Ok(())
    }

    /// Removes the entry for `context`. A non-empty `tag` that differs
    /// from the entry's most recent tag leaves the entry untouched.
    pub fn remove(&mut self, context: &BlockContext, tag: &str) -> Result<(), TlfError> {
        let Some(entry) = self.0.get(&context.ref_nonce) else {
            return Ok(());
        };
        entry.check_context(context)?;
        if !tag.is_empty() && entry.most_recent_tag != tag {
            return Ok(());
        }
        self.0.remove(&context.ref_nonce);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(nonce: u64) -> BlockContext {
        BlockContext {
            creator: UserId::from_bytes([1; 16]),
            writer: UserId::from_bytes([1; 16]),
            ref_nonce: RefNonce(nonce),
        }
    }

    #[test]
    fn block_id_hex_is_66_chars() {
        let id = BlockId::from_payload(b"hello");
        let hex = id.to_hex();
        assert_eq!(hex.len(), 66);
        assert_eq!(hex.parse::<BlockId>().unwrap(), id);
        assert!(id.verify(b"hello").is_ok());
        assert!(id.verify(b"hellO").is_err());
    }

    #[test]
    fn mismatched_context_is_rejected() {
        let mut refs = BlockRefMap::new();
        refs.put(ctx(5), BlockRefStatus::Live, "").unwrap();

        let mut other = ctx(5);
        other.writer = UserId::from_bytes([2; 16]);
        assert!(matches!(
            refs.put(other, BlockRefStatus::Live, ""),
            Err(TlfError::RefContextMismatch { .. })
        ));
        assert!(refs.check_exists(&other).is_err());
        assert!(refs.check_exists(&ctx(5)).unwrap());
        assert!(!refs.check_exists(&ctx(6)).unwrap());
    }

    #[test]
    fn stale_tag_leaves_entry_alone() {
        let mut refs = BlockRefMap::new();
        refs.put(ctx(1), BlockRefStatus::Live, "t1").unwrap();
        refs.put(ctx(1), BlockRefStatus::Archived, "t2").unwrap();

        refs.remove(&ctx(1), "t1").unwrap();
        assert_eq!(refs.len(), 1);

        refs.remove(&ctx(1), "t2").unwrap();
        assert!(refs.is_empty());
    }

    #[test]
    fn refs_round_trip_through_cbor() {
        let mut refs = BlockRefMap::new();
        refs.put(ctx(0), BlockRefStatus::Live, "").unwrap();
        refs.put(ctx(9), BlockRefStatus::Archived, "gc").unwrap();
        let buf = minicbor::to_vec(&refs).unwrap();
        let decoded: BlockRefMap = minicbor::decode(&buf).unwrap();
        assert_eq!(decoded, refs);
        assert_eq!(decoded.live_count(), 1);
    }
}
