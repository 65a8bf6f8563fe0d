//! Sealing blocks for the block server, opening what comes back, and the
//! plaintext cache in between.

use bytes::Bytes;
use dashmap::DashMap;
use tlf_core::crypto::{block_key, decrypt, encrypt};
use tlf_core::{
    BlockContext, BlockId, BlockPointer, DirBlock, KeyGen, KeyServerHalf, TlfCryptKey, TlfResult,
    UserId,
};

/// A staged read hit a block that is not in the cache yet.
#[derive(Debug, thiserror::Error)]
#[error("block {} is not cached", .0.id)]
pub(crate) struct MissingBlock(pub(crate) BlockPointer);

/// A block ready to be put.
#[derive(Debug, Clone)]
pub(crate) struct BlockPut {
    pub ptr: BlockPointer,
    pub payload: Bytes,
    pub half: KeyServerHalf,
    pub plain: Bytes,
}

/// Seals plaintext blocks under one key generation.
pub(crate) struct Sealer {
    key: Option<TlfCryptKey>,
    key_gen: KeyGen,
    creator: UserId,
}

impl Sealer {
    /// `key` is `None` for public folders, whose blocks are stored in
    /// plaintext with an all-zero server half.
    pub fn new(key: Option<TlfCryptKey>, key_gen: KeyGen, creator: UserId) -> Self {
        Self {
            key,
            key_gen,
            creator,
        }
    }

    pub fn seal(&self, plain: Bytes) -> TlfResult<BlockPut> {
        let (payload, half) = match &self.key {
            Some(key) => {
                let half = KeyServerHalf::random();
                let payload = encrypt(&block_key(key, &half), &plain)?;
                (Bytes::from(payload), half)
            }
            None => (plain.clone(), KeyServerHalf([0u8; 32])),
        };
        let ptr = BlockPointer {
            id: BlockId::from_payload(&payload),
            key_gen: self.key_gen,
            data_ver: BlockPointer::DATA_VER,
            context: BlockContext::first(self.creator),
            encoded_size: u32::try_from(payload.len())?,
        };
        Ok(BlockPut {
            ptr,
            payload,
            half,
            plain,
        })
    }
}

/// Verifies a fetched payload against its pointer and decrypts it.
pub(crate) fn open_block(
    ptr: &BlockPointer,
    payload: &[u8],
    half: &KeyServerHalf,
    key: Option<&TlfCryptKey>,
) -> TlfResult<Bytes> {
    ptr.id.verify(payload)?;
    match key {
        Some(key) => Ok(decrypt(&block_key(key, half), payload)?.into()),
        None => Ok(Bytes::copy_from_slice(payload)),
    }
}

/// Plaintext of blocks this engine has read or written, by block ID.
#[derive(Debug, Default)]
pub(crate) struct BlockCache {
    blocks: DashMap<BlockId, Bytes>,
}

impl BlockCache {
    pub fn get(&self, id: &BlockId) -> Option<Bytes> {
        self.blocks.get(id).map(|b| b.clone())
    }

    pub fn insert(&self, id: BlockId, plain: Bytes) {
        self.blocks.insert(id, plain);
    }

    pub fn clear(&self) {
        self.blocks.clear();
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// The directory block behind `ptr`; an invalid pointer is a directory
    /// that has never been written.
    pub fn dir(&self, ptr: &BlockPointer) -> TlfResult<DirBlock> {
        if !ptr.is_valid() {
            return Ok(DirBlock::new());
        }
        let plain = self.get(&ptr.id).ok_or(MissingBlock(*ptr))?;
        Ok(DirBlock::from_bytes(&plain)?)
    }

    pub fn file(&self, ptr: &BlockPointer) -> TlfResult<Vec<u8>> {
        if !ptr.is_valid() {
            return Ok(Vec::new());
        }
        let plain = self.get(&ptr.id).ok_or(MissingBlock(*ptr))?;
        Ok(plain.to_vec())
    }
}

/// Finds a [`MissingBlock`] in an error chain.
pub(crate) fn missing_block(err: &anyhow::Error) -> Option<BlockPointer> {
    err.chain()
        .find_map(|e| e.downcast_ref::<MissingBlock>())
        .map(|m| m.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_blocks_round_trip() {
        let key = TlfCryptKey::from_bytes([9u8; 32]);
        let sealer = Sealer::new(Some(key), KeyGen::FIRST, UserId::random());
        let put = sealer.seal(Bytes::from_static(b"hello")).unwrap();
        assert_ne!(&put.payload[..], b"hello");
        assert!(put.ptr.is_valid());

        let key = TlfCryptKey::from_bytes([9u8; 32]);
        let plain = open_block(&put.ptr, &put.payload, &put.half, Some(&key)).unwrap();
        assert_eq!(&plain[..], b"hello");
    }

    #[test]
    fn public_blocks_are_deterministic() {
        let sealer = Sealer::new(None, KeyGen::PUBLIC, UserId::random());
        let a = sealer.seal(Bytes::from_static(b"same")).unwrap();
        let b = sealer.seal(Bytes::from_static(b"same")).unwrap();
        assert_eq!(a.ptr.id, b.ptr.id);
        assert_eq!(a.half, b.half);
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let sealer = Sealer::new(None, KeyGen::PUBLIC, UserId::random());
        let put = sealer.seal(Bytes::from_static(b"data")).unwrap();
        assert!(open_block(&put.ptr, b"other", &put.half, None).is_err());
    }

    #[test]
    fn uncached_blocks_are_reported() {
        let cache = BlockCache::default();
        let sealer = Sealer::new(None, KeyGen::PUBLIC, UserId::random());
        let put = sealer.seal(Bytes::from_static(b"data")).unwrap();

        let err = cache.file(&put.ptr).unwrap_err();
        assert_eq!(missing_block(&err), Some(put.ptr));

        cache.insert(put.ptr.id, put.plain.clone());
        assert_eq!(cache.file(&put.ptr).unwrap(), b"data");
    }
}
