use bytes::Bytes;
use dashmap::DashMap;
use std::collections::BTreeMap;
use tlf_core::{
    BlockContext, BlockId, BlockRefMap, BlockRefStatus, BlockServer, KeyServerHalf, RefNonce,
    TlfError, TlfId, TlfResult,
};

#[derive(Debug)]
struct BlockEntry {
    buf: Bytes,
    server_half: KeyServerHalf,
    refs: BlockRefMap,
}

/// An in-memory block authority shared by every device of a test.
#[derive(Debug, Default)]
pub struct MemoryBlockServer {
    blocks: DashMap<(TlfId, BlockId), BlockEntry>,
}

impl MemoryBlockServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blocks across all folders.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// The status of every reference to a stored block, or `None` once
    /// the block is gone.
    pub fn reference_statuses(
        &self,
        tlf: TlfId,
        id: BlockId,
    ) -> Option<BTreeMap<RefNonce, BlockRefStatus>> {
        self.blocks
            .get(&(tlf, id))
            .map(|entry| entry.refs.get_statuses())
    }
}

#[async_trait::async_trait]
impl BlockServer for MemoryBlockServer {
    async fn get(
        &self,
        tlf: TlfId,
        id: BlockId,
        context: BlockContext,
    ) -> TlfResult<(Bytes, KeyServerHalf)> {
        let entry = self
            .blocks
            .get(&(tlf, id))
            .ok_or(TlfError::BlockNonExistent(id))?;
        if !entry.refs.check_exists(&context)? {
            return Err(TlfError::BlockNonExistent(id).into());
        }
        Ok((entry.buf.clone(), entry.server_half))
    }

    async fn put(
        &self,
        tlf: TlfId,
        id: BlockId,
        context: BlockContext,
        buf: Bytes,
        server_half: KeyServerHalf,
    ) -> TlfResult<()> {
        context.validate_put(true, &id, &buf)?;
        let mut entry = self.blocks.entry((tlf, id)).or_insert_with(|| BlockEntry {
            buf,
            server_half,
            refs: BlockRefMap::new(),
        });
        if entry.server_half != server_half {
            return Err(TlfError::ServerHalfMismatch(id).into());
        }
        entry.refs.put(context, BlockRefStatus::Live, "")?;
        Ok(())
    }

    async fn add_block_reference(
        &self,
        tlf: TlfId,
        id: BlockId,
        context: BlockContext,
    ) -> TlfResult<()> {
        let mut entry = self
            .blocks
            .get_mut(&(tlf, id))
            .ok_or(TlfError::BlockNonExistent(id))?;
        entry.refs.put(context, BlockRefStatus::Live, "")?;
        Ok(())
    }

    async fn remove_block_references(
        &self,
        tlf: TlfId,
        contexts: BTreeMap<BlockId, Vec<BlockContext>>,
    ) -> TlfResult<BTreeMap<BlockId, usize>> {
        let mut live = BTreeMap::new();
        for (id, id_contexts) in contexts {
            let key = (tlf, id);
            let (count, empty) = match self.blocks.get_mut(&key) {
                Some(mut entry) => {
                    for context in &id_contexts {
                        entry.refs.remove(context, "")?;
                    }
                    (entry.refs.live_count(), entry.refs.is_empty())
                }
                None => (0, false),
            };
            if empty {
                self.blocks.remove(&key);
            }
            live.insert(id, count);
        }
        Ok(live)
    }

    async fn archive_block_references(
        &self,
        tlf: TlfId,
        contexts: BTreeMap<BlockId, Vec<BlockContext>>,
    ) -> TlfResult<()> {
        for (id, id_contexts) in contexts {
            let mut entry = self
                .blocks
                .get_mut(&(tlf, id))
                .ok_or(TlfError::BlockNonExistent(id))?;
            for context in id_contexts {
                entry.refs.put(context, BlockRefStatus::Archived, "")?;
            }
        }
        Ok(())
    }
}
