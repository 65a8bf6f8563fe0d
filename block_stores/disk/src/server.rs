use crate::BlockDiskStore;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tlf_core::{
    BlockContext, BlockId, BlockServer, KeyServerHalf, TlfError, TlfId, TlfResult,
};
use tracing::debug;

/// A block authority persisting each folder's blocks in its own
/// [`BlockDiskStore`] under `<root>/<tlf id>/`.
#[derive(Debug)]
pub struct DiskBlockServer {
    root: PathBuf,
    stores: DashMap<TlfId, Arc<BlockDiskStore>>,
}

impl DiskBlockServer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            stores: DashMap::new(),
        }
    }

    pub fn store(&self, tlf: TlfId) -> Arc<BlockDiskStore> {
        self.stores
            .entry(tlf)
            .or_insert_with(|| Arc::new(BlockDiskStore::new(self.root.join(tlf.to_hex()))))
            .clone()
    }

    async fn require_data(store: &BlockDiskStore, id: BlockId) -> TlfResult<()> {
        if !store.has_data(id).await? {
            return Err(TlfError::BlockNonExistent(id).into());
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl BlockServer for DiskBlockServer {
    async fn get(
        &self,
        tlf: TlfId,
        id: BlockId,
        context: BlockContext,
    ) -> TlfResult<(Bytes, KeyServerHalf)> {
        let (buf, half) = self.store(tlf).get(id, context).await?;
        Ok((Bytes::from(buf), half))
    }

    async fn put(
        &self,
        tlf: TlfId,
        id: BlockId,
        context: BlockContext,
        buf: Bytes,
        server_half: KeyServerHalf,
    ) -> TlfResult<()> {
        self.store(tlf)
            .put(id, context, &buf, server_half, true)
            .await?;
        Ok(())
    }

    async fn add_block_reference(
        &self,
        tlf: TlfId,
        id: BlockId,
        context: BlockContext,
    ) -> TlfResult<()> {
        let store = self.store(tlf);
        Self::require_data(&store, id).await?;
        store.add_reference(id, context, "").await
    }

    async fn remove_block_references(
        &self,
        tlf: TlfId,
        contexts: BTreeMap<BlockId, Vec<BlockContext>>,
    ) -> TlfResult<BTreeMap<BlockId, usize>> {
        let store = self.store(tlf);
        let mut live = BTreeMap::new();
        for (id, id_contexts) in contexts {
            let count = store.remove_references(id, &id_contexts, "").await?;
            if !store.has_any_ref(id).await? {
                store.remove(id).await?;
                debug!(tlf = %tlf, block = %id, "deleted unreferenced block");
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
        let store = self.store(tlf);
        for id in contexts.keys() {
            Self::require_data(&store, *id).await?;
        }
        store.archive_references(&contexts, "").await
    }
}
