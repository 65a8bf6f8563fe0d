//! Local block writes waiting to reach the remote block authority.

use anyhow::anyhow;
use minicbor::{Decode, Encode};
use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tlf_core::{BlockContext, BlockId, BlockServer, KeyServerHalf, TlfId, TlfResult};
use tlf_store_disk::BlockDiskStore;
use tracing::debug;

/// Sequence number → encoded [`BlockOp`].
const OPS: TableDefinition<u64, &[u8]> = TableDefinition::new("block_ops");

/// One journaled call against the block authority, replayed in order.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
enum BlockOp {
    #[n(0)]
    Put {
        #[n(0)]
        id: BlockId,
        #[n(1)]
        context: BlockContext,
    },
    #[n(1)]
    AddReference {
        #[n(0)]
        id: BlockId,
        #[n(1)]
        context: BlockContext,
    },
    #[n(2)]
    RemoveReferences {
        #[n(0)]
        contexts: BTreeMap<BlockId, Vec<BlockContext>>,
    },
    #[n(3)]
    ArchiveReferences {
        #[n(0)]
        contexts: BTreeMap<BlockId, Vec<BlockContext>>,
    },
}

/// Blocks of one folder, stored in a journal-side [`BlockDiskStore`]
/// until flushed.
pub struct BlockJournal {
    tlf: TlfId,
    store: BlockDiskStore,
    db: Arc<Database>,
}

impl std::fmt::Debug for BlockJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockJournal")
            .field("tlf", &self.tlf)
            .field("dir", &self.store.dir())
            .finish()
    }
}

impl BlockJournal {
    pub fn open(dir: &Path, tlf: TlfId) -> TlfResult<Self> {
        std::fs::create_dir_all(dir)?;
        let db = Database::create(dir.join("blocks.redb"))?;
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(OPS)?;
        }
        write_txn.commit()?;
        Ok(Self {
            tlf,
            store: BlockDiskStore::new(dir.join("blocks")),
            db: Arc::new(db),
        })
    }

    pub fn store(&self) -> &BlockDiskStore {
        &self.store
    }

    /// Number of calls not yet replayed to the server.
    pub async fn length(&self) -> TlfResult<u64> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> TlfResult<u64> {
            let read_txn = db.begin_read()?;
            Ok(read_txn.open_table(OPS)?.len()?)
        })
        .await
        .map_err(|e| anyhow!("block journal task failed: {e}"))?
    }

    async fn append(&self, op: BlockOp) -> TlfResult<()> {
        let bytes = minicbor::to_vec(&op)?;
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> TlfResult<()> {
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(OPS)?;
                let seq = table.last()?.map_or(0, |(k, _)| k.value() + 1);
                table.insert(seq, bytes.as_slice())?;
            }
            write_txn.commit()?;
            Ok(())
        })
        .await
        .map_err(|e| anyhow!("block journal task failed: {e}"))?
    }

    async fn first(&self) -> TlfResult<Option<(u64, BlockOp)>> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> TlfResult<Option<(u64, BlockOp)>> {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(OPS)?;
            match table.first()? {
                Some((k, v)) => Ok(Some((k.value(), minicbor::decode(v.value())?))),
                None => Ok(None),
            }
        })
        .await
        .map_err(|e| anyhow!("block journal task failed: {e}"))?
    }

    async fn pop(&self, seq: u64) -> TlfResult<()> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> TlfResult<()> {
            let write_txn = db.begin_write()?;
            write_txn.open_table(OPS)?.remove(seq)?;
            write_txn.commit()?;
            Ok(())
        })
        .await
        .map_err(|e| anyhow!("block journal task failed: {e}"))?
    }

    pub async fn put(
        &self,
        id: BlockId,
        context: BlockContext,
        buf: &[u8],
        server_half: KeyServerHalf,
    ) -> TlfResult<()> {
        self.store
            .put(id, context, buf, server_half, false)
            .await?;
        self.append(BlockOp::Put { id, context }).await
    }

    /// Serves a block from the journal if it holds both the payload and
    /// `context`'s reference.
    pub async fn get(
        &self,
        id: BlockId,
        context: BlockContext,
    ) -> TlfResult<Option<(Vec<u8>, KeyServerHalf)>> {
        if !self.store.has_data(id).await? || self.store.has_context(id, context).await?.is_none()
        {
            return Ok(None);
        }
        Ok(Some(self.store.get(id, context).await?))
    }

    pub async fn add_reference(&self, id: BlockId, context: BlockContext) -> TlfResult<()> {
        self.store.add_reference(id, context, "").await?;
        self.append(BlockOp::AddReference { id, context }).await
    }

    pub async fn remove_references(
        &self,
        contexts: BTreeMap<BlockId, Vec<BlockContext>>,
    ) -> TlfResult<BTreeMap<BlockId, usize>> {
        let mut live = BTreeMap::new();
        for (id, id_contexts) in &contexts {
            live.insert(*id, self.store.remove_references(*id, id_contexts, "").await?);
        }
        self.append(BlockOp::RemoveReferences { contexts }).await?;
        Ok(live)
    }

    pub async fn archive_references(
        &self,
        contexts: BTreeMap<BlockId, Vec<BlockContext>>,
    ) -> TlfResult<()> {
        self.store.archive_references(&contexts, "").await?;
        self.append(BlockOp::ArchiveReferences { contexts }).await
    }

    /// Replays up to `max` journaled calls to `server`, oldest first.
    /// Returns how many were flushed.
    pub async fn flush(&self, server: &dyn BlockServer, max: usize) -> TlfResult<usize> {
        let mut flushed = 0;
        while flushed < max {
            let Some((seq, op)) = self.first().await? else {
                break;
            };
            match op {
                BlockOp::Put { id, context } => {
                    let (buf, half) = self.store.get_data(id).await?;
                    server
                        .put(self.tlf, id, context, buf.into(), half)
                        .await?;
                    self.store.mark_flushed(id).await?;
                }
                BlockOp::AddReference { id, context } => {
                    server.add_block_reference(self.tlf, id, context).await?;
                }
                BlockOp::RemoveReferences { contexts } => {
                    let ids: Vec<BlockId> = contexts.keys().copied().collect();
                    server.remove_block_references(self.tlf, contexts).await?;
                    for id in ids {
                        if !self.store.has_any_ref(id).await? {
                            self.store.remove(id).await?;
                        }
                    }
                }
                BlockOp::ArchiveReferences { contexts } => {
                    server.archive_block_references(self.tlf, contexts).await?;
                }
            }
            self.pop(seq).await?;
            flushed += 1;
        }
        if flushed > 0 {
            debug!(tlf = %self.tlf, count = flushed, "flushed block journal");
        }
        Ok(flushed)
    }
}
