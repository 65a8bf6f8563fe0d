use crate::manager::JournalManager;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use tlf_core::{BlockContext, BlockId, BlockServer, KeyServerHalf, TlfId, TlfResult};

/// A [`BlockServer`] that writes into a folder's block journal while one
/// is enabled and reads journaled blocks before asking the remote.
#[derive(Debug, Clone)]
pub struct JournalBlockServer {
    manager: Arc<JournalManager>,
}

impl JournalBlockServer {
    pub fn new(manager: Arc<JournalManager>) -> Self {
        Self { manager }
    }

    fn remote(&self) -> &Arc<dyn BlockServer> {
        self.manager.block_server()
    }
}

#[async_trait::async_trait]
impl BlockServer for JournalBlockServer {
    async fn get(
        &self,
        tlf: TlfId,
        id: BlockId,
        context: BlockContext,
    ) -> TlfResult<(Bytes, KeyServerHalf)> {
        if let Some(journal) = self.manager.get(tlf) {
            if let Some((buf, half)) = journal.blocks().get(id, context).await? {
                return Ok((Bytes::from(buf), half));
            }
        }
        self.remote().get(tlf, id, context).await
    }

    async fn put(
        &self,
        tlf: TlfId,
        id: BlockId,
        context: BlockContext,
        buf: Bytes,
        server_half: KeyServerHalf,
    ) -> TlfResult<()> {
        match self.manager.get_or_auto_enable(tlf)? {
            Some(journal) => {
                journal.blocks().put(id, context, &buf, server_half).await?;
                self.manager.signal_work();
                Ok(())
            }
            None => self.remote().put(tlf, id, context, buf, server_half).await,
        }
    }

    async fn add_block_reference(
        &self,
        tlf: TlfId,
        id: BlockId,
        context: BlockContext,
    ) -> TlfResult<()> {
        match self.manager.get_or_auto_enable(tlf)? {
            Some(journal) => journal.blocks().add_reference(id, context).await,
            None => self.remote().add_block_reference(tlf, id, context).await,
        }
    }

    async fn remove_block_references(
        &self,
        tlf: TlfId,
        contexts: BTreeMap<BlockId, Vec<BlockContext>>,
    ) -> TlfResult<BTreeMap<BlockId, usize>> {
        match self.manager.get_or_auto_enable(tlf)? {
            Some(journal) => journal.blocks().remove_references(contexts).await,
            None => self.remote().remove_block_references(tlf, contexts).await,
        }
    }

    async fn archive_block_references(
        &self,
        tlf: TlfId,
        contexts: BTreeMap<BlockId, Vec<BlockContext>>,
    ) -> TlfResult<()> {
        match self.manager.get_or_auto_enable(tlf)? {
            Some(journal) => journal.blocks().archive_references(contexts).await,
            None => self.remote().archive_block_references(tlf, contexts).await,
        }
    }
}
