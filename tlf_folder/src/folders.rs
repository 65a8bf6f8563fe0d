//! One engine per folder, created on first access.

use crate::blocks::Sealer;
use crate::branch::{FolderBranchOps, FolderStatus, now_ms};
use crate::cancel::OpContext;
use crate::context::FolderContext;
use crate::node_cache::Node;
use dashmap::DashMap;
use std::sync::Arc;
use tlf_core::{
    DirBlock, DirEntry, EntryKind, ImmutableRootMetadata, KeyGen, MergeStatus,
    PutOptions, RootMetadata, TlfError, TlfHandle, TlfId, TlfResult, is_revision_conflict,
};
use tlf_journal::JournalEvent;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct Folders {
    ctx: FolderContext,
    engines: DashMap<TlfId, Arc<FolderBranchOps>>,
    /// Serializes engine creation.
    init: tokio::sync::Mutex<()>,
    /// Stops the journal event router.
    shutdown: CancellationToken,
}

impl Folders {
    pub fn new(ctx: FolderContext) -> Self {
        Self {
            ctx,
            engines: DashMap::new(),
            init: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn context(&self) -> &FolderContext {
        &self.ctx
    }

    pub fn get(&self, id: TlfId) -> Option<Arc<FolderBranchOps>> {
        self.engines.get(&id).map(|e| e.value().clone())
    }

    /// The engine and root node of the folder named by `handle`. A folder
    /// without history is created if this device's user may write it.
    pub async fn get_or_create_root(
        &self,
        handle: &TlfHandle,
    ) -> TlfResult<(Arc<FolderBranchOps>, Node)> {
        let (id, merged) = self
            .ctx
            .md_ops
            .get_for_handle(handle, MergeStatus::Merged)
            .await?;
        let _init = self.init.lock().await;
        if let Some(engine) = self.get(id) {
            if let Some(head) = merged {
                engine.trust_head(head).await?;
            }
            let root = engine.root_node();
            return Ok((engine, root));
        }
        let head = match merged {
            Some(head) => head,
            None => self.create_initial(id, handle).await?,
        };
        self.install(id, head, true).await
    }

    /// The engine and root node of the folder `id`. Its head is not yet
    /// trusted: it came from an ID rather than a handle the user named.
    pub async fn open_by_id(&self, id: TlfId) -> TlfResult<(Arc<FolderBranchOps>, Node)> {
        let _init = self.init.lock().await;
        if let Some(engine) = self.get(id) {
            let root = engine.root_node();
            return Ok((engine, root));
        }
        let head = self
            .ctx
            .md_ops
            .get_for_tlf(id)
            .await?
            .ok_or_else(|| TlfError::NotFound(format!("folder {id}")))?;
        self.install(id, head, false).await
    }

    async fn install(
        &self,
        id: TlfId,
        head: ImmutableRootMetadata,
        trusted: bool,
    ) -> TlfResult<(Arc<FolderBranchOps>, Node)> {
        let engine = FolderBranchOps::new(self.ctx.clone(), id);
        engine.init_head(head, trusted).await?;
        if self.ctx.background_tasks {
            engine.spawn_background()?;
        }
        self.engines.insert(id, engine.clone());
        let root = engine.root_node();
        Ok((engine, root))
    }

    async fn create_initial(&self, id: TlfId, handle: &TlfHandle) -> TlfResult<ImmutableRootMetadata> {
        let uid = self.ctx.session.uid;
        if !handle.is_writer(&uid) {
            return Err(TlfError::NotFound(format!("folder {}", handle.canonical_name())).into());
        }
        let (key, key_gen) = if handle.public {
            (None, KeyGen::PUBLIC)
        } else {
            let key_gen = self.ctx.keys.latest_key_gen(id).await?;
            (Some(self.ctx.keys.tlf_crypt_key(id, key_gen).await?), key_gen)
        };
        let put = Sealer::new(key, key_gen, uid).seal(DirBlock::new().to_bytes()?)?;
        self.ctx
            .block_server
            .put(id, put.ptr.id, put.ptr.context, put.payload.clone(), put.half)
            .await?;
        let root = DirEntry {
            kind: EntryKind::Dir,
            ptr: put.ptr,
            size: put.plain.len() as u64,
            mtime_ms: now_ms(),
            exec: false,
        };
        let rmd = RootMetadata::new_initial(id, handle.clone(), uid, key_gen, root);
        match self
            .ctx
            .md_ops
            .put(rmd, &self.ctx.session, PutOptions::default())
            .await
        {
            Ok(irmd) => {
                info!(tlf = %id, handle = %handle.canonical_name(), "created folder");
                Ok(irmd)
            }
            Err(err) if is_revision_conflict(&err) => {
                debug!(tlf = %id, "another device created the folder first");
                self.ctx.md_ops.get_for_tlf(id).await?.ok_or(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Moves the engine of a folder whose journal was diverted onto a
    /// branch onto that branch, which schedules its resolution. Other
    /// events and folders without an engine are ignored.
    pub async fn on_journal_event(&self, event: JournalEvent) -> TlfResult<()> {
        let JournalEvent::BranchChanged { tlf, bid } = event else {
            return Ok(());
        };
        let Some(engine) = self.get(tlf) else {
            debug!(tlf = %tlf, %bid, "branch change for a folder that is not open");
            return Ok(());
        };
        engine.on_branch_changed(&OpContext::background(), bid).await
    }

    /// Spawns a task feeding `events` to [`on_journal_event`](Self::on_journal_event)
    /// until shutdown or until the journal manager goes away.
    pub fn follow_journal(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<JournalEvent>,
    ) -> JoinHandle<()> {
        let folders = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "journal events were dropped");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(folders) = folders.upgrade() else {
                    break;
                };
                if let Err(err) = folders.on_journal_event(event).await {
                    warn!("journal event not applied: {err:#}");
                }
            }
            debug!("journal event router stopped");
        })
    }

    pub async fn status(&self, id: TlfId) -> TlfResult<FolderStatus> {
        self.get(id)
            .ok_or_else(|| TlfError::NotFound(format!("folder {id}")))?
            .status()
            .await
    }

    /// Shuts every engine down. Returns the first failure, after trying
    /// them all.
    pub async fn shutdown(&self) -> TlfResult<()> {
        self.shutdown.cancel();
        let engines: Vec<Arc<FolderBranchOps>> =
            self.engines.iter().map(|e| e.value().clone()).collect();
        self.engines.clear();
        let mut first_err = None;
        for engine in engines {
            if let Err(err) = engine.shutdown().await {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
