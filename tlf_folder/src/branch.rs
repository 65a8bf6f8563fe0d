//! The per-folder engine: head revision, staged local changes and the
//! operations that move between them.
//!
//! Locks are always taken in the order `md_writer` < `head` < `blocks`,
//! each acquisition recorded in the caller's [`LockState`]:
//! - `md_writer` serializes everything that produces or replaces a
//!   revision, including every local mutation, and is held across the
//!   whole commit;
//! - `head` is only held to read or swap the head;
//! - `blocks` guards the staged changes and is never held across network
//!   calls (readers release it with `do_unlocked_if_possible` to fetch).

mod background;
mod gc;
mod head;
mod resolve;
mod sync;
mod updates;

use crate::blocks::{BlockCache, Sealer, missing_block, open_block};
use crate::cancel::OpContext;
use crate::context::FolderContext;
use crate::locks::{LeveledMutex, LeveledRwLock, LockLevel, LockState};
use crate::node_cache::{Node, NodeCache};
use crate::observer::{Observer, Observers};
use crate::staging::{ROOT, Staging, empty_root, join, split};
use anyhow::anyhow;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tlf_core::{
    AttrChange, BlockPointer, BranchId, DirEntry, EntryKind, ImmutableRootMetadata, KeyGen,
    MergeStatus, NodeChange, Op, Revision, TlfCryptKey, TlfError, TlfId, TlfResult, WriteRange,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Upper bound on block fetches while serving one call.
const MAX_BLOCK_FETCHES: usize = 256;

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[derive(Debug)]
pub(crate) struct HeadState {
    head: Option<ImmutableRootMetadata>,
    trusted: bool,
    bid: BranchId,
    /// Latest merged revision known to exist on the server.
    latest_merged: Revision,
}

impl HeadState {
    fn new() -> Self {
        Self {
            head: None,
            trusted: false,
            bid: BranchId::NULL,
            latest_merged: Revision::UNINITIALIZED,
        }
    }
}

/// A snapshot of an engine's state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FolderStatus {
    pub tlf: TlfId,
    pub revision: Revision,
    pub merged_status: MergeStatus,
    pub branch_id: BranchId,
    pub dirty: bool,
    pub latest_merged_revision: Revision,
    pub handle_name: String,
    pub trusted_head: bool,
    pub cached_nodes: usize,
}

pub struct FolderBranchOps {
    ctx: FolderContext,
    tlf: TlfId,
    md_writer: LeveledMutex<()>,
    head: LeveledRwLock<HeadState>,
    blocks: LeveledRwLock<Staging>,
    cache: BlockCache,
    nodes: NodeCache,
    observers: Observers,
    cr_tx: mpsc::Sender<()>,
    cr_rx: Mutex<Option<mpsc::Receiver<()>>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for FolderBranchOps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FolderBranchOps")
            .field("tlf", &self.tlf)
            .field("cached_blocks", &self.cache.len())
            .field("nodes", &self.nodes.len())
            .finish_non_exhaustive()
    }
}

impl FolderBranchOps {
    /// An engine without a head; [`Folders`](crate::Folders) sets one up.
    pub fn new(ctx: FolderContext, tlf: TlfId) -> Arc<Self> {
        let (cr_tx, cr_rx) = mpsc::channel(1);
        Arc::new(Self {
            ctx,
            tlf,
            md_writer: LeveledMutex::new(LockLevel::MdWriter, ()),
            head: LeveledRwLock::new(LockLevel::Head, HeadState::new()),
            blocks: LeveledRwLock::new(LockLevel::Blocks, Staging::new(empty_root())),
            cache: BlockCache::default(),
            nodes: NodeCache::new(),
            observers: Observers::default(),
            cr_tx,
            cr_rx: Mutex::new(Some(cr_rx)),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn tlf(&self) -> TlfId {
        self.tlf
    }

    pub fn context(&self) -> &FolderContext {
        &self.ctx
    }

    fn mismatch(&self, revision: Revision, reason: impl Into<String>) -> TlfError {
        TlfError::MdMismatch {
            tlf: self.tlf,
            revision,
            reason: reason.into(),
        }
    }

    async fn head_rmd(&self, lstate: &LockState) -> TlfResult<ImmutableRootMetadata> {
        self.head
            .read(lstate)
            .await
            .head
            .clone()
            .ok_or_else(|| TlfError::NotFound(format!("head of {}", self.tlf)).into())
    }

    async fn crypt_key(&self, key_gen: KeyGen) -> TlfResult<Option<TlfCryptKey>> {
        if key_gen == KeyGen::PUBLIC {
            return Ok(None);
        }
        Ok(Some(self.ctx.keys.tlf_crypt_key(self.tlf, key_gen).await?))
    }

    /// Seals new blocks under the key generation of `head`.
    async fn sealer_for(&self, head: &ImmutableRootMetadata) -> TlfResult<Sealer> {
        let key_gen = if head.handle().public {
            KeyGen::PUBLIC
        } else {
            head.key_gen()
        };
        Ok(Sealer::new(
            self.crypt_key(key_gen).await?,
            key_gen,
            self.ctx.session.uid,
        ))
    }

    async fn fetch_block(&self, ptr: BlockPointer) -> TlfResult<()> {
        let (payload, half) = self
            .ctx
            .block_server
            .get(self.tlf, ptr.id, ptr.context)
            .await?;
        let key = self.crypt_key(ptr.key_gen).await?;
        let plain = open_block(&ptr, &payload, &half, key.as_ref())?;
        self.cache.insert(ptr.id, plain);
        Ok(())
    }

    /// Runs `f` against the staged view of the folder, fetching blocks it
    /// is missing with the blocks lock released.
    async fn with_view<T, F>(&self, f: F) -> TlfResult<T>
    where
        F: Fn(&Staging, &BlockCache) -> TlfResult<T>,
    {
        let lstate = LockState::new();
        let mut guard = Some(self.blocks.read(&lstate).await);
        let mut fetched = 0;
        loop {
            let res = match guard.as_deref() {
                Some(staging) => f(staging, &self.cache),
                None => Err(anyhow!("blocks lock of {} not reacquired", self.tlf)),
            };
            match res {
                Err(err) => match missing_block(&err) {
                    Some(ptr) if fetched < MAX_BLOCK_FETCHES => {
                        fetched += 1;
                        self.blocks
                            .do_unlocked_if_possible(&lstate, &mut guard, self.fetch_block(ptr))
                            .await?;
                    }
                    _ => return Err(err),
                },
                ok => return ok,
            }
        }
    }

    /// Runs `f` without any lock, fetching the blocks it is missing.
    async fn with_fetches<T, F>(&self, mut f: F) -> TlfResult<T>
    where
        F: FnMut(&BlockCache) -> TlfResult<T>,
    {
        let mut fetched = 0;
        loop {
            match f(&self.cache) {
                Err(err) => match missing_block(&err) {
                    Some(ptr) if fetched < MAX_BLOCK_FETCHES => {
                        fetched += 1;
                        self.fetch_block(ptr).await?;
                    }
                    _ => return Err(err),
                },
                ok => return ok,
            }
        }
    }

    /// Applies `f` to a copy of the staged changes and keeps the copy only
    /// if `f` succeeds. Returns the ops `f` appended.
    async fn stage<F>(&self, lstate: &LockState, f: F) -> TlfResult<Vec<Op>>
    where
        F: Fn(&mut Staging, &BlockCache) -> TlfResult<()>,
    {
        lstate.assert_held(LockLevel::MdWriter);
        let mut fetched = 0;
        loop {
            let mut guard = self.blocks.write(lstate).await;
            let mut next = guard.clone();
            let before = next.ops().len();
            match f(&mut next, &self.cache) {
                Ok(()) => {
                    let ops = next.ops()[before..].to_vec();
                    *guard = next;
                    return Ok(ops);
                }
                Err(err) => match missing_block(&err) {
                    Some(ptr) if fetched < MAX_BLOCK_FETCHES => {
                        drop(guard);
                        fetched += 1;
                        self.fetch_block(ptr).await?;
                    }
                    _ => return Err(err),
                },
            }
        }
    }

    fn entry_path(&self, node: &Node) -> TlfResult<(String, String)> {
        let path = self.nodes.path(node)?;
        let (dir, name) = split(&path).ok_or_else(|| TlfError::IsDir(path.clone()))?;
        Ok((dir.to_string(), name.to_string()))
    }

    pub async fn register_observer(&self, observer: Arc<dyn Observer>) {
        self.observers.register(observer).await;
    }

    pub fn root_node(&self) -> Node {
        self.nodes.get_or_create(ROOT)
    }

    /// Gives back a handle returned by this engine.
    pub fn forget(&self, node: Node) {
        self.nodes.forget(node);
    }

    pub fn node_path(&self, node: &Node) -> TlfResult<String> {
        self.nodes.path(node)
    }

    pub async fn lookup(&self, dir: &Node, name: &str) -> TlfResult<(Node, DirEntry)> {
        let path = join(&self.nodes.path(dir)?, name);
        let entry = self.with_view(|s, cache| s.entry(&path, cache)).await?;
        Ok((self.nodes.get_or_create(&path), entry))
    }

    pub async fn list_dir(&self, dir: &Node) -> TlfResult<BTreeMap<String, DirEntry>> {
        let path = self.nodes.path(dir)?;
        let block = self.with_view(|s, cache| s.dir(&path, cache)).await?;
        Ok(block.children)
    }

    pub async fn stat(&self, node: &Node) -> TlfResult<DirEntry> {
        let path = self.nodes.path(node)?;
        self.with_view(|s, cache| s.entry(&path, cache)).await
    }

    pub async fn read(&self, file: &Node, off: u64, len: usize) -> TlfResult<Vec<u8>> {
        let path = self.nodes.path(file)?;
        let content = self.with_view(|s, cache| s.file(&path, cache)).await?;
        let start = usize::try_from(off)?.min(content.len());
        let end = start.saturating_add(len).min(content.len());
        Ok(content[start..end].to_vec())
    }

    /// Creates `name` in `dir`. An exclusive create is committed before it
    /// returns; if the folder is (or becomes) unmerged it fails with
    /// [`TlfError::ExclOnUnmerged`] and should be retried after resolution.
    pub async fn create_entry(
        &self,
        ctx: &OpContext,
        dir: &Node,
        name: &str,
        kind: EntryKind,
        excl: bool,
    ) -> TlfResult<Node> {
        let dir_path = self.nodes.path(dir)?;
        let lstate = LockState::new();
        let writer = self.md_writer.lock(&lstate).await;
        let res = self
            .create_locked(&lstate, ctx, &dir_path, name, kind, excl)
            .await;
        drop(writer);

        self.observers.flush().await;
        let ops = res?;
        self.observers
            .batch_changes(ops.iter().flat_map(Op::changes).collect())
            .await;
        Ok(self.nodes.get_or_create(&join(&dir_path, name)))
    }

    async fn create_locked(
        &self,
        lstate: &LockState,
        ctx: &OpContext,
        dir_path: &str,
        name: &str,
        kind: EntryKind,
        excl: bool,
    ) -> TlfResult<Vec<Op>> {
        let now = now_ms();
        ctx.check()?;
        if excl {
            if self.head_rmd(lstate).await?.merged_status() == MergeStatus::Unmerged {
                self.request_cr();
                return Err(TlfError::ExclOnUnmerged {
                    name: name.to_string(),
                }
                .into());
            }
            // Earlier changes go into their own revision.
            self.sync_locked(lstate, ctx, None).await?;
        }
        let ops = self
            .stage(lstate, |s, cache| {
                s.create(dir_path, name, kind, now, cache).map(|_| ())
            })
            .await?;
        if excl {
            self.sync_locked(lstate, ctx, Some(name)).await?;
        }
        Ok(ops)
    }

    pub async fn remove_entry(&self, ctx: &OpContext, dir: &Node, name: &str) -> TlfResult<()> {
        let dir_path = self.nodes.path(dir)?;
        let lstate = LockState::new();
        let writer = self.md_writer.lock(&lstate).await;
        ctx.check()?;
        let ops = self
            .stage(&lstate, |s, cache| s.remove(&dir_path, name, cache).map(|_| ()))
            .await?;
        drop(writer);

        self.nodes.unlink(&join(&dir_path, name));
        self.observers
            .batch_changes(ops.iter().flat_map(Op::changes).collect())
            .await;
        Ok(())
    }

    pub async fn rename(
        &self,
        ctx: &OpContext,
        old_dir: &Node,
        old_name: &str,
        new_dir: &Node,
        new_name: &str,
    ) -> TlfResult<()> {
        let old_dir_path = self.nodes.path(old_dir)?;
        let new_dir_path = self.nodes.path(new_dir)?;
        let lstate = LockState::new();
        let writer = self.md_writer.lock(&lstate).await;
        ctx.check()?;
        let ops = self
            .stage(&lstate, |s, cache| {
                s.rename(&old_dir_path, old_name, &new_dir_path, new_name, cache)
            })
            .await?;
        drop(writer);

        if !ops.is_empty() {
            self.nodes.rename(
                &join(&old_dir_path, old_name),
                &join(&new_dir_path, new_name),
            );
        }
        self.observers
            .batch_changes(ops.iter().flat_map(Op::changes).collect())
            .await;
        Ok(())
    }

    pub async fn set_attr(&self, ctx: &OpContext, node: &Node, attr: AttrChange) -> TlfResult<()> {
        let (dir, name) = self.entry_path(node)?;
        let lstate = LockState::new();
        let writer = self.md_writer.lock(&lstate).await;
        ctx.check()?;
        let ops = self
            .stage(&lstate, |s, cache| s.set_attr(&dir, &name, attr, cache).map(|_| ()))
            .await?;
        drop(writer);

        self.observers
            .batch_changes(ops.iter().flat_map(Op::changes).collect())
            .await;
        Ok(())
    }

    /// Rejects a write or truncate that would make the file larger than
    /// `max_file_size`, before anything is allocated.
    fn check_file_size(&self, dir: &str, name: &str, size: Option<u64>) -> TlfResult<()> {
        let max = self.ctx.config.max_file_size;
        match size {
            Some(size) if size <= max => Ok(()),
            size => Err(TlfError::FileTooBig {
                path: join(dir, name),
                size: size.unwrap_or(u64::MAX),
                max,
            }
            .into()),
        }
    }

    pub async fn write(&self, ctx: &OpContext, file: &Node, off: u64, data: &[u8]) -> TlfResult<()> {
        let (dir, name) = self.entry_path(file)?;
        self.check_file_size(&dir, &name, off.checked_add(data.len() as u64))?;
        let now = now_ms();
        let lstate = LockState::new();
        let writer = self.md_writer.lock(&lstate).await;
        ctx.check()?;
        self.stage(&lstate, |s, cache| {
            s.write(&dir, &name, off, data, now, cache).map(|_| ())
        })
        .await?;
        drop(writer);

        let range = WriteRange {
            off,
            len: data.len() as u64,
        };
        self.observers
            .local_change(
                &NodeChange {
                    dir,
                    name: Some(name),
                },
                range,
            )
            .await;
        Ok(())
    }

    pub async fn truncate(&self, ctx: &OpContext, file: &Node, size: u64) -> TlfResult<()> {
        let (dir, name) = self.entry_path(file)?;
        self.check_file_size(&dir, &name, Some(size))?;
        let now = now_ms();
        let lstate = LockState::new();
        let writer = self.md_writer.lock(&lstate).await;
        ctx.check()?;
        self.stage(&lstate, |s, cache| {
            s.truncate(&dir, &name, size, now, cache).map(|_| ())
        })
        .await?;
        drop(writer);

        self.observers
            .local_change(
                &NodeChange {
                    dir,
                    name: Some(name),
                },
                WriteRange { off: size, len: 0 },
            )
            .await;
        Ok(())
    }

    pub async fn status(&self) -> TlfResult<FolderStatus> {
        let lstate = LockState::new();
        let head = self.head.read(&lstate).await;
        let irmd = head
            .head
            .clone()
            .ok_or_else(|| TlfError::NotFound(format!("head of {}", self.tlf)))?;
        let dirty = self.blocks.read(&lstate).await.is_dirty();
        Ok(FolderStatus {
            tlf: self.tlf,
            revision: irmd.revision(),
            merged_status: irmd.merged_status(),
            branch_id: head.bid,
            dirty,
            latest_merged_revision: head.latest_merged,
            handle_name: irmd.handle().canonical_name(),
            trusted_head: head.trusted,
            cached_nodes: self.nodes.len(),
        })
    }
}
