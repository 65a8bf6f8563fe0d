//! Turning staged changes into a revision.

use super::{FolderBranchOps, now_ms};
use crate::blocks::BlockPut;
use crate::cancel::OpContext;
use crate::locks::{LockLevel, LockState};
use crate::staging::{Built, Staging};
use futures::{StreamExt, TryStreamExt};
use std::time::Duration;
use tlf_core::{
    ErrorClass, ImmutableRootMetadata, MergeStatus, PutOptions, RootMetadata, TlfError,
    TlfResult, class_of, classify, is_revision_conflict,
};
use tracing::{debug, info, warn};

impl FolderBranchOps {
    /// Commits every staged change. Returns whether there was anything to
    /// commit.
    pub async fn sync_all(&self, ctx: &OpContext) -> TlfResult<bool> {
        let lstate = LockState::new();
        let writer = self.md_writer.lock(&lstate).await;
        let res = self.sync_locked(&lstate, ctx, None).await;
        drop(writer);
        self.observers.flush().await;
        res
    }

    /// The successor of `head` carrying the staged ops and new root. The
    /// block references of the whole change ride on the last op.
    pub(super) fn prepare_successor(
        &self,
        head: &ImmutableRootMetadata,
        staging: &Staging,
        built: &Built,
    ) -> RootMetadata {
        let mut rmd = head.make_successor(head.md_id());
        rmd.set_last_modifying_writer(self.ctx.session.uid);
        let mut ops = staging.ops().to_vec();
        if let Some(last) = ops.last_mut() {
            last.refs.extend(built.refs.iter().copied());
            last.unrefs.extend(built.unrefs.iter().copied());
        }
        for op in ops {
            rmd.add_op(op);
        }
        rmd.set_root(built.root, built.ref_bytes, built.unref_bytes);
        rmd
    }

    pub(super) async fn put_blocks(&self, puts: &[BlockPut]) -> TlfResult<()> {
        let futs: Vec<_> = puts.iter().map(|put| self.put_block(put)).collect();
        futures::stream::iter(futs)
            .buffer_unordered(self.ctx.config.max_parallel_block_puts.max(1))
            .try_collect::<Vec<()>>()
            .await?;
        Ok(())
    }

    async fn put_block(&self, put: &BlockPut) -> TlfResult<()> {
        let max_retries = self.ctx.config.max_retries_on_recoverable_errors;
        let mut attempt = 0;
        loop {
            let res = self
                .ctx
                .block_server
                .put(
                    self.tlf,
                    put.ptr.id,
                    put.ptr.context,
                    put.payload.clone(),
                    put.half,
                )
                .await;
            match res {
                Ok(()) => return Ok(()),
                Err(err)
                    if class_of(&err) == ErrorClass::Transient
                        && !matches!(classify(&err), Some(TlfError::Canceled))
                        && attempt < max_retries =>
                {
                    attempt += 1;
                    warn!(tlf = %self.tlf, block = %put.ptr.id, attempt, "block put failed, retrying: {err:#}");
                    tokio::time::sleep(Duration::from_millis(10 << attempt.min(6))).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn put_md(&self, rmd: RootMetadata) -> TlfResult<ImmutableRootMetadata> {
        match rmd.merged_status() {
            MergeStatus::Merged => {
                self.ctx
                    .md_ops
                    .put(rmd, &self.ctx.session, PutOptions::default())
                    .await
            }
            MergeStatus::Unmerged => self.ctx.md_ops.put_unmerged(rmd, &self.ctx.session).await,
        }
    }

    async fn finish_sync(
        &self,
        lstate: &LockState,
        irmd: ImmutableRootMetadata,
        built: &Built,
    ) -> TlfResult<()> {
        for put in &built.puts {
            self.cache.insert(put.ptr.id, put.plain.clone());
        }
        let rev = irmd.revision();
        let status = irmd.merged_status();
        self.set_head_successor(lstate, irmd.clone(), false, None).await?;
        info!(tlf = %self.tlf, rev = %rev, %status, blocks = built.puts.len(), "synced local changes");
        self.archive_unrefs(&irmd).await;
        Ok(())
    }

    /// Commits the staged changes as the next revision.
    ///
    /// A merged head that loses the race moves onto an unmerged branch
    /// (unless `excl` names an exclusive create, which fails instead). An
    /// unmerged head that loses the race to another engine of this device
    /// rebases onto the branch head and tries again.
    pub(super) async fn sync_locked(
        &self,
        lstate: &LockState,
        ctx: &OpContext,
        excl: Option<&str>,
    ) -> TlfResult<bool> {
        lstate.assert_held(LockLevel::MdWriter);
        let max_retries = self.ctx.config.max_retries_on_recoverable_errors;
        let mut attempts = 0;
        loop {
            let staging = self.blocks.read(lstate).await.clone();
            if !staging.is_dirty() {
                return Ok(false);
            }
            ctx.check()?;

            let head = self.head_rmd(lstate).await?;
            let sealer = self.sealer_for(&head).await?;
            let built = staging.build(&sealer, now_ms())?;
            let rmd = self.prepare_successor(&head, &staging, &built);

            let delayed = ctx.enable_delayed_cancellation(self.ctx.config.cancellation_delay())?;
            let res = ctx
                .run(async {
                    self.put_blocks(&built.puts).await?;
                    self.put_md(rmd.clone()).await
                })
                .await;

            match res {
                Ok(irmd) => {
                    self.finish_sync(lstate, irmd, &built).await?;
                    return Ok(true);
                }
                Err(err) if !is_revision_conflict(&err) => return Err(err),
                Err(err) if head.merged_status() == MergeStatus::Merged => {
                    if let Some(name) = excl {
                        drop(delayed);
                        self.discard_for_excl(lstate, ctx, name).await;
                        return Err(TlfError::ExclOnUnmerged {
                            name: name.to_string(),
                        }
                        .into());
                    }
                    info!(tlf = %self.tlf, rev = %rmd.revision(), "merged put conflicted, moving to an unmerged branch: {err:#}");
                    let mut unmerged = rmd;
                    unmerged.set_unmerged();
                    let irmd = ctx.run(self.put_md(unmerged)).await?;
                    self.finish_sync(lstate, irmd, &built).await?;
                    self.request_cr();
                    return Ok(true);
                }
                Err(err) => {
                    drop(delayed);
                    attempts += 1;
                    if attempts > max_retries {
                        return Err(TlfError::RetryLimit(max_retries).into());
                    }
                    debug!(tlf = %self.tlf, attempts, "unmerged put conflicted: {err:#}");
                    self.recover_self_conflict(lstate, &head, &staging).await?;
                }
            }
        }
    }

    /// Drops the staged changes after an exclusive create lost a race, and
    /// catches up with the winner.
    async fn discard_for_excl(&self, lstate: &LockState, ctx: &OpContext, name: &str) {
        warn!(tlf = %self.tlf, name, "exclusive create conflicted, discarding staged changes");
        {
            let mut blocks = self.blocks.write(lstate).await;
            let base = blocks.base();
            *blocks = Staging::new(base);
        }
        if let Err(err) = self.apply_updates_locked(lstate, ctx).await {
            warn!(tlf = %self.tlf, "catching up after exclusive create failed: {err:#}");
        }
    }

    /// Another engine of this device extended our unmerged branch: replay
    /// the staged changes onto its head and make that our head.
    async fn recover_self_conflict(
        &self,
        lstate: &LockState,
        head: &ImmutableRootMetadata,
        staging: &Staging,
    ) -> TlfResult<()> {
        let conflict = || TlfError::UnmergedSelfConflict {
            tlf: self.tlf,
            revision: head.revision().next(),
        };
        let server_head = self
            .ctx
            .md_ops
            .get_unmerged_for_tlf(self.tlf, head.bid())
            .await?
            .ok_or_else(conflict)?;
        if server_head.revision() <= head.revision() {
            return Err(conflict().into());
        }
        let replayed = self
            .with_fetches(|cache| {
                let mut dst = Staging::new(*server_head.root());
                dst.replay(staging, staging.ops(), cache)?;
                Ok(dst)
            })
            .await?;
        info!(tlf = %self.tlf, from = %head.revision(), to = %server_head.revision(), "rebased staged changes onto our unmerged branch");
        self.set_head_successor(lstate, server_head, true, Some(replayed))
            .await
    }
}
