//! Following the merged mainline.

use super::FolderBranchOps;
use crate::cancel::OpContext;
use crate::locks::{LockLevel, LockState};
use crate::staging::ROOT;
use tlf_core::{BranchId, ImmutableRootMetadata, MergeStatus, NodeChange, Op, TlfError, TlfResult};
use tracing::{debug, info};

impl FolderBranchOps {
    /// Applies merged revisions newer than the head. Fails while staged
    /// changes exist or while the head is unmerged.
    pub async fn sync_from_server(&self, ctx: &OpContext) -> TlfResult<()> {
        let lstate = LockState::new();
        let writer = self.md_writer.lock(&lstate).await;
        let res = self.apply_updates_locked(&lstate, ctx).await;
        drop(writer);
        self.observers.flush().await;
        res
    }

    /// Jumps straight to the latest merged revision, if the folder is clean
    /// and merged. Returns whether the head moved.
    pub async fn force_fast_forward(&self, ctx: &OpContext) -> TlfResult<bool> {
        let lstate = LockState::new();
        let writer = self.md_writer.lock(&lstate).await;
        let res = self.force_fast_forward_locked(&lstate, ctx).await;
        drop(writer);
        self.observers.flush().await;
        res
    }

    async fn force_fast_forward_locked(&self, lstate: &LockState, ctx: &OpContext) -> TlfResult<bool> {
        ctx.check()?;
        let head = self.head_rmd(lstate).await?;
        if self.blocks.read(lstate).await.is_dirty()
            || head.merged_status() == MergeStatus::Unmerged
        {
            debug!(tlf = %self.tlf, "not fast-forwarding a dirty or unmerged folder");
            return Ok(false);
        }
        let Some(latest) = self.ctx.md_ops.get_for_tlf(self.tlf).await? else {
            return Ok(false);
        };
        self.note_latest_merged(lstate, &latest).await;
        if latest.revision() <= head.revision() {
            return Ok(false);
        }
        self.fast_forward_locked(lstate, latest).await?;
        Ok(true)
    }

    /// Moves the head onto our unmerged branch `bid`, after something
    /// below the engine (a journal) diverted our writes there.
    pub async fn on_branch_changed(&self, ctx: &OpContext, bid: BranchId) -> TlfResult<()> {
        let lstate = LockState::new();
        let writer = self.md_writer.lock(&lstate).await;
        let res = self.branch_changed_locked(&lstate, ctx, bid).await;
        drop(writer);
        self.observers.flush().await;
        res
    }

    async fn branch_changed_locked(
        &self,
        lstate: &LockState,
        ctx: &OpContext,
        bid: BranchId,
    ) -> TlfResult<()> {
        ctx.check()?;
        if self.blocks.read(lstate).await.is_dirty() {
            return Err(TlfError::NoUpdatesWhileDirty(self.tlf).into());
        }
        let head = self.head_rmd(lstate).await?;
        if head.bid() == bid {
            return Ok(());
        }
        let branch = self
            .ctx
            .md_ops
            .get_unmerged_for_tlf(self.tlf, bid)
            .await?
            .ok_or_else(|| TlfError::NotFound(format!("branch {bid} of {}", self.tlf)))?;
        info!(tlf = %self.tlf, %bid, rev = %branch.revision(), "switching to unmerged branch");
        self.set_head_successor(lstate, branch, true, None).await
    }

    pub(super) async fn note_latest_merged(&self, lstate: &LockState, latest: &ImmutableRootMetadata) {
        let mut head = self.head.write(lstate).await;
        head.latest_merged = head.latest_merged.max(latest.revision());
    }

    fn should_fast_forward(&self, head: &ImmutableRootMetadata, latest: &ImmutableRootMetadata) -> bool {
        let distance = latest.revision().0.saturating_sub(head.revision().0);
        if distance > self.ctx.config.fast_forward_rev_thresh {
            return true;
        }
        latest
            .local_timestamp()
            .duration_since(head.local_timestamp())
            .is_ok_and(|gap| gap > self.ctx.config.fast_forward_time_thresh())
    }

    pub(super) async fn apply_updates_locked(
        &self,
        lstate: &LockState,
        ctx: &OpContext,
    ) -> TlfResult<()> {
        lstate.assert_held(LockLevel::MdWriter);
        ctx.check()?;
        if self.blocks.read(lstate).await.is_dirty() {
            return Err(TlfError::NoUpdatesWhileDirty(self.tlf).into());
        }
        let head = self.head_rmd(lstate).await?;
        let Some(latest) = self.ctx.md_ops.get_for_tlf(self.tlf).await? else {
            return Ok(());
        };
        self.note_latest_merged(lstate, &latest).await;
        if head.merged_status() == MergeStatus::Unmerged {
            self.request_cr();
            return Err(TlfError::Unmerged {
                tlf: self.tlf,
                branch: head.bid(),
            }
            .into());
        }
        if latest.revision() <= head.revision() {
            return Ok(());
        }
        if self.should_fast_forward(&head, &latest) {
            return self.fast_forward_locked(lstate, latest).await;
        }

        let revs = ctx
            .run(
                self.ctx
                    .md_ops
                    .get_range(self.tlf, head.revision().next(), latest.revision()),
            )
            .await?;
        let mut applied = 0;
        for irmd in revs {
            let changes: Vec<NodeChange> = irmd.ops().iter().flat_map(Op::changes).collect();
            self.set_head_successor(lstate, irmd, false, None).await?;
            self.observers.defer_batch(changes);
            applied += 1;
        }
        debug!(tlf = %self.tlf, applied, "applied remote updates");
        Ok(())
    }

    /// Replaces the head without replaying the revisions in between. All
    /// cached blocks and every node are invalidated.
    async fn fast_forward_locked(&self, lstate: &LockState, latest: ImmutableRootMetadata) -> TlfResult<()> {
        let rev = latest.revision();
        self.set_head_fast_forward(lstate, latest).await?;
        self.cache.clear();
        let mut changes = vec![NodeChange {
            dir: ROOT.to_string(),
            name: None,
        }];
        changes.extend(self.nodes.invalidate_all());
        info!(tlf = %self.tlf, rev = %rev, nodes = changes.len(), "fast-forwarded");
        self.observers.defer_batch(changes);
        Ok(())
    }
}
