//! Folding an unmerged branch back into the mainline, or giving it up.

use super::{FolderBranchOps, now_ms};
use crate::cancel::OpContext;
use crate::locks::{LockLevel, LockState};
use crate::resolver::{ResolveInput, TimedOp};
use crate::staging::Staging;
use tlf_core::{
    ImmutableRootMetadata, MergeStatus, NodeChange, Op, OpKind, Revision, TlfError, TlfResult,
    is_revision_conflict,
};
use tracing::{debug, info, warn};

enum Outcome {
    Resolved,
    Rejected(anyhow::Error),
}

fn timed_ops(revs: &[ImmutableRootMetadata]) -> Vec<TimedOp> {
    revs.iter()
        .flat_map(|irmd| {
            irmd.ops().iter().map(move |op| TimedOp {
                op: op.clone(),
                revision: irmd.revision(),
                at: irmd.local_timestamp(),
            })
        })
        .collect()
}

impl FolderBranchOps {
    /// Resolves this device's unmerged branch, if there is one.
    pub async fn resolve_conflicts(&self, ctx: &OpContext) -> TlfResult<()> {
        let lstate = LockState::new();
        let writer = self.md_writer.lock(&lstate).await;
        let res = self.resolve_locked(&lstate, ctx).await;
        drop(writer);
        self.observers.flush().await;
        res
    }

    /// Discards this device's unmerged branch and returns to the merged
    /// mainline.
    pub async fn unstage(&self, ctx: &OpContext) -> TlfResult<()> {
        let lstate = LockState::new();
        let writer = self.md_writer.lock(&lstate).await;
        let res = match self.head_rmd(&lstate).await {
            Ok(head) if head.merged_status() == MergeStatus::Merged => Ok(()),
            Ok(_) => self.unstage_locked(&lstate, ctx).await,
            Err(err) => Err(err),
        };
        drop(writer);
        self.observers.flush().await;
        res
    }

    pub(super) async fn resolve_locked(&self, lstate: &LockState, ctx: &OpContext) -> TlfResult<()> {
        lstate.assert_held(LockLevel::MdWriter);
        if self.head_rmd(lstate).await?.merged_status() == MergeStatus::Merged {
            return Ok(());
        }
        self.sync_locked(lstate, ctx, None).await?;

        let max_retries = self.ctx.config.max_retries_on_recoverable_errors;
        let mut attempts = 0;
        loop {
            ctx.check()?;
            match self.resolve_once(lstate, ctx).await {
                Ok(Outcome::Resolved) => return Ok(()),
                Ok(Outcome::Rejected(err)) => {
                    warn!(tlf = %self.tlf, "conflict resolution failed, unstaging: {err:#}");
                    return self.unstage_locked(lstate, ctx).await;
                }
                Err(err) if is_revision_conflict(&err) && attempts < max_retries => {
                    attempts += 1;
                    debug!(tlf = %self.tlf, attempts, "mainline moved during resolution: {err:#}");
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn resolve_once(&self, lstate: &LockState, ctx: &OpContext) -> TlfResult<Outcome> {
        let head = self.head_rmd(lstate).await?;
        let bid = head.bid();
        let unmerged = self
            .ctx
            .md_ops
            .get_unmerged_range(self.tlf, bid, Revision::INITIAL, head.revision())
            .await?;
        let first = unmerged.first().ok_or_else(|| {
            self.mismatch(head.revision(), "unmerged branch has no revisions on the server")
        })?;
        let branch_point = first.revision().prev();

        let merged_head = self
            .ctx
            .md_ops
            .get_for_tlf(self.tlf)
            .await?
            .ok_or_else(|| TlfError::NotFound(format!("merged head of {}", self.tlf)))?;
        let merged = if merged_head.revision() > branch_point {
            self.ctx
                .md_ops
                .get_range(self.tlf, branch_point.next(), merged_head.revision())
                .await?
        } else {
            Vec::new()
        };

        let input = ResolveInput {
            tlf: self.tlf,
            branch_point,
            merged: timed_ops(&merged),
            unmerged: timed_ops(&unmerged),
        };
        let keep = match self.ctx.resolver.resolve(&input).await {
            Ok(keep) => keep,
            Err(err) => return Ok(Outcome::Rejected(err)),
        };

        let src = Staging::new(*head.root());
        let mut dst = self
            .with_fetches(|cache| {
                let mut dst = Staging::new(*merged_head.root());
                dst.replay(&src, &keep, cache)?;
                Ok(dst)
            })
            .await?;
        dst.push_front_op(Op::new(OpKind::Resolution));

        let sealer = self.sealer_for(&merged_head).await?;
        let built = dst.build(&sealer, now_ms())?;
        let rmd = self.prepare_successor(&merged_head, &dst, &built);

        let delayed = ctx.enable_delayed_cancellation(self.ctx.config.cancellation_delay())?;
        let irmd = ctx
            .run(async {
                self.put_blocks(&built.puts).await?;
                self.ctx
                    .md_ops
                    .resolve_branch(self.tlf, bid, rmd, &self.ctx.session)
                    .await
            })
            .await?;
        for put in &built.puts {
            self.cache.insert(put.ptr.id, put.plain.clone());
        }

        let rev = irmd.revision();
        self.set_head_conflict_resolved(lstate, irmd.clone()).await?;
        drop(delayed);
        self.archive_unrefs(&irmd).await;
        info!(
            tlf = %self.tlf,
            %branch_point,
            rev = %rev,
            merged = merged.len(),
            kept = keep.len(),
            "resolved unmerged branch"
        );
        let changes: Vec<NodeChange> = merged
            .iter()
            .flat_map(|m| m.ops().iter().flat_map(Op::changes))
            .collect();
        self.observers.defer_batch(changes);
        Ok(Outcome::Resolved)
    }

    /// Walks the head back along the unmerged branch to its branch point,
    /// prunes the branch and catches up with the mainline. Staged changes
    /// are lost.
    pub(super) async fn unstage_locked(&self, lstate: &LockState, ctx: &OpContext) -> TlfResult<()> {
        lstate.assert_held(LockLevel::MdWriter);
        {
            let mut blocks = self.blocks.write(lstate).await;
            if blocks.is_dirty() {
                warn!(tlf = %self.tlf, ops = blocks.ops().len(), "discarding staged changes");
                let base = blocks.base();
                *blocks = Staging::new(base);
            }
        }

        let head = self.head_rmd(lstate).await?;
        let bid = head.bid();
        let unmerged = self
            .ctx
            .md_ops
            .get_unmerged_range(self.tlf, bid, Revision::INITIAL, head.revision())
            .await?;
        match unmerged.last() {
            Some(last) if last.same_revision(&head) => {}
            _ => {
                return Err(self
                    .mismatch(head.revision(), "head is not the tip of its unmerged branch")
                    .into());
            }
        }
        let branch_point = unmerged[0].revision().prev();
        let base = self
            .ctx
            .md_ops
            .get_range(self.tlf, branch_point, branch_point)
            .await?
            .pop()
            .ok_or_else(|| TlfError::NotFound(format!("revision {branch_point} of {}", self.tlf)))?;

        for i in (0..unmerged.len()).rev() {
            let undone = &unmerged[i];
            let prev = if i == 0 {
                base.clone()
            } else {
                unmerged[i - 1].clone()
            };
            self.set_head_predecessor(lstate, prev).await?;
            let changes: Vec<NodeChange> = undone
                .ops()
                .iter()
                .rev()
                .filter_map(Op::invert)
                .flat_map(|op| op.changes())
                .collect();
            self.observers.defer_batch(changes);
        }

        self.ctx.md_ops.prune_branch(self.tlf, bid).await?;
        info!(tlf = %self.tlf, %bid, %branch_point, "unstaged unmerged branch");
        self.apply_updates_locked(lstate, ctx).await
    }
}
