//! Every way the head revision can change. Callers hold `md_writer`.

use super::FolderBranchOps;
use crate::locks::{LockLevel, LockState};
use crate::staging::Staging;
use tlf_core::{BranchId, ImmutableRootMetadata, MergeStatus, TlfError, TlfResult};
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info};

impl FolderBranchOps {
    /// Sets the first head and, if this device has an unmerged branch of
    /// the folder, moves onto it.
    pub(crate) async fn init_head(
        &self,
        head: ImmutableRootMetadata,
        trusted: bool,
    ) -> TlfResult<()> {
        let lstate = LockState::new();
        let writer = self.md_writer.lock(&lstate).await;
        let res = self.init_head_locked(&lstate, head, trusted).await;
        drop(writer);
        self.observers.flush().await;
        res
    }

    async fn init_head_locked(
        &self,
        lstate: &LockState,
        head: ImmutableRootMetadata,
        trusted: bool,
    ) -> TlfResult<()> {
        self.set_initial_head(lstate, head, trusted).await?;
        if let Some(unmerged) = self
            .ctx
            .md_ops
            .get_unmerged_for_tlf(self.tlf, BranchId::NULL)
            .await?
        {
            info!(tlf = %self.tlf, rev = %unmerged.revision(), "resuming unmerged branch");
            self.set_head_successor(lstate, unmerged, true, None).await?;
        }
        Ok(())
    }

    /// Marks an untrusted head as trusted once the same revision was
    /// fetched through the folder's handle.
    pub(crate) async fn trust_head(&self, head: ImmutableRootMetadata) -> TlfResult<()> {
        let lstate = LockState::new();
        let _writer = self.md_writer.lock(&lstate).await;
        let upgradable = {
            let state = self.head.read(&lstate).await;
            !state.trusted
                && state
                    .head
                    .as_ref()
                    .is_some_and(|h| h.revision() == head.revision())
        };
        if upgradable {
            self.set_initial_head(&lstate, head, true).await?;
        }
        Ok(())
    }

    /// Installs `irmd` as the head and resets the staged changes to it (or
    /// to `staging`, which must already be based on its root).
    async fn swap_head(
        &self,
        lstate: &LockState,
        irmd: ImmutableRootMetadata,
        staging: Option<Staging>,
    ) {
        let mut head = self.head.write(lstate).await;
        head.bid = irmd.bid();
        if irmd.merged_status() == MergeStatus::Merged {
            head.latest_merged = head.latest_merged.max(irmd.revision());
        }
        let mut blocks = self.blocks.write(lstate).await;
        *blocks = staging.unwrap_or_else(|| Staging::new(*irmd.root()));
        head.head = Some(irmd);
    }

    /// Sets the first head of this engine. A trusted head may replace an
    /// untrusted one of the same revision; any other existing head is an
    /// error.
    pub(crate) async fn set_initial_head(
        &self,
        lstate: &LockState,
        irmd: ImmutableRootMetadata,
        trusted: bool,
    ) -> TlfResult<()> {
        lstate.assert_held(LockLevel::MdWriter);
        let mut head = self.head.write(lstate).await;
        let upgrade = match &head.head {
            None => false,
            Some(current)
                if trusted && !head.trusted && current.revision() == irmd.revision() =>
            {
                true
            }
            Some(current) => {
                return Err(self
                    .mismatch(current.revision(), "engine already has a head")
                    .into());
            }
        };
        head.trusted = trusted;
        head.bid = irmd.bid();
        if irmd.merged_status() == MergeStatus::Merged {
            head.latest_merged = head.latest_merged.max(irmd.revision());
        }
        if !upgrade {
            *self.blocks.write(lstate).await = Staging::new(*irmd.root());
        }
        debug!(tlf = %self.tlf, rev = %irmd.revision(), trusted, upgrade, "initial head set");
        head.head = Some(irmd);
        Ok(())
    }

    /// Advances the head to `irmd`. Unless `rebase` is set it must be a
    /// valid successor of the current head. A rebase jumps to an arbitrary
    /// later revision (our own unmerged branch, typically) and may carry
    /// staged changes already replayed onto it.
    pub(crate) async fn set_head_successor(
        &self,
        lstate: &LockState,
        irmd: ImmutableRootMetadata,
        rebase: bool,
        staging: Option<Staging>,
    ) -> TlfResult<()> {
        lstate.assert_held(LockLevel::MdWriter);
        let current = self.head_rmd(lstate).await?;
        if !rebase {
            current.check_valid_successor(&irmd)?;
        }
        let handle_changed = current.handle() != irmd.handle();
        if handle_changed
            && !current
                .handle()
                .resolves_to(irmd.handle(), self.ctx.keys.as_ref())
                .await?
        {
            return Err(TlfError::IncompatibleHandle {
                tlf: self.tlf,
                old: current.handle().canonical_name(),
                new: irmd.handle().canonical_name(),
            }
            .into());
        }

        let unmerged = irmd.merged_status() == MergeStatus::Unmerged;
        let handle = irmd.handle().clone();
        debug!(tlf = %self.tlf, from = %current.revision(), to = %irmd.revision(), rebase, "head advanced");
        self.swap_head(lstate, irmd, staging).await;

        if handle_changed {
            info!(tlf = %self.tlf, handle = %handle.canonical_name(), "folder handle changed");
            self.observers.defer_handle_change(handle);
        }
        if rebase && unmerged {
            self.request_cr();
        }
        Ok(())
    }

    /// Steps the head back from an unmerged revision to its predecessor.
    pub(crate) async fn set_head_predecessor(
        &self,
        lstate: &LockState,
        irmd: ImmutableRootMetadata,
    ) -> TlfResult<()> {
        lstate.assert_held(LockLevel::MdWriter);
        let current = self.head_rmd(lstate).await?;
        if current.merged_status() != MergeStatus::Unmerged {
            return Err(self
                .mismatch(current.revision(), "only an unmerged head can be stepped back")
                .into());
        }
        irmd.check_valid_successor(&current)?;
        self.swap_head(lstate, irmd, None).await;
        Ok(())
    }

    /// Moves from an unmerged head to the merged revision that resolved it.
    pub(crate) async fn set_head_conflict_resolved(
        &self,
        lstate: &LockState,
        irmd: ImmutableRootMetadata,
    ) -> TlfResult<()> {
        lstate.assert_held(LockLevel::MdWriter);
        let current = self.head_rmd(lstate).await?;
        if current.merged_status() != MergeStatus::Unmerged {
            return Err(self
                .mismatch(current.revision(), "no conflict to resolve on a merged head")
                .into());
        }
        if irmd.merged_status() != MergeStatus::Merged || irmd.bid() != BranchId::NULL {
            return Err(self
                .mismatch(irmd.revision(), "resolution is not on the mainline")
                .into());
        }
        self.swap_head(lstate, irmd, None).await;
        Ok(())
    }

    /// Jumps a merged head forward past revisions that are not replayed.
    pub(crate) async fn set_head_fast_forward(
        &self,
        lstate: &LockState,
        irmd: ImmutableRootMetadata,
    ) -> TlfResult<()> {
        lstate.assert_held(LockLevel::MdWriter);
        let current = self.head_rmd(lstate).await?;
        if current.merged_status() != MergeStatus::Merged
            || irmd.merged_status() != MergeStatus::Merged
        {
            return Err(self
                .mismatch(irmd.revision(), "fast-forward only moves along the mainline")
                .into());
        }
        if irmd.revision() <= current.revision() {
            return Err(self
                .mismatch(irmd.revision(), "fast-forward must move the head forward")
                .into());
        }
        self.swap_head(lstate, irmd, None).await;
        Ok(())
    }

    /// Asks the background resolver to run. A pending request absorbs
    /// further ones.
    pub(crate) fn request_cr(&self) {
        if !self.ctx.config.cr_enabled {
            return;
        }
        match self.cr_tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Closed(())) => {
                debug!(tlf = %self.tlf, "conflict resolver is gone");
            }
        }
    }
}
