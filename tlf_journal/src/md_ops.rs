use crate::manager::{JournalManager, TlfJournal};
use crate::md_journal::JournalEntry;
use std::sync::Arc;
use tlf_core::{
    BranchId, ImmutableRootMetadata, MdPriority, MergeStatus, PutOptions, Revision, RootMetadata,
    Session, TlfError, TlfHandle, TlfId, TlfResult,
};
use tlf_md::MdOps;
use tlf_md::envelope::decrypt_local;
use tracing::debug;

/// [`MdOps`] that overlays each folder's journal on top of another
/// [`MdOps`]: reads prefer journaled revisions, puts go to the journal
/// while one is enabled.
#[derive(Debug, Clone)]
pub struct JournalMdOps {
    inner: Arc<dyn MdOps>,
    manager: Arc<JournalManager>,
}

impl JournalMdOps {
    pub fn new(inner: Arc<dyn MdOps>, manager: Arc<JournalManager>) -> Self {
        Self { inner, manager }
    }

    pub fn manager(&self) -> &Arc<JournalManager> {
        &self.manager
    }

    async fn to_irmd(&self, entry: &JournalEntry) -> TlfResult<ImmutableRootMetadata> {
        decrypt_local(
            self.manager.keys().as_ref(),
            &entry.rmds,
            entry.md_id,
            entry.local_timestamp(),
        )
        .await
    }

    /// The journal's branch stands in for a null unmerged branch.
    fn effective_bid(journal_bid: BranchId, bid: BranchId, status: MergeStatus) -> BranchId {
        if status == MergeStatus::Unmerged && bid.is_null() {
            journal_bid
        } else {
            bid
        }
    }

    async fn head_from_journal(
        &self,
        id: TlfId,
        bid: BranchId,
        status: MergeStatus,
        handle: Option<&TlfHandle>,
    ) -> TlfResult<Option<ImmutableRootMetadata>> {
        let Some(journal) = self.manager.get(id) else {
            return Ok(None);
        };
        let head = {
            let md = journal.md().await;
            let bid = Self::effective_bid(md.branch_id(), bid, status);
            if status == MergeStatus::Unmerged && bid.is_null() {
                return Ok(None);
            }
            md.get_head(bid).await?
        };
        let Some(head) = head else {
            return Ok(None);
        };
        if head.rmds.md.merged_status() != status {
            return Ok(None);
        }
        if let Some(handle) = handle {
            if !handle
                .mutually_resolves_to(&head.rmds.md.handle, self.manager.keys().as_ref())
                .await?
            {
                return Err(TlfError::MdMismatch {
                    tlf: id,
                    revision: head.revision(),
                    reason: format!(
                        "journal head handle {} does not match {}",
                        head.rmds.md.handle.canonical_name(),
                        handle.canonical_name()
                    ),
                }
                .into());
            }
        }
        Ok(Some(self.to_irmd(&head).await?))
    }

    async fn range_from_journal(
        &self,
        id: TlfId,
        bid: BranchId,
        status: MergeStatus,
        start: Revision,
        stop: Revision,
    ) -> TlfResult<Vec<ImmutableRootMetadata>> {
        let entries = match self.manager.get(id) {
            Some(journal) => {
                let md = journal.md().await;
                let bid = Self::effective_bid(md.branch_id(), bid, status);
                md.get_range(bid, start, stop).await?
            }
            None => Vec::new(),
        };
        let entries: Vec<JournalEntry> = entries
            .into_iter()
            .filter(|e| e.rmds.md.merged_status() == status)
            .collect();

        let delegate = |start: Revision, stop: Revision| async move {
            match status {
                MergeStatus::Merged => self.inner.get_range(id, start, stop).await,
                MergeStatus::Unmerged => {
                    self.inner.get_unmerged_range(id, bid, start, stop).await
                }
            }
        };

        let Some(first) = entries.first().map(JournalEntry::revision) else {
            return delegate(start, stop).await;
        };
        let mut journaled = Vec::with_capacity(entries.len());
        for entry in &entries {
            journaled.push(self.to_irmd(entry).await?);
        }
        if first <= start {
            return Ok(journaled);
        }

        let mut remote = delegate(start, first.prev()).await?;
        let last = remote.last().map(|irmd| irmd.revision());
        if last != Some(first.prev()) {
            return Err(TlfError::MdMismatch {
                tlf: id,
                revision: first,
                reason: format!(
                    "server range ends at {last:?}, journal starts at {first}"
                ),
            }
            .into());
        }
        remote.extend(journaled);
        Ok(remote)
    }

    fn check_put_options(opts: &PutOptions) -> TlfResult<()> {
        if opts.lock_context.is_some() {
            return Err(TlfError::JournalUnsupported("lock contexts").into());
        }
        if opts.priority != MdPriority::Normal {
            return Err(TlfError::JournalUnsupported("non-default put priority").into());
        }
        Ok(())
    }

    async fn put_to_journal(
        &self,
        journal: &TlfJournal,
        rmd: RootMetadata,
        session: &Session,
    ) -> TlfResult<ImmutableRootMetadata> {
        let old_bid = rmd.bid();
        let data = rmd.data.clone();
        let entry = journal
            .md()
            .await
            .put(rmd, self.manager.keys().as_ref())
            .await?;
        let irmd = ImmutableRootMetadata::new(
            RootMetadata {
                bare: entry.rmds.md.clone(),
                data,
            },
            entry.md_id,
            session.verifying_key().to_bytes(),
            entry.local_timestamp(),
            false,
        );
        self.manager.cache().replace(irmd.clone(), old_bid)?;
        self.manager.signal_work();
        Ok(irmd)
    }
}

#[async_trait::async_trait]
impl MdOps for JournalMdOps {
    async fn get_for_handle(
        &self,
        handle: &TlfHandle,
        status: MergeStatus,
    ) -> TlfResult<(TlfId, Option<ImmutableRootMetadata>)> {
        // The folder ID always comes from the server.
        let (id, remote) = self.inner.get_for_handle(handle, status).await?;
        match self
            .head_from_journal(id, BranchId::NULL, status, Some(handle))
            .await?
        {
            Some(irmd) => Ok((id, Some(irmd))),
            None => Ok((id, remote)),
        }
    }

    async fn get_for_tlf(&self, id: TlfId) -> TlfResult<Option<ImmutableRootMetadata>> {
        match self
            .head_from_journal(id, BranchId::NULL, MergeStatus::Merged, None)
            .await?
        {
            Some(irmd) => Ok(Some(irmd)),
            None => self.inner.get_for_tlf(id).await,
        }
    }

    async fn get_unmerged_for_tlf(
        &self,
        id: TlfId,
        bid: BranchId,
    ) -> TlfResult<Option<ImmutableRootMetadata>> {
        match self
            .head_from_journal(id, bid, MergeStatus::Unmerged, None)
            .await?
        {
            Some(irmd) => Ok(Some(irmd)),
            None => self.inner.get_unmerged_for_tlf(id, bid).await,
        }
    }

    async fn get_range(
        &self,
        id: TlfId,
        start: Revision,
        stop: Revision,
    ) -> TlfResult<Vec<ImmutableRootMetadata>> {
        self.range_from_journal(id, BranchId::NULL, MergeStatus::Merged, start, stop)
            .await
    }

    async fn get_unmerged_range(
        &self,
        id: TlfId,
        bid: BranchId,
        start: Revision,
        stop: Revision,
    ) -> TlfResult<Vec<ImmutableRootMetadata>> {
        self.range_from_journal(id, bid, MergeStatus::Unmerged, start, stop)
            .await
    }

    async fn put(
        &self,
        rmd: RootMetadata,
        session: &Session,
        opts: PutOptions,
    ) -> TlfResult<ImmutableRootMetadata> {
        let Some(journal) = self.manager.get_or_auto_enable(rmd.tlf_id())? else {
            return self.inner.put(rmd, session, opts).await;
        };
        Self::check_put_options(&opts)?;
        if rmd.merged_status() == MergeStatus::Unmerged {
            return Err(TlfError::UnexpectedUnmergedPut {
                tlf: rmd.tlf_id(),
                revision: rmd.revision(),
            }
            .into());
        }
        self.put_to_journal(&journal, rmd, session).await
    }

    async fn put_unmerged(
        &self,
        mut rmd: RootMetadata,
        session: &Session,
    ) -> TlfResult<ImmutableRootMetadata> {
        let Some(journal) = self.manager.get_or_auto_enable(rmd.tlf_id())? else {
            return self.inner.put_unmerged(rmd, session).await;
        };
        rmd.set_unmerged();
        if rmd.bid().is_null() && journal.md().await.branch_id().is_null() {
            rmd.set_branch_id(BranchId::random());
        }
        self.put_to_journal(&journal, rmd, session).await
    }

    async fn prune_branch(&self, id: TlfId, bid: BranchId) -> TlfResult<()> {
        if let Some(journal) = self.manager.get(id) {
            journal.md().await.clear(bid).await?;
        }
        self.inner.prune_branch(id, bid).await
    }

    async fn resolve_branch(
        &self,
        id: TlfId,
        bid: BranchId,
        rmd: RootMetadata,
        session: &Session,
    ) -> TlfResult<ImmutableRootMetadata> {
        let journal = match self.manager.get(id) {
            Some(journal) => journal,
            None => return self.inner.resolve_branch(id, bid, rmd, session).await,
        };
        if journal.md().await.branch_id() != bid {
            return self.inner.resolve_branch(id, bid, rmd, session).await;
        }
        let data = rmd.data.clone();
        let entry = journal
            .md()
            .await
            .resolve_and_clear(bid, rmd, self.manager.keys().as_ref())
            .await?;
        // Revisions of the branch that were already flushed.
        self.inner.prune_branch(id, bid).await?;
        debug!(tlf = %id, bid = %bid, rev = %entry.revision(), "journaled branch resolution");

        let irmd = ImmutableRootMetadata::new(
            RootMetadata {
                bare: entry.rmds.md.clone(),
                data,
            },
            entry.md_id,
            session.verifying_key().to_bytes(),
            entry.local_timestamp(),
            false,
        );
        self.manager.cache().replace(irmd.clone(), bid)?;
        self.manager.signal_work();
        Ok(irmd)
    }
}
