use tlf_core::{
    BranchId, ImmutableRootMetadata, MergeStatus, PutOptions, Revision, RootMetadata, Session,
    TlfHandle, TlfId, TlfResult,
};

/// Verified access to a folder's revision history.
///
/// Everything returned has been decrypted and checked; everything put is
/// signed with the given session's device key.
#[async_trait::async_trait]
pub trait MdOps: std::fmt::Debug + Send + Sync + 'static {
    /// The folder ID for `handle` and its head of the requested status.
    async fn get_for_handle(
        &self,
        handle: &TlfHandle,
        status: MergeStatus,
    ) -> TlfResult<(TlfId, Option<ImmutableRootMetadata>)>;

    async fn get_for_tlf(&self, id: TlfId) -> TlfResult<Option<ImmutableRootMetadata>>;

    /// Head of the unmerged branch `bid`; a null `bid` means this
    /// device's current branch.
    async fn get_unmerged_for_tlf(
        &self,
        id: TlfId,
        bid: BranchId,
    ) -> TlfResult<Option<ImmutableRootMetadata>>;

    /// Merged revisions `start..=stop`, oldest first.
    async fn get_range(
        &self,
        id: TlfId,
        start: Revision,
        stop: Revision,
    ) -> TlfResult<Vec<ImmutableRootMetadata>>;

    async fn get_unmerged_range(
        &self,
        id: TlfId,
        bid: BranchId,
        start: Revision,
        stop: Revision,
    ) -> TlfResult<Vec<ImmutableRootMetadata>>;

    /// Puts a merged revision.
    async fn put(
        &self,
        rmd: RootMetadata,
        session: &Session,
        opts: PutOptions,
    ) -> TlfResult<ImmutableRootMetadata>;

    /// Puts `rmd` on an unmerged branch, starting a new one when its
    /// branch ID is null.
    async fn put_unmerged(
        &self,
        rmd: RootMetadata,
        session: &Session,
    ) -> TlfResult<ImmutableRootMetadata>;

    async fn prune_branch(&self, id: TlfId, bid: BranchId) -> TlfResult<()>;

    /// Puts the merged resolution of branch `bid` and then prunes it.
    async fn resolve_branch(
        &self,
        id: TlfId,
        bid: BranchId,
        rmd: RootMetadata,
        session: &Session,
    ) -> TlfResult<ImmutableRootMetadata>;
}
