//! Seams to the remote metadata and block authorities.

use crate::TlfResult;
use crate::block::{BlockContext, BlockId, KeyServerHalf};
use crate::handle::TlfHandle;
use crate::ids::{BranchId, Revision, TlfId};
use crate::md::{MergeStatus, RootMetadataSigned};
use bytes::Bytes;
use std::collections::BTreeMap;
use tokio::sync::oneshot;

/// Fires once the folder's merged head moves past the registered revision.
pub type UpdateReceiver = oneshot::Receiver<TlfResult<()>>;

/// Priority hint for metadata puts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MdPriority {
    #[default]
    Normal,
    High,
}

/// Server-side lock a put may require.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockContext {
    pub lock_id: u64,
    pub release_after_success: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PutOptions {
    pub lock_context: Option<LockContext>,
    pub priority: MdPriority,
}

/// The remote metadata authority, as seen by one device.
#[async_trait::async_trait]
pub trait MdServer: std::fmt::Debug + Send + Sync + 'static {
    /// Returns the folder ID for `handle` (creating it when unknown) and
    /// the head of the requested merge status, if any.
    async fn get_for_handle(
        &self,
        handle: &TlfHandle,
        status: MergeStatus,
    ) -> TlfResult<(TlfId, Option<RootMetadataSigned>)>;

    /// Returns the head of `bid`. For `Unmerged` with a null branch, the
    /// branch this device is currently on is used.
    async fn get_for_tlf(
        &self,
        id: TlfId,
        bid: BranchId,
        status: MergeStatus,
    ) -> TlfResult<Option<RootMetadataSigned>>;

    /// Returns the inclusive range `start..=stop`, truncated to what exists.
    async fn get_range(
        &self,
        id: TlfId,
        bid: BranchId,
        status: MergeStatus,
        start: Revision,
        stop: Revision,
    ) -> TlfResult<Vec<RootMetadataSigned>>;

    /// Submits a signed revision. Rejects non-successors with a conflict.
    async fn put(&self, rmds: RootMetadataSigned, opts: PutOptions) -> TlfResult<()>;

    /// Forgets this device's unmerged branch `bid`.
    async fn prune_branch(&self, id: TlfId, bid: BranchId) -> TlfResult<()>;

    /// Registers interest in merged revisions after `current`.
    async fn register_for_update(&self, id: TlfId, current: Revision) -> TlfResult<UpdateReceiver>;

    /// Estimated `server_time - local_time` in milliseconds, when known.
    fn offset_from_server_time(&self) -> Option<i64>;
}

/// The remote block authority.
#[async_trait::async_trait]
pub trait BlockServer: std::fmt::Debug + Send + Sync + 'static {
    async fn get(
        &self,
        tlf: TlfId,
        id: BlockId,
        context: BlockContext,
    ) -> TlfResult<(Bytes, KeyServerHalf)>;

    async fn put(
        &self,
        tlf: TlfId,
        id: BlockId,
        context: BlockContext,
        buf: Bytes,
        server_half: KeyServerHalf,
    ) -> TlfResult<()>;

    async fn add_block_reference(
        &self,
        tlf: TlfId,
        id: BlockId,
        context: BlockContext,
    ) -> TlfResult<()>;

    /// Removes references and returns the live references left per block.
    async fn remove_block_references(
        &self,
        tlf: TlfId,
        contexts: BTreeMap<BlockId, Vec<BlockContext>>,
    ) -> TlfResult<BTreeMap<BlockId, usize>>;

    async fn archive_block_references(
        &self,
        tlf: TlfId,
        contexts: BTreeMap<BlockId, Vec<BlockContext>>,
    ) -> TlfResult<()>;
}
