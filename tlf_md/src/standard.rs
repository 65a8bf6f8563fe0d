use crate::cache::MdCache;
use crate::envelope::{decrypt_private, sign_md};
use crate::ops::MdOps;
use anyhow::Context;
use ed25519_dalek::VerifyingKey;
use futures::future::BoxFuture;
use futures::{StreamExt, stream};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tlf_core::{
    BranchId, ImmutableRootMetadata, KeyService, KeyStatus, MdId, MdServer, MergeStatus,
    PutOptions, Revision, RootMetadata, RootMetadataSigned, Session, TlfConfig, TlfError,
    TlfHandle, TlfId, TlfResult, UserId,
};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// [`MdOps`] backed directly by a remote [`MdServer`].
#[derive(Debug, Clone)]
pub struct MdOpsStandard {
    server: Arc<dyn MdServer>,
    keys: Arc<dyn KeyService>,
    cache: Arc<MdCache>,
    config: TlfConfig,
}

impl MdOpsStandard {
    pub fn new(
        server: Arc<dyn MdServer>,
        keys: Arc<dyn KeyService>,
        cache: Arc<MdCache>,
        config: TlfConfig,
    ) -> Self {
        Self {
            server,
            keys,
            cache,
            config,
        }
    }

    pub fn cache(&self) -> &Arc<MdCache> {
        &self.cache
    }

    pub fn server(&self) -> &Arc<dyn MdServer> {
        &self.server
    }

    fn local_timestamp(&self, rmds: &RootMetadataSigned) -> SystemTime {
        let server_ts = rmds.server_timestamp();
        match self.server.offset_from_server_time() {
            Some(offset) if offset >= 0 => server_ts
                .checked_sub(Duration::from_millis(offset.unsigned_abs()))
                .unwrap_or(server_ts),
            Some(offset) => server_ts + Duration::from_millis(offset.unsigned_abs()),
            None => server_ts,
        }
    }

    async fn writer_name(&self, uid: UserId) -> String {
        match self.keys.normalized_username(uid).await {
            Ok(name) => name,
            Err(_) => format!("uid: {uid}"),
        }
    }

    /// Checks `key` for `uid` at the revision's server time. Returns
    /// whether the verified revision may be cached.
    async fn verify_key(
        &self,
        rmds: &RootMetadataSigned,
        uid: UserId,
        key: &[u8; 32],
    ) -> TlfResult<bool> {
        let md = &rmds.md;
        let unverifiable = |writer: String, reason: String| TlfError::UnverifiableUpdate {
            tlf: md.tlf_id(),
            writer,
            reason,
        };
        let key = VerifyingKey::from_bytes(key).map_err(|e| TlfError::MdMismatch {
            tlf: md.tlf_id(),
            revision: md.revision,
            reason: format!("malformed verifying key: {e}"),
        })?;
        let server_ts = rmds.server_timestamp();
        match self.keys.verifying_key_status(uid, &key, server_ts).await? {
            KeyStatus::Valid => Ok(true),
            KeyStatus::Revoked { at } => {
                // The server may have accepted the write shortly after the
                // revocation before learning about it.
                if server_ts <= at + self.config.revocation_allowance() {
                    Ok(true)
                } else {
                    Err(unverifiable(
                        self.writer_name(uid).await,
                        format!("key was revoked before revision {}", md.revision),
                    )
                    .into())
                }
            }
            KeyStatus::NotFound if md.handle.is_finalized() => {
                debug!(tlf = %md.tlf_id(), rev = %md.revision, "accepting unverified revision of finalized folder");
                Ok(false)
            }
            KeyStatus::NotFound => Err(unverifiable(
                self.writer_name(uid).await,
                format!("revision {}: {}", md.revision, TlfError::VerifyingKeyNotFound),
            )
            .into()),
        }
    }

    async fn verify_writer_key(
        &self,
        rmds: &RootMetadataSigned,
        walk_lock: Option<&Mutex<()>>,
    ) -> TlfResult<bool> {
        let md = &rmds.md;
        let writer_sig = md.writer_sig.ok_or_else(|| TlfError::MdMismatch {
            tlf: md.tlf_id(),
            revision: md.revision,
            reason: "missing writer signature".into(),
        })?;
        if !md.is_writer_metadata_copied() {
            let writer = md.writer_metadata.last_modifying_writer;
            if writer == md.last_modifying_user
                && writer_sig.verifying_key == rmds.sig.verifying_key
            {
                // Covered by the last-modifying-user check.
                return Ok(true);
            }
            return self
                .verify_key(rmds, writer, &writer_sig.verifying_key)
                .await;
        }

        // Copied writer metadata only comes from rekeys and finalizations,
        // which never happen on a branch.
        if md.merged_status() != MergeStatus::Merged {
            return Err(TlfError::MdMismatch {
                tlf: md.tlf_id(),
                revision: md.revision,
                reason: "copied writer metadata on an unmerged revision".into(),
            }
            .into());
        }
        let _guard = match walk_lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        let page = self.config.copied_writer_md_page_size.max(1);
        let mut stop = md.revision.prev();
        while stop.is_initialized() {
            let start = Revision(stop.0.saturating_sub(page - 1).max(Revision::INITIAL.0));
            let fetched = self
                .server
                .get_range(md.tlf_id(), md.bid(), MergeStatus::Merged, start, stop)
                .await?;
            let Some(writer_rmds) = fetched
                .into_iter()
                .rev()
                .find(|r| !r.md.is_writer_metadata_copied())
            else {
                stop = start.prev();
                continue;
            };
            let writer_rev = writer_rmds.md.revision;
            let writer_irmd = match self.cache.get(md.tlf_id(), writer_rev, md.bid())? {
                Some(irmd) => irmd,
                None => self.process_metadata(writer_rmds, None).await?,
            };
            let buf = writer_irmd.bare.serialized_writer_metadata()?;
            writer_sig.verify(&buf).map_err(|e| TlfError::MdMismatch {
                tlf: md.tlf_id(),
                revision: md.revision,
                reason: format!("copied writer metadata does not match revision {writer_rev}: {e}"),
            })?;
            debug!(tlf = %md.tlf_id(), rev = %md.revision, writer_rev = %writer_rev, "verified copied writer metadata");
            return Ok(true);
        }
        Err(TlfError::MdMismatch {
            tlf: md.tlf_id(),
            revision: md.revision,
            reason: "no earlier revision carries the copied writer metadata".into(),
        }
        .into())
    }

    /// Decrypts and verifies one fetched revision, caching it when every
    /// key check succeeded.
    fn process_metadata<'a>(
        &'a self,
        rmds: RootMetadataSigned,
        walk_lock: Option<&'a Mutex<()>>,
    ) -> BoxFuture<'a, TlfResult<ImmutableRootMetadata>> {
        Box::pin(async move {
            let data = decrypt_private(self.keys.as_ref(), &rmds.md).await?;
            let md_id = rmds.md.md_id()?;
            let local_ts = self.local_timestamp(&rmds);

            rmds.md.is_valid_and_signed(&rmds.sig)?;
            let writer_cacheable = self.verify_writer_key(&rmds, walk_lock).await?;
            let user_cacheable = self
                .verify_key(&rmds, rmds.md.last_modifying_user, &rmds.sig.verifying_key)
                .await?;

            let writer_key = rmds
                .md
                .writer_sig
                .map_or(rmds.sig.verifying_key, |s| s.verifying_key);
            let irmd = ImmutableRootMetadata::new(
                RootMetadata {
                    bare: rmds.md,
                    data,
                },
                md_id,
                writer_key,
                local_ts,
                true,
            );
            if writer_cacheable && user_cacheable {
                self.cache.put(irmd.clone())?;
            }
            Ok(irmd)
        })
    }

    async fn process_metadata_with_id(
        &self,
        id: TlfId,
        bid: BranchId,
        rmds: RootMetadataSigned,
        walk_lock: Option<&Mutex<()>>,
    ) -> TlfResult<ImmutableRootMetadata> {
        let md = &rmds.md;
        if md.tlf_id() != id {
            return Err(TlfError::MdMismatch {
                tlf: id,
                revision: md.revision,
                reason: format!("server returned a revision of {}", md.tlf_id()),
            }
            .into());
        }
        if !bid.is_null() && md.bid() != bid {
            return Err(TlfError::MdMismatch {
                tlf: id,
                revision: md.revision,
                reason: format!("expected branch {bid}, got {}", md.bid()),
            }
            .into());
        }
        self.process_metadata(rmds, walk_lock).await
    }

    async fn get_for_tlf_inner(
        &self,
        id: TlfId,
        bid: BranchId,
        status: MergeStatus,
    ) -> TlfResult<Option<ImmutableRootMetadata>> {
        let Some(rmds) = self.server.get_for_tlf(id, bid, status).await? else {
            return Ok(None);
        };
        Ok(Some(
            self.process_metadata_with_id(id, bid, rmds, None).await?,
        ))
    }

    /// Verifies a fetched range in parallel, then checks that it forms a
    /// chain.
    async fn process_range(
        &self,
        id: TlfId,
        bid: BranchId,
        rmdses: Vec<RootMetadataSigned>,
    ) -> TlfResult<Vec<ImmutableRootMetadata>> {
        let Some(first) = rmdses.first() else {
            return Ok(Vec::new());
        };
        let start = first.md.revision;
        let expected = rmdses.len();
        let walk_lock = Mutex::new(());
        let workers = expected.min(self.config.max_mds_at_a_time.max(1));

        let mut slots: Vec<Option<ImmutableRootMetadata>> = vec![None; expected];
        let mut results = stream::iter(rmdses)
            .map(|rmds| self.process_metadata_with_id(id, bid, rmds, Some(&walk_lock)))
            .buffer_unordered(workers);
        while let Some(irmd) = results.next().await {
            let irmd = irmd?;
            let rev = irmd.revision();
            let mismatch = |reason: String| TlfError::MdMismatch {
                tlf: id,
                revision: rev,
                reason,
            };
            let slot = rev
                .0
                .checked_sub(start.0)
                .and_then(|i| usize::try_from(i).ok())
                .filter(|i| *i < expected)
                .ok_or_else(|| {
                    mismatch(format!(
                        "unexpected revision; expected {start} to {}",
                        Revision(start.0 + expected as u64 - 1)
                    ))
                })?;
            if slots[slot].is_some() {
                return Err(mismatch("revision served twice".into()).into());
            }
            slots[slot] = Some(irmd);
        }
        drop(results);

        let mut irmds = Vec::with_capacity(expected);
        for (i, slot) in slots.into_iter().enumerate() {
            let irmd = slot.ok_or_else(|| TlfError::MdMismatch {
                tlf: id,
                revision: Revision(start.0 + i as u64),
                reason: "revision missing from range".into(),
            })?;
            irmds.push(irmd);
        }
        for pair in irmds.windows(2) {
            pair[0]
                .bare
                .check_valid_successor_strict(pair[0].md_id(), &pair[1].bare)?;
        }
        Ok(irmds)
    }

    async fn get_range_inner(
        &self,
        id: TlfId,
        bid: BranchId,
        status: MergeStatus,
        start: Revision,
        stop: Revision,
    ) -> TlfResult<Vec<ImmutableRootMetadata>> {
        let rmdses = self
            .server
            .get_range(id, bid, status, start, stop)
            .await
            .with_context(|| format!("while fetching revisions {start}..={stop} of {id}"))?;
        self.process_range(id, bid, rmdses).await
    }

    async fn put_inner(
        &self,
        rmd: RootMetadata,
        session: &Session,
        opts: PutOptions,
    ) -> TlfResult<ImmutableRootMetadata> {
        let rmds = sign_md(self.keys.as_ref(), session, &rmd).await?;
        let md_id: MdId = rmds.md.md_id()?;
        self.server.put(rmds.clone(), opts).await?;
        debug!(tlf = %rmd.tlf_id(), rev = %rmd.revision(), bid = %rmd.bid(), "put revision");

        let bid = rmd.bid();
        let irmd = ImmutableRootMetadata::new(
            RootMetadata {
                bare: rmds.md,
                data: rmd.data,
            },
            md_id,
            session.verifying_key().to_bytes(),
            SystemTime::now(),
            true,
        );
        // Locally written revisions override anything cached from a race.
        self.cache.replace(irmd.clone(), bid)?;
        Ok(irmd)
    }
}

#[async_trait::async_trait]
impl MdOps for MdOpsStandard {
    async fn get_for_handle(
        &self,
        handle: &TlfHandle,
        status: MergeStatus,
    ) -> TlfResult<(TlfId, Option<ImmutableRootMetadata>)> {
        let (id, rmds) = self.server.get_for_handle(handle, status).await?;

        if !handle.public {
            let session = self.keys.current_session().await?;
            let resolved = handle.resolve(self.keys.as_ref()).await?;
            if !resolved.is_reader(&session.uid) {
                return Err(TlfError::ReadAccess {
                    tlf: id,
                    user: session.name,
                }
                .into());
            }
        }

        let Some(rmds) = rmds else {
            return Ok((id, None));
        };
        if !handle
            .mutually_resolves_to(&rmds.md.handle, self.keys.as_ref())
            .await?
        {
            warn!(tlf = %id, requested = %handle.canonical_name(), got = %rmds.md.handle.canonical_name(), "handle mismatch");
            return Err(TlfError::MdMismatch {
                tlf: id,
                revision: rmds.md.revision,
                reason: format!(
                    "requested handle {} does not match {}",
                    handle.canonical_name(),
                    rmds.md.handle.canonical_name()
                ),
            }
            .into());
        }

        let irmd = self
            .process_metadata_with_id(id, BranchId::NULL, rmds, None)
            .await?;
        Ok((id, Some(irmd)))
    }

    async fn get_for_tlf(&self, id: TlfId) -> TlfResult<Option<ImmutableRootMetadata>> {
        self.get_for_tlf_inner(id, BranchId::NULL, MergeStatus::Merged)
            .await
    }

    async fn get_unmerged_for_tlf(
        &self,
        id: TlfId,
        bid: BranchId,
    ) -> TlfResult<Option<ImmutableRootMetadata>> {
        self.get_for_tlf_inner(id, bid, MergeStatus::Unmerged).await
    }

    async fn get_range(
        &self,
        id: TlfId,
        start: Revision,
        stop: Revision,
    ) -> TlfResult<Vec<ImmutableRootMetadata>> {
        self.get_range_inner(id, BranchId::NULL, MergeStatus::Merged, start, stop)
            .await
    }

    async fn get_unmerged_range(
        &self,
        id: TlfId,
        bid: BranchId,
        start: Revision,
        stop: Revision,
    ) -> TlfResult<Vec<ImmutableRootMetadata>> {
        self.get_range_inner(id, bid, MergeStatus::Unmerged, start, stop)
            .await
    }

    async fn put(
        &self,
        rmd: RootMetadata,
        session: &Session,
        opts: PutOptions,
    ) -> TlfResult<ImmutableRootMetadata> {
        if rmd.merged_status() == MergeStatus::Unmerged {
            return Err(TlfError::UnexpectedUnmergedPut {
                tlf: rmd.tlf_id(),
                revision: rmd.revision(),
            }
            .into());
        }
        self.put_inner(rmd, session, opts).await
    }

    async fn put_unmerged(
        &self,
        mut rmd: RootMetadata,
        session: &Session,
    ) -> TlfResult<ImmutableRootMetadata> {
        rmd.set_unmerged();
        if rmd.bid().is_null() {
            rmd.set_branch_id(BranchId::random());
        }
        self.put_inner(rmd, session, PutOptions::default()).await
    }

    async fn prune_branch(&self, id: TlfId, bid: BranchId) -> TlfResult<()> {
        self.server.prune_branch(id, bid).await
    }

    async fn resolve_branch(
        &self,
        id: TlfId,
        bid: BranchId,
        rmd: RootMetadata,
        session: &Session,
    ) -> TlfResult<ImmutableRootMetadata> {
        let irmd = self.put(rmd, session, PutOptions::default()).await?;
        // A crash between the two leaves a stale branch behind, which the
        // next prune of this device's branch cleans up.
        self.prune_branch(id, bid).await?;
        Ok(irmd)
    }
}
