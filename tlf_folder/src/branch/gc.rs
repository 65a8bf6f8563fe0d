//! Archiving the blocks a revision stopped using, and later deleting
//! their references for good.
//!
//! Every merged commit archives the references its ops dropped. A
//! reclamation pass looks at the merged revisions after the last GC op,
//! deletes the references that have been unused for long enough, and
//! commits a revision carrying a single GC op that records how far it got.

use super::FolderBranchOps;
use crate::cancel::OpContext;
use crate::locks::{LockLevel, LockState};
use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, SystemTime};
use tlf_core::{
    BlockContext, BlockId, BlockPointer, ImmutableRootMetadata, MergeStatus, Op, OpKind,
    PutOptions, Revision, TlfResult, is_revision_conflict,
};
use tracing::{debug, info, warn};

/// Revisions fetched per call while scanning history.
const SCAN_PAGE_SIZE: u64 = 100;
/// Revisions one reclamation pass covers at most.
const MAX_REVISIONS_PER_RECLAIM: u64 = 100;

fn age(irmd: &ImmutableRootMetadata) -> Duration {
    SystemTime::now()
        .duration_since(irmd.local_timestamp())
        .unwrap_or_default()
}

fn gc_revision(op: &Op) -> Option<Revision> {
    match op.kind {
        OpKind::Gc { latest_rev } => Some(latest_rev),
        _ => None,
    }
}

fn by_block(ptrs: impl IntoIterator<Item = BlockPointer>) -> BTreeMap<BlockId, Vec<BlockContext>> {
    let mut contexts: BTreeMap<BlockId, Vec<BlockContext>> = BTreeMap::new();
    for ptr in ptrs {
        let ids = contexts.entry(ptr.id).or_default();
        if !ids.contains(&ptr.context) {
            ids.push(ptr.context);
        }
    }
    contexts
}

/// Pointers unreferenced by `revs` up to `latest` that no later op in
/// `revs` referenced again. `revs` is in increasing revision order.
fn unreferenced_blocks(revs: &[ImmutableRootMetadata], latest: Revision) -> Vec<BlockPointer> {
    let mut unrefs: Vec<BlockPointer> = Vec::new();
    let mut seen = HashSet::new();
    for irmd in revs {
        for op in irmd.ops() {
            if gc_revision(op).is_some() {
                continue;
            }
            if irmd.revision() <= latest {
                for ptr in op.unrefs.iter().filter(|p| p.is_valid()) {
                    if seen.insert(*ptr) {
                        unrefs.push(*ptr);
                    }
                }
            }
            if !op.refs.is_empty() {
                unrefs.retain(|p| !op.refs.contains(p));
                for ptr in &op.refs {
                    seen.remove(ptr);
                }
            }
        }
    }
    unrefs
}

impl FolderBranchOps {
    /// Archives the references the ops of a committed merged revision
    /// dropped. Failures are logged; reclamation deletes the references
    /// later either way.
    pub(super) async fn archive_unrefs(&self, irmd: &ImmutableRootMetadata) {
        if irmd.merged_status() != MergeStatus::Merged {
            return;
        }
        let contexts = by_block(
            irmd.ops()
                .iter()
                .filter(|op| gc_revision(op).is_none())
                .flat_map(|op| {
                    op.unrefs
                        .iter()
                        .filter(|p| p.is_valid() && !op.refs.contains(p))
                        .copied()
                }),
        );
        if contexts.is_empty() {
            return;
        }
        let blocks = contexts.len();
        match self
            .ctx
            .block_server
            .archive_block_references(self.tlf, contexts)
            .await
        {
            Ok(()) => debug!(tlf = %self.tlf, rev = %irmd.revision(), blocks, "archived unreferenced blocks"),
            Err(err) => warn!(tlf = %self.tlf, rev = %irmd.revision(), "archiving unreferenced blocks failed: {err:#}"),
        }
    }

    /// Deletes the references of blocks that have been unreferenced for
    /// at least `gc_min_unref_age`, and commits a GC op recording the last
    /// revision covered. Returns that revision, or `None` if there was
    /// nothing to do.
    pub async fn reclaim_quota(&self, ctx: &OpContext) -> TlfResult<Option<Revision>> {
        let lstate = LockState::new();
        let writer = self.md_writer.lock(&lstate).await;
        let res = self.reclaim_locked(&lstate, ctx).await;
        drop(writer);
        self.observers.flush().await;
        res
    }

    async fn reclaim_locked(&self, lstate: &LockState, ctx: &OpContext) -> TlfResult<Option<Revision>> {
        lstate.assert_held(LockLevel::MdWriter);
        ctx.check()?;
        let head = self.head_rmd(lstate).await?;
        if head.merged_status() == MergeStatus::Unmerged || self.blocks.read(lstate).await.is_dirty() {
            debug!(tlf = %self.tlf, "not reclaiming on a dirty or unmerged folder");
            return Ok(None);
        }
        let session = &self.ctx.session;
        if !head.handle().is_writer(&session.uid) {
            return Ok(None);
        }
        let self_wrote = head.last_writer_verifying_key() == &session.verifying_key().to_bytes();
        if !self_wrote && age(&head) < self.ctx.config.gc_min_head_age() {
            debug!(tlf = %self.tlf, rev = %head.revision(), "head is too fresh to reclaim behind");
            return Ok(None);
        }
        if let [op] = head.ops()
            && gc_revision(op) == Some(head.revision().prev())
        {
            return Ok(None);
        }

        let (old_enough, last_gc) = self.reclaim_bounds(ctx, &head).await?;
        let Some(old_enough) = old_enough.filter(|rev| *rev > last_gc) else {
            return Ok(None);
        };
        let latest = old_enough.min(Revision(last_gc.0 + MAX_REVISIONS_PER_RECLAIM));

        let revs = self.merged_history(ctx, last_gc.next(), head.revision()).await?;
        let unrefs = unreferenced_blocks(&revs, latest);
        let live = if unrefs.is_empty() {
            BTreeMap::new()
        } else {
            ctx.run(
                self.ctx
                    .block_server
                    .remove_block_references(self.tlf, by_block(unrefs.iter().copied())),
            )
            .await?
        };

        let mut gc = Op::new(OpKind::Gc { latest_rev: latest });
        let mut deleted = HashSet::new();
        gc.unrefs = unrefs
            .iter()
            .filter(|p| live.get(&p.id) == Some(&0) && deleted.insert(p.id))
            .copied()
            .collect();
        let mut rmd = head.make_successor(head.md_id());
        rmd.set_last_modifying_writer(session.uid);
        rmd.add_op(gc);

        let res = ctx
            .run(self.ctx.md_ops.put(rmd, session, PutOptions::default()))
            .await;
        match res {
            Ok(irmd) => {
                let rev = irmd.revision();
                self.set_head_successor(lstate, irmd, false, None).await?;
                info!(
                    tlf = %self.tlf,
                    rev = %rev,
                    through = %latest,
                    references = unrefs.len(),
                    deleted = deleted.len(),
                    "reclaimed unreferenced blocks"
                );
                Ok(Some(latest))
            }
            Err(err) if is_revision_conflict(&err) => {
                debug!(tlf = %self.tlf, "head moved during reclamation, retrying later: {err:#}");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Walks back from `head` for the newest revision old enough to
    /// reclaim and the revision the last GC op covered.
    async fn reclaim_bounds(
        &self,
        ctx: &OpContext,
        head: &ImmutableRootMetadata,
    ) -> TlfResult<(Option<Revision>, Revision)> {
        let min_age = self.ctx.config.gc_min_unref_age();
        let mut old_enough = None;
        let mut last_gc = None;
        let mut stop = head.revision();
        while stop >= Revision::INITIAL {
            let start = Revision(stop.0.saturating_sub(SCAN_PAGE_SIZE - 1).max(Revision::INITIAL.0));
            let page = ctx
                .run(self.ctx.md_ops.get_range(self.tlf, start, stop))
                .await?;
            for irmd in page.iter().rev() {
                if old_enough.is_none() && age(irmd) >= min_age {
                    old_enough = Some(irmd.revision());
                }
                if last_gc.is_none() {
                    last_gc = irmd.ops().iter().rev().find_map(gc_revision);
                }
                if let (Some(old_enough), Some(last_gc)) = (old_enough, last_gc) {
                    return Ok((Some(old_enough), last_gc));
                }
            }
            stop = start.prev();
        }
        Ok((old_enough, last_gc.unwrap_or(Revision::UNINITIALIZED)))
    }

    async fn merged_history(
        &self,
        ctx: &OpContext,
        start: Revision,
        stop: Revision,
    ) -> TlfResult<Vec<ImmutableRootMetadata>> {
        let mut revs = Vec::new();
        let mut from = start;
        while from <= stop {
            let to = Revision(from.0.saturating_add(SCAN_PAGE_SIZE - 1).min(stop.0));
            revs.extend(
                ctx.run(self.ctx.md_ops.get_range(self.tlf, from, to))
                    .await?,
            );
            from = to.next();
        }
        Ok(revs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tlf_core::{EntryKind, KeyGen, MdId, RootMetadata, TlfHandle, TlfId, UserId};

    fn ptr(seed: u8) -> BlockPointer {
        BlockPointer {
            id: BlockId::from_payload(&[seed]),
            key_gen: KeyGen::FIRST,
            data_ver: BlockPointer::DATA_VER,
            context: BlockContext::first(UserId::from_bytes([1; 16])),
            encoded_size: 1,
        }
    }

    fn revision(rev: u64, refs: Vec<BlockPointer>, unrefs: Vec<BlockPointer>) -> ImmutableRootMetadata {
        let uid = UserId::from_bytes([1; 16]);
        let root = tlf_core::DirEntry {
            kind: EntryKind::Dir,
            ptr: ptr(0),
            size: 1,
            mtime_ms: 0,
            exec: false,
        };
        let mut rmd =
            RootMetadata::new_initial(TlfId::random(), TlfHandle::private(uid), uid, KeyGen::FIRST, root);
        rmd.set_revision(Revision(rev));
        let mut op = Op::new(OpKind::Sync {
            dir: "/".into(),
            name: "f".into(),
            writes: Vec::new(),
        });
        op.refs = refs;
        op.unrefs = unrefs;
        rmd.add_op(op);
        ImmutableRootMetadata::new(rmd, MdId::random(), [0; 32], SystemTime::now(), true)
    }

    #[test]
    fn unrefs_are_gathered_up_to_the_latest_revision() {
        let revs = [
            revision(2, vec![ptr(2)], vec![ptr(1)]),
            revision(3, vec![ptr(3)], vec![ptr(2)]),
            revision(4, vec![ptr(4)], vec![ptr(3)]),
        ];
        assert_eq!(unreferenced_blocks(&revs, Revision(3)), vec![ptr(1), ptr(2)]);
    }

    #[test]
    fn blocks_referenced_again_are_kept() {
        let revs = [
            revision(2, Vec::new(), vec![ptr(1), ptr(2)]),
            revision(3, vec![ptr(1)], Vec::new()),
            revision(4, vec![ptr(2)], Vec::new()),
        ];
        assert!(unreferenced_blocks(&revs, Revision(2)).is_empty());
    }

    #[test]
    fn contexts_are_grouped_per_block() {
        let mut other = ptr(1);
        other.context.ref_nonce = tlf_core::RefNonce::random();
        let grouped = by_block([ptr(1), other, ptr(1)]);
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped[&ptr(1).id].len(), 2);
    }
}
