//! Deciding which local operations survive a conflict.

use std::collections::HashSet;
use std::time::SystemTime;
use tlf_core::{NodeChange, Op, Revision, TlfId, TlfResult};

/// An operation with the revision that carried it and that revision's
/// local timestamp.
#[derive(Clone, Debug)]
pub struct TimedOp {
    pub op: Op,
    pub revision: Revision,
    pub at: SystemTime,
}

#[derive(Clone, Debug)]
pub struct ResolveInput {
    pub tlf: TlfId,
    /// Last merged revision the unmerged branch has in common.
    pub branch_point: Revision,
    /// Merged operations after the branch point, oldest first.
    pub merged: Vec<TimedOp>,
    /// This device's unmerged operations, oldest first.
    pub unmerged: Vec<TimedOp>,
}

/// Resolves an unmerged branch against the merged history.
#[async_trait::async_trait]
pub trait ConflictResolver: std::fmt::Debug + Send + Sync + 'static {
    /// The unmerged operations to replay on top of the merged head, in
    /// order. An error makes the engine discard the branch instead.
    async fn resolve(&self, input: &ResolveInput) -> TlfResult<Vec<Op>>;
}

/// Replays every local operation except those on an entry that a merged
/// operation touched strictly later (last writer wins).
#[derive(Clone, Copy, Debug, Default)]
pub struct ReplayResolver;

fn entry_changes(op: &Op) -> impl Iterator<Item = NodeChange> {
    op.changes().into_iter().filter(|c| c.name.is_some())
}

#[async_trait::async_trait]
impl ConflictResolver for ReplayResolver {
    async fn resolve(&self, input: &ResolveInput) -> TlfResult<Vec<Op>> {
        let mut kept = Vec::with_capacity(input.unmerged.len());
        for local in &input.unmerged {
            let targets: HashSet<NodeChange> = entry_changes(&local.op).collect();
            let overridden = input.merged.iter().any(|remote| {
                remote.at > local.at && entry_changes(&remote.op).any(|c| targets.contains(&c))
            });
            if overridden {
                tracing::debug!(tlf = %input.tlf, rev = %local.revision, op = ?local.op.kind, "dropping local op overridden by a later merged op");
            } else {
                kept.push(local.op.clone());
            }
        }
        Ok(kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tlf_core::{EntryKind, OpKind, WriteRange};

    fn timed(op: OpKind, rev: u64, secs: u64) -> TimedOp {
        TimedOp {
            op: Op::new(op),
            revision: Revision(rev),
            at: SystemTime::UNIX_EPOCH + Duration::from_secs(secs),
        }
    }

    fn sync(name: &str) -> OpKind {
        OpKind::Sync {
            dir: "/".into(),
            name: name.into(),
            writes: vec![WriteRange { off: 0, len: 1 }],
        }
    }

    #[tokio::test]
    async fn later_remote_write_wins() {
        let input = ResolveInput {
            tlf: TlfId::random(),
            branch_point: Revision(5),
            merged: vec![timed(sync("shared.txt"), 6, 20)],
            unmerged: vec![
                timed(sync("shared.txt"), 6, 10),
                timed(
                    OpKind::Create {
                        dir: "/".into(),
                        name: "mine.txt".into(),
                        kind: EntryKind::File,
                    },
                    6,
                    10,
                ),
            ],
        };
        let kept = ReplayResolver.resolve(&input).await.unwrap();
        assert_eq!(kept.len(), 1);
        assert!(matches!(&kept[0].kind, OpKind::Create { name, .. } if name == "mine.txt"));
    }

    #[tokio::test]
    async fn ties_keep_the_local_op() {
        let input = ResolveInput {
            tlf: TlfId::random(),
            branch_point: Revision(1),
            merged: vec![timed(sync("f"), 2, 10)],
            unmerged: vec![timed(sync("f"), 2, 10)],
        };
        assert_eq!(ReplayResolver.resolve(&input).await.unwrap().len(), 1);
    }
}
