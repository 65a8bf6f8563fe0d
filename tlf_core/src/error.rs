//! Classified failures of the storage core.
//!
//! Lower layers propagate [`anyhow::Error`] unchanged; anything that needs
//! to be told apart by a caller is a [`TlfError`] somewhere in the chain,
//! found again with [`classify`].

use crate::block::{BlockContext, BlockId};
use crate::ids::{BranchId, MdId, Revision, TlfId};
use thiserror::Error;

/// How a failure should be treated by whoever sees it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient; retrying the same call may succeed.
    Transient,
    /// Optimistic-concurrency failure, resolved by branching or refreshing.
    Conflict,
    /// Trust or consistency violation; needs intervention, never retried.
    Structural,
    /// Invariant violation; the triggering call must fail.
    Fatal,
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TlfError {
    // Remote metadata authority conflicts.
    #[error("conflict: expected revision {expected}, got {actual}")]
    ServerConflictRevision { expected: Revision, actual: Revision },
    #[error("conflict: expected previous root {expected}, got {actual}")]
    ServerConflictPrevRoot { expected: MdId, actual: MdId },
    #[error("conflict: expected disk usage {expected}, got {actual}")]
    ServerConflictDiskUsage { expected: u64, actual: u64 },
    #[error("bad request to metadata server: {0}")]
    ServerBadRequest(String),

    // Metadata verification.
    #[error("metadata mismatch for {tlf} revision {revision}: {reason}")]
    MdMismatch {
        tlf: TlfId,
        revision: Revision,
        reason: String,
    },
    #[error("unverifiable update of {tlf} by {writer}: {reason}")]
    UnverifiableUpdate {
        tlf: TlfId,
        writer: String,
        reason: String,
    },
    #[error("verifying key not found")]
    VerifyingKeyNotFound,
    #[error("{user} has no read access to {tlf}")]
    ReadAccess { tlf: TlfId, user: String },
    #[error("cannot put an unmerged revision {revision} of {tlf} as merged")]
    UnexpectedUnmergedPut { tlf: TlfId, revision: Revision },

    // Blocks.
    #[error("block {0} does not exist")]
    BlockNonExistent(BlockId),
    #[error("block {id} still has {count} references")]
    BlockStillReferenced { id: BlockId, count: usize },
    #[error("reference context mismatch: expected {expected:?}, got {actual:?}")]
    RefContextMismatch {
        expected: BlockContext,
        actual: BlockContext,
    },
    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: BlockId, actual: BlockId },
    #[error("key server half mismatch for block {0}")]
    ServerHalfMismatch(BlockId),
    #[error("invalid block put: {0}")]
    InvalidBlockPut(String),

    // Head state machine.
    #[error("{tlf} is unmerged on branch {branch}")]
    Unmerged { tlf: TlfId, branch: BranchId },
    #[error("exclusive write of {name} hit an unmerged state; retry after resolution")]
    ExclOnUnmerged { name: String },
    #[error("unmerged put of {tlf} revision {revision} conflicted with itself")]
    UnmergedSelfConflict { tlf: TlfId, revision: Revision },
    #[error("cannot apply remote updates to {0} while local changes are unflushed")]
    NoUpdatesWhileDirty(TlfId),
    #[error("handle of {tlf} changed incompatibly: {old} -> {new}")]
    IncompatibleHandle {
        tlf: TlfId,
        old: String,
        new: String,
    },
    #[error("journal of {tlf} is on branch {branch} but received a merged put")]
    JournalConflict { tlf: TlfId, branch: BranchId },
    #[error("journaling does not support {0}")]
    JournalUnsupported(&'static str),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    Exists(String),
    #[error("{0} is not a directory")]
    NotDir(String),
    #[error("{0} is a directory")]
    IsDir(String),
    #[error("{path} would grow to {size} bytes, over the limit of {max}")]
    FileTooBig { path: String, size: u64, max: u64 },
    #[error("directory {0} is not empty")]
    DirNotEmpty(String),
    #[error("operation canceled")]
    Canceled,
    #[error("retry limit of {0} reached")]
    RetryLimit(usize),
}

impl TlfError {
    pub fn class(&self) -> ErrorClass {
        match self {
            TlfError::ServerConflictRevision { .. }
            | TlfError::ServerConflictPrevRoot { .. }
            | TlfError::ServerConflictDiskUsage { .. }
            | TlfError::JournalConflict { .. }
            | TlfError::Unmerged { .. }
            | TlfError::ExclOnUnmerged { .. } => ErrorClass::Conflict,
            TlfError::UnmergedSelfConflict { .. }
            | TlfError::NoUpdatesWhileDirty(_)
            | TlfError::Canceled
            | TlfError::BlockNonExistent(_) => ErrorClass::Transient,
            TlfError::BlockStillReferenced { .. }
            | TlfError::RefContextMismatch { .. }
            | TlfError::HashMismatch { .. }
            | TlfError::ServerHalfMismatch(_)
            | TlfError::InvalidBlockPut(_)
            | TlfError::FileTooBig { .. }
            | TlfError::UnexpectedUnmergedPut { .. }
            | TlfError::RetryLimit(_) => ErrorClass::Fatal,
            _ => ErrorClass::Structural,
        }
    }

    /// True for the remote authority's optimistic-concurrency rejections.
    pub fn is_revision_conflict(&self) -> bool {
        matches!(
            self,
            TlfError::ServerConflictRevision { .. }
                | TlfError::ServerConflictPrevRoot { .. }
                | TlfError::ServerConflictDiskUsage { .. }
                | TlfError::JournalConflict { .. }
        )
    }
}

/// Finds the first [`TlfError`] in an error chain.
pub fn classify(err: &anyhow::Error) -> Option<&TlfError> {
    err.chain().find_map(|e| e.downcast_ref::<TlfError>())
}

/// Classification of an arbitrary error; unclassified errors are transient
/// storage or network failures.
pub fn class_of(err: &anyhow::Error) -> ErrorClass {
    classify(err).map_or(ErrorClass::Transient, TlfError::class)
}

pub fn is_revision_conflict(err: &anyhow::Error) -> bool {
    classify(err).is_some_and(TlfError::is_revision_conflict)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn classify_finds_wrapped_errors() {
        let err: anyhow::Error = TlfError::ServerConflictRevision {
            expected: Revision(6),
            actual: Revision(5),
        }
        .into();
        let err = Err::<(), _>(err).context("put failed").unwrap_err();
        assert!(is_revision_conflict(&err));
        assert_eq!(class_of(&err), ErrorClass::Conflict);

        let io: anyhow::Error = std::io::Error::other("disk").into();
        assert_eq!(class_of(&io), ErrorClass::Transient);
        assert!(classify(&io).is_none());
    }
}
