//! Revisions of a folder's metadata, in their plaintext, signed and
//! immutable forms.

use crate::TlfResult;
use crate::crypto::SignatureInfo;
use crate::error::TlfError;
use crate::handle::TlfHandle;
use crate::ids::{BranchId, KeyGen, MdId, Revision, TlfId, UserId};
use crate::ops::{DirEntry, Op};
use ed25519_dalek::VerifyingKey;
use minicbor::{Decode, Encode};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// The writer metadata was copied verbatim from an earlier revision.
pub const FLAG_WRITER_METADATA_COPIED: u8 = 0x01;
/// The revision only changes key material.
pub const FLAG_REKEY: u8 = 0x02;
/// The folder's history ends with this revision.
pub const FLAG_FINAL: u8 = 0x04;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MergeStatus {
    Merged,
    Unmerged,
}

impl fmt::Display for MergeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeStatus::Merged => f.write_str("merged"),
            MergeStatus::Unmerged => f.write_str("unmerged"),
        }
    }
}

/// The part of a revision signed by its writer.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
#[cbor(map)]
pub struct WriterMetadata {
    /// Encrypted (private folders) or plain (public) `PrivateMetadata`.
    #[n(0)]
    #[cbor(with = "minicbor::bytes")]
    pub serialized_private: Vec<u8>,
    #[n(1)]
    pub last_modifying_writer: UserId,
    #[n(2)]
    pub tlf_id: TlfId,
    #[n(3)]
    pub branch_id: BranchId,
    #[n(4)]
    pub unmerged: bool,
    #[n(5)]
    pub disk_usage: u64,
    #[n(6)]
    pub ref_bytes: u64,
    #[n(7)]
    pub unref_bytes: u64,
}

/// A revision as hashed, signed and sent over the wire.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
#[cbor(map)]
pub struct BareRootMetadata {
    #[n(0)]
    pub writer_metadata: WriterMetadata,
    #[n(1)]
    pub writer_sig: Option<SignatureInfo>,
    #[n(2)]
    pub revision: Revision,
    #[n(3)]
    pub prev_root: MdId,
    #[n(4)]
    pub flags: u8,
    #[n(5)]
    pub last_modifying_user: UserId,
    #[n(6)]
    pub handle: TlfHandle,
    #[n(7)]
    pub key_gen: KeyGen,
}

impl BareRootMetadata {
    pub fn tlf_id(&self) -> TlfId {
        self.writer_metadata.tlf_id
    }

    pub fn bid(&self) -> BranchId {
        self.writer_metadata.branch_id
    }

    pub fn merged_status(&self) -> MergeStatus {
        if self.writer_metadata.unmerged {
            MergeStatus::Unmerged
        } else {
            MergeStatus::Merged
        }
    }

    pub fn disk_usage(&self) -> u64 {
        self.writer_metadata.disk_usage
    }

    pub fn is_writer_metadata_copied(&self) -> bool {
        self.flags & FLAG_WRITER_METADATA_COPIED != 0
    }

    pub fn is_final(&self) -> bool {
        self.flags & FLAG_FINAL != 0
    }

    pub fn is_rekey(&self) -> bool {
        self.flags & FLAG_REKEY != 0
    }

    pub fn serialized_writer_metadata(&self) -> TlfResult<Vec<u8>> {
        Ok(minicbor::to_vec(&self.writer_metadata)?)
    }

    pub fn to_vec(&self) -> TlfResult<Vec<u8>> {
        Ok(minicbor::to_vec(self)?)
    }

    /// The ID of this revision: the hash of its encoding.
    pub fn md_id(&self) -> TlfResult<MdId> {
        Ok(MdId::of_encoded(&self.to_vec()?))
    }

    fn mismatch(&self, reason: impl Into<String>) -> TlfError {
        TlfError::MdMismatch {
            tlf: self.tlf_id(),
            revision: self.revision,
            reason: reason.into(),
        }
    }

    /// Checks that `next` may directly follow this revision, whose ID is
    /// `curr_id`.
    pub fn check_valid_successor(
        &self,
        curr_id: MdId,
        next: &BareRootMetadata,
    ) -> Result<(), TlfError> {
        if self.is_final() {
            return Err(self.mismatch("revision is final"));
        }
        if next.tlf_id() != self.tlf_id() {
            return Err(self.mismatch(format!(
                "successor belongs to folder {}",
                next.tlf_id()
            )));
        }
        if next.revision != self.revision.next() {
            return Err(TlfError::ServerConflictRevision {
                expected: self.revision.next(),
                actual: next.revision,
            });
        }
        let expected_prev_root = if next.is_final() {
            self.prev_root
        } else {
            curr_id
        };
        if next.prev_root != expected_prev_root {
            return Err(TlfError::ServerConflictPrevRoot {
                expected: expected_prev_root,
                actual: next.prev_root,
            });
        }
        if self.merged_status() == next.merged_status() && self.bid() != next.bid() {
            return Err(self.mismatch(format!(
                "unexpected branch ID on successor: {} vs. {}",
                self.bid(),
                next.bid()
            )));
        } else if self.merged_status() == MergeStatus::Unmerged
            && next.merged_status() == MergeStatus::Merged
        {
            return Err(self.mismatch("merged revision can't follow unmerged revision"));
        }
        let mut expected_usage = self.disk_usage();
        if !next.is_writer_metadata_copied() {
            expected_usage = (expected_usage + next.writer_metadata.ref_bytes)
                .saturating_sub(next.writer_metadata.unref_bytes);
        }
        if next.disk_usage() != expected_usage {
            return Err(TlfError::ServerConflictDiskUsage {
                expected: expected_usage,
                actual: next.disk_usage(),
            });
        }
        Ok(())
    }

    /// Like [`check_valid_successor`](Self::check_valid_successor), but
    /// reports every ordering failure as an [`TlfError::MdMismatch`].
    pub fn check_valid_successor_strict(
        &self,
        curr_id: MdId,
        next: &BareRootMetadata,
    ) -> Result<(), TlfError> {
        self.check_valid_successor(curr_id, next)
            .map_err(|e| match e {
                e @ TlfError::MdMismatch { .. } => e,
                other => next.mismatch(format!(
                    "not a valid successor of revision {}: {other}",
                    self.revision
                )),
            })
    }

    /// Structural and signature self-check against the envelope `sig`.
    pub fn is_valid_and_signed(&self, sig: &SignatureInfo) -> TlfResult<()> {
        if !self.revision.is_initialized() {
            return Err(self.mismatch("revision is uninitialized").into());
        }
        if (self.merged_status() == MergeStatus::Merged) != self.bid().is_null() {
            return Err(self
                .mismatch(format!(
                    "merge status {} inconsistent with branch {}",
                    self.merged_status(),
                    self.bid()
                ))
                .into());
        }
        let writer_sig = self
            .writer_sig
            .ok_or_else(|| self.mismatch("missing writer signature"))?;
        writer_sig
            .verify(&self.serialized_writer_metadata()?)
            .map_err(|e| self.mismatch(format!("writer signature: {e}")))?;
        sig.verify(&self.to_vec()?)
            .map_err(|e| self.mismatch(format!("envelope signature: {e}")))?;

        let writer = self.writer_metadata.last_modifying_writer;
        if !self.is_writer_metadata_copied() && !self.handle.is_writer(&writer) {
            return Err(self
                .mismatch(format!("last writer {writer} is not a writer"))
                .into());
        }
        let user = self.last_modifying_user;
        let may_modify = self.handle.is_writer(&user)
            || (self.is_rekey() && self.handle.is_reader(&user));
        if !may_modify {
            return Err(self
                .mismatch(format!("last modifying user {user} may not modify"))
                .into());
        }
        Ok(())
    }

    pub fn is_last_modified_by(&self, uid: UserId, key: &VerifyingKey, sig: &SignatureInfo) -> bool {
        self.last_modifying_user == uid && sig.verifying_key == key.to_bytes()
    }
}

/// The decrypted payload of a revision.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
#[cbor(map)]
pub struct PrivateMetadata {
    #[n(0)]
    pub root: DirEntry,
    #[n(1)]
    pub ops: Vec<Op>,
}

/// A revision together with its envelope signature.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
#[cbor(map)]
pub struct RootMetadataSigned {
    #[n(0)]
    pub md: BareRootMetadata,
    #[n(1)]
    pub sig: SignatureInfo,
    /// Set by the metadata server when it accepts the revision; untrusted.
    #[n(2)]
    pub server_timestamp_ms: u64,
}

impl RootMetadataSigned {
    pub fn to_vec(&self) -> TlfResult<Vec<u8>> {
        Ok(minicbor::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> TlfResult<Self> {
        Ok(minicbor::decode(bytes)?)
    }

    pub fn server_timestamp(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.server_timestamp_ms)
    }
}

/// A mutable, plaintext revision under construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RootMetadata {
    pub bare: BareRootMetadata,
    pub data: PrivateMetadata,
}

impl RootMetadata {
    /// The first revision of a new folder.
    pub fn new_initial(
        tlf_id: TlfId,
        handle: TlfHandle,
        writer: UserId,
        key_gen: KeyGen,
        root: DirEntry,
    ) -> Self {
        let size = u64::from(root.ptr.encoded_size);
        Self {
            bare: BareRootMetadata {
                writer_metadata: WriterMetadata {
                    serialized_private: Vec::new(),
                    last_modifying_writer: writer,
                    tlf_id,
                    branch_id: BranchId::NULL,
                    unmerged: false,
                    disk_usage: size,
                    ref_bytes: size,
                    unref_bytes: 0,
                },
                writer_sig: None,
                revision: Revision::INITIAL,
                prev_root: MdId::default(),
                flags: 0,
                last_modifying_user: writer,
                handle,
                key_gen,
            },
            data: PrivateMetadata {
                root,
                ops: Vec::new(),
            },
        }
    }

    pub fn tlf_id(&self) -> TlfId {
        self.bare.tlf_id()
    }

    pub fn revision(&self) -> Revision {
        self.bare.revision
    }

    pub fn prev_root(&self) -> MdId {
        self.bare.prev_root
    }

    pub fn bid(&self) -> BranchId {
        self.bare.bid()
    }

    pub fn merged_status(&self) -> MergeStatus {
        self.bare.merged_status()
    }

    pub fn handle(&self) -> &TlfHandle {
        &self.bare.handle
    }

    pub fn key_gen(&self) -> KeyGen {
        self.bare.key_gen
    }

    pub fn disk_usage(&self) -> u64 {
        self.bare.disk_usage()
    }

    pub fn ops(&self) -> &[Op] {
        &self.data.ops
    }

    pub fn root(&self) -> &DirEntry {
        &self.data.root
    }

    /// A fresh successor of this revision (whose ID is `md_id`): next
    /// revision number, PrevRoot set, empty op log, unsigned.
    pub fn make_successor(&self, md_id: MdId) -> RootMetadata {
        let mut next = self.clone();
        next.bare.revision = self.revision().next();
        next.bare.prev_root = md_id;
        next.bare.writer_sig = None;
        next.bare.flags &= !(FLAG_WRITER_METADATA_COPIED | FLAG_REKEY);
        next.bare.writer_metadata.ref_bytes = 0;
        next.bare.writer_metadata.unref_bytes = 0;
        next.data.ops.clear();
        next
    }

    /// Moves this revision onto an unmerged branch.
    pub fn set_unmerged(&mut self) {
        self.bare.writer_metadata.unmerged = true;
    }

    /// Moves this revision back onto the mainline.
    pub fn set_merged(&mut self) {
        self.bare.writer_metadata.unmerged = false;
        self.bare.writer_metadata.branch_id = BranchId::NULL;
    }

    pub fn set_branch_id(&mut self, bid: BranchId) {
        self.bare.writer_metadata.branch_id = bid;
    }

    pub fn set_prev_root(&mut self, id: MdId) {
        self.bare.prev_root = id;
    }

    pub fn set_revision(&mut self, rev: Revision) {
        self.bare.revision = rev;
    }

    pub fn set_last_modifying_writer(&mut self, uid: UserId) {
        self.bare.writer_metadata.last_modifying_writer = uid;
        self.bare.last_modifying_user = uid;
    }

    pub fn add_op(&mut self, op: Op) {
        self.data.ops.push(op);
    }

    /// Records a new root and the block bytes the change added and removed.
    pub fn set_root(&mut self, root: DirEntry, ref_bytes: u64, unref_bytes: u64) {
        let wm = &mut self.bare.writer_metadata;
        wm.ref_bytes += ref_bytes;
        wm.unref_bytes += unref_bytes;
        wm.disk_usage = (wm.disk_usage + ref_bytes).saturating_sub(unref_bytes);
        self.data.root = root;
    }

    /// Recomputes disk usage against a new predecessor, keeping this
    /// revision's own ref/unref counters.
    pub fn rebase_disk_usage(&mut self, predecessor_usage: u64) {
        let wm = &mut self.bare.writer_metadata;
        wm.disk_usage = (predecessor_usage + wm.ref_bytes).saturating_sub(wm.unref_bytes);
    }
}

struct ImmutableInner {
    rmd: RootMetadata,
    md_id: MdId,
    last_writer_verifying_key: [u8; 32],
    local_timestamp: SystemTime,
    put_to_server: bool,
}

/// A verified revision with its ID. Cheap to clone; never mutated.
#[derive(Clone)]
pub struct ImmutableRootMetadata(Arc<ImmutableInner>);

impl ImmutableRootMetadata {
    pub fn new(
        rmd: RootMetadata,
        md_id: MdId,
        last_writer_verifying_key: [u8; 32],
        local_timestamp: SystemTime,
        put_to_server: bool,
    ) -> Self {
        Self(Arc::new(ImmutableInner {
            rmd,
            md_id,
            last_writer_verifying_key,
            local_timestamp,
            put_to_server,
        }))
    }

    pub fn md_id(&self) -> MdId {
        self.0.md_id
    }

    pub fn last_writer_verifying_key(&self) -> &[u8; 32] {
        &self.0.last_writer_verifying_key
    }

    pub fn local_timestamp(&self) -> SystemTime {
        self.0.local_timestamp
    }

    /// False for revisions that only exist in the local journal.
    pub fn put_to_server(&self) -> bool {
        self.0.put_to_server
    }

    pub fn rmd(&self) -> &RootMetadata {
        &self.0.rmd
    }

    /// Checks that `next` is a valid successor of this revision.
    pub fn check_valid_successor(&self, next: &RootMetadata) -> Result<(), TlfError> {
        self.bare.check_valid_successor(self.md_id(), &next.bare)
    }

    pub fn same_revision(&self, other: &ImmutableRootMetadata) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.md_id() == other.md_id()
    }
}

impl Deref for ImmutableRootMetadata {
    type Target = RootMetadata;

    fn deref(&self) -> &RootMetadata {
        &self.0.rmd
    }
}

impl fmt::Debug for ImmutableRootMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImmutableRootMetadata")
            .field("tlf", &self.tlf_id())
            .field("revision", &self.revision())
            .field("bid", &self.bid())
            .field("md_id", &self.md_id())
            .finish()
    }
}
