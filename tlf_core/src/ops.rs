//! Directory payloads and the operation log carried by each revision.

use crate::block::BlockPointer;
use crate::ids::Revision;
use bytes::Bytes;
use minicbor::{Decode, Encode};
use std::collections::BTreeMap;
use std::convert::Infallible;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode)]
#[cbor(index_only)]
pub enum EntryKind {
    #[n(0)]
    File,
    #[n(1)]
    Dir,
}

/// One named child of a directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode)]
#[cbor(map)]
pub struct DirEntry {
    #[n(0)]
    pub kind: EntryKind,
    #[n(1)]
    pub ptr: BlockPointer,
    /// Plaintext size (file length, or encoded directory size).
    #[n(2)]
    pub size: u64,
    #[n(3)]
    pub mtime_ms: u64,
    #[n(4)]
    pub exec: bool,
}

/// A directory's plaintext payload.
#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode)]
#[cbor(map)]
pub struct DirBlock {
    #[n(0)]
    pub children: BTreeMap<String, DirEntry>,
}

impl DirBlock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes a directory from CBOR bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<DirBlock, minicbor::decode::Error> {
        minicbor::decode(bytes)
    }

    /// Encodes this directory to a CBOR `Vec<u8>`.
    pub fn to_vec(&self) -> Result<Vec<u8>, minicbor::encode::Error<Infallible>> {
        minicbor::to_vec(self)
    }

    pub fn to_bytes(&self) -> Result<Bytes, minicbor::encode::Error<Infallible>> {
        Ok(self.to_vec()?.into())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode)]
pub enum AttrChange {
    #[n(0)]
    Exec(#[n(0)] bool),
    #[n(1)]
    Mtime(#[n(0)] u64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode)]
#[cbor(map)]
pub struct WriteRange {
    #[n(0)]
    pub off: u64,
    /// Zero length marks a truncate to `off`.
    #[n(1)]
    pub len: u64,
}

/// What an operation did to the tree.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub enum OpKind {
    #[n(0)]
    Create {
        #[n(0)]
        dir: String,
        #[n(1)]
        name: String,
        #[n(2)]
        kind: EntryKind,
    },
    #[n(1)]
    Rm {
        #[n(0)]
        dir: String,
        #[n(1)]
        name: String,
        #[n(2)]
        kind: EntryKind,
    },
    #[n(2)]
    Rename {
        #[n(0)]
        old_dir: String,
        #[n(1)]
        old_name: String,
        #[n(2)]
        new_dir: String,
        #[n(3)]
        new_name: String,
    },
    #[n(3)]
    SetAttr {
        #[n(0)]
        dir: String,
        #[n(1)]
        name: String,
        #[n(2)]
        attr: AttrChange,
    },
    #[n(4)]
    Sync {
        #[n(0)]
        dir: String,
        #[n(1)]
        name: String,
        #[n(2)]
        writes: Vec<WriteRange>,
    },
    #[n(5)]
    Gc {
        #[n(0)]
        latest_rev: Revision,
    },
    #[n(6)]
    Resolution,
}

/// One entry of a revision's operation log.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
#[cbor(map)]
pub struct Op {
    #[n(0)]
    pub kind: OpKind,
    /// Blocks this operation started referencing.
    #[n(1)]
    pub refs: Vec<BlockPointer>,
    /// Blocks this operation stopped referencing.
    #[n(2)]
    pub unrefs: Vec<BlockPointer>,
}

/// A path whose cached state an operation invalidates.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeChange {
    pub dir: String,
    pub name: Option<String>,
}

impl Op {
    pub fn new(kind: OpKind) -> Self {
        Self {
            kind,
            refs: Vec::new(),
            unrefs: Vec::new(),
        }
    }

    /// The operation that undoes this one for local-notification purposes,
    /// if there is one.
    pub fn invert(&self) -> Option<Op> {
        let kind = match &self.kind {
            OpKind::Create { dir, name, kind } => OpKind::Rm {
                dir: dir.clone(),
                name: name.clone(),
                kind: *kind,
            },
            OpKind::Rm { dir, name, kind } => OpKind::Create {
                dir: dir.clone(),
                name: name.clone(),
                kind: *kind,
            },
            OpKind::Rename {
                old_dir,
                old_name,
                new_dir,
                new_name,
            } => OpKind::Rename {
                old_dir: new_dir.clone(),
                old_name: new_name.clone(),
                new_dir: old_dir.clone(),
                new_name: old_name.clone(),
            },
            OpKind::SetAttr { .. } | OpKind::Sync { .. } => self.kind.clone(),
            OpKind::Gc { .. } | OpKind::Resolution => return None,
        };
        Some(Op {
            kind,
            refs: self.unrefs.clone(),
            unrefs: self.refs.clone(),
        })
    }

    /// Paths whose cached state this operation changes.
    pub fn changes(&self) -> Vec<NodeChange> {
        let entry = |dir: &str, name: &str| NodeChange {
            dir: dir.to_string(),
            name: Some(name.to_string()),
        };
        let dir_only = |dir: &str| NodeChange {
            dir: dir.to_string(),
            name: None,
        };
        match &self.kind {
            OpKind::Create { dir, name, .. } | OpKind::Rm { dir, name, .. } => {
                vec![dir_only(dir), entry(dir, name)]
            }
            OpKind::Rename {
                old_dir,
                old_name,
                new_dir,
                new_name,
            } => vec![
                dir_only(old_dir),
                entry(old_dir, old_name),
                dir_only(new_dir),
                entry(new_dir, new_name),
            ],
            OpKind::SetAttr { dir, name, .. } | OpKind::Sync { dir, name, .. } => {
                vec![entry(dir, name)]
            }
            OpKind::Gc { .. } | OpKind::Resolution => Vec::new(),
        }
    }
}
