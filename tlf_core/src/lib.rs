//! # tlf_core
//!
//! Types and traits shared by every crate of the TLF storage core.
//!
//! ## Layers
//! 1. `ids`, `block` – identifiers, block pointers and reference bookkeeping.
//! 2. `md`, `ops`, `handle` – revisions, their operation logs and folder handles.
//! 3. `crypto` – XChaCha20-Poly1305 payload encryption, ed25519 signatures.
//! 4. `server`, `keys` – the collaborator seams (remote metadata authority,
//!    remote block authority, key/identity service).
//! 5. `config`, `error` – the tunables and the classified error taxonomy.

pub mod block;
pub mod config;
pub mod crypto;
pub mod error;
pub mod handle;
pub mod ids;
pub mod keys;
pub mod md;
pub mod ops;
pub mod server;
#[cfg(feature = "testutil")]
pub mod testutil;

pub use block::{
    BlockContext, BlockId, BlockPointer, BlockRefEntry, BlockRefMap, BlockRefStatus,
    KeyServerHalf, RefNonce,
};
pub use config::TlfConfig;
pub use crypto::SignatureInfo;
pub use error::{ErrorClass, TlfError, class_of, classify, is_revision_conflict};
pub use handle::TlfHandle;
pub use ids::{BranchId, KeyGen, MdId, Revision, TlfId, UserId};
pub use keys::{KeyService, KeyStatus, Session, TlfCryptKey};
pub use md::{
    BareRootMetadata, ImmutableRootMetadata, MergeStatus, PrivateMetadata, RootMetadata,
    RootMetadataSigned, WriterMetadata,
};
pub use ops::{AttrChange, DirBlock, DirEntry, EntryKind, NodeChange, Op, OpKind, WriteRange};
pub use server::{BlockServer, LockContext, MdPriority, MdServer, PutOptions, UpdateReceiver};

/// Crate-wide result alias that bubbles up [`anyhow::Error`].
pub type TlfResult<T> = anyhow::Result<T>;
