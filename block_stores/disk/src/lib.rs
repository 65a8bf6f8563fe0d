//! On-disk block storage.
//!
//! [`BlockDiskStore`] keeps the blocks of one folder in a splayed
//! directory tree with a reference map per block; [`DiskBlockServer`]
//! serves the [`tlf_core::BlockServer`] seam from one such store per
//! folder.

mod server;
mod store;

pub use server::DiskBlockServer;
pub use store::BlockDiskStore;

use std::path::PathBuf;
use tlf_core::BlockId;

/// Layout corruption found while reading a store directory.
#[derive(Debug, thiserror::Error)]
pub enum DiskStoreError {
    #[error("unexpected non-directory {0:?} in block store")]
    UnexpectedEntry(PathBuf),
    #[error("directory {dir} does not prefix the id {id} it holds")]
    IdPrefixMismatch { dir: String, id: BlockId },
    #[error("refs file of block {id} is corrupt: {source}")]
    CorruptRefs {
        id: BlockId,
        #[source]
        source: minicbor::decode::Error,
    },
    #[error("server half of block {id} has {len} bytes")]
    CorruptServerHalf { id: BlockId, len: usize },
}
