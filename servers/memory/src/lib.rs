//! In-memory collaborators of the storage core: a metadata authority with
//! per-device branches, a block authority and a key directory.
//!
//! Several devices share one [`MemoryMdBackend`], [`MemoryBlockServer`]
//! and [`KeyDirectory`]; each gets its own [`MemoryMdServer`] and
//! [`MemoryKeyService`] bound to its session.

mod block;
mod keys;
mod md;

pub use block::MemoryBlockServer;
pub use keys::{KeyDirectory, MemoryKeyService};
pub use md::{MemoryMdBackend, MemoryMdServer};
