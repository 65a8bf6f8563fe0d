//! # tlf_journal
//!
//! Durable local journals of unflushed revisions and blocks, and the
//! overlays that let the rest of the stack read through them.
//!
//! - [`MdJournal`] keeps a folder's unflushed revisions in a redb table
//!   keyed by revision number.
//! - [`BlockJournal`] keeps unflushed blocks in a [`tlf_store_disk::BlockDiskStore`]
//!   plus an ordered log of the calls to replay.
//! - [`JournalManager`] owns the journals and runs the background flusher.
//! - [`JournalMdOps`] and [`JournalBlockServer`] route reads and writes
//!   through the journal of each folder that has one.

mod block_journal;
mod block_server;
mod manager;
mod md_journal;
mod md_ops;

pub use block_journal::BlockJournal;
pub use block_server::JournalBlockServer;
pub use manager::{JournalEvent, JournalManager, TlfJournal};
pub use md_journal::{JournalEntry, MdJournal};
pub use md_ops::JournalMdOps;
