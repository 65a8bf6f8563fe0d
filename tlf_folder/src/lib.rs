//! # tlf_folder
//!
//! The per-folder engine of a device: it holds the folder's head revision,
//! stages local changes on top of it, commits them as new revisions,
//! follows the mainline and folds unmerged branches back into it.
//!
//! ```text
//! Folders ── FolderBranchOps ──┬── MdOps        (revisions, maybe journaled)
//!                              ├── BlockServer  (encrypted blocks)
//!                              ├── MdServer     (update notifications)
//!                              └── Observer     (change notifications)
//! ```
//!
//! A journal that diverts a folder's writes onto a branch reports it
//! through [`Folders::follow_journal`].

mod blocks;
mod branch;
mod cancel;
mod context;
mod folders;
mod locks;
mod node_cache;
mod observer;
mod resolver;
mod staging;

pub use branch::{FolderBranchOps, FolderStatus};
pub use cancel::{DelayedCancellation, OpContext, coalesce};
pub use context::FolderContext;
pub use folders::Folders;
pub use locks::{LeveledMutex, LeveledRwLock, LockLevel, LockState};
pub use node_cache::{Node, NodeCache, NodeId};
pub use observer::Observer;
pub use resolver::{ConflictResolver, ReplayResolver, ResolveInput, TimedOp};
