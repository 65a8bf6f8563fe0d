//! # tlf_md
//!
//! The metadata layer between a folder engine and the remote metadata
//! authority: an LRU of verified revisions ([`MdCache`]), the sealing and
//! opening of signed envelopes ([`envelope`]) and the [`MdOps`] seam with
//! its server-backed implementation [`MdOpsStandard`].

mod cache;
pub mod envelope;
mod ops;
mod standard;

pub use cache::MdCache;
pub use ops::MdOps;
pub use standard::MdOpsStandard;
