//! Folder handles: who may write and read a folder.

use crate::TlfResult;
use crate::ids::UserId;
use crate::keys::KeyService;
use minicbor::{Decode, Encode};
use std::collections::BTreeSet;

/// Set when a folder's handle has been finalized (e.g. after an account
/// reset); revisions of such folders may be accepted unverified.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
#[cbor(map)]
pub struct FinalizedInfo {
    #[n(0)]
    pub timestamp_ms: u64,
    #[n(1)]
    pub finalized_by: UserId,
}

/// Members of a folder, partly resolved to user IDs.
///
/// Unresolved entries are social assertions (`alice@twitter`) that the
/// key service may later resolve to a user. Lists are kept sorted so two
/// handles can be compared structurally.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
#[cbor(map)]
pub struct TlfHandle {
    #[n(0)]
    pub writers: Vec<UserId>,
    #[n(1)]
    pub readers: Vec<UserId>,
    #[n(2)]
    pub unresolved_writers: Vec<String>,
    #[n(3)]
    pub unresolved_readers: Vec<String>,
    #[n(4)]
    pub public: bool,
    #[n(5)]
    pub finalized: Option<FinalizedInfo>,
}

impl TlfHandle {
    /// A private folder with a single writer.
    pub fn private(writer: UserId) -> Self {
        Self::new(vec![writer], vec![], vec![], vec![], false)
    }

    pub fn new(
        writers: Vec<UserId>,
        readers: Vec<UserId>,
        unresolved_writers: Vec<String>,
        unresolved_readers: Vec<String>,
        public: bool,
    ) -> Self {
        let mut h = Self {
            writers,
            readers,
            unresolved_writers,
            unresolved_readers,
            public,
            finalized: None,
        };
        h.normalize();
        h
    }

    fn normalize(&mut self) {
        fn sort_dedup<T: Ord + Clone>(v: &mut Vec<T>) {
            let set: BTreeSet<T> = v.drain(..).collect();
            v.extend(set);
        }
        sort_dedup(&mut self.writers);
        sort_dedup(&mut self.readers);
        sort_dedup(&mut self.unresolved_writers);
        sort_dedup(&mut self.unresolved_readers);
        // A writer is implicitly a reader.
        let writers = self.writers.clone();
        self.readers.retain(|r| !writers.contains(r));
    }

    pub fn is_writer(&self, uid: &UserId) -> bool {
        self.writers.contains(uid)
    }

    pub fn is_reader(&self, uid: &UserId) -> bool {
        self.public || self.is_writer(uid) || self.readers.contains(uid)
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.is_some()
    }

    /// A stable textual form, used in logs and errors.
    pub fn canonical_name(&self) -> String {
        let mut writers: Vec<String> = self.writers.iter().map(|u| u.to_hex()).collect();
        writers.extend(self.unresolved_writers.iter().cloned());
        let mut name = writers.join(",");
        let mut readers: Vec<String> = self.readers.iter().map(|u| u.to_hex()).collect();
        readers.extend(self.unresolved_readers.iter().cloned());
        if !readers.is_empty() {
            name.push('#');
            name.push_str(&readers.join(","));
        }
        if self.public {
            name.push_str(" (public)");
        }
        name
    }

    /// Returns a copy with every assertion the key service can resolve
    /// moved into the resolved lists.
    pub async fn resolve(&self, keys: &dyn KeyService) -> TlfResult<TlfHandle> {
        let mut writers = self.writers.clone();
        let mut unresolved_writers = Vec::new();
        for a in &self.unresolved_writers {
            match keys.resolve_assertion(a).await? {
                Some(uid) => writers.push(uid),
                None => unresolved_writers.push(a.clone()),
            }
        }
        let mut readers = self.readers.clone();
        let mut unresolved_readers = Vec::new();
        for a in &self.unresolved_readers {
            match keys.resolve_assertion(a).await? {
                Some(uid) => readers.push(uid),
                None => unresolved_readers.push(a.clone()),
            }
        }
        let mut resolved = TlfHandle::new(
            writers,
            readers,
            unresolved_writers,
            unresolved_readers,
            self.public,
        );
        resolved.finalized = self.finalized.clone();
        Ok(resolved)
    }

    /// Whether `newer` is this handle, or this handle with some of its
    /// assertions resolved.
    pub async fn resolves_to(&self, newer: &TlfHandle, keys: &dyn KeyService) -> TlfResult<bool> {
        if self == newer {
            return Ok(true);
        }
        if self.public != newer.public {
            return Ok(false);
        }
        let resolved = self.resolve(keys).await?;
        Ok(resolved.same_members(newer))
    }

    /// Whether both handles resolve to the same members.
    pub async fn mutually_resolves_to(
        &self,
        other: &TlfHandle,
        keys: &dyn KeyService,
    ) -> TlfResult<bool> {
        if self == other {
            return Ok(true);
        }
        let a = self.resolve(keys).await?;
        let b = other.resolve(keys).await?;
        Ok(a.public == b.public && a.same_members(&b))
    }

    fn same_members(&self, other: &TlfHandle) -> bool {
        self.writers == other.writers
            && self.readers == other.readers
            && self.unresolved_writers == other.unresolved_writers
            && self.unresolved_readers == other.unresolved_readers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writers_are_not_duplicated_as_readers() {
        let a = UserId::from_bytes([1; 16]);
        let b = UserId::from_bytes([2; 16]);
        let h = TlfHandle::new(vec![b, a, a], vec![a, b], vec![], vec![], false);
        assert_eq!(h.writers, vec![a, b]);
        assert!(h.readers.is_empty());
        assert!(h.is_reader(&a));
        assert!(!h.is_reader(&UserId::from_bytes([3; 16])));
    }

    #[test]
    fn canonical_name_lists_assertions() {
        let a = UserId::from_bytes([1; 16]);
        let h = TlfHandle::new(vec![a], vec![], vec!["bob@twitter".into()], vec![], false);
        assert!(h.canonical_name().ends_with(",bob@twitter"));
    }
}
