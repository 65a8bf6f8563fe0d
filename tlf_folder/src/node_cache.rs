//! Handles to paths of a folder, counted explicitly.
//!
//! A [`Node`] stays valid across renames of any of its ancestors. It is
//! not `Clone`: a second handle is taken with [`NodeCache::dup`] and every
//! handle is given back with [`NodeCache::forget`].

use crate::staging::{ROOT, is_within};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tlf_core::{NodeChange, TlfError, TlfResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

#[derive(Debug, PartialEq, Eq)]
pub struct Node {
    id: NodeId,
}

impl Node {
    pub fn id(&self) -> NodeId {
        self.id
    }
}

#[derive(Debug)]
struct Slot {
    path: String,
    refs: usize,
    unlinked: bool,
}

#[derive(Debug, Default)]
struct Inner {
    next: u64,
    slots: HashMap<NodeId, Slot>,
    by_path: HashMap<String, NodeId>,
}

#[derive(Debug, Default)]
pub struct NodeCache {
    inner: Mutex<Inner>,
}

impl NodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get_or_create(&self, path: &str) -> Node {
        let mut inner = self.inner();
        if let Some(id) = inner.by_path.get(path).copied()
            && let Some(slot) = inner.slots.get_mut(&id)
        {
            slot.refs += 1;
            return Node { id };
        }
        inner.next += 1;
        let id = NodeId(inner.next);
        inner.slots.insert(
            id,
            Slot {
                path: path.to_string(),
                refs: 1,
                unlinked: false,
            },
        );
        inner.by_path.insert(path.to_string(), id);
        Node { id }
    }

    pub fn dup(&self, node: &Node) -> Node {
        if let Some(slot) = self.inner().slots.get_mut(&node.id) {
            slot.refs += 1;
        }
        Node { id: node.id }
    }

    /// The current path of `node`. Fails once the entry has been removed.
    pub fn path(&self, node: &Node) -> TlfResult<String> {
        match self.inner().slots.get(&node.id) {
            Some(slot) if !slot.unlinked => Ok(slot.path.clone()),
            _ => Err(TlfError::NotFound(format!("node {:?}", node.id)).into()),
        }
    }

    pub fn forget(&self, node: Node) {
        let mut inner = self.inner();
        let Some(slot) = inner.slots.get_mut(&node.id) else {
            return;
        };
        slot.refs -= 1;
        if slot.refs > 0 {
            return;
        }
        if let Some(slot) = inner.slots.remove(&node.id)
            && inner.by_path.get(&slot.path) == Some(&node.id)
        {
            inner.by_path.remove(&slot.path);
        }
    }

    /// Moves `from` and everything below it to `to`. A node already at
    /// `to` is unlinked.
    pub fn rename(&self, from: &str, to: &str) {
        let mut inner = self.inner();
        Self::unlink_locked(&mut inner, to);
        let moved: Vec<NodeId> = inner
            .slots
            .iter()
            .filter(|(_, slot)| !slot.unlinked && is_within(&slot.path, from))
            .map(|(id, _)| *id)
            .collect();
        for id in moved {
            let Some(slot) = inner.slots.get_mut(&id) else {
                continue;
            };
            let old = std::mem::take(&mut slot.path);
            let new = format!("{to}{}", &old[from.len()..]);
            slot.path = new.clone();
            inner.by_path.remove(&old);
            inner.by_path.insert(new, id);
        }
    }

    /// Marks `path` and everything below it as removed.
    pub fn unlink(&self, path: &str) {
        Self::unlink_locked(&mut self.inner(), path);
    }

    fn unlink_locked(inner: &mut Inner, path: &str) {
        if path == ROOT {
            return;
        }
        let Inner { slots, by_path, .. } = inner;
        for slot in slots.values_mut() {
            if !slot.unlinked && is_within(&slot.path, path) {
                slot.unlinked = true;
                by_path.remove(&slot.path);
            }
        }
    }

    /// Every live node, as changes for observers to refresh.
    pub fn invalidate_all(&self) -> Vec<NodeChange> {
        let inner = self.inner();
        let mut paths: Vec<&String> = inner
            .slots
            .values()
            .filter(|slot| !slot.unlinked)
            .map(|slot| &slot.path)
            .collect();
        paths.sort();
        paths
            .into_iter()
            .map(|path| NodeChange {
                dir: path.clone(),
                name: None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_counted() {
        let nodes = NodeCache::new();
        let a = nodes.get_or_create("/a");
        let b = nodes.get_or_create("/a");
        assert_eq!(a.id(), b.id());
        let c = nodes.dup(&a);

        nodes.forget(a);
        nodes.forget(b);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes.path(&c).unwrap(), "/a");
        nodes.forget(c);
        assert!(nodes.is_empty());
    }

    #[test]
    fn renames_carry_descendants() {
        let nodes = NodeCache::new();
        let dir = nodes.get_or_create("/a");
        let file = nodes.get_or_create("/a/f");
        let other = nodes.get_or_create("/ab");

        nodes.rename("/a", "/b");
        assert_eq!(nodes.path(&dir).unwrap(), "/b");
        assert_eq!(nodes.path(&file).unwrap(), "/b/f");
        assert_eq!(nodes.path(&other).unwrap(), "/ab");

        let again = nodes.get_or_create("/b/f");
        assert_eq!(again.id(), file.id());
    }

    #[test]
    fn unlinked_nodes_stop_resolving() {
        let nodes = NodeCache::new();
        let dir = nodes.get_or_create("/d");
        let file = nodes.get_or_create("/d/f");
        nodes.unlink("/d");
        assert!(nodes.path(&dir).is_err());
        assert!(nodes.path(&file).is_err());

        // A new entry at the same path gets a fresh node.
        let fresh = nodes.get_or_create("/d");
        assert_ne!(fresh.id(), dir.id());
        assert_eq!(nodes.invalidate_all().len(), 1);
    }
}
