use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use tlf_core::{BranchId, ImmutableRootMetadata, Revision, TlfId, TlfResult};

type CacheKey = (TlfId, Revision, BranchId);

struct CacheEntry {
    irmd: ImmutableRootMetadata,
    tick: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    /// Recency order: lowest tick is evicted first.
    order: BTreeMap<u64, CacheKey>,
    next_tick: u64,
}

impl CacheState {
    fn touch(&mut self, key: CacheKey) {
        let tick = self.next_tick;
        self.next_tick += 1;
        if let Some(entry) = self.entries.get_mut(&key) {
            self.order.remove(&entry.tick);
            entry.tick = tick;
            self.order.insert(tick, key);
        }
    }

    fn insert(&mut self, key: CacheKey, irmd: ImmutableRootMetadata, capacity: usize) {
        let tick = self.next_tick;
        self.next_tick += 1;
        if let Some(old) = self.entries.insert(key, CacheEntry { irmd, tick }) {
            self.order.remove(&old.tick);
        }
        self.order.insert(tick, key);
        while self.entries.len() > capacity {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }

    fn remove(&mut self, key: &CacheKey) {
        if let Some(entry) = self.entries.remove(key) {
            self.order.remove(&entry.tick);
        }
    }
}

/// A bounded LRU of verified revisions keyed by (folder, revision, branch).
///
/// Every call is atomic on its own; there is no atomicity across calls.
/// Callers that fetch and then update use [`replace`](Self::replace) or
/// [`delete`](Self::delete) rather than get followed by put.
pub struct MdCache {
    capacity: usize,
    state: Mutex<CacheState>,
}

impl std::fmt::Debug for MdCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MdCache")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl MdCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(CacheState::default()),
        }
    }

    fn state(&self) -> TlfResult<MutexGuard<'_, CacheState>> {
        self.state
            .lock()
            .map_err(|_| anyhow::anyhow!("metadata cache lock poisoned"))
    }

    pub fn get(
        &self,
        tlf: TlfId,
        rev: Revision,
        bid: BranchId,
    ) -> TlfResult<Option<ImmutableRootMetadata>> {
        let mut state = self.state()?;
        let key = (tlf, rev, bid);
        let found = state.entries.get(&key).map(|e| e.irmd.clone());
        if found.is_some() {
            state.touch(key);
        }
        Ok(found)
    }

    /// Inserts `irmd` unless an entry for its key already exists.
    pub fn put(&self, irmd: ImmutableRootMetadata) -> TlfResult<()> {
        let mut state = self.state()?;
        let key = (irmd.tlf_id(), irmd.revision(), irmd.bid());
        if state.entries.contains_key(&key) {
            state.touch(key);
            return Ok(());
        }
        state.insert(key, irmd, self.capacity);
        Ok(())
    }

    /// Drops the entry for the same revision on `old_bid` and stores
    /// `new_irmd`, overwriting whatever was there.
    pub fn replace(&self, new_irmd: ImmutableRootMetadata, old_bid: BranchId) -> TlfResult<()> {
        let mut state = self.state()?;
        let tlf = new_irmd.tlf_id();
        let rev = new_irmd.revision();
        state.remove(&(tlf, rev, old_bid));
        state.insert((tlf, rev, new_irmd.bid()), new_irmd, self.capacity);
        Ok(())
    }

    pub fn delete(&self, tlf: TlfId, rev: Revision, bid: BranchId) -> TlfResult<()> {
        self.state()?.remove(&(tlf, rev, bid));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.state().map_or(0, |s| s.entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
