use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use tlf_core::{
    BranchId, MdId, MdServer, MergeStatus, PutOptions, Revision, RootMetadataSigned, Session,
    TlfError, TlfHandle, TlfId, TlfResult, UpdateReceiver,
};
use tokio::sync::oneshot;
use tracing::debug;

type UpdateSender = oneshot::Sender<TlfResult<()>>;

/// Revisions of one branch, in revision order.
#[derive(Default)]
struct BranchLog {
    revisions: Vec<RootMetadataSigned>,
}

impl BranchLog {
    fn head(&self) -> Option<&RootMetadataSigned> {
        self.revisions.last()
    }

    fn get(&self, rev: Revision) -> Option<&RootMetadataSigned> {
        let first = self.revisions.first()?.md.revision;
        let index = rev.0.checked_sub(first.0)?;
        self.revisions.get(usize::try_from(index).ok()?)
    }
}

#[derive(Default)]
struct BackendState {
    handles: HashMap<String, TlfId>,
    /// Keyed by folder and branch; the null branch is the mainline.
    logs: HashMap<(TlfId, BranchId), BranchLog>,
    /// The unmerged branch each device is on, keyed by its verifying key.
    branches: HashMap<(TlfId, [u8; 32]), BranchId>,
    updates: HashMap<TlfId, Vec<(Revision, UpdateSender)>>,
    locks: HashMap<TlfId, u64>,
}

/// The shared state of an in-memory metadata authority. Each device talks
/// to it through its own [`MemoryMdServer`].
#[derive(Default)]
pub struct MemoryMdBackend {
    state: Mutex<BackendState>,
}

impl std::fmt::Debug for MemoryMdBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryMdBackend").finish_non_exhaustive()
    }
}

impl MemoryMdBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> TlfResult<MutexGuard<'_, BackendState>> {
        self.state
            .lock()
            .map_err(|_| anyhow::anyhow!("metadata backend lock poisoned"))
    }

    /// Takes the server-side write lock of a folder.
    pub fn lock(&self, tlf: TlfId, lock_id: u64) -> TlfResult<bool> {
        let mut state = self.state()?;
        match state.locks.get(&tlf) {
            Some(holder) if *holder != lock_id => Ok(false),
            _ => {
                state.locks.insert(tlf, lock_id);
                Ok(true)
            }
        }
    }

    pub fn release_lock(&self, tlf: TlfId, lock_id: u64) -> TlfResult<()> {
        let mut state = self.state()?;
        if state.locks.get(&tlf) == Some(&lock_id) {
            state.locks.remove(&tlf);
        }
        Ok(())
    }

    /// The merged head revision number, for assertions in tests.
    pub fn merged_revision(&self, tlf: TlfId) -> TlfResult<Option<Revision>> {
        let state = self.state()?;
        Ok(state
            .logs
            .get(&(tlf, BranchId::NULL))
            .and_then(BranchLog::head)
            .map(|rmds| rmds.md.revision))
    }
}

/// One device's connection to a [`MemoryMdBackend`].
#[derive(Debug)]
pub struct MemoryMdServer {
    backend: Arc<MemoryMdBackend>,
    session: Session,
    offset_ms: Option<i64>,
}

impl MemoryMdServer {
    pub fn new(backend: Arc<MemoryMdBackend>, session: Session) -> Self {
        Self {
            backend,
            session,
            offset_ms: Some(0),
        }
    }

    /// Pretends the server clock runs `offset_ms` ahead of the local one.
    pub fn with_clock_offset(mut self, offset_ms: Option<i64>) -> Self {
        self.offset_ms = offset_ms;
        self
    }

    pub fn backend(&self) -> &Arc<MemoryMdBackend> {
        &self.backend
    }

    fn device_key(&self) -> [u8; 32] {
        self.session.verifying_key().to_bytes()
    }

    /// Maps a request onto a log key. Unmerged requests with a null
    /// branch use the branch this device is on.
    fn log_key(
        &self,
        state: &BackendState,
        id: TlfId,
        bid: BranchId,
        status: MergeStatus,
    ) -> Option<(TlfId, BranchId)> {
        match status {
            MergeStatus::Merged => Some((id, BranchId::NULL)),
            MergeStatus::Unmerged if bid.is_null() => state
                .branches
                .get(&(id, self.device_key()))
                .map(|bid| (id, *bid)),
            MergeStatus::Unmerged => Some((id, bid)),
        }
    }

    fn server_now_ms(&self) -> u64 {
        let local = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as i64);
        (local + self.offset_ms.unwrap_or(0)).max(0) as u64
    }
}

#[async_trait::async_trait]
impl MdServer for MemoryMdServer {
    async fn get_for_handle(
        &self,
        handle: &TlfHandle,
        status: MergeStatus,
    ) -> TlfResult<(TlfId, Option<RootMetadataSigned>)> {
        let id = {
            let mut state = self.backend.state()?;
            *state
                .handles
                .entry(handle.canonical_name())
                .or_insert_with(TlfId::random)
        };
        let head = self.get_for_tlf(id, BranchId::NULL, status).await?;
        Ok((id, head))
    }

    async fn get_for_tlf(
        &self,
        id: TlfId,
        bid: BranchId,
        status: MergeStatus,
    ) -> TlfResult<Option<RootMetadataSigned>> {
        let state = self.backend.state()?;
        let Some(key) = self.log_key(&state, id, bid, status) else {
            return Ok(None);
        };
        Ok(state.logs.get(&key).and_then(BranchLog::head).cloned())
    }

    async fn get_range(
        &self,
        id: TlfId,
        bid: BranchId,
        status: MergeStatus,
        start: Revision,
        stop: Revision,
    ) -> TlfResult<Vec<RootMetadataSigned>> {
        let state = self.backend.state()?;
        let Some(log) = self
            .log_key(&state, id, bid, status)
            .and_then(|key| state.logs.get(&key))
        else {
            return Ok(Vec::new());
        };
        Ok(log
            .revisions
            .iter()
            .filter(|rmds| rmds.md.revision >= start && rmds.md.revision <= stop)
            .cloned()
            .collect())
    }

    async fn put(&self, mut rmds: RootMetadataSigned, opts: PutOptions) -> TlfResult<()> {
        rmds.md
            .is_valid_and_signed(&rmds.sig)
            .map_err(|e| TlfError::ServerBadRequest(format!("{e:#}")))?;
        if !rmds
            .md
            .is_last_modified_by(self.session.uid, &self.session.verifying_key(), &rmds.sig)
        {
            return Err(TlfError::ServerBadRequest(
                "revision was not last modified by this device".into(),
            )
            .into());
        }

        let id = rmds.md.tlf_id();
        let bid = rmds.md.bid();
        let status = rmds.md.merged_status();
        let mut state = self.backend.state()?;

        if let Some(lc) = opts.lock_context {
            if state.locks.get(&id) != Some(&lc.lock_id) {
                return Err(TlfError::ServerBadRequest(format!(
                    "folder {id} is not locked by {}",
                    lc.lock_id
                ))
                .into());
            }
        }
        if status == MergeStatus::Unmerged && bid.is_null() {
            return Err(TlfError::ServerBadRequest("unmerged put with null branch".into()).into());
        }

        let key = (id, bid);
        let mut record_branch = false;
        let predecessor = match state.logs.get(&key).and_then(BranchLog::head) {
            Some(head) => Some(head.clone()),
            // The first revision of a branch follows a merged revision.
            None if status == MergeStatus::Unmerged => {
                let prev = rmds.md.revision.prev();
                let base = state
                    .logs
                    .get(&(id, BranchId::NULL))
                    .and_then(|log| log.get(prev))
                    .cloned()
                    .ok_or_else(|| {
                        TlfError::ServerBadRequest(format!(
                            "no merged revision {prev} to branch from"
                        ))
                    })?;
                record_branch = true;
                Some(base)
            }
            None => None,
        };

        match predecessor {
            Some(head) => {
                let head_id: MdId = head.md.md_id()?;
                head.md.check_valid_successor(head_id, &rmds.md)?;
            }
            None if rmds.md.revision != Revision::INITIAL => {
                return Err(TlfError::ServerConflictRevision {
                    expected: Revision::INITIAL,
                    actual: rmds.md.revision,
                }
                .into());
            }
            None => {}
        }

        if record_branch {
            state.branches.insert((id, self.device_key()), bid);
        }

        let revision = rmds.md.revision;
        rmds.server_timestamp_ms = self.server_now_ms();
        state.logs.entry(key).or_default().revisions.push(rmds);
        debug!(tlf = %id, rev = %revision, bid = %bid, "accepted revision");

        if status == MergeStatus::Merged {
            if let Some(waiters) = state.updates.remove(&id) {
                let mut pending = Vec::new();
                for (current, tx) in waiters {
                    if current < revision {
                        let _ = tx.send(Ok(()));
                    } else {
                        pending.push((current, tx));
                    }
                }
                if !pending.is_empty() {
                    state.updates.insert(id, pending);
                }
            }
        }

        if let Some(lc) = opts.lock_context {
            if lc.release_after_success {
                state.locks.remove(&id);
            }
        }
        Ok(())
    }

    async fn prune_branch(&self, id: TlfId, bid: BranchId) -> TlfResult<()> {
        let mut state = self.backend.state()?;
        let device_key = (id, self.device_key());
        match state.branches.get(&device_key) {
            Some(current) if *current != bid => {
                return Err(TlfError::ServerBadRequest(format!(
                    "cannot prune {bid}, device is on branch {current}"
                ))
                .into());
            }
            Some(_) => {
                state.branches.remove(&device_key);
            }
            None => {}
        }
        state.logs.remove(&(id, bid));
        debug!(tlf = %id, bid = %bid, "pruned branch");
        Ok(())
    }

    async fn register_for_update(&self, id: TlfId, current: Revision) -> TlfResult<UpdateReceiver> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.backend.state()?;
        let head = state
            .logs
            .get(&(id, BranchId::NULL))
            .and_then(BranchLog::head)
            .map(|rmds| rmds.md.revision);
        match head {
            Some(head) if head > current => {
                let _ = tx.send(Ok(()));
            }
            _ => state.updates.entry(id).or_default().push((current, tx)),
        }
        Ok(rx)
    }

    fn offset_from_server_time(&self) -> Option<i64> {
        self.offset_ms
    }
}
