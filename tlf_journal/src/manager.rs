use crate::block_journal::BlockJournal;
use crate::md_journal::{JournalEntry, MdJournal};
use anyhow::anyhow;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tlf_core::{
    BlockServer, BranchId, KeyService, MdServer, PutOptions, Revision, Session, TlfConfig,
    TlfError, TlfId, TlfResult, is_revision_conflict,
};
use tlf_md::MdCache;
use tlf_md::envelope::decrypt_local;
use tokio::sync::{Mutex, MutexGuard, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Something the flusher did that folder engines may need to react to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JournalEvent {
    /// A journaled revision was accepted by the server.
    MdFlushed {
        tlf: TlfId,
        bid: BranchId,
        revision: Revision,
    },
    /// The journal moved its entries onto `bid` after a remote conflict.
    BranchChanged { tlf: TlfId, bid: BranchId },
}

/// The metadata and block journals of one folder.
#[derive(Debug)]
pub struct TlfJournal {
    tlf: TlfId,
    md: Mutex<MdJournal>,
    blocks: BlockJournal,
}

impl TlfJournal {
    pub fn tlf(&self) -> TlfId {
        self.tlf
    }

    pub async fn md(&self) -> MutexGuard<'_, MdJournal> {
        self.md.lock().await
    }

    pub fn blocks(&self) -> &BlockJournal {
        &self.blocks
    }

    /// True when nothing is left to flush.
    pub async fn is_empty(&self) -> TlfResult<bool> {
        Ok(self.md.lock().await.length().await? == 0 && self.blocks.length().await? == 0)
    }
}

/// Owns every folder's journal under `root` and flushes them to the
/// remote authorities.
#[derive(Debug)]
pub struct JournalManager {
    root: PathBuf,
    session: Session,
    keys: Arc<dyn KeyService>,
    md_server: Arc<dyn MdServer>,
    block_server: Arc<dyn BlockServer>,
    cache: Arc<MdCache>,
    config: TlfConfig,
    journals: DashMap<TlfId, Arc<TlfJournal>>,
    wake_tx: mpsc::Sender<()>,
    wake_rx: Mutex<Option<mpsc::Receiver<()>>>,
    events: broadcast::Sender<JournalEvent>,
}

impl JournalManager {
    pub fn new(
        root: impl Into<PathBuf>,
        session: Session,
        keys: Arc<dyn KeyService>,
        md_server: Arc<dyn MdServer>,
        block_server: Arc<dyn BlockServer>,
        cache: Arc<MdCache>,
        config: TlfConfig,
    ) -> Arc<Self> {
        let (wake_tx, wake_rx) = mpsc::channel(1);
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            root: root.into(),
            session,
            keys,
            md_server,
            block_server,
            cache,
            config,
            journals: DashMap::new(),
            wake_tx,
            wake_rx: Mutex::new(Some(wake_rx)),
            events,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn keys(&self) -> &Arc<dyn KeyService> {
        &self.keys
    }

    pub fn cache(&self) -> &Arc<MdCache> {
        &self.cache
    }

    pub fn block_server(&self) -> &Arc<dyn BlockServer> {
        &self.block_server
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JournalEvent> {
        self.events.subscribe()
    }

    /// Starts journaling `tlf`, reopening any journal left on disk.
    pub fn enable(&self, tlf: TlfId) -> TlfResult<Arc<TlfJournal>> {
        if let Some(journal) = self.journals.get(&tlf) {
            return Ok(journal.clone());
        }
        let dir = self.root.join(tlf.to_hex());
        let journal = Arc::new(TlfJournal {
            tlf,
            md: Mutex::new(MdJournal::open(&dir, tlf, self.session.clone())?),
            blocks: BlockJournal::open(&dir, tlf)?,
        });
        info!(tlf = %tlf, dir = %dir.display(), "journal enabled");
        Ok(self.journals.entry(tlf).or_insert(journal).clone())
    }

    pub fn get(&self, tlf: TlfId) -> Option<Arc<TlfJournal>> {
        self.journals.get(&tlf).map(|j| j.clone())
    }

    /// The folder's journal, enabling one when journaling is on by default.
    pub fn get_or_auto_enable(&self, tlf: TlfId) -> TlfResult<Option<Arc<TlfJournal>>> {
        match self.get(tlf) {
            Some(journal) => Ok(Some(journal)),
            None if self.config.journal_enabled => self.enable(tlf).map(Some),
            None => Ok(None),
        }
    }

    /// Stops journaling `tlf`. Fails while anything is left to flush.
    pub async fn disable(&self, tlf: TlfId) -> TlfResult<()> {
        let Some(journal) = self.get(tlf) else {
            return Ok(());
        };
        if !journal.is_empty().await? {
            return Err(anyhow!("journal of {tlf} still has unflushed entries"));
        }
        self.journals.remove(&tlf);
        info!(tlf = %tlf, "journal disabled");
        Ok(())
    }

    /// Nudges the background flusher.
    pub fn signal_work(&self) {
        let _ = self.wake_tx.try_send(());
    }

    /// Flushes every journal once.
    pub async fn flush_all(&self) -> TlfResult<()> {
        let tlfs: Vec<TlfId> = self.journals.iter().map(|e| *e.key()).collect();
        for tlf in tlfs {
            self.flush(tlf).await?;
        }
        Ok(())
    }

    /// Pushes the blocks and then up to `journal_flush_batch` revisions of
    /// `tlf` to the server. Returns the number of revisions flushed.
    pub async fn flush(&self, tlf: TlfId) -> TlfResult<usize> {
        let Some(journal) = self.get(tlf) else {
            return Ok(0);
        };
        journal
            .blocks
            .flush(self.block_server.as_ref(), usize::MAX)
            .await?;

        let mut flushed = 0;
        let mut md = journal.md.lock().await;
        while flushed < self.config.journal_flush_batch {
            let Some(entry) = md.get_earliest_to_flush().await? else {
                break;
            };
            match self
                .md_server
                .put(entry.rmds.clone(), PutOptions::default())
                .await
            {
                Ok(()) => {}
                Err(err) if is_revision_conflict(&err) => {
                    if self.already_flushed(&entry).await? {
                        debug!(tlf = %tlf, rev = %entry.revision(), "revision was already flushed");
                    } else if entry.bid().is_null() {
                        self.convert_to_branch(&mut md).await?;
                        continue;
                    } else {
                        return Err(err);
                    }
                }
                Err(err) => return Err(err),
            }
            md.remove_flushed_entry(entry.md_id).await?;
            flushed += 1;
            let _ = self.events.send(JournalEvent::MdFlushed {
                tlf,
                bid: entry.bid(),
                revision: entry.revision(),
            });
        }
        if flushed > 0 {
            debug!(tlf = %tlf, count = flushed, "flushed md journal");
        }
        Ok(flushed)
    }

    /// A put that was canceled after the server accepted it leaves the
    /// entry behind; the server then holds the same revision ID.
    async fn already_flushed(&self, entry: &JournalEntry) -> TlfResult<bool> {
        let rev = entry.revision();
        let remote = self
            .md_server
            .get_range(
                entry.rmds.md.tlf_id(),
                entry.bid(),
                entry.rmds.md.merged_status(),
                rev,
                rev,
            )
            .await?;
        match remote.first() {
            Some(rmds) => Ok(rmds.md.md_id()? == entry.md_id),
            None => Ok(false),
        }
    }

    async fn convert_to_branch(&self, md: &mut MdJournal) -> TlfResult<()> {
        let (bid, entries) = md.convert_to_branch().await?;
        let tlf = entries
            .first()
            .map(|e| e.rmds.md.tlf_id())
            .ok_or_else(|| TlfError::NotFound("journal entries to convert".into()))?;
        warn!(tlf = %tlf, bid = %bid, count = entries.len(), "journal conflicted remotely, moved to a branch");
        for entry in &entries {
            let irmd = decrypt_local(
                self.keys.as_ref(),
                &entry.rmds,
                entry.md_id,
                entry.local_timestamp(),
            )
            .await?;
            self.cache.replace(irmd, BranchId::NULL)?;
        }
        let _ = self.events.send(JournalEvent::BranchChanged { tlf, bid });
        Ok(())
    }

    /// Spawns the background flusher: a pass on every wake signal and
    /// every `flush_interval`, until `cancel` fires.
    pub async fn spawn_flusher(self: &Arc<Self>, cancel: CancellationToken) -> TlfResult<JoinHandle<()>> {
        let mut wake_rx = self
            .wake_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("journal flusher already running"))?;
        let manager = self.clone();
        Ok(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.flush_interval());
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = wake_rx.recv() => {}
                    _ = ticker.tick() => {}
                }
                if let Err(err) = manager.flush_all().await {
                    warn!("journal flush failed: {err:#}");
                }
            }
            debug!("journal flusher stopped");
        }))
    }
}
