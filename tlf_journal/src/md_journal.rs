//! Durable per-folder log of revisions not yet accepted by the server.

use anyhow::anyhow;
use minicbor::{Decode, Encode};
use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tlf_core::{
    BranchId, KeyService, MdId, MergeStatus, Revision, RootMetadata, RootMetadataSigned, Session,
    TlfError, TlfId, TlfResult,
};
use tlf_md::envelope::{resign, sign_md};
use tracing::debug;

/// Revision number → encoded [`JournalEntry`].
const ENTRIES: TableDefinition<u64, &[u8]> = TableDefinition::new("md_entries");

/// One journaled revision, signed and ready to be put to the server.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
#[cbor(map)]
pub struct JournalEntry {
    #[n(0)]
    pub rmds: RootMetadataSigned,
    #[n(1)]
    pub md_id: MdId,
    #[n(2)]
    pub local_timestamp_ms: u64,
}

impl JournalEntry {
    pub fn revision(&self) -> Revision {
        self.rmds.md.revision
    }

    pub fn bid(&self) -> BranchId {
        self.rmds.md.bid()
    }

    pub fn local_timestamp(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.local_timestamp_ms)
    }

    fn to_vec(&self) -> TlfResult<Vec<u8>> {
        Ok(minicbor::to_vec(self)?)
    }

    fn from_bytes(bytes: &[u8]) -> TlfResult<Self> {
        Ok(minicbor::decode(bytes)?)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

async fn blocking<T, F>(db: &Arc<Database>, f: F) -> TlfResult<T>
where
    T: Send + 'static,
    F: FnOnce(&Database) -> TlfResult<T> + Send + 'static,
{
    let db = db.clone();
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(|e| anyhow!("journal task failed: {e}"))?
}

/// The revisions of one folder that only exist locally, in revision order.
///
/// All entries share one branch: the mainline, or the branch the journal
/// was converted to after a conflict.
pub struct MdJournal {
    tlf: TlfId,
    db: Arc<Database>,
    session: Session,
    branch_id: BranchId,
    /// ID of the last flushed entry while the journal is empty; the
    /// predecessor of the next unmerged put.
    last_md_id: Option<MdId>,
}

impl std::fmt::Debug for MdJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MdJournal")
            .field("tlf", &self.tlf)
            .field("branch_id", &self.branch_id)
            .finish_non_exhaustive()
    }
}

impl MdJournal {
    /// Opens (or creates) the journal database `md.redb` under `dir`.
    pub fn open(dir: &Path, tlf: TlfId, session: Session) -> TlfResult<Self> {
        std::fs::create_dir_all(dir)?;
        let db = Database::create(dir.join("md.redb"))?;
        let branch_id = {
            let write_txn = db.begin_write()?;
            let head = {
                let table = write_txn.open_table(ENTRIES)?;
                table
                    .last()?
                    .map(|(_, v)| JournalEntry::from_bytes(v.value()))
                    .transpose()?
            };
            write_txn.commit()?;
            head.map_or(BranchId::NULL, |h| h.bid())
        };
        debug!(tlf = %tlf, bid = %branch_id, "opened md journal");
        Ok(Self {
            tlf,
            db: Arc::new(db),
            session,
            branch_id,
            last_md_id: None,
        })
    }

    pub fn branch_id(&self) -> BranchId {
        self.branch_id
    }

    pub async fn length(&self) -> TlfResult<u64> {
        blocking(&self.db, |db| {
            let read_txn = db.begin_read()?;
            Ok(read_txn.open_table(ENTRIES)?.len()?)
        })
        .await
    }

    async fn latest(&self) -> TlfResult<Option<JournalEntry>> {
        blocking(&self.db, |db| {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(ENTRIES)?;
            table
                .last()?
                .map(|(_, v)| JournalEntry::from_bytes(v.value()))
                .transpose()
        })
        .await
    }

    /// The earliest entry, which is the next one to flush.
    pub async fn get_earliest_to_flush(&self) -> TlfResult<Option<JournalEntry>> {
        blocking(&self.db, |db| {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(ENTRIES)?;
            table
                .first()?
                .map(|(_, v)| JournalEntry::from_bytes(v.value()))
                .transpose()
        })
        .await
    }

    /// The newest entry, if the journal is on `bid`.
    pub async fn get_head(&self, bid: BranchId) -> TlfResult<Option<JournalEntry>> {
        if bid != self.branch_id {
            return Ok(None);
        }
        Ok(self.latest().await?.filter(|h| h.bid() == bid))
    }

    /// Entries `start..=stop` of branch `bid`, oldest first.
    pub async fn get_range(
        &self,
        bid: BranchId,
        start: Revision,
        stop: Revision,
    ) -> TlfResult<Vec<JournalEntry>> {
        if bid != self.branch_id || start > stop {
            return Ok(Vec::new());
        }
        blocking(&self.db, move |db| {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(ENTRIES)?;
            let mut out = Vec::new();
            for item in table.range(start.0..=stop.0)? {
                let (_, v) = item?;
                out.push(JournalEntry::from_bytes(v.value())?);
            }
            Ok(out)
        })
        .await
    }

    /// Signs and appends `rmd`, or replaces the head when `rmd` has the
    /// head's revision (a retried put that was canceled after it landed).
    ///
    /// An unmerged `rmd` with a null branch is moved onto the journal's
    /// branch, after the journal's last revision. A merged `rmd` while the
    /// journal is on a branch fails with [`TlfError::JournalConflict`] so
    /// the caller can retry it as unmerged.
    pub async fn put(
        &mut self,
        mut rmd: RootMetadata,
        keys: &dyn KeyService,
    ) -> TlfResult<JournalEntry> {
        let head = self.latest().await?;
        let status = rmd.merged_status();
        let mut new_branch = self.branch_id;

        if status == MergeStatus::Unmerged {
            if rmd.bid().is_null() && self.branch_id.is_null() {
                return Err(anyhow!(
                    "unmerged put of {} with a null branch onto the mainline journal",
                    self.tlf
                ));
            }
            if head.is_none() && self.branch_id.is_null() {
                // Nothing journaled: trust the caller's branch.
                new_branch = rmd.bid();
            } else if rmd.bid().is_null() {
                let last = match &head {
                    Some(h) => Some(h.md_id),
                    None => self.last_md_id,
                };
                debug!(tlf = %self.tlf, bid = %self.branch_id, rev = %rmd.revision(), "moving put onto journal branch");
                rmd.set_branch_id(self.branch_id);
                if let Some(last) = last {
                    rmd.set_prev_root(last);
                }
            }
        }

        if (rmd.merged_status() == MergeStatus::Merged) != rmd.bid().is_null() {
            return Err(anyhow!(
                "merge status {} does not match branch {}",
                rmd.merged_status(),
                rmd.bid()
            ));
        }
        if status == MergeStatus::Merged && !self.branch_id.is_null() {
            return Err(TlfError::JournalConflict {
                tlf: self.tlf,
                branch: self.branch_id,
            }
            .into());
        }
        if rmd.bid() != new_branch {
            return Err(anyhow!(
                "branch mismatch: journal is on {new_branch}, got {}",
                rmd.bid()
            ));
        }
        if let Some(head) = &head {
            if rmd.revision() != head.revision() {
                head.rmds.md.check_valid_successor(head.md_id, &rmd.bare)?;
            }
        }

        let rmds = sign_md(keys, &self.session, &rmd).await?;
        rmds.md.is_valid_and_signed(&rmds.sig)?;
        let entry = JournalEntry {
            md_id: rmds.md.md_id()?,
            rmds,
            local_timestamp_ms: now_ms(),
        };
        let bytes = entry.to_vec()?;
        let rev = entry.revision().0;
        blocking(&self.db, move |db| {
            let write_txn = db.begin_write()?;
            write_txn.open_table(ENTRIES)?.insert(rev, bytes.as_slice())?;
            write_txn.commit()?;
            Ok(())
        })
        .await?;

        self.branch_id = new_branch;
        self.last_md_id = None;
        debug!(tlf = %self.tlf, rev = %entry.revision(), bid = %entry.bid(), "journaled revision");
        Ok(entry)
    }

    /// Drops the earliest entry after the server accepted it.
    pub async fn remove_flushed_entry(&mut self, md_id: MdId) -> TlfResult<()> {
        let tlf = self.tlf;
        let empty = blocking(&self.db, move |db| {
            let write_txn = db.begin_write()?;
            let empty = {
                let mut table = write_txn.open_table(ENTRIES)?;
                let (rev, earliest) = match table.first()? {
                    Some((k, v)) => (k.value(), JournalEntry::from_bytes(v.value())?),
                    None => return Err(anyhow!("md journal of {tlf} is unexpectedly empty")),
                };
                if earliest.md_id != md_id {
                    return Err(anyhow!(
                        "expected to flush {md_id}, earliest is {}",
                        earliest.md_id
                    ));
                }
                table.remove(rev)?;
                table.is_empty()?
            };
            write_txn.commit()?;
            Ok(empty)
        })
        .await?;
        if empty {
            debug!(tlf = %self.tlf, md_id = %md_id, "md journal drained");
            self.last_md_id = Some(md_id);
        }
        Ok(())
    }

    /// Drops every entry of branch `bid`. Clearing another branch than the
    /// journal's is a no-op; the mainline cannot be cleared.
    pub async fn clear(&mut self, bid: BranchId) -> TlfResult<()> {
        if bid.is_null() {
            return Err(anyhow!("cannot clear the mainline journal of {}", self.tlf));
        }
        if bid != self.branch_id {
            debug!(tlf = %self.tlf, bid = %bid, current = %self.branch_id, "ignoring clear of another branch");
            return Ok(());
        }
        if let Some(head) = self.latest().await? {
            if head.bid() != self.branch_id {
                return Err(anyhow!(
                    "journal head is on {} while the journal is on {}",
                    head.bid(),
                    self.branch_id
                ));
            }
        }
        blocking(&self.db, |db| {
            let write_txn = db.begin_write()?;
            clear_entries(&write_txn)?;
            write_txn.commit()?;
            Ok(())
        })
        .await?;
        self.branch_id = BranchId::NULL;
        self.last_md_id = None;
        Ok(())
    }

    /// Moves every entry onto a fresh branch, re-signing and re-chaining
    /// them. Returns the new branch and the rewritten entries.
    pub async fn convert_to_branch(&mut self) -> TlfResult<(BranchId, Vec<JournalEntry>)> {
        if !self.branch_id.is_null() {
            return Err(anyhow!(
                "journal of {} is already on branch {}",
                self.tlf,
                self.branch_id
            ));
        }
        let entries = self
            .get_range(BranchId::NULL, Revision::INITIAL, Revision(u64::MAX))
            .await?;
        let bid = BranchId::random();
        debug!(tlf = %self.tlf, bid = %bid, count = entries.len(), "converting journal to branch");

        let mut rewritten = Vec::with_capacity(entries.len());
        let mut prev_id: Option<MdId> = None;
        for entry in entries {
            let mut md = entry.rmds.md;
            md.writer_metadata.unmerged = true;
            md.writer_metadata.branch_id = bid;
            if let Some(prev) = prev_id {
                md.prev_root = prev;
            }
            let rmds = resign(&self.session, md)?;
            let md_id = rmds.md.md_id()?;
            prev_id = Some(md_id);
            rewritten.push(JournalEntry {
                rmds,
                md_id,
                local_timestamp_ms: entry.local_timestamp_ms,
            });
        }

        let encoded = rewritten
            .iter()
            .map(|e| Ok((e.revision().0, e.to_vec()?)))
            .collect::<TlfResult<Vec<_>>>()?;
        blocking(&self.db, move |db| {
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(ENTRIES)?;
                for (rev, bytes) in &encoded {
                    table.insert(*rev, bytes.as_slice())?;
                }
            }
            write_txn.commit()?;
            Ok(())
        })
        .await?;

        self.branch_id = bid;
        Ok((bid, rewritten))
    }

    /// Replaces the whole branch `bid` with the merged resolution `rmd`.
    pub async fn resolve_and_clear(
        &mut self,
        bid: BranchId,
        rmd: RootMetadata,
        keys: &dyn KeyService,
    ) -> TlfResult<JournalEntry> {
        if !rmd.bid().is_null() {
            return Err(anyhow!("resolution has branch {}", rmd.bid()));
        }
        if bid.is_null() {
            return Err(anyhow!("cannot resolve the mainline of {}", self.tlf));
        }
        if bid != self.branch_id {
            return Err(anyhow!(
                "resolving branch {bid} while the journal is on {}",
                self.branch_id
            ));
        }

        let rmds = sign_md(keys, &self.session, &rmd).await?;
        rmds.md.is_valid_and_signed(&rmds.sig)?;
        let entry = JournalEntry {
            md_id: rmds.md.md_id()?,
            rmds,
            local_timestamp_ms: now_ms(),
        };
        let bytes = entry.to_vec()?;
        let rev = entry.revision().0;
        blocking(&self.db, move |db| {
            let write_txn = db.begin_write()?;
            clear_entries(&write_txn)?;
            write_txn.open_table(ENTRIES)?.insert(rev, bytes.as_slice())?;
            write_txn.commit()?;
            Ok(())
        })
        .await?;

        self.branch_id = BranchId::NULL;
        self.last_md_id = None;
        debug!(tlf = %self.tlf, bid = %bid, rev = %entry.revision(), "resolved journal branch");
        Ok(entry)
    }
}

fn clear_entries(write_txn: &redb::WriteTransaction) -> TlfResult<()> {
    let mut table = write_txn.open_table(ENTRIES)?;
    let keys = table
        .iter()?
        .map(|item| item.map(|(k, _)| k.value()))
        .collect::<Result<Vec<u64>, _>>()?;
    for key in keys {
        table.remove(key)?;
    }
    Ok(())
}
