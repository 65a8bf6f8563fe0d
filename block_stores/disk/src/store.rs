use crate::DiskStoreError;
use minicbor::{Decode, Encode};
use std::collections::BTreeMap;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tlf_core::{
    BlockContext, BlockId, BlockRefMap, BlockRefStatus, KeyServerHalf, TlfError, TlfResult,
};
use tokio::sync::Mutex;
use tracing::debug;

const ID_FILENAME: &str = "id";
const DATA_FILENAME: &str = "data";
const KSH_FILENAME: &str = "ksh";
const REFS_FILENAME: &str = "refs";

const LOCK_STRIPES: usize = 64;

/// Contents of the `refs` file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode)]
#[cbor(map)]
struct BlockInfo {
    #[n(0)]
    refs: BlockRefMap,
    #[n(1)]
    flushed: bool,
}

/// Stores encrypted blocks under `<dir>/<id[0..4]>/<id[4..34]>/`, each
/// directory holding `id`, `data`, `ksh` and `refs`.
///
/// Every call is exclusive per block ID. Callers still serialize
/// mutating calls per folder; the stripes only protect the `refs`
/// read-modify-write when several writers share a directory.
#[derive(Clone, Debug)]
pub struct BlockDiskStore {
    dir: PathBuf,
    write_locks: [Arc<Mutex<()>>; LOCK_STRIPES],
}

impl BlockDiskStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_locks: std::array::from_fn(|_| Arc::new(Mutex::new(()))),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock_for(&self, id: &BlockId) -> Arc<Mutex<()>> {
        let index = id.digest()[0] as usize % LOCK_STRIPES;
        self.write_locks[index].clone()
    }

    pub fn block_path(&self, id: &BlockId) -> PathBuf {
        let hex = id.to_hex();
        self.dir.join(&hex[..4]).join(&hex[4..34])
    }

    fn data_path(&self, id: &BlockId) -> PathBuf {
        self.block_path(id).join(DATA_FILENAME)
    }

    fn ksh_path(&self, id: &BlockId) -> PathBuf {
        self.block_path(id).join(KSH_FILENAME)
    }

    fn refs_path(&self, id: &BlockId) -> PathBuf {
        self.block_path(id).join(REFS_FILENAME)
    }

    /// Creates the block directory and (re)writes its `id` file.
    async fn make_dir(&self, id: &BlockId) -> TlfResult<()> {
        let path = self.block_path(id);
        tokio::fs::create_dir_all(&path).await?;
        tokio::fs::write(path.join(ID_FILENAME), id.to_hex()).await?;
        Ok(())
    }

    async fn get_info(&self, id: &BlockId) -> TlfResult<BlockInfo> {
        match read_optional(&self.refs_path(id)).await? {
            Some(buf) => minicbor::decode(&buf)
                .map_err(|source| DiskStoreError::CorruptRefs { id: *id, source }.into()),
            None => Ok(BlockInfo::default()),
        }
    }

    async fn put_info(&self, id: &BlockId, info: &BlockInfo) -> TlfResult<()> {
        let buf = minicbor::to_vec(info)?;
        let dir = self.block_path(id);
        let path = self.refs_path(id);
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(&buf)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await??;
        Ok(())
    }

    async fn add_refs_exclusive(
        &self,
        id: &BlockId,
        contexts: &[BlockContext],
        status: BlockRefStatus,
        tag: &str,
    ) -> TlfResult<()> {
        let mut info = self.get_info(id).await?;
        for context in contexts {
            info.refs.check_exists(context)?;
        }
        for context in contexts {
            info.refs.put(*context, status, tag)?;
        }
        self.put_info(id, &info).await
    }

    async fn get_data_exclusive(&self, id: &BlockId) -> TlfResult<(Vec<u8>, KeyServerHalf)> {
        let Some(data) = read_optional(&self.data_path(id)).await? else {
            return Err(TlfError::BlockNonExistent(*id).into());
        };
        let Some(ksh) = read_optional(&self.ksh_path(id)).await? else {
            return Err(TlfError::BlockNonExistent(*id).into());
        };
        id.verify(&data)?;
        let half: [u8; 32] = ksh
            .as_slice()
            .try_into()
            .map_err(|_| DiskStoreError::CorruptServerHalf { id: *id, len: ksh.len() })?;
        Ok((data, KeyServerHalf(half)))
    }

    async fn has_data_exclusive(&self, id: &BlockId) -> TlfResult<bool> {
        Ok(tokio::fs::try_exists(self.data_path(id)).await?)
    }

    /// Stores a block and adds a live reference for `context`.
    ///
    /// Returns whether the payload was newly written. Regular puts must
    /// come from the block's creator with the zero nonce, and must carry
    /// the server half already on disk, if any.
    pub async fn put(
        &self,
        id: BlockId,
        context: BlockContext,
        buf: &[u8],
        server_half: KeyServerHalf,
        is_regular_put: bool,
    ) -> TlfResult<bool> {
        let lock = self.lock_for(&id);
        let _guard = lock.lock().await;

        context.validate_put(is_regular_put, &id, buf)?;

        let exists = self.has_data_exclusive(&id).await?;
        if exists {
            if is_regular_put {
                let (_, existing) = self.get_data_exclusive(&id).await?;
                if existing != server_half {
                    return Err(TlfError::ServerHalfMismatch(id).into());
                }
            }
        } else {
            self.make_dir(&id).await?;
            tokio::fs::write(self.data_path(&id), buf).await?;
            tokio::fs::write(self.ksh_path(&id), server_half.as_bytes()).await?;
            debug!(block = %id, size = buf.len(), "stored block");
        }

        self.add_refs_exclusive(&id, &[context], BlockRefStatus::Live, "")
            .await?;
        Ok(!exists)
    }

    /// Returns the payload and server half, provided `context` is one of
    /// the block's references.
    pub async fn get(
        &self,
        id: BlockId,
        context: BlockContext,
    ) -> TlfResult<(Vec<u8>, KeyServerHalf)> {
        let lock = self.lock_for(&id);
        let _guard = lock.lock().await;

        if !self.get_info(&id).await?.refs.check_exists(&context)? {
            return Err(TlfError::BlockNonExistent(id).into());
        }
        self.get_data_exclusive(&id).await
    }

    /// Returns the payload and server half regardless of references.
    pub async fn get_data(&self, id: BlockId) -> TlfResult<(Vec<u8>, KeyServerHalf)> {
        let lock = self.lock_for(&id);
        let _guard = lock.lock().await;
        self.get_data_exclusive(&id).await
    }

    pub async fn add_reference(&self, id: BlockId, context: BlockContext, tag: &str) -> TlfResult<()> {
        let lock = self.lock_for(&id);
        let _guard = lock.lock().await;

        self.make_dir(&id).await?;
        self.add_refs_exclusive(&id, &[context], BlockRefStatus::Live, tag)
            .await
    }

    pub async fn archive_references(
        &self,
        contexts: &BTreeMap<BlockId, Vec<BlockContext>>,
        tag: &str,
    ) -> TlfResult<()> {
        for (id, id_contexts) in contexts {
            let lock = self.lock_for(id);
            let _guard = lock.lock().await;

            self.make_dir(id).await?;
            self.add_refs_exclusive(id, id_contexts, BlockRefStatus::Archived, tag)
                .await?;
        }
        Ok(())
    }

    /// Removes references and returns the number of live references left.
    ///
    /// An entry whose most recent tag differs from a non-empty `tag` was
    /// touched again since the caller saw it and is left in place.
    pub async fn remove_references(
        &self,
        id: BlockId,
        contexts: &[BlockContext],
        tag: &str,
    ) -> TlfResult<usize> {
        let lock = self.lock_for(&id);
        let _guard = lock.lock().await;

        let mut info = self.get_info(&id).await?;
        if info.refs.is_empty() {
            return Ok(0);
        }
        for context in contexts {
            info.refs.remove(context, tag)?;
            if info.refs.is_empty() {
                break;
            }
        }
        self.put_info(&id, &info).await?;
        Ok(info.refs.live_count())
    }

    /// Deletes the block directory. Fails while any reference remains.
    pub async fn remove(&self, id: BlockId) -> TlfResult<()> {
        let lock = self.lock_for(&id);
        let _guard = lock.lock().await;

        let refs = self.get_info(&id).await?.refs;
        if !refs.is_empty() {
            return Err(TlfError::BlockStillReferenced {
                id,
                count: refs.len(),
            }
            .into());
        }

        let path = self.block_path(&id);
        match tokio::fs::remove_dir_all(&path).await {
            Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        if let Some(parent) = path.parent() {
            // Fails harmlessly while other blocks share the prefix.
            match tokio::fs::remove_dir(parent).await {
                Ok(()) => {}
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::NotFound | ErrorKind::DirectoryNotEmpty
                    ) => {}
                Err(e) => return Err(e.into()),
            }
        }
        debug!(block = %id, "removed block");
        Ok(())
    }

    pub async fn has_any_ref(&self, id: BlockId) -> TlfResult<bool> {
        let lock = self.lock_for(&id);
        let _guard = lock.lock().await;
        Ok(!self.get_info(&id).await?.refs.is_empty())
    }

    pub async fn has_non_archived_ref(&self, id: BlockId) -> TlfResult<bool> {
        let lock = self.lock_for(&id);
        let _guard = lock.lock().await;
        Ok(self.get_info(&id).await?.refs.has_non_archived_ref())
    }

    pub async fn live_count(&self, id: BlockId) -> TlfResult<usize> {
        let lock = self.lock_for(&id);
        let _guard = lock.lock().await;
        Ok(self.get_info(&id).await?.refs.live_count())
    }

    /// The status of `context`'s reference, if the block has it.
    pub async fn has_context(
        &self,
        id: BlockId,
        context: BlockContext,
    ) -> TlfResult<Option<BlockRefStatus>> {
        let lock = self.lock_for(&id);
        let _guard = lock.lock().await;

        let refs = self.get_info(&id).await?.refs;
        if !refs.check_exists(&context)? {
            return Ok(None);
        }
        Ok(refs.get_statuses().get(&context.ref_nonce).copied())
    }

    pub async fn has_data(&self, id: BlockId) -> TlfResult<bool> {
        let lock = self.lock_for(&id);
        let _guard = lock.lock().await;
        self.has_data_exclusive(&id).await
    }

    /// Size of the stored payload; 0 when there is none.
    pub async fn get_data_size(&self, id: BlockId) -> TlfResult<u64> {
        let lock = self.lock_for(&id);
        let _guard = lock.lock().await;
        match tokio::fs::metadata(self.data_path(&id)).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// True when the block has a payload that was not yet marked flushed.
    pub async fn is_unflushed(&self, id: BlockId) -> TlfResult<bool> {
        let lock = self.lock_for(&id);
        let _guard = lock.lock().await;
        if !self.has_data_exclusive(&id).await? {
            return Ok(false);
        }
        Ok(!self.get_info(&id).await?.flushed)
    }

    pub async fn mark_flushed(&self, id: BlockId) -> TlfResult<()> {
        let lock = self.lock_for(&id);
        let _guard = lock.lock().await;
        if !tokio::fs::try_exists(self.block_path(&id)).await? {
            return Err(TlfError::BlockNonExistent(id).into());
        }
        let mut info = self.get_info(&id).await?;
        info.flushed = true;
        self.put_info(&id, &info).await
    }

    pub async fn get_all_refs_for_id(&self, id: BlockId) -> TlfResult<BlockRefMap> {
        let lock = self.lock_for(&id);
        let _guard = lock.lock().await;
        Ok(self.get_info(&id).await?.refs)
    }

    /// Walks the splayed layout and returns every block with references.
    pub async fn get_all_refs(&self) -> TlfResult<BTreeMap<BlockId, BlockRefMap>> {
        let mut res = BTreeMap::new();
        let mut prefixes = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(res),
            Err(e) => return Err(e.into()),
        };

        while let Some(prefix) = prefixes.next_entry().await? {
            if !prefix.file_type().await?.is_dir() {
                return Err(DiskStoreError::UnexpectedEntry(prefix.path()).into());
            }
            let prefix_name = prefix.file_name().to_string_lossy().into_owned();
            let mut blocks = tokio::fs::read_dir(prefix.path()).await?;
            while let Some(block) = blocks.next_entry().await? {
                if !block.file_type().await?.is_dir() {
                    return Err(DiskStoreError::UnexpectedEntry(block.path()).into());
                }
                let id_text = tokio::fs::read_to_string(block.path().join(ID_FILENAME)).await?;
                let id: BlockId = id_text.parse()?;
                let dir_name = format!(
                    "{prefix_name}{}",
                    block.file_name().to_string_lossy()
                );
                if !id.to_hex().starts_with(&dir_name) {
                    return Err(DiskStoreError::IdPrefixMismatch { dir: dir_name, id }.into());
                }

                let refs = self.get_all_refs_for_id(id).await?;
                if !refs.is_empty() {
                    res.insert(id, refs);
                }
            }
        }
        Ok(res)
    }

    /// Removes the whole store directory.
    pub async fn clear(&self) -> TlfResult<()> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

async fn read_optional(path: &Path) -> std::io::Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(buf) => Ok(Some(buf)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
