//! Unflushed local changes of one folder.
//!
//! A [`Staging`] overlays the tree of the head revision (its `base` root
//! entry) with the directories and files changed since, plus the op log
//! describing those changes. Everything here is synchronous: a read that
//! needs a block that is not cached fails with a `MissingBlock` error and
//! the caller fetches it and retries.

use crate::blocks::{BlockCache, BlockPut, Sealer};
use anyhow::{anyhow, bail};
use bytes::Bytes;
use std::collections::BTreeMap;
use tlf_core::{
    AttrChange, BlockContext, BlockId, BlockPointer, DirBlock, DirEntry, EntryKind, KeyGen, Op,
    OpKind, TlfError, TlfResult, UserId, WriteRange, classify,
};

pub(crate) const ROOT: &str = "/";

pub(crate) fn join(dir: &str, name: &str) -> String {
    if dir == ROOT {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Splits a path into its parent directory and its name; `None` for the root.
pub(crate) fn split(path: &str) -> Option<(&str, &str)> {
    if path == ROOT {
        return None;
    }
    let idx = path.rfind('/')?;
    let dir = if idx == 0 { ROOT } else { &path[..idx] };
    Some((dir, &path[idx + 1..]))
}

fn depth(path: &str) -> usize {
    if path == ROOT {
        0
    } else {
        path.matches('/').count()
    }
}

pub(crate) fn is_within(path: &str, ancestor: &str) -> bool {
    ancestor == ROOT
        || path == ancestor
        || path
            .strip_prefix(ancestor)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// The root, then each ancestor of `path`, then `path` itself.
fn ancestors(path: &str) -> Vec<String> {
    let mut out = vec![ROOT.to_string()];
    let mut cur = String::new();
    for comp in path.split('/').filter(|c| !c.is_empty()) {
        cur.push('/');
        cur.push_str(comp);
        out.push(cur.clone());
    }
    out
}

fn rekey(path: &str, from: &str, to: &str) -> String {
    format!("{to}{}", &path[from.len()..])
}

fn check_name(name: &str) -> TlfResult<()> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        bail!("invalid entry name {name:?}");
    }
    Ok(())
}

/// Pointer of an entry whose block has not been written yet.
pub(crate) fn placeholder() -> BlockPointer {
    BlockPointer {
        id: BlockId::from_parts(0, [0u8; 32]),
        key_gen: KeyGen::PUBLIC,
        data_ver: BlockPointer::DATA_VER,
        context: BlockContext::first(UserId::default()),
        encoded_size: 0,
    }
}

/// An empty, never-written root directory.
pub(crate) fn empty_root() -> DirEntry {
    DirEntry {
        kind: EntryKind::Dir,
        ptr: placeholder(),
        size: 0,
        mtime_ms: 0,
        exec: false,
    }
}

fn is_absent(err: &anyhow::Error) -> bool {
    matches!(
        classify(err),
        Some(TlfError::NotFound(_) | TlfError::NotDir(_))
    )
}

/// The output of [`Staging::build`].
#[derive(Debug)]
pub(crate) struct Built {
    pub root: DirEntry,
    pub puts: Vec<BlockPut>,
    pub refs: Vec<BlockPointer>,
    pub unrefs: Vec<BlockPointer>,
    pub ref_bytes: u64,
    pub unref_bytes: u64,
}

#[derive(Clone, Debug)]
pub(crate) struct Staging {
    base: DirEntry,
    /// Changed directories by path. Every ancestor of a staged path is
    /// staged too.
    dirs: BTreeMap<String, DirBlock>,
    files: BTreeMap<String, Vec<u8>>,
    ops: Vec<Op>,
    /// Committed blocks the changes stopped referencing.
    unrefs: Vec<BlockPointer>,
    /// Committed blocks of another tree the changes started referencing.
    adopted: Vec<BlockPointer>,
}

impl Staging {
    pub fn new(base: DirEntry) -> Self {
        Self {
            base,
            dirs: BTreeMap::new(),
            files: BTreeMap::new(),
            ops: Vec::new(),
            unrefs: Vec::new(),
            adopted: Vec::new(),
        }
    }

    pub fn base(&self) -> DirEntry {
        self.base
    }

    pub fn is_dirty(&self) -> bool {
        !self.ops.is_empty()
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn push_front_op(&mut self, op: Op) {
        self.ops.insert(0, op);
    }

    pub fn dir(&self, path: &str, cache: &BlockCache) -> TlfResult<DirBlock> {
        if let Some(block) = self.dirs.get(path) {
            return Ok(block.clone());
        }
        let entry = self.entry(path, cache)?;
        if entry.kind != EntryKind::Dir {
            return Err(TlfError::NotDir(path.to_string()).into());
        }
        cache.dir(&entry.ptr)
    }

    pub fn entry(&self, path: &str, cache: &BlockCache) -> TlfResult<DirEntry> {
        let Some((dir, name)) = split(path) else {
            return Ok(self.base);
        };
        self.dir(dir, cache)?
            .children
            .get(name)
            .copied()
            .ok_or_else(|| TlfError::NotFound(path.to_string()).into())
    }

    fn try_entry(&self, path: &str, cache: &BlockCache) -> TlfResult<Option<DirEntry>> {
        match self.entry(path, cache) {
            Ok(entry) => Ok(Some(entry)),
            Err(err) if is_absent(&err) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn file(&self, path: &str, cache: &BlockCache) -> TlfResult<Vec<u8>> {
        if let Some(data) = self.files.get(path) {
            return Ok(data.clone());
        }
        let entry = self.entry(path, cache)?;
        if entry.kind == EntryKind::Dir {
            return Err(TlfError::IsDir(path.to_string()).into());
        }
        cache.file(&entry.ptr)
    }

    /// Stages `path` and all of its ancestors.
    fn dir_mut(&mut self, path: &str, cache: &BlockCache) -> TlfResult<&mut DirBlock> {
        for p in ancestors(path) {
            if !self.dirs.contains_key(&p) {
                let block = self.dir(&p, cache)?;
                self.dirs.insert(p, block);
            }
        }
        self.dirs
            .get_mut(path)
            .ok_or_else(|| anyhow!("staged directory {path} vanished"))
    }

    fn drop_subtree(&mut self, path: &str) {
        self.dirs.retain(|p, _| !is_within(p, path));
        self.files.retain(|p, _| !is_within(p, path));
    }

    fn rekey_subtree(&mut self, from: &str, to: &str) {
        let dirs: Vec<String> = self
            .dirs
            .keys()
            .filter(|p| is_within(p, from))
            .cloned()
            .collect();
        for p in dirs {
            if let Some(block) = self.dirs.remove(&p) {
                self.dirs.insert(rekey(&p, from, to), block);
            }
        }
        let files: Vec<String> = self
            .files
            .keys()
            .filter(|p| is_within(p, from))
            .cloned()
            .collect();
        for p in files {
            if let Some(data) = self.files.remove(&p) {
                self.files.insert(rekey(&p, from, to), data);
            }
        }
    }

    pub fn create(
        &mut self,
        dir: &str,
        name: &str,
        kind: EntryKind,
        now_ms: u64,
        cache: &BlockCache,
    ) -> TlfResult<DirEntry> {
        check_name(name)?;
        let path = join(dir, name);
        let parent = self.dir_mut(dir, cache)?;
        if parent.children.contains_key(name) {
            return Err(TlfError::Exists(path).into());
        }
        let entry = DirEntry {
            kind,
            ptr: placeholder(),
            size: 0,
            mtime_ms: now_ms,
            exec: false,
        };
        parent.children.insert(name.to_string(), entry);
        match kind {
            EntryKind::File => {
                self.files.insert(path, Vec::new());
            }
            EntryKind::Dir => {
                self.dirs.insert(path, DirBlock::new());
            }
        }
        self.ops.push(Op::new(OpKind::Create {
            dir: dir.to_string(),
            name: name.to_string(),
            kind,
        }));
        Ok(entry)
    }

    pub fn remove(&mut self, dir: &str, name: &str, cache: &BlockCache) -> TlfResult<DirEntry> {
        let path = join(dir, name);
        let entry = self.entry(&path, cache)?;
        if entry.kind == EntryKind::Dir && !self.dir(&path, cache)?.children.is_empty() {
            return Err(TlfError::DirNotEmpty(path).into());
        }
        self.dir_mut(dir, cache)?.children.remove(name);
        self.drop_subtree(&path);
        if entry.ptr.is_valid() {
            self.unrefs.push(entry.ptr);
        }
        self.ops.push(Op::new(OpKind::Rm {
            dir: dir.to_string(),
            name: name.to_string(),
            kind: entry.kind,
        }));
        Ok(entry)
    }

    pub fn rename(
        &mut self,
        old_dir: &str,
        old_name: &str,
        new_dir: &str,
        new_name: &str,
        cache: &BlockCache,
    ) -> TlfResult<()> {
        check_name(new_name)?;
        let old_path = join(old_dir, old_name);
        let new_path = join(new_dir, new_name);
        if old_path == new_path {
            return Ok(());
        }
        if is_within(&new_path, &old_path) {
            bail!("cannot move {old_path} into itself");
        }
        let entry = self.entry(&old_path, cache)?;
        let target_dir = self.dir(new_dir, cache)?;
        if let Some(target) = target_dir.children.get(new_name).copied() {
            match (target.kind, entry.kind) {
                (EntryKind::Dir, EntryKind::File) => {
                    return Err(TlfError::IsDir(new_path).into());
                }
                (EntryKind::File, EntryKind::Dir) => {
                    return Err(TlfError::NotDir(new_path).into());
                }
                (EntryKind::Dir, EntryKind::Dir) => {
                    if !self.dir(&new_path, cache)?.children.is_empty() {
                        return Err(TlfError::DirNotEmpty(new_path).into());
                    }
                }
                (EntryKind::File, EntryKind::File) => {}
            }
            self.drop_subtree(&new_path);
            if target.ptr.is_valid() {
                self.unrefs.push(target.ptr);
            }
        }
        self.dir_mut(old_dir, cache)?.children.remove(old_name);
        self.dir_mut(new_dir, cache)?
            .children
            .insert(new_name.to_string(), entry);
        self.rekey_subtree(&old_path, &new_path);
        self.ops.push(Op::new(OpKind::Rename {
            old_dir: old_dir.to_string(),
            old_name: old_name.to_string(),
            new_dir: new_dir.to_string(),
            new_name: new_name.to_string(),
        }));
        Ok(())
    }

    pub fn set_attr(
        &mut self,
        dir: &str,
        name: &str,
        attr: AttrChange,
        cache: &BlockCache,
    ) -> TlfResult<DirEntry> {
        let path = join(dir, name);
        let parent = self.dir_mut(dir, cache)?;
        let entry = parent
            .children
            .get_mut(name)
            .ok_or_else(|| TlfError::NotFound(path))?;
        match attr {
            AttrChange::Exec(exec) => entry.exec = exec,
            AttrChange::Mtime(mtime_ms) => entry.mtime_ms = mtime_ms,
        }
        let entry = *entry;
        self.ops.push(Op::new(OpKind::SetAttr {
            dir: dir.to_string(),
            name: name.to_string(),
            attr,
        }));
        Ok(entry)
    }

    pub fn write(
        &mut self,
        dir: &str,
        name: &str,
        off: u64,
        data: &[u8],
        now_ms: u64,
        cache: &BlockCache,
    ) -> TlfResult<WriteRange> {
        let path = join(dir, name);
        let mut content = self.file(&path, cache)?;
        let start = usize::try_from(off)?;
        let end = start
            .checked_add(data.len())
            .ok_or_else(|| anyhow!("write to {path} overflows"))?;
        if content.len() < end {
            content.resize(end, 0);
        }
        content[start..end].copy_from_slice(data);
        let range = WriteRange {
            off,
            len: data.len() as u64,
        };
        self.stage_file(dir, name, content, now_ms, range, cache)?;
        Ok(range)
    }

    pub fn truncate(
        &mut self,
        dir: &str,
        name: &str,
        size: u64,
        now_ms: u64,
        cache: &BlockCache,
    ) -> TlfResult<WriteRange> {
        let path = join(dir, name);
        let mut content = self.file(&path, cache)?;
        content.resize(usize::try_from(size)?, 0);
        let range = WriteRange { off: size, len: 0 };
        self.stage_file(dir, name, content, now_ms, range, cache)?;
        Ok(range)
    }

    fn stage_file(
        &mut self,
        dir: &str,
        name: &str,
        content: Vec<u8>,
        now_ms: u64,
        range: WriteRange,
        cache: &BlockCache,
    ) -> TlfResult<()> {
        let path = join(dir, name);
        let parent = self.dir_mut(dir, cache)?;
        let entry = parent
            .children
            .get_mut(name)
            .ok_or_else(|| TlfError::NotFound(path.clone()))?;
        entry.size = content.len() as u64;
        entry.mtime_ms = now_ms;
        self.files.insert(path, content);

        // Consecutive writes to one file share a single sync op.
        match self.ops.last_mut() {
            Some(Op {
                kind:
                    OpKind::Sync {
                        dir: d,
                        name: n,
                        writes,
                    },
                ..
            }) if d == dir && n == name => writes.push(range),
            _ => self.ops.push(Op::new(OpKind::Sync {
                dir: dir.to_string(),
                name: name.to_string(),
                writes: vec![range],
            })),
        }
        Ok(())
    }

    /// Seals every staged file and directory, deepest first, and returns
    /// the new root entry with the blocks to put.
    pub fn build(&self, sealer: &Sealer, now_ms: u64) -> TlfResult<Built> {
        let mut dirs = self.dirs.clone();
        let mut puts = Vec::new();
        let mut unrefs = self.unrefs.clone();

        for (path, content) in &self.files {
            let (dir, name) = split(path).ok_or_else(|| anyhow!("file staged at the root"))?;
            let put = sealer.seal(Bytes::from(content.clone()))?;
            let entry = dirs
                .get_mut(dir)
                .and_then(|parent| parent.children.get_mut(name))
                .ok_or_else(|| anyhow!("staged file {path} has no staged entry"))?;
            if entry.ptr.is_valid() {
                unrefs.push(entry.ptr);
            }
            entry.ptr = put.ptr;
            entry.size = content.len() as u64;
            puts.push(put);
        }

        let mut order: Vec<String> = dirs.keys().cloned().collect();
        order.sort_by_key(|p| std::cmp::Reverse(depth(p)));
        let mut root = self.base;
        for path in order {
            let block = dirs
                .remove(&path)
                .ok_or_else(|| anyhow!("staged directory {path} vanished"))?;
            let put = sealer.seal(block.to_bytes()?)?;
            let entry = match split(&path) {
                Some((dir, name)) => dirs
                    .get_mut(dir)
                    .and_then(|parent| parent.children.get_mut(name))
                    .ok_or_else(|| anyhow!("staged directory {path} has no staged entry"))?,
                None => &mut root,
            };
            if entry.ptr.is_valid() {
                unrefs.push(entry.ptr);
            }
            entry.ptr = put.ptr;
            entry.size = put.plain.len() as u64;
            entry.mtime_ms = now_ms;
            puts.push(put);
        }

        let mut refs: Vec<BlockPointer> = puts.iter().map(|p| p.ptr).collect();
        refs.extend(self.adopted.iter().copied());
        let ref_bytes = refs.iter().map(|p| u64::from(p.encoded_size)).sum();
        let unref_bytes = unrefs.iter().map(|p| u64::from(p.encoded_size)).sum();
        Ok(Built {
            root,
            puts,
            refs,
            unrefs,
            ref_bytes,
            unref_bytes,
        })
    }

    /// Applies `ops` on top of this staging by copying, for every path an
    /// op touched, the final state of that path in `src`. Ops whose
    /// destination directory no longer exists here are skipped. Returns
    /// the ops that were applied; they are also appended to this op log.
    pub fn replay(&mut self, src: &Staging, ops: &[Op], cache: &BlockCache) -> TlfResult<Vec<Op>> {
        let mut applied = Vec::new();
        for op in ops {
            let done = match &op.kind {
                OpKind::Create { dir, name, .. }
                | OpKind::SetAttr { dir, name, .. }
                | OpKind::Sync { dir, name, .. } => {
                    self.copy_entry(src, &join(dir, name), cache)?
                }
                OpKind::Rm { dir, name, .. } => {
                    let path = join(dir, name);
                    if src.try_entry(&path, cache)?.is_some() {
                        false
                    } else {
                        self.remove_if_present(&path, false, cache)?
                    }
                }
                OpKind::Rename {
                    old_dir,
                    old_name,
                    new_dir,
                    new_name,
                } => {
                    let old_path = join(old_dir, old_name);
                    let copied = self.copy_entry(src, &join(new_dir, new_name), cache)?;
                    let removed = if src.try_entry(&old_path, cache)?.is_some() {
                        false
                    } else {
                        self.remove_if_present(&old_path, true, cache)?
                    };
                    copied || removed
                }
                OpKind::Gc { .. } | OpKind::Resolution => false,
            };
            if done {
                applied.push(Op::new(op.kind.clone()));
            }
        }
        self.ops.extend(applied.iter().cloned());
        Ok(applied)
    }

    fn copy_entry(&mut self, src: &Staging, path: &str, cache: &BlockCache) -> TlfResult<bool> {
        let Some((dir, name)) = split(path) else {
            return Ok(false);
        };
        let Some(mut entry) = src.try_entry(path, cache)? else {
            return Ok(false);
        };
        match self.try_entry(dir, cache)? {
            Some(parent) if parent.kind == EntryKind::Dir => {}
            _ => return Ok(false),
        }
        let old = self.dir(dir, cache)?.children.get(name).copied();

        let staged_in_src =
            src.files.contains_key(path) || src.dirs.keys().any(|p| is_within(p, path));
        if staged_in_src {
            entry.ptr = placeholder();
        } else if entry.ptr.is_valid() && old.map(|o| o.ptr) != Some(entry.ptr) {
            self.adopted.push(entry.ptr);
        }
        if let Some(old) = old
            && old.ptr.is_valid()
            && old.ptr != entry.ptr
        {
            self.unrefs.push(old.ptr);
        }

        self.dir_mut(dir, cache)?
            .children
            .insert(name.to_string(), entry);
        self.drop_subtree(path);
        for (p, block) in src.dirs.iter().filter(|(p, _)| is_within(p, path)) {
            self.dirs.insert(p.clone(), block.clone());
        }
        for (p, data) in src.files.iter().filter(|(p, _)| is_within(p, path)) {
            self.files.insert(p.clone(), data.clone());
        }
        Ok(true)
    }

    /// Removes `path` if it exists here. Non-empty directories are only
    /// removed when `force` is set.
    fn remove_if_present(&mut self, path: &str, force: bool, cache: &BlockCache) -> TlfResult<bool> {
        let Some((dir, name)) = split(path) else {
            return Ok(false);
        };
        let Some(entry) = self.try_entry(path, cache)? else {
            return Ok(false);
        };
        if !force && entry.kind == EntryKind::Dir && !self.dir(path, cache)?.children.is_empty() {
            return Ok(false);
        }
        self.dir_mut(dir, cache)?.children.remove(name);
        self.drop_subtree(path);
        if entry.ptr.is_valid() {
            self.unrefs.push(entry.ptr);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealer() -> Sealer {
        Sealer::new(None, KeyGen::PUBLIC, UserId::random())
    }

    fn names(block: &DirBlock) -> Vec<&str> {
        block.children.keys().map(String::as_str).collect()
    }

    /// Builds `staging`, caches its blocks and returns a clean staging over
    /// the new root.
    fn commit(staging: &Staging, cache: &BlockCache) -> Staging {
        let built = staging.build(&sealer(), 1).unwrap();
        for put in &built.puts {
            cache.insert(put.ptr.id, put.plain.clone());
        }
        Staging::new(built.root)
    }

    #[test]
    fn path_helpers() {
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a", "b"), "/a/b");
        assert_eq!(split("/a/b"), Some(("/a", "b")));
        assert_eq!(split("/a"), Some(("/", "a")));
        assert_eq!(split("/"), None);
        assert!(is_within("/a/b", "/a"));
        assert!(!is_within("/ab", "/a"));
        assert_eq!(ancestors("/a/b"), vec!["/", "/a", "/a/b"]);
    }

    #[test]
    fn staged_changes_are_visible_before_build() {
        let cache = BlockCache::default();
        let mut s = Staging::new(empty_root());
        s.create("/", "docs", EntryKind::Dir, 1, &cache).unwrap();
        s.create("/docs", "a.txt", EntryKind::File, 1, &cache).unwrap();
        s.write("/docs", "a.txt", 0, b"hello", 2, &cache).unwrap();
        s.write("/docs", "a.txt", 5, b" world", 3, &cache).unwrap();

        assert_eq!(s.file("/docs/a.txt", &cache).unwrap(), b"hello world");
        assert_eq!(s.entry("/docs/a.txt", &cache).unwrap().size, 11);
        // Create, create and one coalesced sync.
        assert_eq!(s.ops().len(), 3);
        let OpKind::Sync { writes, .. } = &s.ops()[2].kind else {
            panic!("expected a sync op");
        };
        assert_eq!(writes.len(), 2);

        let err = s.create("/docs", "a.txt", EntryKind::File, 1, &cache).unwrap_err();
        assert!(matches!(classify(&err), Some(TlfError::Exists(_))));
    }

    #[test]
    fn build_then_read_back_from_cache() {
        let cache = BlockCache::default();
        let mut s = Staging::new(empty_root());
        s.create("/", "d", EntryKind::Dir, 1, &cache).unwrap();
        s.create("/d", "f", EntryKind::File, 1, &cache).unwrap();
        s.write("/d", "f", 0, b"abc", 1, &cache).unwrap();

        let built = s.build(&sealer(), 1).unwrap();
        // Root, /d and /d/f.
        assert_eq!(built.puts.len(), 3);
        assert!(built.unrefs.is_empty());
        assert_eq!(
            built.ref_bytes,
            built.puts.iter().map(|p| u64::from(p.ptr.encoded_size)).sum::<u64>()
        );

        let clean = commit(&s, &cache);
        assert!(!clean.is_dirty());
        assert_eq!(clean.file("/d/f", &cache).unwrap(), b"abc");
        assert_eq!(names(&clean.dir("/", &cache).unwrap()), vec!["d"]);
    }

    #[test]
    fn rewriting_a_committed_file_unrefs_its_old_block() {
        let cache = BlockCache::default();
        let mut s = Staging::new(empty_root());
        s.create("/", "f", EntryKind::File, 1, &cache).unwrap();
        s.write("/", "f", 0, b"one", 1, &cache).unwrap();
        let mut s = commit(&s, &cache);
        let old = s.entry("/f", &cache).unwrap().ptr;

        s.truncate("/", "f", 1, 2, &cache).unwrap();
        assert_eq!(s.file("/f", &cache).unwrap(), b"o");
        let built = s.build(&sealer(), 2).unwrap();
        assert!(built.unrefs.contains(&old));
        assert!(built.unrefs.contains(&s.base().ptr));
    }

    #[test]
    fn remove_and_rename() {
        let cache = BlockCache::default();
        let mut s = Staging::new(empty_root());
        s.create("/", "a", EntryKind::Dir, 1, &cache).unwrap();
        s.create("/a", "x", EntryKind::File, 1, &cache).unwrap();
        s.write("/a", "x", 0, b"x", 1, &cache).unwrap();
        let mut s = commit(&s, &cache);

        let err = s.remove("/", "a", &cache).unwrap_err();
        assert!(matches!(classify(&err), Some(TlfError::DirNotEmpty(_))));

        s.rename("/", "a", "/", "b", &cache).unwrap();
        assert_eq!(s.file("/b/x", &cache).unwrap(), b"x");
        assert!(s.entry("/a", &cache).is_err());
        assert!(s.rename("/", "b", "/b", "c", &cache).is_err());

        s.remove("/b", "x", &cache).unwrap();
        s.remove("/", "b", &cache).unwrap();
        assert!(s.dir("/", &cache).unwrap().children.is_empty());
    }

    #[test]
    fn uncached_blocks_surface_as_missing() {
        let cache = BlockCache::default();
        let mut s = Staging::new(empty_root());
        s.create("/", "f", EntryKind::File, 1, &cache).unwrap();
        let built = s.build(&sealer(), 1).unwrap();
        let s = Staging::new(built.root);

        let err = s.entry("/f", &cache).unwrap_err();
        assert_eq!(crate::blocks::missing_block(&err), Some(built.root.ptr));
    }

    #[test]
    fn replay_copies_final_state_onto_another_base() {
        let cache = BlockCache::default();

        // Common ancestor with one directory.
        let mut s = Staging::new(empty_root());
        s.create("/", "shared", EntryKind::Dir, 1, &cache).unwrap();
        let base = commit(&s, &cache);

        // The other side added a file.
        let mut theirs = base.clone();
        theirs.create("/", "theirs.txt", EntryKind::File, 2, &cache).unwrap();
        let theirs = commit(&theirs, &cache);

        // Local side: a file written in place and a directory that is
        // created and then removed again.
        let mut ours = base.clone();
        ours.create("/shared", "ours.txt", EntryKind::File, 3, &cache).unwrap();
        ours.write("/shared", "ours.txt", 0, b"mine", 3, &cache).unwrap();
        ours.create("/", "tmp", EntryKind::Dir, 3, &cache).unwrap();
        ours.remove("/", "tmp", &cache).unwrap();

        let mut dst = Staging::new(theirs.base());
        let applied = dst.replay(&ours, ours.ops(), &cache).unwrap();
        // The create of /tmp finds nothing to copy; its removal finds
        // nothing to remove.
        assert_eq!(applied.len(), 2);
        assert_eq!(dst.file("/shared/ours.txt", &cache).unwrap(), b"mine");
        assert_eq!(
            names(&dst.dir("/", &cache).unwrap()),
            vec!["shared", "theirs.txt"]
        );

        let merged = commit(&dst, &cache);
        assert_eq!(merged.file("/shared/ours.txt", &cache).unwrap(), b"mine");
    }

    #[test]
    fn replay_skips_ops_whose_directory_is_gone() {
        let cache = BlockCache::default();
        let mut s = Staging::new(empty_root());
        s.create("/", "d", EntryKind::Dir, 1, &cache).unwrap();
        let base = commit(&s, &cache);

        let mut theirs = base.clone();
        theirs.remove("/", "d", &cache).unwrap();
        let theirs = commit(&theirs, &cache);

        let mut ours = base.clone();
        ours.create("/d", "f", EntryKind::File, 2, &cache).unwrap();

        let mut dst = Staging::new(theirs.base());
        let applied = dst.replay(&ours, ours.ops(), &cache).unwrap();
        assert!(applied.is_empty());
        assert!(!dst.is_dirty());
    }
}
