use bytes::Bytes;
use std::sync::Arc;
use tempfile::TempDir;
use tlf_core::{
    BlockContext, BlockId, BlockPointer, BlockServer, BranchId, DirEntry, EntryKind,
    ImmutableRootMetadata, KeyGen, KeyServerHalf, MergeStatus, Op, OpKind, PutOptions, Revision,
    RootMetadata, Session, TlfConfig, TlfError, TlfHandle, TlfId, UserId, classify,
};
use tlf_journal::{JournalBlockServer, JournalEvent, JournalManager, JournalMdOps, MdJournal};
use tlf_md::{MdCache, MdOps, MdOpsStandard};
use tlf_server_memory::{
    KeyDirectory, MemoryBlockServer, MemoryKeyService, MemoryMdBackend, MemoryMdServer,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn root_entry(uid: UserId) -> DirEntry {
    DirEntry {
        kind: EntryKind::Dir,
        ptr: BlockPointer {
            id: BlockId::from_payload(b"root"),
            key_gen: KeyGen::FIRST,
            data_ver: BlockPointer::DATA_VER,
            context: BlockContext::first(uid),
            encoded_size: 4,
        },
        size: 4,
        mtime_ms: 0,
        exec: false,
    }
}

fn with_op(mut rmd: RootMetadata, name: &str) -> RootMetadata {
    rmd.add_op(Op::new(OpKind::Create {
        dir: "/".into(),
        name: name.into(),
        kind: EntryKind::File,
    }));
    rmd
}

fn successor(irmd: &ImmutableRootMetadata) -> RootMetadata {
    irmd.make_successor(irmd.md_id())
}

/// One device with a journal in front of a shared in-memory authority.
struct Device {
    _dir: TempDir,
    session: Session,
    remote: MdOpsStandard,
    manager: Arc<JournalManager>,
    ops: JournalMdOps,
    blocks: Arc<MemoryBlockServer>,
}

struct World {
    backend: Arc<MemoryMdBackend>,
    directory: Arc<KeyDirectory>,
    blocks: Arc<MemoryBlockServer>,
    alice: Session,
}

impl World {
    fn new() -> Self {
        init_tracing();
        let directory = KeyDirectory::new();
        let alice = directory.add_user("alice");
        Self {
            backend: MemoryMdBackend::new(),
            directory,
            blocks: Arc::new(MemoryBlockServer::new()),
            alice,
        }
    }

    fn device(&self, session: &Session) -> Device {
        let dir = tempfile::tempdir().unwrap();
        let config = TlfConfig::default();
        let keys = Arc::new(MemoryKeyService::new(
            self.directory.clone(),
            session.clone(),
        ));
        let server = Arc::new(MemoryMdServer::new(self.backend.clone(), session.clone()));
        let cache = Arc::new(MdCache::new(config.md_cache_capacity));
        let remote = MdOpsStandard::new(server.clone(), keys.clone(), cache.clone(), config.clone());
        let manager = JournalManager::new(
            dir.path(),
            session.clone(),
            keys,
            server,
            self.blocks.clone(),
            cache,
            config,
        );
        let ops = JournalMdOps::new(Arc::new(remote.clone()), manager.clone());
        Device {
            _dir: dir,
            session: session.clone(),
            remote,
            manager,
            ops,
            blocks: self.blocks.clone(),
        }
    }
}

impl Device {
    /// Creates the folder's first revision directly on the server.
    async fn create_remote(&self) -> ImmutableRootMetadata {
        let handle = TlfHandle::private(self.session.uid);
        let (id, head) = self
            .remote
            .get_for_handle(&handle, MergeStatus::Merged)
            .await
            .unwrap();
        assert!(head.is_none());
        let rmd = RootMetadata::new_initial(
            id,
            handle,
            self.session.uid,
            KeyGen::FIRST,
            root_entry(self.session.uid),
        );
        self.remote
            .put(rmd, &self.session, PutOptions::default())
            .await
            .unwrap()
    }
}

fn revisions(irmds: &[ImmutableRootMetadata]) -> Vec<u64> {
    irmds.iter().map(|r| r.revision().0).collect()
}

#[tokio::test]
async fn journaled_puts_are_read_back_before_flush() {
    let world = World::new();
    let device = world.device(&world.alice);
    let handle = TlfHandle::private(world.alice.uid);
    let (id, _) = device
        .ops
        .get_for_handle(&handle, MergeStatus::Merged)
        .await
        .unwrap();
    device.manager.enable(id).unwrap();

    let rmd = RootMetadata::new_initial(
        id,
        handle.clone(),
        world.alice.uid,
        KeyGen::FIRST,
        root_entry(world.alice.uid),
    );
    let first = device
        .ops
        .put(rmd, &world.alice, PutOptions::default())
        .await
        .unwrap();
    let second = device
        .ops
        .put(with_op(successor(&first), "a"), &world.alice, PutOptions::default())
        .await
        .unwrap();
    assert!(!second.put_to_server());
    assert_eq!(world.backend.merged_revision(id).unwrap(), None);

    let head = device.ops.get_for_tlf(id).await.unwrap().unwrap();
    assert_eq!(head.md_id(), second.md_id());
    assert_eq!(head.ops(), second.ops());
    let (_, by_handle) = device
        .ops
        .get_for_handle(&handle, MergeStatus::Merged)
        .await
        .unwrap();
    assert_eq!(by_handle.unwrap().md_id(), second.md_id());
    let range = device.ops.get_range(id, Revision(1), Revision(5)).await.unwrap();
    assert_eq!(revisions(&range), vec![1, 2]);

    assert_eq!(device.manager.flush(id).await.unwrap(), 2);
    assert_eq!(world.backend.merged_revision(id).unwrap(), Some(Revision(2)));
    let journal = device.manager.get(id).unwrap();
    assert!(journal.is_empty().await.unwrap());

    let fetched = device.remote.get_for_tlf(id).await.unwrap().unwrap();
    assert_eq!(fetched.md_id(), second.md_id());
    device.manager.disable(id).await.unwrap();
    assert!(device.manager.get(id).is_none());
}

#[tokio::test]
async fn ranges_concatenate_server_and_journal() {
    let world = World::new();
    let device = world.device(&world.alice);
    let first = device.create_remote().await;
    let id = first.tlf_id();

    device.manager.enable(id).unwrap();
    let second = device
        .ops
        .put(with_op(successor(&first), "a"), &world.alice, PutOptions::default())
        .await
        .unwrap();
    device
        .ops
        .put(with_op(successor(&second), "b"), &world.alice, PutOptions::default())
        .await
        .unwrap();

    let all = device.ops.get_range(id, Revision(1), Revision(3)).await.unwrap();
    assert_eq!(revisions(&all), vec![1, 2, 3]);
    assert!(all[0].put_to_server());
    assert!(!all[1].put_to_server());

    let tail = device.ops.get_range(id, Revision(2), Revision(3)).await.unwrap();
    assert_eq!(revisions(&tail), vec![2, 3]);

    // Disabling is refused while revisions wait to be flushed.
    assert!(device.manager.disable(id).await.is_err());
}

#[tokio::test]
async fn journal_puts_reject_lock_contexts_and_priorities() {
    let world = World::new();
    let device = world.device(&world.alice);
    let first = device.create_remote().await;
    device.manager.enable(first.tlf_id()).unwrap();

    let opts = PutOptions {
        lock_context: Some(tlf_core::LockContext {
            lock_id: 1,
            release_after_success: true,
        }),
        ..PutOptions::default()
    };
    let err = device
        .ops
        .put(successor(&first), &world.alice, opts)
        .await
        .unwrap_err();
    assert!(matches!(classify(&err), Some(TlfError::JournalUnsupported(_))));

    let opts = PutOptions {
        priority: tlf_core::MdPriority::High,
        ..PutOptions::default()
    };
    let err = device
        .ops
        .put(successor(&first), &world.alice, opts)
        .await
        .unwrap_err();
    assert!(matches!(classify(&err), Some(TlfError::JournalUnsupported(_))));
}

#[tokio::test]
async fn remote_conflict_moves_the_journal_onto_a_branch() {
    let world = World::new();
    let laptop = world.device(&world.alice);
    let phone_session = world.directory.add_device(world.alice.uid).unwrap();
    let phone = world.device(&phone_session);

    let first = laptop.create_remote().await;
    let id = first.tlf_id();
    laptop.manager.enable(id).unwrap();
    let mut events = laptop.manager.subscribe();

    let local = laptop
        .ops
        .put(with_op(successor(&first), "laptop"), &world.alice, PutOptions::default())
        .await
        .unwrap();

    // The phone wins the race for revision 2.
    let phone_head = phone.remote.get_for_tlf(id).await.unwrap().unwrap();
    phone
        .remote
        .put(with_op(successor(&phone_head), "phone"), &phone_session, PutOptions::default())
        .await
        .unwrap();

    assert_eq!(laptop.manager.flush(id).await.unwrap(), 1);
    let bid = match events.recv().await.unwrap() {
        JournalEvent::BranchChanged { tlf, bid } => {
            assert_eq!(tlf, id);
            bid
        }
        other => panic!("unexpected event {other:?}"),
    };
    assert!(!bid.is_null());
    assert_eq!(
        events.recv().await.unwrap(),
        JournalEvent::MdFlushed {
            tlf: id,
            bid,
            revision: Revision(2),
        }
    );

    let journal = laptop.manager.get(id).unwrap();
    assert_eq!(journal.md().await.branch_id(), bid);

    // The laptop's revision now lives on its branch, the mainline is the phone's.
    let unmerged = laptop
        .ops
        .get_unmerged_for_tlf(id, BranchId::NULL)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(unmerged.bid(), bid);
    assert_eq!(unmerged.ops(), local.ops());
    assert_eq!(world.backend.merged_revision(id).unwrap(), Some(Revision(2)));
    assert!(laptop.manager.cache().get(id, Revision(2), bid).unwrap().is_some());

    // A merged put while the journal is on the branch is a conflict.
    let mut merged = successor(&unmerged);
    merged.set_merged();
    let err = laptop
        .ops
        .put(merged, &world.alice, PutOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(classify(&err), Some(TlfError::JournalConflict { .. })));

    // An unmerged put with a null branch lands on the journal's branch.
    let mut next = successor(&unmerged);
    next.set_merged();
    let next = laptop.ops.put_unmerged(next, &world.alice).await.unwrap();
    assert_eq!(next.bid(), bid);
    assert_eq!(next.prev_root(), unmerged.md_id());
}

#[tokio::test]
async fn prune_branch_clears_the_journal_branch() {
    let world = World::new();
    let device = world.device(&world.alice);
    let first = device.create_remote().await;
    let id = first.tlf_id();
    device.manager.enable(id).unwrap();

    let branched = device
        .ops
        .put_unmerged(with_op(successor(&first), "a"), &world.alice)
        .await
        .unwrap();
    let bid = branched.bid();
    assert!(!bid.is_null());
    assert_eq!(branched.merged_status(), MergeStatus::Unmerged);

    let head = device
        .ops
        .get_unmerged_for_tlf(id, BranchId::NULL)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(head.md_id(), branched.md_id());
    let range = device
        .ops
        .get_unmerged_range(id, bid, Revision(2), Revision(2))
        .await
        .unwrap();
    assert_eq!(revisions(&range), vec![2]);

    device.ops.prune_branch(id, bid).await.unwrap();
    let journal = device.manager.get(id).unwrap();
    assert!(journal.md().await.branch_id().is_null());
    assert_eq!(journal.md().await.length().await.unwrap(), 0);
    assert!(
        device
            .ops
            .get_unmerged_for_tlf(id, bid)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn resolve_branch_replaces_the_journal_branch() {
    let world = World::new();
    let device = world.device(&world.alice);
    let first = device.create_remote().await;
    let id = first.tlf_id();
    device.manager.enable(id).unwrap();

    let b2 = device
        .ops
        .put_unmerged(with_op(successor(&first), "a"), &world.alice)
        .await
        .unwrap();
    let bid = b2.bid();
    device
        .ops
        .put_unmerged(with_op(successor(&b2), "b"), &world.alice)
        .await
        .unwrap();

    let resolution = with_op(with_op(successor(&first), "a"), "b");
    let resolved = device
        .ops
        .resolve_branch(id, bid, resolution, &world.alice)
        .await
        .unwrap();
    assert_eq!(resolved.merged_status(), MergeStatus::Merged);
    assert_eq!(resolved.revision(), Revision(2));

    let journal = device.manager.get(id).unwrap();
    assert!(journal.md().await.branch_id().is_null());
    assert_eq!(journal.md().await.length().await.unwrap(), 1);

    assert_eq!(device.manager.flush(id).await.unwrap(), 1);
    let head = device.remote.get_for_tlf(id).await.unwrap().unwrap();
    assert_eq!(head.md_id(), resolved.md_id());
    assert_eq!(head.ops().len(), 2);
}

#[tokio::test]
async fn md_journal_survives_reopening() {
    let world = World::new();
    let device = world.device(&world.alice);
    let first = device.create_remote().await;
    let id = first.tlf_id();
    let keys = MemoryKeyService::new(world.directory.clone(), world.alice.clone());
    let dir = tempfile::tempdir().unwrap();

    let bid = {
        let mut journal = MdJournal::open(dir.path(), id, world.alice.clone()).unwrap();
        let mut rmd = with_op(successor(&first), "a");
        rmd.set_unmerged();
        rmd.set_branch_id(BranchId::random());
        let entry = journal.put(rmd, &keys).await.unwrap();
        assert_eq!(journal.branch_id(), entry.bid());

        assert!(journal.clear(BranchId::NULL).await.is_err());
        journal.clear(BranchId::random()).await.unwrap();
        assert_eq!(journal.length().await.unwrap(), 1);
        entry.bid()
    };

    let journal = MdJournal::open(dir.path(), id, world.alice.clone()).unwrap();
    assert_eq!(journal.branch_id(), bid);
    let head = journal.get_head(bid).await.unwrap().unwrap();
    assert_eq!(head.revision(), Revision(2));
    assert!(journal.get_head(BranchId::NULL).await.unwrap().is_none());
}

#[tokio::test]
async fn md_journal_rejects_non_successors() {
    let world = World::new();
    let device = world.device(&world.alice);
    let first = device.create_remote().await;
    let keys = MemoryKeyService::new(world.directory.clone(), world.alice.clone());
    let dir = tempfile::tempdir().unwrap();
    let mut journal = MdJournal::open(dir.path(), first.tlf_id(), world.alice.clone()).unwrap();

    journal.put(successor(&first), &keys).await.unwrap();
    let mut skipped = successor(&first);
    skipped.set_revision(Revision(4));
    let err = journal.put(skipped, &keys).await.unwrap_err();
    assert!(matches!(
        classify(&err),
        Some(TlfError::ServerConflictRevision { .. })
    ));

    // Re-putting the head's revision replaces it.
    let replaced = journal.put(with_op(successor(&first), "retry"), &keys).await.unwrap();
    assert_eq!(journal.length().await.unwrap(), 1);
    let head = journal.get_head(BranchId::NULL).await.unwrap().unwrap();
    assert_eq!(head.md_id, replaced.md_id);
}

#[tokio::test]
async fn journaled_blocks_are_served_locally_until_flushed() {
    let world = World::new();
    let device = world.device(&world.alice);
    let tlf = TlfId::random();
    device.manager.enable(tlf).unwrap();
    let server = JournalBlockServer::new(device.manager.clone());

    let buf = Bytes::from_static(b"journaled block");
    let id = BlockId::from_payload(&buf);
    let ctx = BlockContext::first(world.alice.uid);
    let half = KeyServerHalf::random();
    server.put(tlf, id, ctx, buf.clone(), half).await.unwrap();
    let second = ctx.new_reference(world.alice.uid);
    server.add_block_reference(tlf, id, second).await.unwrap();

    assert!(device.blocks.is_empty());
    let (got, got_half) = server.get(tlf, id, second).await.unwrap();
    assert_eq!(got, buf);
    assert_eq!(got_half, half);

    let journal = device.manager.get(tlf).unwrap();
    assert_eq!(journal.blocks().length().await.unwrap(), 2);
    assert!(journal.blocks().store().is_unflushed(id).await.unwrap());

    device.manager.flush(tlf).await.unwrap();
    assert_eq!(journal.blocks().length().await.unwrap(), 0);
    assert!(!journal.blocks().store().is_unflushed(id).await.unwrap());
    let (remote, _) = device.blocks.get(tlf, id, second).await.unwrap();
    assert_eq!(remote, buf);
}

#[tokio::test]
async fn background_flusher_drains_on_signal() {
    let world = World::new();
    let device = world.device(&world.alice);
    let first = device.create_remote().await;
    let id = first.tlf_id();
    device.manager.enable(id).unwrap();
    let mut events = device.manager.subscribe();

    let cancel = tokio_util::sync::CancellationToken::new();
    let flusher = device.manager.spawn_flusher(cancel.clone()).await.unwrap();
    assert!(device.manager.spawn_flusher(cancel.clone()).await.is_err());

    device
        .ops
        .put(with_op(successor(&first), "a"), &world.alice, PutOptions::default())
        .await
        .unwrap();
    let event = tokio::time::timeout(std::time::Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, JournalEvent::MdFlushed { revision: Revision(2), .. }));
    assert_eq!(world.backend.merged_revision(id).unwrap(), Some(Revision(2)));

    cancel.cancel();
    flusher.await.unwrap();
}
