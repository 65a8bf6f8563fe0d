mod common;

use common::{RecordingObserver, World, ctx, manual_config, names, read_file, write_file};
use std::sync::Arc;
use std::time::Duration;
use tlf_core::{NodeChange, Revision, TlfConfig, TlfError, classify};
use tlf_folder::Folders;

#[tokio::test]
async fn remote_revisions_are_applied_in_order() {
    let world = World::new();
    let laptop = world.device(&world.alice);
    let phone = world.device(&world.phone());
    let (engine, _) = world.open(&laptop).await;
    let (remote, _) = world.open(&phone).await;
    let observer = Arc::new(RecordingObserver::default());
    engine.register_observer(observer.clone()).await;

    write_file(&remote, "a", b"first").await;
    remote.sync_all(&ctx()).await.unwrap();
    write_file(&remote, "b", b"second").await;
    remote.sync_all(&ctx()).await.unwrap();

    engine.sync_from_server(&ctx()).await.unwrap();
    let status = engine.status().await.unwrap();
    assert_eq!(status.revision, Revision(3));
    assert_eq!(status.latest_merged_revision, Revision(3));
    assert_eq!(names(&engine).await, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(read_file(&engine, "b").await, b"second");

    // One batch per applied revision.
    assert_eq!(observer.batches().len(), 2);
    assert!(observer.saw("/", Some("a")));
    assert!(observer.saw("/", Some("b")));

    // Nothing newer: a no-op.
    engine.sync_from_server(&ctx()).await.unwrap();
    assert_eq!(observer.batches().len(), 2);
}

#[tokio::test]
async fn updates_wait_for_staged_changes() {
    let world = World::new();
    let laptop = world.device(&world.alice);
    let phone = world.device(&world.phone());
    let (engine, _) = world.open(&laptop).await;
    let (remote, _) = world.open(&phone).await;

    write_file(&remote, "remote", b"r").await;
    remote.sync_all(&ctx()).await.unwrap();
    write_file(&engine, "local", b"l").await;

    let err = engine.sync_from_server(&ctx()).await.unwrap_err();
    assert!(matches!(classify(&err), Some(TlfError::NoUpdatesWhileDirty(_))));
    assert!(!engine.force_fast_forward(&ctx()).await.unwrap());

    let status = engine.status().await.unwrap();
    assert!(status.dirty);
    assert_eq!(status.revision, Revision::INITIAL);
}

#[tokio::test]
async fn far_behind_heads_fast_forward() {
    let world = World::new();
    let config = TlfConfig {
        fast_forward_rev_thresh: 2,
        ..manual_config()
    };
    let laptop = Folders::new(world.context(&world.alice, config).without_background_tasks());
    let phone = world.device(&world.phone());
    let (engine, _) = world.open(&laptop).await;
    let (remote, _) = world.open(&phone).await;
    let observer = Arc::new(RecordingObserver::default());
    engine.register_observer(observer.clone()).await;

    let root = engine.root_node();
    assert!(engine.lookup(&root, "missing").await.is_err());

    for i in 0..4 {
        write_file(&remote, &format!("f{i}"), b"x").await;
        remote.sync_all(&ctx()).await.unwrap();
    }

    engine.sync_from_server(&ctx()).await.unwrap();
    assert_eq!(engine.status().await.unwrap().revision, Revision(5));

    // A single batch that starts at the root and covers every live node.
    let batches = observer.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(
        batches[0][0],
        NodeChange {
            dir: "/".into(),
            name: None,
        }
    );
    assert_eq!(names(&engine).await.len(), 4);
    engine.forget(root);
}

#[tokio::test]
async fn forced_fast_forward_jumps_to_the_latest_revision() {
    let world = World::new();
    let laptop = world.device(&world.alice);
    let phone = world.device(&world.phone());
    let (engine, _) = world.open(&laptop).await;
    let (remote, _) = world.open(&phone).await;

    assert!(!engine.force_fast_forward(&ctx()).await.unwrap());
    write_file(&remote, "x", b"1").await;
    remote.sync_all(&ctx()).await.unwrap();

    assert!(engine.force_fast_forward(&ctx()).await.unwrap());
    assert_eq!(engine.status().await.unwrap().revision, Revision(2));
    assert_eq!(read_file(&engine, "x").await, b"1");
}

#[tokio::test]
async fn subscriber_follows_the_mainline() {
    let world = World::new();
    let config = TlfConfig {
        flush_interval_ms: 50,
        ..manual_config()
    };
    let laptop = Folders::new(world.context(&world.alice, config));
    let phone = world.device(&world.phone());
    let (engine, _) = world.open(&laptop).await;
    let (remote, _) = world.open(&phone).await;

    write_file(&remote, "pushed", b"p").await;
    remote.sync_all(&ctx()).await.unwrap();

    let mut caught_up = false;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(25)).await;
        if engine.status().await.unwrap().revision == Revision(2) {
            caught_up = true;
            break;
        }
    }
    assert!(caught_up);
    assert_eq!(read_file(&engine, "pushed").await, b"p");
    laptop.shutdown().await.unwrap();
}

/// Calls back into the engine from every batch it is handed.
#[derive(Default)]
struct ReentrantObserver {
    engine: std::sync::OnceLock<std::sync::Weak<tlf_folder::FolderBranchOps>>,
    nested: std::sync::Mutex<Vec<bool>>,
}

#[async_trait::async_trait]
impl tlf_folder::Observer for ReentrantObserver {
    async fn local_change(&self, _change: &NodeChange, _write: tlf_core::WriteRange) {}

    async fn batch_changes(&self, _changes: &[NodeChange]) {
        let Some(engine) = self.engine.get().and_then(std::sync::Weak::upgrade) else {
            return;
        };
        let synced = engine.sync_all(&ctx()).await.unwrap();
        self.nested.lock().unwrap().push(synced);
    }

    async fn tlf_handle_change(&self, _handle: &tlf_core::TlfHandle) {}
}

#[tokio::test]
async fn observers_may_call_back_into_the_engine() {
    let world = World::new();
    let config = TlfConfig {
        fast_forward_rev_thresh: 1,
        ..manual_config()
    };
    let laptop = Folders::new(world.context(&world.alice, config).without_background_tasks());
    let phone = world.device(&world.phone());
    let (engine, _) = world.open(&laptop).await;
    let (remote, _) = world.open(&phone).await;
    let observer = Arc::new(ReentrantObserver::default());
    observer.engine.set(Arc::downgrade(&engine)).unwrap();
    engine.register_observer(observer.clone()).await;

    // One revision behind: replayed.
    write_file(&remote, "a", b"1").await;
    remote.sync_all(&ctx()).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), engine.sync_from_server(&ctx()))
        .await
        .expect("update delivery deadlocked")
        .unwrap();

    // Two revisions behind: fast-forwarded.
    for name in ["b", "c"] {
        write_file(&remote, name, b"2").await;
        remote.sync_all(&ctx()).await.unwrap();
    }
    tokio::time::timeout(Duration::from_secs(5), engine.sync_from_server(&ctx()))
        .await
        .expect("fast-forward delivery deadlocked")
        .unwrap();

    assert_eq!(engine.status().await.unwrap().revision, Revision(4));
    assert_eq!(*observer.nested.lock().unwrap(), vec![false, false]);
}
