use std::collections::BTreeMap;
use tlf_core::testutil::BlockServerTests;
use tlf_core::{
    BlockContext, BlockId, BlockRefStatus, KeyServerHalf, RefNonce, TlfError, UserId, classify,
};
use tlf_store_disk::{BlockDiskStore, DiskBlockServer};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn fixture() -> (tempfile::TempDir, BlockDiskStore, UserId) {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let store = BlockDiskStore::new(dir.path().join("blocks"));
    (dir, store, UserId::random())
}

#[tokio::test]
async fn put_then_remove_references_then_delete() {
    let (_dir, store, uid) = fixture();
    let data = b"block payload D";
    let h = BlockId::from_payload(data);
    let c1 = BlockContext::first(uid);
    let half = KeyServerHalf::random();

    assert!(store.put(h, c1, data, half, true).await.unwrap());
    assert!(!store.put(h, c1, data, half, true).await.unwrap());
    assert_eq!(store.get_all_refs_for_id(h).await.unwrap().len(), 1);

    let c2 = c1.new_reference(uid);
    store.add_reference(h, c2, "").await.unwrap();
    assert_eq!(store.remove_references(h, &[c1], "").await.unwrap(), 1);
    assert_eq!(store.remove_references(h, &[c2], "").await.unwrap(), 0);

    let block_dir = store.block_path(&h);
    assert!(block_dir.exists());
    store.remove(h).await.unwrap();
    assert!(!block_dir.exists());
    assert!(!block_dir.parent().unwrap().exists());
}

#[tokio::test]
async fn remove_fails_while_any_reference_remains() {
    let (_dir, store, uid) = fixture();
    let data = b"referenced";
    let id = BlockId::from_payload(data);
    let ctx = BlockContext::first(uid);
    store
        .put(id, ctx, data, KeyServerHalf::random(), true)
        .await
        .unwrap();

    let extra = ctx.new_reference(uid);
    store.add_reference(id, extra, "").await.unwrap();
    store
        .archive_references(&BTreeMap::from([(id, vec![extra])]), "")
        .await
        .unwrap();

    let steps: [&[BlockContext]; 2] = [&[ctx], &[extra]];
    for contexts in steps {
        let err = store.remove(id).await.unwrap_err();
        assert!(matches!(
            classify(&err),
            Some(TlfError::BlockStillReferenced { .. })
        ));
        assert!(store.has_data(id).await.unwrap());
        store.remove_references(id, contexts, "").await.unwrap();
    }

    // Only an archived reference was left before the last removal.
    assert!(!store.has_any_ref(id).await.unwrap());
    store.remove(id).await.unwrap();
    assert!(!store.has_data(id).await.unwrap());
}

#[tokio::test]
async fn put_rejects_payload_with_wrong_hash() {
    let (_dir, store, uid) = fixture();
    let id = BlockId::from_payload(b"the real payload");
    let err = store
        .put(
            id,
            BlockContext::first(uid),
            b"a forged payload",
            KeyServerHalf::random(),
            true,
        )
        .await
        .unwrap_err();
    assert!(matches!(
        classify(&err),
        Some(TlfError::HashMismatch { .. })
    ));
    assert!(!store.block_path(&id).exists());
}

#[tokio::test]
async fn regular_put_validates_context_and_server_half() {
    let (_dir, store, uid) = fixture();
    let data = b"validated";
    let id = BlockId::from_payload(data);
    let ctx = BlockContext::first(uid);

    let mut foreign = ctx;
    foreign.writer = UserId::random();
    assert!(
        store
            .put(id, foreign, data, KeyServerHalf::random(), true)
            .await
            .is_err()
    );

    let half = KeyServerHalf::random();
    store.put(id, ctx, data, half, true).await.unwrap();
    let err = store
        .put(id, ctx, data, KeyServerHalf::random(), true)
        .await
        .unwrap_err();
    assert!(matches!(
        classify(&err),
        Some(TlfError::ServerHalfMismatch(_))
    ));

    // Journal puts carry new references and skip both checks.
    let journal_ctx = ctx.new_reference(UserId::random());
    assert!(
        !store
            .put(id, journal_ctx, data, KeyServerHalf::random(), false)
            .await
            .unwrap()
    );
    assert_eq!(store.live_count(id).await.unwrap(), 2);
}

#[tokio::test]
async fn stale_tag_removal_is_a_silent_no_op() {
    let (_dir, store, uid) = fixture();
    let data = b"tagged";
    let id = BlockId::from_payload(data);
    let ctx = BlockContext::first(uid);
    store
        .put(id, ctx, data, KeyServerHalf::random(), true)
        .await
        .unwrap();

    let tagged = ctx.new_reference(uid);
    store.add_reference(id, tagged, "gc-1").await.unwrap();
    store
        .archive_references(&BTreeMap::from([(id, vec![tagged])]), "gc-2")
        .await
        .unwrap();

    assert_eq!(
        store.remove_references(id, &[tagged], "gc-1").await.unwrap(),
        1
    );
    assert_eq!(
        store.has_context(id, tagged).await.unwrap(),
        Some(BlockRefStatus::Archived)
    );

    store.remove_references(id, &[tagged], "gc-2").await.unwrap();
    assert_eq!(store.has_context(id, tagged).await.unwrap(), None);
}

#[tokio::test]
async fn mismatched_context_for_known_nonce_is_rejected() {
    let (_dir, store, uid) = fixture();
    let data = b"nonce clash";
    let id = BlockId::from_payload(data);
    let ctx = BlockContext::first(uid);
    store
        .put(id, ctx, data, KeyServerHalf::random(), true)
        .await
        .unwrap();

    let clash = BlockContext {
        creator: UserId::random(),
        writer: uid,
        ref_nonce: RefNonce::ZERO,
    };
    let err = store.add_reference(id, clash, "").await.unwrap_err();
    assert!(matches!(
        classify(&err),
        Some(TlfError::RefContextMismatch { .. })
    ));
    assert!(store.has_context(id, clash).await.is_err());
}

#[tokio::test]
async fn layout_and_flush_state() {
    let (_dir, store, uid) = fixture();
    let data = b"layout";
    let id = BlockId::from_payload(data);
    let half = KeyServerHalf::random();
    store
        .put(id, BlockContext::first(uid), data, half, false)
        .await
        .unwrap();

    let hex = id.to_hex();
    let block_dir = store.dir().join(&hex[..4]).join(&hex[4..34]);
    assert_eq!(block_dir, store.block_path(&id));
    assert_eq!(std::fs::read_to_string(block_dir.join("id")).unwrap(), hex);
    assert_eq!(std::fs::read(block_dir.join("data")).unwrap(), data);
    assert_eq!(std::fs::read(block_dir.join("ksh")).unwrap(), half.as_bytes());
    assert!(block_dir.join("refs").exists());

    assert_eq!(store.get_data_size(id).await.unwrap(), data.len() as u64);
    assert!(store.is_unflushed(id).await.unwrap());
    store.mark_flushed(id).await.unwrap();
    assert!(!store.is_unflushed(id).await.unwrap());

    let absent = BlockId::from_payload(b"absent");
    assert_eq!(store.get_data_size(absent).await.unwrap(), 0);
    assert!(!store.is_unflushed(absent).await.unwrap());
    assert!(!store.has_any_ref(absent).await.unwrap());

    let all = store.get_all_refs().await.unwrap();
    assert_eq!(all.keys().copied().collect::<Vec<_>>(), vec![id]);
}

#[tokio::test]
async fn get_requires_a_known_context() {
    let (_dir, store, uid) = fixture();
    let data = b"context gated";
    let id = BlockId::from_payload(data);
    let ctx = BlockContext::first(uid);
    let half = KeyServerHalf::random();
    store.put(id, ctx, data, half, true).await.unwrap();

    let (buf, got_half) = store.get(id, ctx).await.unwrap();
    assert_eq!(buf, data);
    assert_eq!(got_half, half);

    let err = store.get(id, ctx.new_reference(uid)).await.unwrap_err();
    assert!(matches!(
        classify(&err),
        Some(TlfError::BlockNonExistent(_))
    ));
}

#[tokio::test]
async fn disk_block_server_conformance() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let server = DiskBlockServer::new(dir.path());
    BlockServerTests::new(&server).run_all().await.unwrap();
}
