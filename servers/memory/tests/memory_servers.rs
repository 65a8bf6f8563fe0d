use std::sync::Arc;
use tlf_core::testutil::BlockServerTests;
use tlf_core::{
    BlockContext, BlockId, BlockPointer, BranchId, DirEntry, EntryKind, KeyGen, MdServer,
    MergeStatus, PutOptions, Revision, RootMetadata, RootMetadataSigned, Session, SignatureInfo,
    TlfError, TlfHandle, TlfId, classify, is_revision_conflict,
};
use tlf_server_memory::{KeyDirectory, MemoryBlockServer, MemoryMdBackend, MemoryMdServer};

fn root_entry(uid: tlf_core::UserId) -> DirEntry {
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

fn sign(rmd: &RootMetadata, session: &Session) -> RootMetadataSigned {
    let mut md = rmd.bare.clone();
    md.writer_metadata.serialized_private = minicbor::to_vec(&rmd.data).unwrap();
    md.writer_sig = Some(SignatureInfo::sign(
        &session.signing_key,
        &md.serialized_writer_metadata().unwrap(),
    ));
    let sig = SignatureInfo::sign(&session.signing_key, &md.to_vec().unwrap());
    RootMetadataSigned {
        md,
        sig,
        server_timestamp_ms: 0,
    }
}

struct Device {
    session: Session,
    server: MemoryMdServer,
}

fn two_devices() -> (Arc<MemoryMdBackend>, Device, Device) {
    let keys = KeyDirectory::new();
    let first = keys.add_user("alice");
    let second = keys.add_device(first.uid).unwrap();
    let backend = MemoryMdBackend::new();
    let a = Device {
        server: MemoryMdServer::new(backend.clone(), first.clone()),
        session: first,
    };
    let b = Device {
        server: MemoryMdServer::new(backend.clone(), second.clone()),
        session: second,
    };
    (backend, a, b)
}

async fn initial(device: &Device) -> (TlfId, RootMetadataSigned) {
    let handle = TlfHandle::private(device.session.uid);
    let (id, head) = device
        .server
        .get_for_handle(&handle, MergeStatus::Merged)
        .await
        .unwrap();
    assert!(head.is_none());
    let rmd = RootMetadata::new_initial(
        id,
        handle,
        device.session.uid,
        KeyGen::FIRST,
        root_entry(device.session.uid),
    );
    let signed = sign(&rmd, &device.session);
    device
        .server
        .put(signed.clone(), PutOptions::default())
        .await
        .unwrap();
    (id, signed)
}

fn successor(prev: &RootMetadataSigned, data: &RootMetadata) -> RootMetadata {
    RootMetadata {
        bare: prev.md.clone(),
        data: data.data.clone(),
    }
    .make_successor(prev.md.md_id().unwrap())
}

#[tokio::test]
async fn concurrent_merged_puts_conflict() {
    let (backend, a, b) = two_devices();
    let (id, first) = initial(&a).await;
    let base = RootMetadata {
        bare: first.md.clone(),
        data: minicbor::decode(&first.md.writer_metadata.serialized_private).unwrap(),
    };

    let mut from_b = successor(&first, &base);
    from_b.set_last_modifying_writer(b.session.uid);
    b.server
        .put(sign(&from_b, &b.session), PutOptions::default())
        .await
        .unwrap();

    let from_a = successor(&first, &base);
    let err = a
        .server
        .put(sign(&from_a, &a.session), PutOptions::default())
        .await
        .unwrap_err();
    assert!(is_revision_conflict(&err), "unexpected error: {err:#}");
    assert_eq!(backend.merged_revision(id).unwrap(), Some(Revision(2)));
}

#[tokio::test]
async fn unmerged_branch_is_per_device() {
    let (_backend, a, b) = two_devices();
    let (id, first) = initial(&a).await;
    let base = RootMetadata {
        bare: first.md.clone(),
        data: minicbor::decode(&first.md.writer_metadata.serialized_private).unwrap(),
    };

    let bid = BranchId::random();
    let mut unmerged = successor(&first, &base);
    unmerged.set_unmerged();
    unmerged.set_branch_id(bid);
    a.server
        .put(sign(&unmerged, &a.session), PutOptions::default())
        .await
        .unwrap();

    let head = a
        .server
        .get_for_tlf(id, BranchId::NULL, MergeStatus::Unmerged)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(head.md.bid(), bid);
    assert!(
        b.server
            .get_for_tlf(id, BranchId::NULL, MergeStatus::Unmerged)
            .await
            .unwrap()
            .is_none()
    );

    a.server.prune_branch(id, bid).await.unwrap();
    assert!(
        a.server
            .get_for_tlf(id, BranchId::NULL, MergeStatus::Unmerged)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn put_rejects_foreign_signatures() {
    let (_backend, a, b) = two_devices();
    let (_id, first) = initial(&a).await;
    let base = RootMetadata {
        bare: first.md.clone(),
        data: minicbor::decode(&first.md.writer_metadata.serialized_private).unwrap(),
    };
    // Signed by the other device.
    let err = a
        .server
        .put(sign(&successor(&first, &base), &b.session), PutOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        classify(&err),
        Some(TlfError::ServerBadRequest(_))
    ));
}

#[tokio::test]
async fn update_registration_fires_on_newer_merged_revision() {
    let (_backend, a, b) = two_devices();
    let (id, first) = initial(&a).await;
    let base = RootMetadata {
        bare: first.md.clone(),
        data: minicbor::decode(&first.md.writer_metadata.serialized_private).unwrap(),
    };

    let rx = a.server.register_for_update(id, Revision(1)).await.unwrap();
    let mut next = successor(&first, &base);
    next.set_last_modifying_writer(b.session.uid);
    b.server
        .put(sign(&next, &b.session), PutOptions::default())
        .await
        .unwrap();
    rx.await.unwrap().unwrap();

    // Already behind: fires immediately.
    let rx = a.server.register_for_update(id, Revision(1)).await.unwrap();
    rx.await.unwrap().unwrap();

    let range = a
        .server
        .get_range(id, BranchId::NULL, MergeStatus::Merged, Revision(1), Revision(10))
        .await
        .unwrap();
    assert_eq!(range.len(), 2);
}

#[tokio::test]
async fn memory_block_server_conformance() {
    let server = MemoryBlockServer::new();
    BlockServerTests::new(&server).run_all().await.unwrap();
}
