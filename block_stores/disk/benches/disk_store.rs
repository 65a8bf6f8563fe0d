use criterion::{Criterion, criterion_group, criterion_main};
use tlf_core::{BlockContext, BlockId, KeyServerHalf, UserId};
use tlf_store_disk::BlockDiskStore;

fn bench_put(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let rt_handle = &rt;
    let dir = tempfile::tempdir().unwrap();
    let store = BlockDiskStore::new(dir.path());
    let ctx = BlockContext::first(UserId::random());

    let mut group = c.benchmark_group("block_disk_store_put");

    group.bench_function("put_new_4k", |b| {
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            let mut data = vec![0u8; 4 * 1024];
            data[..8].copy_from_slice(&counter.to_le_bytes());
            let id = BlockId::from_payload(&data);
            rt_handle.block_on(async {
                store
                    .put(id, ctx, &data, KeyServerHalf::random(), true)
                    .await
                    .unwrap();
            });
        });
    });

    // Re-puts only rewrite the refs file.
    let data = vec![7u8; 4 * 1024];
    let id = BlockId::from_payload(&data);
    let half = KeyServerHalf::random();
    group.bench_function("re_put_4k", |b| {
        b.iter(|| {
            rt_handle.block_on(async {
                store.put(id, ctx, &data, half, true).await.unwrap();
            });
        });
    });

    group.finish();
}

fn bench_get(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let rt_handle = &rt;
    let dir = tempfile::tempdir().unwrap();
    let store = BlockDiskStore::new(dir.path());
    let ctx = BlockContext::first(UserId::random());

    let data = vec![0u8; 1024 * 1024];
    let id = BlockId::from_payload(&data);
    rt_handle.block_on(async {
        store
            .put(id, ctx, &data, KeyServerHalf::random(), true)
            .await
            .unwrap();
    });

    c.bench_function("get_1mb", |b| {
        b.iter(|| {
            rt_handle.block_on(async {
                let _ = store.get(id, ctx).await.unwrap();
            });
        });
    });
}

criterion_group!(disk_store, bench_put, bench_get);
criterion_main!(disk_store);
