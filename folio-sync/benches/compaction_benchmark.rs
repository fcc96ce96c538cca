use criterion::{criterion_group, criterion_main, Criterion};
use folio_sync::codec;
use folio_sync::hash::fnv1a_32;
use folio_sync::{
    compact_target, compact_updates, content_hash, MemoryStore, RocksStore, StoreConfig,
    TargetKey, UpdateBatch, UpdateRow, UpdateStore, WriteKind,
};
use std::hint::black_box;
use tempfile::tempdir;
use yrs::{Doc, ReadTxn, Text, Transact};

/// `count` rows, each one typed character of the same document.
fn keystroke_rows(target: &TargetKey, count: usize) -> Vec<UpdateRow> {
    let doc = Doc::new();
    let text = doc.get_or_insert_text("content");
    (0..count)
        .map(|i| {
            let before = doc.transact().state_vector();
            {
                let mut txn = doc.transact_mut();
                let len = text.len(&txn);
                text.insert(&mut txn, len, if i % 7 == 6 { " " } else { "x" });
            }
            UpdateRow::new(target.clone(), doc.transact().encode_diff_v1(&before))
        })
        .collect()
}

fn insert_all(store: &dyn UpdateStore, rows: &[UpdateRow]) {
    let batch = rows
        .iter()
        .cloned()
        .fold(UpdateBatch::new(), |batch, row| batch.insert(row));
    store.write(batch, WriteKind::Replicated).unwrap();
}

fn bench_merge_updates(c: &mut Criterion) {
    let target = TargetKey::document("bench");
    let rows = keystroke_rows(&target, 1000);

    c.bench_function("compact_updates_1K_rows", |b| {
        b.iter(|| black_box(compact_updates(black_box(&rows)).unwrap()))
    });
}

fn bench_compact_memory_store(c: &mut Criterion) {
    let target = TargetKey::entity("note", "bench");
    let rows = keystroke_rows(&target, 500);

    c.bench_function("compact_target_memory_500_rows", |b| {
        b.iter_batched(
            || {
                let store = MemoryStore::new();
                insert_all(&store, &rows);
                store
            },
            |store| black_box(compact_target(&store, &target, WriteKind::Local, 200).unwrap()),
            criterion::BatchSize::SmallInput,
        )
    });
}

fn bench_rocks_write_and_scan(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
    let target = TargetKey::object_field("obj", "body");
    insert_all(&store, &keystroke_rows(&target, 1000));

    c.bench_function("rocks_insert_row", |b| {
        b.iter(|| {
            let row = UpdateRow::new(target.clone(), vec![0u8; 64]);
            store
                .write(UpdateBatch::new().insert(row), WriteKind::Replicated)
                .unwrap();
        })
    });

    let scanned = TargetKey::object_field("obj", "scanned");
    insert_all(&store, &keystroke_rows(&scanned, 1000));
    c.bench_function("rocks_scan_1K_rows", |b| {
        b.iter(|| black_box(store.rows(black_box(&scanned)).unwrap()))
    });
}

fn bench_codec_and_hash(c: &mut Criterion) {
    let payload = vec![0xa5u8; 1024];
    let text = codec::bytes_to_text(&payload);
    let hex = codec::bytes_to_hex(&payload);
    let content = serde_json::json!({
        "blocks": (0..100).map(|i| format!("paragraph {i}")).collect::<Vec<_>>(),
    });

    c.bench_function("decode_stored_base64_1KB", |b| {
        b.iter(|| black_box(codec::decode_stored(black_box(&text)).unwrap()))
    });
    c.bench_function("decode_stored_hex_1KB", |b| {
        b.iter(|| black_box(codec::decode_stored(black_box(&hex)).unwrap()))
    });
    c.bench_function("fnv1a_32_target", |b| {
        b.iter(|| black_box(fnv1a_32(black_box("note\u{1f}8f3a2c"))))
    });
    c.bench_function("content_hash_100_blocks", |b| {
        b.iter(|| black_box(content_hash(black_box(&content))))
    });
}

criterion_group!(
    benches,
    bench_merge_updates,
    bench_compact_memory_store,
    bench_rocks_write_and_scan,
    bench_codec_and_hash,
);
criterion_main!(benches);
