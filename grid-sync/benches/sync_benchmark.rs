use criterion::{criterion_group, criterion_main, Criterion};
use grid_sync::protocol::{CellEdit, ClientMessage, PresenceRecord, Record};
use grid_sync::storage::{
    DurableLog, FallbackBuffer, LogEntry, MemoryLog, MemoryStore, RecordStore, RocksConfig,
    RocksLog, RocksStore, RowId, StoredRow,
};
use grid_sync::{GridSnapshot, Session};
use std::hint::black_box;
use tokio::runtime::Runtime;

fn edit_payload(i: usize, user: &str) -> String {
    Record::Edit(CellEdit::new((i % 100).to_string(), (i / 100).to_string(), i.to_string()).stamp(user))
        .encode()
        .unwrap()
}

fn bench_client_edit_decode(c: &mut Criterion) {
    let frame = r#"{"type":"EDIT","payload":{"rowKey":12,"columnKey":7,"value":"42"}}"#;

    c.bench_function("client_edit_decode", |b| {
        b.iter(|| {
            black_box(ClientMessage::decode(black_box(frame)).unwrap());
        })
    });
}

fn bench_record_encode(c: &mut Criterion) {
    let record = Record::Edit(CellEdit::new("12", "7", "42").stamp("client-key"));

    c.bench_function("record_encode", |b| {
        b.iter(|| {
            black_box(black_box(&record).encode().unwrap());
        })
    });
}

fn bench_session_advance_1000(c: &mut Criterion) {
    let batch: Vec<LogEntry> = (0..1000)
        .map(|i| {
            let user = if i % 2 == 0 { "self" } else { "other" };
            LogEntry::new(i as u64 + 1, edit_payload(i, user))
        })
        .collect();

    c.bench_function("session_advance_1000", |b| {
        b.iter(|| {
            let mut session = Session::new("self", 0);
            black_box(session.advance(batch.clone()));
        })
    });
}

fn bench_snapshot_build_10000(c: &mut Criterion) {
    let rows: Vec<StoredRow> = (0..10_000)
        .map(|i| StoredRow {
            id: RowId::Log(i as u64 + 1),
            payload: edit_payload(i, "a"),
        })
        .collect();
    let entries: Vec<LogEntry> = (10_000..10_500)
        .map(|i| LogEntry::new(i as u64 + 1, edit_payload(i, "b")))
        .collect();
    let fallback = vec![(
        RowId::out_of_band(),
        Record::User(PresenceRecord::error("a", "both")).encode().unwrap(),
    )];

    c.bench_function("snapshot_build_10000", |b| {
        b.iter(|| {
            black_box(GridSnapshot::build(
                rows.clone(),
                entries.clone(),
                fallback.clone(),
            ));
        })
    });
}

fn bench_memory_log_append(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let log = MemoryLog::new();
    let record = Record::Edit(CellEdit::new("1", "1", "v").stamp("a"));

    c.bench_function("memory_log_append", |b| {
        b.iter(|| {
            rt.block_on(async { black_box(log.append(&record).await.unwrap()) });
        })
    });
}

fn bench_rocks_log_append(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let log = RocksLog::open(RocksConfig::for_testing(dir.path().join("log"))).unwrap();
    let record = Record::Edit(CellEdit::new("1", "1", "v").stamp("a"));

    c.bench_function("rocks_log_append", |b| {
        b.iter(|| {
            rt.block_on(async { black_box(log.append(&record).await.unwrap()) });
        })
    });
}

fn bench_rocks_store_insert(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let store = RocksStore::open(RocksConfig::for_testing(dir.path().join("store"))).unwrap();
    let payload = edit_payload(1, "a");
    let mut next_id = 0u64;

    c.bench_function("rocks_store_insert", |b| {
        b.iter(|| {
            next_id += 1;
            rt.block_on(async {
                black_box(store.insert_if_absent(RowId::Log(next_id), &payload).await.unwrap())
            });
        })
    });
}

fn bench_fallback_drain_100(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let payload = Record::User(PresenceRecord::error("a", "both")).encode().unwrap();

    c.bench_function("fallback_drain_100", |b| {
        b.iter(|| {
            let buffer = FallbackBuffer::new();
            let store = MemoryStore::new();
            for _ in 0..100 {
                buffer.add(RowId::out_of_band(), payload.clone());
            }
            rt.block_on(async { black_box(buffer.drain_and_persist(&store).await) });
        })
    });
}

criterion_group!(
    benches,
    bench_client_edit_decode,
    bench_record_encode,
    bench_session_advance_1000,
    bench_snapshot_build_10000,
    bench_memory_log_append,
    bench_rocks_log_append,
    bench_rocks_store_insert,
    bench_fallback_drain_100,
);
criterion_main!(benches);
