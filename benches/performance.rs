//! Performance benchmarks for the record store.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use recordcast::{
    BroadcastConfig, Change, Entry, InlineExecutor, MemoryRepository, QueueConfig, RecordId,
    RecordStore, SerialQueue, SnapshotBroadcaster,
};
use std::sync::Arc;

type Row = Entry<u64>;

fn create_store() -> RecordStore<Row> {
    RecordStore::open(Arc::new(MemoryRepository::new()), QueueConfig::default()).unwrap()
}

/// Round-trip cost of one FIFO ticket on a pooled queue.
fn bench_fifo_ticket(c: &mut Criterion) {
    let queue = SerialQueue::with_config(QueueConfig::default()).unwrap();

    c.bench_function("fifo_ticket_roundtrip", |b| {
        b.iter(|| black_box(queue.run_fifo(|| Ok(1u64)).wait().unwrap()));
    });
}

/// Batch insert throughput with varying batch sizes
fn bench_insert_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_batch");

    for size in [1, 10, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("items", size), &size, |b, &size| {
            let store = create_store();
            b.iter(|| {
                let items: Vec<Row> = (0..size).map(Entry::new).collect();
                black_box(store.insert_batch(items).wait().unwrap());
            });
        });
    }

    group.finish();
}

/// Cost of folding a change and rebuilding the ordered snapshot
fn bench_snapshot_fold(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot_fold");

    for records in [100u64, 1000, 10000] {
        group.bench_with_input(BenchmarkId::new("records", records), &records, |b, &records| {
            let broadcaster: SnapshotBroadcaster<Row> = SnapshotBroadcaster::new(
                SerialQueue::new(Arc::new(InlineExecutor)),
                BroadcastConfig::default(),
            );
            let seed: Vec<Row> = (1..=records)
                .map(|i| Entry::new(i).with_id(RecordId(i)))
                .collect();
            broadcaster
                .apply(Change::AllChanged(Arc::from(seed)))
                .wait()
                .unwrap();

            let mut next = records;
            b.iter(|| {
                next += 1;
                let row = Entry::new(next).with_id(RecordId(next));
                broadcaster.apply(Change::Inserted(row)).wait().unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_fifo_ticket, bench_insert_batch, bench_snapshot_fold);
criterion_main!(benches);
