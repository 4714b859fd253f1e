//! Performance benchmarks for the store and live streams.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use livequery::{
    Demand, Predicate, Query, Record, RecordInput, ResultStream, SectionedResult, Sink,
    SortDescriptor, Store, StoreConfig, ValueMapper,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

fn create_store(dir: &TempDir) -> Arc<Store> {
    Arc::new(
        Store::create(StoreConfig {
            path: dir.path().join("store"),
            sync_interval: 1000,
            ..Default::default()
        })
        .unwrap(),
    )
}

fn populate(store: &Store, count: usize) {
    for i in 0..count {
        store
            .insert(
                RecordInput::json(
                    "task",
                    &json!({"list": format!("list-{}", i % 10), "title": format!("task-{}", i)}),
                )
                .unwrap(),
            )
            .unwrap();
    }
}

fn board_query() -> Query {
    Query::new(Predicate::record_type("task"))
        .sorted_by(SortDescriptor::ascending("list"))
        .sorted_by(SortDescriptor::ascending("title"))
        .sectioned_by("list")
}

/// Benchmark record inserts
fn bench_insert(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let store = create_store(&dir);

    c.bench_function("insert", |b| {
        b.iter(|| {
            store
                .insert(RecordInput::json("task", &json!({"title": "x"})).unwrap())
                .unwrap()
        })
    });
}

/// Benchmark sectioned fetches with varying table sizes
fn bench_fetch_sections(c: &mut Criterion) {
    let mut group = c.benchmark_group("fetch_sections");

    for count in [100, 1000, 5000] {
        group.bench_with_input(BenchmarkId::new("records", count), &count, |b, &count| {
            let dir = TempDir::new().unwrap();
            let store = create_store(&dir);
            populate(&store, count);
            let query = board_query();

            b.iter(|| black_box(store.fetch_sections(&query).unwrap()));
        });
    }

    group.finish();
}

/// Benchmark write-to-emission latency with one unlimited subscription
fn bench_stream_emission(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream_emission");

    for count in [100, 1000] {
        group.bench_with_input(BenchmarkId::new("records", count), &count, |b, &count| {
            let dir = TempDir::new().unwrap();
            let store = create_store(&dir);
            populate(&store, count);

            let emitted = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&emitted);
            let stream = ResultStream::sectioned(
                Arc::clone(&store),
                board_query(),
                ValueMapper::<Record, Record>::identity(),
            );
            let subscription = stream.subscribe(Sink::new(move |sections: SectionedResult<Record>| {
                counter.fetch_add(black_box(sections).len(), Ordering::Relaxed);
                Demand::none()
            }));
            subscription.request(Demand::unlimited());

            b.iter(|| {
                store
                    .insert(
                        RecordInput::json("task", &json!({"list": "list-0", "title": "new"}))
                            .unwrap(),
                    )
                    .unwrap()
            });

            subscription.cancel();
        });
    }

    group.finish();
}

/// Benchmark cold restarts: one fresh fetch per requested value
fn bench_cold_requests(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let store = create_store(&dir);
    populate(&store, 1000);

    let stream = ResultStream::flat(
        Arc::clone(&store),
        board_query().cached_as("board"),
        ValueMapper::<Record, Record>::identity(),
    );
    let subscription = stream.subscribe_channel();

    c.bench_function("cold_request", |b| {
        b.iter(|| {
            subscription.request(Demand::max(1));
            black_box(subscription.recv().unwrap())
        })
    });
}

criterion_group!(
    benches,
    bench_insert,
    bench_fetch_sections,
    bench_stream_emission,
    bench_cold_requests,
);
criterion_main!(benches);
