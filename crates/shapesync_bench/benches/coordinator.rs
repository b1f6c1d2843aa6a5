//! Write coordination benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use shapesync_bench::{batch_of, bench_schema, change_log};
use shapesync_core::{DatabaseAdapter, Priority, PriorityQueue};
use shapesync_engine::{ApplyConfig, ApplyPipeline, MessageBatch};
use shapesync_protocol::{Message, PgValueParser, ValueParser};
use tokio::runtime::Runtime;

/// Benchmark priority queue dispatch.
fn bench_queue(c: &mut Criterion) {
    let priorities = [Priority::Low, Priority::Normal, Priority::High];

    c.bench_function("priority_queue_1000", |b| {
        b.iter(|| {
            let mut queue = PriorityQueue::standard();
            for i in 0..1000usize {
                queue.enqueue(i, &priorities[i % 3]).unwrap();
            }
            while let Some(item) = queue.dequeue() {
                black_box(item);
            }
        });
    });
}

/// Parses text-encoded changes into typed values, as the stream does.
fn typed(batch: MessageBatch) -> MessageBatch {
    let schema = bench_schema();
    let messages = batch
        .messages
        .into_iter()
        .map(|mut message| {
            if let Message::Change(change) = &mut message {
                for (column, value) in change.value.iter_mut() {
                    if let Some(info) = schema.column(column) {
                        *value = PgValueParser.parse(value.take(), info).unwrap();
                    }
                }
            }
            message
        })
        .collect();
    MessageBatch { messages, ..batch }
}

/// Benchmark applying batches inside one coordinated transaction.
fn bench_apply(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let mut group = c.benchmark_group("apply_batch");

    for count in [10, 100, 1000].iter() {
        let pipeline = runtime.block_on(async {
            let db = DatabaseAdapter::open_in_memory().unwrap();
            db.run("CREATE TABLE items (id INTEGER PRIMARY KEY, title TEXT, score REAL, done INTEGER)")
                .await
                .unwrap();
            ApplyPipeline::new(db, ApplyConfig::new("items", ["id"]))
        });
        let batch = typed(batch_of(change_log(*count, *count as u64)));

        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &batch, |b, batch| {
            b.iter(|| runtime.block_on(pipeline.apply(black_box(batch))).unwrap());
        });
    }
    group.finish();
}

criterion_group!(benches, bench_queue, bench_apply);
criterion_main!(benches);
