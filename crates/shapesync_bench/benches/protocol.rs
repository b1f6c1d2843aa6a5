//! Wire decoding benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use shapesync_bench::{bench_schema, change_log, offset};
use shapesync_protocol::{decode_messages, encode_messages, PgValueParser, RawValueParser};

/// Benchmark decoding a response body with and without a schema.
fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_messages");
    let schema = bench_schema();

    for count in [10, 100, 1000].iter() {
        let body = encode_messages(&change_log(*count, *count as u64));
        group.throughput(Throughput::Bytes(body.len() as u64));

        group.bench_with_input(BenchmarkId::new("typed", count), &body, |b, body| {
            b.iter(|| decode_messages(black_box(body), Some(&schema), &PgValueParser).unwrap());
        });
        group.bench_with_input(BenchmarkId::new("raw", count), &body, |b, body| {
            b.iter(|| decode_messages(black_box(body), None, &RawValueParser).unwrap());
        });
    }
    group.finish();
}

/// Benchmark offset comparison.
fn bench_offset_compare(c: &mut Criterion) {
    let a = offset(1_234_567);
    let b = offset(1_234_568);

    c.bench_function("offset_compare", |bench| {
        bench.iter(|| black_box(&a).compare(black_box(&b)));
    });
}

criterion_group!(benches, bench_decode, bench_offset_compare);
criterion_main!(benches);
