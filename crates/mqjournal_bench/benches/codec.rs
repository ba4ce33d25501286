//! Record codec benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mqjournal_bench::{random_data, sample_records};
use mqjournal_core::{compute_checksum, JournalRecord, RecordId};

/// Benchmark encoding each record kind.
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");

    for record in sample_records(256) {
        group.bench_function(record.kind().name(), |b| {
            b.iter(|| {
                let bytes = black_box(&record).encode().unwrap();
                black_box(bytes);
            });
        });
    }

    group.finish();
}

/// Benchmark decoding each record kind.
fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");

    for record in sample_records(256) {
        let bytes = record.encode().unwrap();
        group.bench_function(record.kind().name(), |b| {
            b.iter(|| {
                let decoded = JournalRecord::decode(black_box(&bytes)).unwrap();
                black_box(decoded);
            });
        });
    }

    group.finish();
}

/// Benchmark ADD records across payload sizes.
fn bench_payload_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("add_payload");

    for size in [0, 64, 1024, 16 * 1024].iter() {
        let record = JournalRecord::Add {
            id: RecordId::new(1),
            user_type: 1,
            payload: random_data(*size),
        };
        let bytes = record.encode().unwrap();
        group.throughput(Throughput::Bytes(bytes.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode", size), &record, |b, record| {
            b.iter(|| black_box(record.encode().unwrap()));
        });
        group.bench_with_input(BenchmarkId::new("decode", size), &bytes, |b, bytes| {
            b.iter(|| black_box(JournalRecord::decode(bytes).unwrap()));
        });
    }

    group.finish();
}

/// Benchmark the frame checksum on its own.
fn bench_checksum(c: &mut Criterion) {
    let mut group = c.benchmark_group("checksum");

    for size in [64, 1024, 16 * 1024].iter() {
        let data = random_data(*size);
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| black_box(compute_checksum(black_box(data))));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_encode,
    bench_decode,
    bench_payload_sizes,
    bench_checksum
);
criterion_main!(benches);
