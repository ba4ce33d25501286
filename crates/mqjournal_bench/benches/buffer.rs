//! Timed buffer benchmarks.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mqjournal_core::{Completer, JournalMetrics, TimedBuffer, TimedBufferObserver};
use std::sync::Arc;
use std::time::Duration;

/// Observer that accepts every flush without doing I/O.
struct Discard;

impl TimedBufferObserver for Discard {
    fn flush_buffer(&self, data: Bytes, _sync: bool, completers: Vec<Completer>) {
        black_box(data);
        for completer in completers {
            completer.complete(Ok(()));
        }
    }
}

fn started_buffer(capacity: usize) -> TimedBuffer {
    let buffer = TimedBuffer::new(
        capacity,
        Duration::from_micros(100),
        true,
        false,
        Arc::new(JournalMetrics::new()),
    );
    buffer.start().unwrap();
    buffer.set_observer(Arc::new(Discard));
    buffer
}

/// Benchmark appends that never wait for their flush.
fn bench_add_bytes(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer_add");

    for size in [64, 512, 4096].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let buffer = started_buffer(256 * 1024);
            let chunk = vec![7u8; size];
            b.iter(|| {
                buffer
                    .add_bytes(black_box(&chunk), false, Completer::detached(None))
                    .unwrap();
            });
            buffer.stop();
        });
    }

    group.finish();
}

/// Benchmark a sync append, which forces the open batch out.
fn bench_sync_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer_sync");
    group.sample_size(20);

    group.bench_function("256B", |b| {
        let buffer = started_buffer(64 * 1024);
        let chunk = vec![1u8; 256];
        b.iter(|| {
            let (completer, completion) = Completer::channel();
            buffer.add_bytes(&chunk, true, completer).unwrap();
            completion.wait().unwrap();
        });
        buffer.stop();
    });

    group.finish();
}

criterion_group!(benches, bench_add_bytes, bench_sync_round_trip);
criterion_main!(benches);
