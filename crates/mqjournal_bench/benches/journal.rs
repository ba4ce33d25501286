//! Journal append and load benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mqjournal_bench::{bench_config, memory_journal, random_data};
use mqjournal_core::{Journal, JournalType};
use tempfile::TempDir;

/// Benchmark non-sync adds against in-memory files.
fn bench_memory_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory_append");

    for size in [64, 1024, 8192].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let journal = memory_journal(bench_config()).unwrap();
            let payload = random_data(size);
            let mut id = 0u64;
            b.iter(|| {
                journal.append_add(id, 1, black_box(&payload), false).unwrap();
                id += 1;
            });
            journal.stop().unwrap();
        });
    }

    group.finish();
}

/// Benchmark add followed by delete, which keeps reclaim busy.
fn bench_add_delete_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("add_delete_churn");

    group.bench_function("256B", |b| {
        let journal = memory_journal(bench_config()).unwrap();
        let payload = random_data(256);
        let mut id = 0u64;
        b.iter(|| {
            journal.append_add(id, 1, &payload, false).unwrap();
            journal.append_delete(id, false).unwrap();
            id += 1;
        });
        journal.stop().unwrap();
    });

    group.finish();
}

/// Benchmark a committed transaction of ten records.
fn bench_transaction(c: &mut Criterion) {
    let mut group = c.benchmark_group("transaction");
    let payload = random_data(128);

    group.bench_function("commit_10", |b| {
        let journal = memory_journal(bench_config()).unwrap();
        let mut tx = 0u64;
        b.iter(|| {
            for i in 0..10 {
                journal.append_add_tx(tx, tx * 10 + i, 1, &payload).unwrap();
            }
            journal.append_commit(tx, false).unwrap();
            tx += 1;
        });
        journal.stop().unwrap();
    });

    group.finish();
}

/// Benchmark sync adds on disk for both backends.
fn bench_disk_sync_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("disk_sync_append");
    group.sample_size(20);

    for journal_type in [JournalType::Nio, JournalType::AsyncIo] {
        group.bench_function(journal_type.to_string(), |b| {
            let temp = TempDir::new().unwrap();
            let config = bench_config()
                .journal_directory(temp.path())
                .journal_type(journal_type);
            let journal = Journal::open(config).unwrap();
            journal.start().unwrap();
            journal.load().unwrap();
            let payload = random_data(512);
            let mut id = 0u64;
            b.iter(|| {
                journal.append_add(id, 1, &payload, true).unwrap();
                id += 1;
            });
            journal.stop().unwrap();
        });
    }

    group.finish();
}

/// Benchmark replaying a journal of 10,000 live records.
fn bench_load(c: &mut Criterion) {
    let mut group = c.benchmark_group("load");
    group.sample_size(10);

    let temp = TempDir::new().unwrap();
    let config = bench_config()
        .journal_directory(temp.path())
        .journal_type(JournalType::Nio);
    {
        let journal = Journal::open(config.clone()).unwrap();
        journal.start().unwrap();
        journal.load().unwrap();
        let payload = random_data(256);
        for id in 0..10_000u64 {
            journal.append_add(id, 1, &payload, false).unwrap();
        }
        journal.stop().unwrap();
    }

    group.bench_function("10k_records", |b| {
        b.iter(|| {
            let journal = Journal::open(config.clone()).unwrap();
            journal.start().unwrap();
            let loaded = journal.load_with_mode(mqjournal_core::LoadMode::ReadOnly).unwrap();
            black_box(loaded.committed_records.len());
            journal.stop().unwrap();
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_memory_append,
    bench_add_delete_churn,
    bench_transaction,
    bench_disk_sync_append,
    bench_load
);
criterion_main!(benches);
