//! Storage engine benchmarks.
//!
//! These benchmarks measure end-to-end store performance for key operations:
//! point lookups, batched inserts, range scans and checkpoints. Every page
//! read or written goes through encryption, so the numbers include the
//! cipher cost.

#![allow(clippy::expect_used, missing_docs)]

use std::{hint::black_box, time::Duration};

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use sealdb_store::{Database, FileBackend, KdfParams, KeyRange, Record, StoreConfig, Value};
use tempfile::TempDir;

const PASSPHRASE: &[u8] = b"benchmark passphrase";

// =============================================================================
// Helpers
// =============================================================================

fn bench_config() -> StoreConfig {
    StoreConfig::builder().kdf(KdfParams::new(64, 1, 1)).checkpoint_threshold(4096).build()
}

fn open_store(dir: &TempDir) -> Database<FileBackend> {
    Database::open(dir.path().join("bench.sdb"), PASSPHRASE, bench_config()).expect("open store")
}

fn record(i: u64) -> Record {
    Record::new(vec![Value::Integer(i as i64), Value::Text(format!("value-{i}"))])
}

/// Populate the store with `count` sequential keys in batches.
fn populate(db: &Database<FileBackend>, count: u64, batch_size: u64) {
    for batch_start in (0..count).step_by(batch_size as usize) {
        let batch_end = (batch_start + batch_size).min(count);
        let mut txn = db.begin().expect("write txn");
        for i in batch_start..batch_end {
            txn.put(&i, &record(i)).expect("put");
        }
        txn.commit().expect("commit");
    }
}

// =============================================================================
// Single-Key Lookups
// =============================================================================

/// Benchmark point lookups at various dataset sizes.
///
/// Measures tree traversal plus page decryption as the tree grows deeper.
fn bench_point_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("store/point_lookup");
    group.throughput(Throughput::Elements(1));

    for count in [1_000u64, 10_000, 100_000] {
        let temp_dir = TempDir::new().expect("create temp dir");
        let db = open_store(&temp_dir);
        populate(&db, count, 1000);

        group.bench_with_input(BenchmarkId::new("sequential", format!("{}k", count / 1000)), &count, |b, &count| {
            let mut counter = 0u64;
            b.iter(|| {
                counter = (counter + 1) % count;
                let txn = db.read().expect("read txn");
                black_box(txn.get(&counter).expect("get"))
            });
        });
    }

    group.finish();
}

/// Benchmark lookups that miss.
fn bench_missing_key_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("store/missing_key");
    group.throughput(Throughput::Elements(1));

    let temp_dir = TempDir::new().expect("create temp dir");
    let db = open_store(&temp_dir);
    populate(&db, 10_000, 1000);

    group.bench_function("10k_entries", |b| {
        let mut counter = 10_000u64;
        b.iter(|| {
            counter += 1;
            black_box(db.get(&counter).expect("get"))
        });
    });

    group.finish();
}

// =============================================================================
// Inserts
// =============================================================================

/// Benchmark committing batches of inserts of various sizes.
///
/// Each commit appends every dirty page to the write-ahead log and syncs.
fn bench_batch_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("store/batch_insert");

    for batch_size in [1u64, 100, 1000] {
        group.throughput(Throughput::Elements(batch_size));
        group.bench_with_input(BenchmarkId::from_parameter(batch_size), &batch_size, |b, &batch_size| {
            let temp_dir = TempDir::new().expect("create temp dir");
            let db = open_store(&temp_dir);
            let mut next = 0u64;
            b.iter(|| {
                let mut txn = db.begin().expect("write txn");
                for _ in 0..batch_size {
                    txn.put(&next, &record(next)).expect("put");
                    next += 1;
                }
                black_box(txn.commit().expect("commit"))
            });
        });
    }

    group.finish();
}

/// Benchmark values large enough to spill into overflow pages.
fn bench_large_values(c: &mut Criterion) {
    let mut group = c.benchmark_group("store/large_value");

    for size in [8 * 1024usize, 64 * 1024] {
        let blob = Record::new(vec![Value::Blob(vec![0xAB; size])]);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(format!("{}KiB", size / 1024)), &blob, |b, blob| {
            let temp_dir = TempDir::new().expect("create temp dir");
            let db = open_store(&temp_dir);
            let mut key = 0u64;
            b.iter(|| {
                key = (key + 1) % 64;
                db.put(&key, blob).expect("put");
            });
        });
    }

    group.finish();
}

// =============================================================================
// Scans
// =============================================================================

/// Benchmark full scans over stores of various sizes.
fn bench_full_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("store/full_scan");

    for count in [1_000u64, 10_000] {
        let temp_dir = TempDir::new().expect("create temp dir");
        let db = open_store(&temp_dir);
        populate(&db, count, 1000);

        group.throughput(Throughput::Elements(count));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| {
                let txn = db.read().expect("read txn");
                let scanned = txn.scan(KeyRange::all()).expect("scan").map(|e| e.expect("entry")).count();
                black_box(scanned)
            });
        });
    }

    group.finish();
}

/// Benchmark bounded range scans in the middle of a large store.
fn bench_range_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("store/range_scan");

    let temp_dir = TempDir::new().expect("create temp dir");
    let db = open_store(&temp_dir);
    populate(&db, 50_000, 1000);

    for width in [10u64, 100, 1000] {
        group.throughput(Throughput::Elements(width));
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, &width| {
            let mut start = 0u64;
            b.iter(|| {
                start = (start + 7919) % (50_000 - width);
                let end = start + width;
                let txn = db.read().expect("read txn");
                let scanned = txn.scan(KeyRange::between(&start, &end)).expect("scan").count();
                black_box(scanned)
            });
        });
    }

    group.finish();
}

// =============================================================================
// Checkpoints
// =============================================================================

/// Benchmark copying logged pages back into the main file.
fn bench_checkpoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("store/checkpoint");

    group.bench_function("1000_commits", |b| {
        b.iter_with_setup(
            || {
                let temp_dir = TempDir::new().expect("create temp dir");
                let db = open_store(&temp_dir);
                populate(&db, 1000, 1);
                (temp_dir, db)
            },
            |(_temp_dir, db)| black_box(db.checkpoint().expect("checkpoint")),
        );
    });

    group.finish();
}

// =============================================================================
// Benchmark Groups
// =============================================================================

criterion_group! {
    name = lookup_benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(5))
        .sample_size(100);
    targets = bench_point_lookup, bench_missing_key_lookup
}

criterion_group! {
    name = insert_benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(5))
        .sample_size(50);
    targets = bench_batch_insert, bench_large_values
}

criterion_group! {
    name = scan_benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(10))
        .sample_size(20);
    targets = bench_full_scan, bench_range_scan
}

criterion_group! {
    name = checkpoint_benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(30))
        .sample_size(10);
    targets = bench_checkpoint
}

criterion_main!(lookup_benches, insert_benches, scan_benches, checkpoint_benches);
