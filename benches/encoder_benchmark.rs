//! Benchmarks for task encoding and result envelopes.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use forkpool::runtime::protocol::{ChildSuccess, decode_message, encode_message};
use forkpool::task::{TaskEncoder, TempFileStore};
use forkpool::Task;
use serde_json::json;
use tempfile::tempdir;

fn task_with_payload(bytes: usize) -> Task {
    Task::new("echo", &json!({ "text": "x".repeat(bytes) })).unwrap()
}

fn bench_encode_inline(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_inline");
    let encoder = TaskEncoder::default();

    for size in [64, 4096, 65536].iter() {
        let task = task_with_payload(*size);
        group.bench_with_input(BenchmarkId::new("encode", size), size, |b, _| {
            b.iter(|| black_box(encoder.encode(black_box(&task)).unwrap()));
        });

        let token = encoder.encode(&task).unwrap();
        group.bench_with_input(BenchmarkId::new("decode", size), size, |b, _| {
            b.iter(|| black_box(encoder.decode(black_box(&token)).unwrap()));
        });
    }

    group.finish();
}

fn bench_spill_round_trip(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let encoder = TaskEncoder::with_store(TempFileStore::in_dir(dir.path()), 1024);
    let task = task_with_payload(256 * 1024);

    // Each decode consumes the spilled file, so encode and decode together.
    c.bench_function("spill_round_trip_256k", |b| {
        b.iter(|| {
            let token = encoder.encode(black_box(&task)).unwrap();
            black_box(encoder.decode(&token).unwrap())
        });
    });
}

fn bench_result_envelope(c: &mut Criterion) {
    let mut group = c.benchmark_group("result_envelope");

    for size in [16, 1024, 8192].iter() {
        let message = ChildSuccess {
            output: json!("y".repeat(*size)),
            other_output: String::new(),
        };
        let encoded = encode_message(&message).unwrap();
        group.bench_with_input(BenchmarkId::new("decode", size), size, |b, _| {
            b.iter(|| black_box(decode_message::<ChildSuccess>(black_box(&encoded)).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_encode_inline,
    bench_spill_round_trip,
    bench_result_envelope
);
criterion_main!(benches);
