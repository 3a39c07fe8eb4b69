use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::{json, Map, Value};

use offsync::{
    config::{CompressionConfig, DeltaConfig, QueueConfig},
    core::queue::OfflineOperationQueue,
    engine::{
        chunk::{reassemble_chunks, split_into_chunks},
        compression::CompressionEngine,
        delta::DeltaSyncOptimizer,
    },
    operation::Operation,
    types::Priority,
};

fn payload(i: u64) -> Map<String, Value> {
    json!({
        "id": i,
        "title": format!("note {i}"),
        "body": "lorem ipsum dolor sit amet ".repeat(8),
        "tags": ["inbox", "draft"],
    })
    .as_object()
    .cloned()
    .unwrap_or_default()
}

fn filled_queue(n: u64) -> OfflineOperationQueue {
    let mut queue = OfflineOperationQueue::new(QueueConfig {
        max_queue_size: n as usize + 1,
        ..QueueConfig::default()
    });
    for i in 0..n {
        let priority = match i % 3 {
            0 => Priority::High,
            1 => Priority::Normal,
            _ => Priority::Low,
        };
        let _ = queue
            .enqueue("note.update", payload(i), "bench", priority, None)
            .expect("enqueue");
    }
    queue
}

fn bench_enqueue(c: &mut Criterion) {
    c.bench_function("queue_enqueue_5k", |b| {
        b.iter(|| filled_queue(5_000));
    });
}

fn bench_next_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_next_batch");
    let queue = filled_queue(10_000);

    for n in [10usize, 100usize, 1000usize] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| {
                let _ = queue.get_next_batch(n);
            });
        });
    }

    group.finish();
}

fn bench_batch_deltas(c: &mut Criterion) {
    let queue = filled_queue(1_000);
    let ops: Vec<Operation> = queue.get_next_batch(1_000);
    let edited: Vec<Operation> = ops
        .iter()
        .cloned()
        .map(|mut op| {
            op.data.insert("title".into(), Value::from("edited"));
            op
        })
        .collect();

    c.bench_function("delta_batch_1k", |b| {
        b.iter(|| {
            let mut delta = DeltaSyncOptimizer::new(DeltaConfig::default());
            let _ = delta.compute_batch_deltas(&ops);
            let _ = delta.compute_batch_deltas(&edited);
        });
    });
}

fn bench_compression_levels(c: &mut Criterion) {
    let mut group = c.benchmark_group("gzip_level");
    let queue = filled_queue(500);
    let bytes = serde_json::to_vec(&queue.get_next_batch(500)).expect("encode");

    for level in [1u32, 6, 9] {
        group.bench_with_input(BenchmarkId::from_parameter(level), &level, |b, &level| {
            let mut engine = CompressionEngine::new(CompressionConfig {
                level,
                ..CompressionConfig::default()
            });
            b.iter(|| {
                let _ = engine.compress(&bytes);
            });
        });
    }

    group.finish();
}

fn bench_chunks(c: &mut Criterion) {
    let queue = filled_queue(500);
    let bytes = serde_json::to_vec(&queue.get_next_batch(500)).expect("encode");
    let batch = CompressionEngine::new(CompressionConfig::default()).compress(&bytes);

    c.bench_function("chunk_split_reassemble_4k", |b| {
        b.iter(|| {
            let chunks = split_into_chunks(&batch, 4 * 1024).expect("split");
            let _ = reassemble_chunks(&chunks).expect("reassemble");
        });
    });
}

criterion_group!(
    benches,
    bench_enqueue,
    bench_next_batch,
    bench_batch_deltas,
    bench_compression_levels,
    bench_chunks
);
criterion_main!(benches);
