use std::sync::Arc;

use rand::{rngs::StdRng, SeedableRng};
use serde_json::{json, Value};

use offsync::{
    clock::{ManualClock, SequentialIds},
    config::PipelineConfig,
    engine::{
        chunk::reassemble_chunks,
        compression::CompressedBatch,
        delta::{DeltaKind, DeltaOperation, DeltaSyncOptimizer},
        timing::NetworkQuality,
    },
    operation::Operation,
    pipeline::{OutboundBatch, PipelineError, PipelineStep, SyncPipeline},
    types::{OperationStatus, Priority},
};

fn pipeline(config: PipelineConfig) -> (SyncPipeline, ManualClock) {
    let clock = ManualClock::new(50_000);
    let p = SyncPipeline::with_sources(
        config,
        Arc::new(clock.clone()),
        Box::new(SequentialIds::new("op")),
        StdRng::seed_from_u64(99),
    )
    .expect("pipeline");
    (p, clock)
}

fn data(v: Value) -> serde_json::Map<String, Value> {
    v.as_object().cloned().expect("object")
}

#[test]
fn idle_when_nothing_is_queued() {
    let (mut p, _clock) = pipeline(PipelineConfig::default());
    assert!(matches!(p.next_step(false).expect("step"), PipelineStep::Idle));
}

#[test]
fn invalid_config_is_rejected() {
    let config = PipelineConfig {
        chunk_size: 0,
        ..PipelineConfig::default()
    };
    let result = SyncPipeline::with_sources(
        config,
        Arc::new(ManualClock::new(0)),
        Box::new(SequentialIds::new("op")),
        StdRng::seed_from_u64(1),
    );
    assert!(matches!(result, Err(PipelineError::Config(_))));
}

#[test]
fn ready_batch_round_trips_through_chunks() {
    let (mut p, _clock) = pipeline(PipelineConfig {
        chunk_size: 32,
        ..PipelineConfig::default()
    });
    let a = p
        .enqueue("note.update", data(json!({"title": "a", "body": "x".repeat(300)})), "s", Priority::Normal)
        .expect("a");
    let b = p
        .enqueue("note.update", data(json!({"title": "b"})), "s", Priority::High)
        .expect("b");

    let PipelineStep::Ready(batch) = p.next_step(false).expect("step") else {
        panic!("expected ready batch");
    };
    assert_eq!(batch.operation_ids, vec![b.id.clone(), a.id.clone()]);
    assert_eq!(batch.deltas.full_count, 2);
    assert!(batch.chunks.len() > 1);
    assert_eq!(p.queue().get(&a.id).expect("a").status, OperationStatus::Syncing);

    let bytes = reassemble_chunks(&batch.chunks).expect("reassemble");
    let mut received = batch.compressed.clone();
    received.compressed = bytes;
    let json = p.compression_mut().decompress(&received).expect("decompress");
    let deltas: Vec<DeltaOperation> = serde_json::from_slice(&json).expect("decode");

    let receiver = DeltaSyncOptimizer::new(Default::default());
    assert_eq!(receiver.decompress_delta(&deltas[1]), a.data);

    assert_eq!(p.complete(&batch.operation_ids), 2);
    assert_eq!(p.queue().get_stats().synced, 2);
    assert!(matches!(p.next_step(false).expect("step"), PipelineStep::Idle));
}

#[test]
fn every_new_operation_goes_out_in_full() {
    let (mut p, _clock) = pipeline(PipelineConfig::default());
    let body = "stable body ".repeat(50);
    p.enqueue("doc", data(json!({"id": 1, "body": body.clone(), "rev": 1})), "s", Priority::Normal)
        .expect("enqueue");
    let PipelineStep::Ready(first) = p.next_step(false).expect("step") else {
        panic!("expected ready batch");
    };
    p.complete(&first.operation_ids);

    // delta history is keyed by operation id
    let op = p
        .enqueue("doc", data(json!({"id": 1, "body": body, "rev": 2})), "s", Priority::Normal)
        .expect("enqueue");
    let PipelineStep::Ready(second) = p.next_step(false).expect("step") else {
        panic!("expected ready batch");
    };
    assert_eq!(second.deltas.deltas[0].operation_id, op.id);
    assert_eq!(second.deltas.deltas[0].kind, DeltaKind::Full);
}

#[test]
fn failed_send_resends_full_payload() {
    let (mut p, _clock) = pipeline(PipelineConfig::default());
    let op = p
        .enqueue("doc", data(json!({"body": "abc"})), "s", Priority::Normal)
        .expect("enqueue");

    let PipelineStep::Ready(batch) = p.next_step(false).expect("step") else {
        panic!("expected ready batch");
    };
    assert_eq!(p.fail(&batch.operation_ids, "connection reset"), 0);
    assert!(!p.delta().has_history(&op.id));
    assert_eq!(p.queue().get(&op.id).expect("op").status, OperationStatus::Pending);

    let PipelineStep::Ready(retry) = p.next_step(false).expect("step") else {
        panic!("expected ready batch");
    };
    assert_eq!(retry.deltas.full_count, 1);
}

#[test]
fn poor_network_defers_then_user_action_sends() {
    let (mut p, _clock) = pipeline(PipelineConfig::default());
    for _ in 0..10 {
        assert_eq!(p.record_network_measurement(900.0, 0.1), NetworkQuality::Poor);
    }
    let op = p
        .enqueue("note", data(json!({"t": 1})), "s", Priority::Low)
        .expect("enqueue");

    let PipelineStep::Deferred(decision) = p.next_step(false).expect("step") else {
        panic!("expected deferral");
    };
    assert!(decision.recommended_delay_ms >= 10_000);
    assert_eq!(p.queue().get(&op.id).expect("op").status, OperationStatus::Pending);

    p.record_user_activity();
    assert!(matches!(p.next_step(true).expect("step"), PipelineStep::Ready(_)));
    assert_eq!(p.timing().stats().deferred_count, 1);
}

#[test]
fn network_samples_drive_compression_level() {
    let (mut p, _clock) = pipeline(PipelineConfig::default());
    p.adaptive_mut().update_device_resources(0.9, 256);
    for _ in 0..10 {
        p.record_network_measurement(900.0, 0.1);
    }
    assert!(p.tune_compression());
    assert_eq!(p.compression().level(), p.adaptive().current_level());
    assert!(p.compression().level() < 6);
}

#[test]
fn batches_respect_operation_cap() {
    let (mut p, _clock) = pipeline(PipelineConfig {
        max_batch_operations: 3,
        ..PipelineConfig::default()
    });
    for i in 0..5 {
        p.enqueue("t", data(json!({"i": i})), "s", Priority::Normal)
            .expect("enqueue");
    }
    let PipelineStep::Ready(batch) = p.next_step(false).expect("step") else {
        panic!("expected ready batch");
    };
    assert_eq!(batch.operation_ids.len(), 3);
    assert_eq!(p.queue().get_stats().pending, 2);
}

#[test]
fn enqueue_feeds_prefetch_predictions() {
    let (mut p, clock) = pipeline(PipelineConfig::default());
    for _ in 0..4 {
        p.enqueue("open", data(json!({})), "s", Priority::Normal).expect("open");
        p.enqueue("edit", data(json!({})), "s", Priority::Normal).expect("edit");
    }
    clock.advance(30_000);
    p.enqueue("open", data(json!({})), "s", Priority::Normal).expect("open");

    let predictions = p.predict_next();
    assert_eq!(predictions.first().expect("prediction").operation_type, "edit");
    assert_eq!(p.prefetch().get_stats().history_len, 9);
}

#[test]
fn identically_seeded_runs_produce_identical_wire_bytes() {
    let run = || {
        let (mut p, _clock) = pipeline(PipelineConfig {
            chunk_size: 16,
            ..PipelineConfig::default()
        });
        p.enqueue("note.update", data(json!({"title": "same", "body": "x".repeat(80)})), "s", Priority::Normal)
            .expect("enqueue");
        let PipelineStep::Ready(batch) = p.next_step(false).expect("step") else {
            panic!("expected ready batch");
        };
        batch
    };

    let first = run();
    let second = run();
    assert_eq!(first.deltas.deltas[0].id, second.deltas.deltas[0].id);
    assert_eq!(first.compressed.id, second.compressed.id);
    assert_eq!(first.compressed.compressed, second.compressed.compressed);
    let chunk_ids = |b: &OutboundBatch| b.chunks.iter().map(|c| c.chunk_id.clone()).collect::<Vec<_>>();
    assert_eq!(chunk_ids(&first), chunk_ids(&second));

    // operation, delta and batch ids share one sequence
    assert_eq!(first.operation_ids, vec!["op-1".to_string()]);
    assert_eq!(first.deltas.deltas[0].id, "op-2");
    assert_eq!(first.compressed.id, "op-3");
}

#[test]
fn predicted_types_are_staged_and_taken() {
    let (mut p, clock) = pipeline(PipelineConfig::default());
    for _ in 0..4 {
        p.enqueue("open", data(json!({})), "s", Priority::Normal).expect("open");
        p.enqueue("edit", data(json!({"body": "draft"})), "s", Priority::Normal).expect("edit");
    }
    clock.advance(30_000);
    p.enqueue("open", data(json!({})), "s", Priority::Normal).expect("open");

    let staged = p.prefetch_predicted().expect("prefetch");
    let edit = staged
        .iter()
        .find(|b| b.operation_type == "edit")
        .expect("edit staged");
    assert!(edit.compressed_size > 0);
    // staging leaves the queue alone
    assert_eq!(p.queue().get_stats().pending, 9);

    let taken = p.take_prefetched("edit").expect("fresh batch");
    assert_eq!(taken.id, edit.id);
    let batch = CompressedBatch {
        id: taken.id.clone(),
        compressed: taken.compressed.clone(),
        original_size: taken.original_size,
        compressed_size: taken.compressed_size,
        compression_ratio: taken.compression_ratio,
        algorithm: p.compression().algorithm(),
        timestamp: taken.created_at,
    };
    let json = p.compression_mut().decompress(&batch).expect("decompress");
    let ops: Vec<Operation> = serde_json::from_slice(&json).expect("decode");
    assert_eq!(ops.len(), 4);
    assert!(ops.iter().all(|op| op.op_type == "edit"));

    assert!(p.take_prefetched("delete").is_none());
    let stats = p.prefetch().get_stats();
    assert_eq!(stats.total_hits, 1);
    assert_eq!(stats.total_misses, 1);

    clock.advance(PipelineConfig::default().prefetch.ttl_ms);
    assert!(p.take_prefetched("edit").is_none());
}
