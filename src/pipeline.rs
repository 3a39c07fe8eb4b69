//! One owner for every engine, wired into a pull-based send loop.
//!
//! The caller drives the loop: ask [`SyncPipeline::next_step`] what to do,
//! ship a [`PipelineStep::Ready`] batch over its transport, then report the
//! outcome with [`SyncPipeline::complete`] or [`SyncPipeline::fail`].

use std::collections::VecDeque;
use std::sync::Arc;

use rand::{SeedableRng, rngs::StdRng};
use tracing::{debug, warn};

use crate::{
    clock::{Clock, IdSource, SharedIds, SystemClock, UuidIds},
    config::{ConfigError, PipelineConfig},
    core::queue::{OfflineOperationQueue, QueueError},
    engine::{
        adaptive::AdaptiveCompressionOptimizer,
        chunk::{ChunkError, CompressedChunk},
        compression::{CompressedBatch, CompressionEngine},
        delta::{BatchDeltaResult, DeltaSyncOptimizer},
        prefetch::{Prediction, PrefetchedBatch, PrefetchingEngine},
        timing::{BatchTimingOptimizer, NetworkQuality, SchedulingDecision},
    },
    operation::{Operation, OperationData},
    types::{OperationId, OperationStatus, Priority, SchedulePriority},
};

const RECENT_TYPES: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error("failed to encode batch: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Everything needed to put one batch on the wire.
#[derive(Debug, Clone)]
pub struct OutboundBatch {
    pub decision: SchedulingDecision,
    pub operation_ids: Vec<OperationId>,
    pub deltas: BatchDeltaResult,
    pub compressed: CompressedBatch,
    pub chunks: Vec<CompressedChunk>,
}

#[derive(Debug, Clone)]
pub enum PipelineStep {
    /// Nothing pending.
    Idle,
    /// Work exists but the network says wait.
    Deferred(SchedulingDecision),
    /// Operations are now `Syncing`; send and report back.
    Ready(OutboundBatch),
}

pub struct SyncPipeline {
    config: PipelineConfig,
    queue: OfflineOperationQueue,
    delta: DeltaSyncOptimizer,
    compression: CompressionEngine,
    prefetch: PrefetchingEngine,
    timing: BatchTimingOptimizer,
    adaptive: AdaptiveCompressionOptimizer,
    recent_types: VecDeque<String>,
}

impl SyncPipeline {
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        Self::with_sources(
            config,
            Arc::new(SystemClock),
            Box::new(UuidIds),
            StdRng::from_entropy(),
        )
    }

    /// Shares `clock` and `ids` across every engine; `rng` drives
    /// scheduling jitter. Operation, delta and batch ids all come from `ids`.
    pub fn with_sources(
        config: PipelineConfig,
        clock: Arc<dyn Clock>,
        ids: Box<dyn IdSource>,
        rng: StdRng,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let ids = SharedIds::new(ids);
        Ok(Self {
            queue: OfflineOperationQueue::with_sources(
                config.queue.clone(),
                Arc::clone(&clock),
                Box::new(ids.clone()),
            ),
            delta: DeltaSyncOptimizer::with_ids(config.delta.clone(), Box::new(ids.clone())),
            compression: CompressionEngine::with_sources(
                config.compression.clone(),
                Some(Box::new(crate::engine::codec::FlateBackend)),
                Arc::clone(&clock),
                Box::new(ids),
            ),
            prefetch: PrefetchingEngine::with_clock(config.prefetch.clone(), Arc::clone(&clock)),
            timing: BatchTimingOptimizer::with_sources(config.timing.clone(), clock, rng),
            adaptive: AdaptiveCompressionOptimizer::new(config.adaptive.clone()),
            recent_types: VecDeque::with_capacity(RECENT_TYPES),
            config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn queue(&self) -> &OfflineOperationQueue {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut OfflineOperationQueue {
        &mut self.queue
    }

    pub fn delta(&self) -> &DeltaSyncOptimizer {
        &self.delta
    }

    pub fn compression(&self) -> &CompressionEngine {
        &self.compression
    }

    pub fn compression_mut(&mut self) -> &mut CompressionEngine {
        &mut self.compression
    }

    pub fn prefetch(&self) -> &PrefetchingEngine {
        &self.prefetch
    }

    pub fn prefetch_mut(&mut self) -> &mut PrefetchingEngine {
        &mut self.prefetch
    }

    pub fn timing(&self) -> &BatchTimingOptimizer {
        &self.timing
    }

    pub fn adaptive(&self) -> &AdaptiveCompressionOptimizer {
        &self.adaptive
    }

    pub fn adaptive_mut(&mut self) -> &mut AdaptiveCompressionOptimizer {
        &mut self.adaptive
    }

    /// Queues the operation and feeds its type to the prefetcher.
    pub fn enqueue(
        &mut self,
        op_type: impl Into<String>,
        data: OperationData,
        session_id: impl Into<String>,
        priority: Priority,
    ) -> Result<Operation, PipelineError> {
        let op = self.queue.enqueue(op_type, data, session_id, priority, None)?;
        self.prefetch.record_operation(op.op_type.clone(), op.data_size());
        if self.recent_types.len() == RECENT_TYPES {
            self.recent_types.pop_front();
        }
        self.recent_types.push_back(op.op_type.clone());
        Ok(op)
    }

    /// Likely next operation types given the most recent enqueues.
    pub fn predict_next(&self) -> Vec<Prediction> {
        let recent: Vec<&str> = self.recent_types.iter().map(String::as_str).collect();
        self.prefetch.predict_next_operations(&recent)
    }

    /// Pre-compresses the pending operations of every type worth
    /// prefetching, as a JSON array of full operations. Returns what was
    /// staged.
    pub fn prefetch_predicted(&mut self) -> Result<Vec<PrefetchedBatch>, PipelineError> {
        let mut staged = Vec::new();
        for prediction in self.predict_next().into_iter().filter(|p| p.should_prefetch) {
            let mut ops: Vec<&Operation> = self
                .queue
                .operations()
                .into_iter()
                .filter(|op| op.status == OperationStatus::Pending && op.op_type == prediction.operation_type)
                .collect();
            if ops.is_empty() {
                continue;
            }
            ops.sort_by_key(|op| (op.priority, op.created_at));
            ops.truncate(self.config.max_batch_operations);

            let payload = serde_json::to_vec(&ops)?;
            let compressed = self.compression.compress(&payload);
            let entry = self.prefetch.add_prefetched_batch(prediction.operation_type.clone(), &compressed);
            debug!(
                op_type = %prediction.operation_type,
                probability = prediction.probability,
                operations = ops.len(),
                bytes = entry.compressed_size,
                "prefetched batch staged"
            );
            staged.push(entry);
        }
        Ok(staged)
    }

    /// Staged batch for `op_type`, if one is still fresh. Lookups feed the
    /// prefetcher's hit and miss counts.
    pub fn take_prefetched(&mut self, op_type: &str) -> Option<PrefetchedBatch> {
        self.prefetch.get_prefetched_batch(op_type)
    }

    pub fn record_user_activity(&mut self) {
        self.timing.record_user_activity();
    }

    /// Feeds both the scheduler and the adaptive level picker.
    pub fn record_network_measurement(&mut self, latency_ms: f64, bandwidth_mbps: f64) -> NetworkQuality {
        let quality = self.timing.record_network_measurement(latency_ms, bandwidth_mbps);
        self.adaptive.update_network_conditions(
            bandwidth_mbps * 1_000.0,
            Some(latency_ms),
            Some(bandwidth_mbps > 0.0),
        );
        quality
    }

    /// Applies the adaptive recommendation to the compression engine.
    pub fn tune_compression(&mut self) -> bool {
        let changed = self.adaptive.apply_recommendation();
        self.compression.set_level(self.adaptive.current_level());
        changed
    }

    /// Pulls the next batch, asks the scheduler, and if cleared encodes,
    /// compresses and chunks it.
    pub fn next_step(&mut self, is_user_triggered: bool) -> Result<PipelineStep, PipelineError> {
        let candidates = self.queue.get_next_batch(self.config.max_batch_operations);
        if candidates.is_empty() {
            return Ok(PipelineStep::Idle);
        }

        let batch = fit_to_budget(candidates, self.timing.get_optimal_batch_size());
        let bytes: usize = batch.iter().map(Operation::data_size).sum();
        let priority = batch
            .iter()
            .map(|op| op.priority)
            .min()
            .map(SchedulePriority::from)
            .unwrap_or(SchedulePriority::Normal);

        let decision = self.timing.get_scheduling_decision(bytes, priority, is_user_triggered);
        self.timing.apply_scheduling(&decision);
        if !decision.should_send_now {
            return Ok(PipelineStep::Deferred(decision));
        }

        let deltas = self.delta.compute_batch_deltas(&batch);
        let payload = serde_json::to_vec(&deltas.deltas)?;

        let before_ms = self.compression.get_stats().compress_time_ms;
        let compressed = self.compression.compress(&payload);
        let elapsed_ms = self.compression.get_stats().compress_time_ms - before_ms;
        self.adaptive.record_compression_performance(
            self.compression.level(),
            elapsed_ms,
            compressed.compression_ratio,
        );

        let chunks = self.compression.split_into_chunks(&compressed, self.config.chunk_size)?;
        let operation_ids: Vec<OperationId> = batch.into_iter().map(|op| op.id).collect();
        self.queue.mark_syncing(&operation_ids);

        debug!(
            operations = operation_ids.len(),
            deltas = deltas.delta_count,
            compressed = compressed.compressed_size,
            chunks = chunks.len(),
            "batch ready"
        );
        Ok(PipelineStep::Ready(OutboundBatch {
            decision,
            operation_ids,
            deltas,
            compressed,
            chunks,
        }))
    }

    /// Marks delivered operations synced. Returns how many transitioned.
    pub fn complete<S: AsRef<str>>(&mut self, ids: &[S]) -> usize {
        let mut done = 0;
        for id in ids {
            match self.queue.mark_synced(id.as_ref()) {
                Ok(()) => done += 1,
                Err(err) => warn!(id = id.as_ref(), %err, "cannot mark operation synced"),
            }
        }
        done
    }

    /// Reports a failed delivery. Delta history for these operations is
    /// dropped so the retry carries full payloads. Returns how many became
    /// terminally failed.
    pub fn fail<S: AsRef<str>>(&mut self, ids: &[S], error: &str) -> usize {
        let mut terminal = 0;
        for id in ids {
            let id = id.as_ref();
            self.delta.clear_history(Some(id));
            match self.queue.mark_failed(id, error) {
                Ok(OperationStatus::Failed) => terminal += 1,
                Ok(_) => {}
                Err(err) => warn!(id, %err, "cannot mark operation failed"),
            }
        }
        terminal
    }
}

/// Keeps the queue order and stops once `budget` bytes are exceeded. The
/// first operation always goes, however large.
fn fit_to_budget(ops: Vec<Operation>, budget: usize) -> Vec<Operation> {
    let mut used = 0usize;
    let mut out = Vec::with_capacity(ops.len());
    for op in ops {
        let size = op.data_size();
        if !out.is_empty() && used + size > budget {
            break;
        }
        used += size;
        out.push(op);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, Value};

    fn op(id: &str, bytes: usize) -> Operation {
        let mut data = Map::new();
        data.insert("blob".into(), Value::String("x".repeat(bytes)));
        Operation {
            id: id.to_string(),
            op_type: "t".into(),
            session_id: "s".into(),
            data,
            priority: Priority::Normal,
            status: OperationStatus::Pending,
            created_at: 0,
            retry_count: 0,
            max_retries: 3,
            last_error: None,
            last_attempt_at: None,
            synced_at: None,
        }
    }

    #[test]
    fn budget_keeps_first_operation_even_if_oversized() {
        let out = fit_to_budget(vec![op("a", 100), op("b", 10)], 50);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, "a");
    }

    #[test]
    fn budget_stops_at_first_overflow() {
        let small = op("a", 10).data_size();
        let out = fit_to_budget(vec![op("a", 10), op("b", 10), op("c", 10)], small * 2);
        assert_eq!(out.iter().map(|o| o.id.as_str()).collect::<Vec<_>>(), ["a", "b"]);
    }
}
