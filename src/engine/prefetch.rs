//! Sequence mining over recent operation types and a speculative cache of
//! pre-compressed batches for the types likely to come next.

use std::collections::VecDeque;
use std::sync::Arc;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    clock::{Clock, SystemClock},
    config::PrefetchConfig,
    types::TimestampMs,
};

use super::compression::CompressedBatch;

const MIN_PATTERN_LEN: usize = 2;
const MAX_PATTERN_LEN: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
struct RecordedOperation {
    op_type: String,
    size: usize,
    at: TimestampMs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationPattern {
    pub sequence: Vec<String>,
    pub frequency: u32,
    /// `frequency / recorded operations`.
    pub probability: f64,
    pub last_occurred: TimestampMs,
    /// Mean spacing between occurrences, 0 with a single occurrence.
    pub avg_interval_ms: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub operation_type: String,
    pub probability: f64,
    pub should_prefetch: bool,
    /// Pattern that produced this prediction.
    pub pattern: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrefetchedBatch {
    pub id: String,
    pub operation_type: String,
    pub compressed: Vec<u8>,
    pub original_size: usize,
    pub compressed_size: usize,
    pub compression_ratio: f64,
    pub created_at: TimestampMs,
    pub expires_at: TimestampMs,
    pub hit_count: u32,
    pub miss_count: u32,
}

impl PrefetchedBatch {
    pub fn is_fresh(&self, now: TimestampMs) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrefetchStats {
    pub history_len: usize,
    pub pattern_count: usize,
    pub cached_batches: usize,
    pub total_hits: u64,
    pub total_misses: u64,
    /// `hits / (hits + misses)`, 0 before any lookup.
    pub prediction_accuracy: f64,
    /// Average size of recorded operations.
    pub average_operation_size: f64,
}

pub struct PrefetchingEngine {
    config: PrefetchConfig,
    history: VecDeque<RecordedOperation>,
    patterns: HashMap<Vec<String>, OperationPattern>,
    cache: HashMap<String, VecDeque<PrefetchedBatch>>,
    last_analysis: Option<TimestampMs>,
    hits: u64,
    misses: u64,
    clock: Arc<dyn Clock>,
}

impl PrefetchingEngine {
    pub fn new(config: PrefetchConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: PrefetchConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            history: VecDeque::new(),
            patterns: HashMap::new(),
            cache: HashMap::new(),
            last_analysis: None,
            hits: 0,
            misses: 0,
            clock,
        }
    }

    /// Appends to the sliding history and re-mines patterns when the
    /// analysis interval has elapsed.
    pub fn record_operation(&mut self, op_type: impl Into<String>, size: usize) {
        let now = self.clock.now_ms();
        self.history.push_back(RecordedOperation {
            op_type: op_type.into(),
            size,
            at: now,
        });
        while self.history.len() > self.config.max_history {
            self.history.pop_front();
        }

        let due = self
            .last_analysis
            .is_none_or(|last| now.saturating_sub(last) >= self.config.analysis_interval_ms);
        if due {
            self.analyze_patterns();
        }
    }

    /// Counts every contiguous run of 2 or 3 types in the history.
    pub fn analyze_patterns(&mut self) {
        self.last_analysis = Some(self.clock.now_ms());
        self.patterns.clear();

        let total = self.history.len();
        if total < MIN_PATTERN_LEN {
            return;
        }

        let entries: Vec<&RecordedOperation> = self.history.iter().collect();
        let mut occurrences: HashMap<Vec<String>, Vec<TimestampMs>> = HashMap::new();
        for len in MIN_PATTERN_LEN..=MAX_PATTERN_LEN {
            for window in entries.windows(len) {
                let key: Vec<String> = window.iter().map(|e| e.op_type.clone()).collect();
                let at = window[len - 1].at;
                occurrences.entry(key).or_default().push(at);
            }
        }

        for (sequence, times) in occurrences {
            let frequency = times.len() as u32;
            let last_occurred = times.iter().copied().max().unwrap_or(0);
            let avg_interval_ms = if times.len() > 1 {
                let first = times.iter().copied().min().unwrap_or(0);
                (last_occurred - first) as f64 / (times.len() - 1) as f64
            } else {
                0.0
            };
            self.patterns.insert(
                sequence.clone(),
                OperationPattern {
                    sequence,
                    frequency,
                    probability: f64::from(frequency) / total as f64,
                    last_occurred,
                    avg_interval_ms,
                },
            );
        }
        debug!(patterns = self.patterns.len(), history = total, "operation patterns analyzed");
    }

    /// Predicts what follows the tail of `recent`, most likely first.
    pub fn predict_next_operations<S: AsRef<str>>(&self, recent: &[S]) -> Vec<Prediction> {
        let start = recent.len().saturating_sub(MAX_PATTERN_LEN);
        let tail: Vec<&str> = recent[start..].iter().map(|s| s.as_ref()).collect();
        if tail.is_empty() {
            return Vec::new();
        }

        let mut best: HashMap<String, Prediction> = HashMap::new();
        for pattern in self.patterns.values() {
            let (next, prefix) = match pattern.sequence.split_last() {
                Some(split) => split,
                None => continue,
            };
            if prefix.len() > tail.len() {
                continue;
            }
            let matches = tail[tail.len() - prefix.len()..]
                .iter()
                .zip(prefix)
                .all(|(a, b)| *a == b.as_str());
            if !matches {
                continue;
            }

            let candidate = Prediction {
                operation_type: next.clone(),
                probability: pattern.probability,
                should_prefetch: pattern.probability > self.config.prefetch_threshold,
                pattern: pattern.sequence.clone(),
            };
            match best.get(next) {
                Some(existing) if !better(&candidate, existing) => {}
                _ => {
                    best.insert(next.clone(), candidate);
                }
            }
        }

        let mut out: Vec<Prediction> = best.into_values().collect();
        out.sort_by(|a, b| {
            b.probability
                .total_cmp(&a.probability)
                .then_with(|| a.operation_type.cmp(&b.operation_type))
        });
        out
    }

    /// Caches `batch` for `op_type`, evicting the oldest entry of that type
    /// when its slot is full.
    pub fn add_prefetched_batch(&mut self, op_type: impl Into<String>, batch: &CompressedBatch) -> PrefetchedBatch {
        let op_type = op_type.into();
        let now = self.clock.now_ms();
        let entry = PrefetchedBatch {
            id: batch.id.clone(),
            operation_type: op_type.clone(),
            compressed: batch.compressed.clone(),
            original_size: batch.original_size,
            compressed_size: batch.compressed_size,
            compression_ratio: batch.compression_ratio,
            created_at: now,
            expires_at: now.saturating_add(self.config.ttl_ms),
            hit_count: 0,
            miss_count: 0,
        };

        let slot = self.cache.entry(op_type).or_default();
        slot.push_back(entry.clone());
        while slot.len() > self.config.max_cache_per_type.max(1) {
            if let Some(old) = slot.pop_front() {
                debug!(id = %old.id, op_type = %old.operation_type, "prefetch cache slot full, dropping oldest");
            }
        }
        entry
    }

    /// Newest fresh batch for `op_type`. Expired entries met on the way are
    /// dropped and each counts as a miss.
    pub fn get_prefetched_batch(&mut self, op_type: &str) -> Option<PrefetchedBatch> {
        let now = self.clock.now_ms();
        let mut expired = 0u64;
        let mut found = None;

        if let Some(slot) = self.cache.get_mut(op_type) {
            slot.retain_mut(|b| {
                if b.is_fresh(now) {
                    true
                } else {
                    b.miss_count += 1;
                    debug!(id = %b.id, hits = b.hit_count, "prefetched batch expired");
                    expired += 1;
                    false
                }
            });
            if let Some(batch) = slot.back_mut() {
                batch.hit_count += 1;
                found = Some(batch.clone());
            }
            if slot.is_empty() {
                self.cache.remove(op_type);
            }
        }

        self.misses += expired;
        match found {
            Some(batch) => {
                self.hits += 1;
                Some(batch)
            }
            None => {
                if expired == 0 {
                    self.misses += 1;
                }
                None
            }
        }
    }

    pub fn prediction_accuracy(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }

    /// Known patterns, most probable first.
    pub fn patterns(&self) -> Vec<OperationPattern> {
        let mut out: Vec<OperationPattern> = self.patterns.values().cloned().collect();
        out.sort_by(|a, b| {
            b.probability
                .total_cmp(&a.probability)
                .then_with(|| a.sequence.cmp(&b.sequence))
        });
        out
    }

    pub fn get_stats(&self) -> PrefetchStats {
        let history_len = self.history.len();
        let average_operation_size = if history_len == 0 {
            0.0
        } else {
            self.history.iter().map(|e| e.size as f64).sum::<f64>() / history_len as f64
        };
        PrefetchStats {
            history_len,
            pattern_count: self.patterns.len(),
            cached_batches: self.cache.values().map(VecDeque::len).sum(),
            total_hits: self.hits,
            total_misses: self.misses,
            prediction_accuracy: self.prediction_accuracy(),
            average_operation_size,
        }
    }

    /// Resets history, patterns, cache and hit statistics.
    pub fn clear(&mut self) {
        self.history.clear();
        self.patterns.clear();
        self.cache.clear();
        self.last_analysis = None;
        self.hits = 0;
        self.misses = 0;
    }
}

fn better(candidate: &Prediction, existing: &Prediction) -> bool {
    candidate.probability > existing.probability
        || (candidate.probability == existing.probability && candidate.pattern.len() > existing.pattern.len())
}
