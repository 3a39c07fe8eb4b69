//! Field-level delta encoding against the last known state of an operation.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    clock::{IdSource, UuidIds},
    config::DeltaConfig,
    operation::{data_size, Operation, OperationData},
    types::OperationId,
};

use super::compression::compression_ratio;

/// Suffix appended to a field name in `change_mask` when it was removed.
pub const DELETED_SUFFIX: &str = ":deleted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaKind {
    Full,
    Delta,
}

/// Encoded form of one operation, either complete or relative to history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaOperation {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: DeltaKind,
    pub operation_id: OperationId,
    /// Changed fields; `Null` for removed ones.
    pub changes: OperationData,
    /// Changed field names, removed ones as `"<field>:deleted"`.
    pub change_mask: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_data: Option<OperationData>,
}

impl DeltaOperation {
    /// Serialized size of what actually goes on the wire.
    pub fn payload_size(&self) -> usize {
        match self.kind {
            DeltaKind::Full => self.full_data.as_ref().map(data_size).unwrap_or(0),
            DeltaKind::Delta => data_size(&self.changes),
        }
    }

    /// Field names this delta removes.
    pub fn deleted_fields(&self) -> impl Iterator<Item = &str> {
        self.change_mask
            .iter()
            .filter_map(|m| m.strip_suffix(DELETED_SUFFIX))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchDeltaResult {
    pub deltas: Vec<DeltaOperation>,
    pub full_count: usize,
    pub delta_count: usize,
    pub original_bytes: usize,
    pub encoded_bytes: usize,
    /// `1 - encoded/original`; negative when deltas cost more than they save.
    pub reduction_ratio: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeltaStats {
    pub computed: u64,
    pub full_count: u64,
    pub delta_count: u64,
    /// Deltas demoted to full because they exceeded the size threshold.
    pub demoted_count: u64,
    pub original_bytes: u64,
    pub encoded_bytes: u64,
}

#[derive(Debug, Clone)]
struct HistoryEntry {
    data: OperationData,
    touched: u64,
}

pub struct DeltaSyncOptimizer {
    config: DeltaConfig,
    history: HashMap<OperationId, HistoryEntry>,
    touch_seq: u64,
    stats: DeltaStats,
    ids: Box<dyn IdSource>,
}

impl DeltaSyncOptimizer {
    pub fn new(config: DeltaConfig) -> Self {
        Self::with_ids(config, Box::new(UuidIds))
    }

    /// `ids` names every emitted [`DeltaOperation`].
    pub fn with_ids(config: DeltaConfig, ids: Box<dyn IdSource>) -> Self {
        Self {
            config,
            history: HashMap::new(),
            touch_seq: 0,
            stats: DeltaStats::default(),
            ids,
        }
    }

    pub fn compute_delta(&mut self, op: &Operation) -> DeltaOperation {
        let original = op.data_size();
        let id = self.ids.next_id();
        let delta = match self.history.get(&op.id) {
            None => full_delta(id, op),
            Some(prev) => {
                let (changes, change_mask) = diff_fields(&prev.data, &op.data);
                let encoded = data_size(&changes);
                if encoded > self.config.max_delta_bytes {
                    debug!(
                        id = %op.id,
                        encoded,
                        threshold = self.config.max_delta_bytes,
                        "delta over threshold, sending full payload"
                    );
                    self.stats.demoted_count += 1;
                    full_delta(id, op)
                } else {
                    DeltaOperation {
                        id,
                        kind: DeltaKind::Delta,
                        operation_id: op.id.clone(),
                        changes,
                        change_mask,
                        full_data: None,
                    }
                }
            }
        };

        self.stats.computed += 1;
        match delta.kind {
            DeltaKind::Full => self.stats.full_count += 1,
            DeltaKind::Delta => self.stats.delta_count += 1,
        }
        self.stats.original_bytes += original as u64;
        self.stats.encoded_bytes += delta.payload_size() as u64;

        self.remember(op);
        delta
    }

    pub fn compute_batch_deltas(&mut self, ops: &[Operation]) -> BatchDeltaResult {
        let mut result = BatchDeltaResult {
            deltas: Vec::with_capacity(ops.len()),
            full_count: 0,
            delta_count: 0,
            original_bytes: 0,
            encoded_bytes: 0,
            reduction_ratio: 0.0,
        };
        for op in ops {
            let delta = self.compute_delta(op);
            result.original_bytes += op.data_size();
            result.encoded_bytes += delta.payload_size();
            match delta.kind {
                DeltaKind::Full => result.full_count += 1,
                DeltaKind::Delta => result.delta_count += 1,
            }
            result.deltas.push(delta);
        }
        result.reduction_ratio = compression_ratio(result.original_bytes, result.encoded_bytes);
        result
    }

    /// Rebuilds the full payload a delta describes.
    ///
    /// Without history for a `Delta` this is best effort: only the changed
    /// fields come back.
    pub fn decompress_delta(&self, delta: &DeltaOperation) -> OperationData {
        if delta.kind == DeltaKind::Full {
            return delta.full_data.clone().unwrap_or_default();
        }

        let deleted: Vec<&str> = delta.deleted_fields().collect();
        let Some(prev) = self.history.get(&delta.operation_id) else {
            warn!(operation_id = %delta.operation_id, "no history for delta, returning partial changes");
            return delta
                .changes
                .iter()
                .filter(|(k, _)| !deleted.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
        };

        let mut data = prev.data.clone();
        for (key, value) in &delta.changes {
            if deleted.contains(&key.as_str()) {
                data.remove(key);
            } else {
                data.insert(key.clone(), value.clone());
            }
        }
        data
    }

    /// Records `op.data` as the confirmed state for `op.id`.
    pub fn update_history(&mut self, op: &Operation) {
        self.remember(op);
    }

    /// Drops one entry, or everything when `id` is `None`.
    pub fn clear_history(&mut self, id: Option<&str>) {
        match id {
            Some(id) => {
                self.history.remove(id);
            }
            None => self.history.clear(),
        }
    }

    pub fn has_history(&self, id: &str) -> bool {
        self.history.contains_key(id)
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Serialized bytes retained across all history entries.
    pub fn get_memory_estimate(&self) -> usize {
        self.history.values().map(|e| data_size(&e.data)).sum()
    }

    pub fn stats(&self) -> DeltaStats {
        self.stats.clone()
    }

    fn remember(&mut self, op: &Operation) {
        if self.config.max_history_entries == 0 {
            return;
        }
        self.touch_seq += 1;
        self.history.insert(
            op.id.clone(),
            HistoryEntry {
                data: op.data.clone(),
                touched: self.touch_seq,
            },
        );

        while self.history.len() > self.config.max_history_entries {
            let Some(stale) = self
                .history
                .iter()
                .min_by_key(|(_, e)| e.touched)
                .map(|(id, _)| id.clone())
            else {
                break;
            };
            self.history.remove(&stale);
        }
    }
}

fn full_delta(id: String, op: &Operation) -> DeltaOperation {
    DeltaOperation {
        id,
        kind: DeltaKind::Full,
        operation_id: op.id.clone(),
        changes: OperationData::new(),
        change_mask: Vec::new(),
        full_data: Some(op.data.clone()),
    }
}

/// Top-level diff with deep equality on values.
fn diff_fields(prev: &OperationData, next: &OperationData) -> (OperationData, Vec<String>) {
    let mut changes = OperationData::new();
    let mut mask = Vec::new();

    for (key, value) in next {
        if prev.get(key) != Some(value) {
            changes.insert(key.clone(), value.clone());
            mask.push(key.clone());
        }
    }
    for key in prev.keys() {
        if !next.contains_key(key) {
            changes.insert(key.clone(), Value::Null);
            mask.push(format!("{key}{DELETED_SUFFIX}"));
        }
    }
    (changes, mask)
}
