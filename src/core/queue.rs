use std::sync::Arc;
use std::time::Duration;

use hashbrown::{HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::{
    clock::{Clock, IdSource, SystemClock, UuidIds},
    config::QueueConfig,
    operation::{decode_record, decode_records, Operation, OperationData, QueueSnapshot, RecordError},
    persist::{PersistError, PersistenceAdapter},
    runtime::events::{QueueEvent, QueueListener},
    types::{ListenerId, OperationId, OperationStatus, Priority, TimestampMs},
};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue is full ({capacity} operations) and holds no evictable low-priority operation")]
    QueueFull { capacity: usize },
    #[error("operation {0} not found")]
    MissingOperation(OperationId),
    #[error("operation {id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: OperationId,
        from: OperationStatus,
        to: OperationStatus,
    },
    #[error("queue payload rejected: {0}")]
    Decode(String),
    #[error("queue serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("persistence failed: {0}")]
    Persist(#[from] PersistError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub syncing: usize,
    pub synced: usize,
    pub failed: usize,
    /// Age of the oldest pending operation, `None` when nothing is pending.
    pub oldest_pending_age_ms: Option<u64>,
    pub average_retry_count: f64,
}

/// Outcome of [`OfflineOperationQueue::import`].
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ImportReport {
    pub imported: usize,
    /// Record index in the payload and the reason it was refused.
    pub rejected: Vec<(usize, RecordError)>,
}

/// Priority-ordered holding area for operations that have not synced yet.
///
/// Single owner; every mutation takes `&mut self` and emits its events
/// before returning.
pub struct OfflineOperationQueue {
    config: QueueConfig,
    records: HashMap<OperationId, Operation>,
    order: Vec<OperationId>,
    listeners: Vec<(ListenerId, Box<dyn QueueListener>)>,
    next_listener_id: ListenerId,
    clock: Arc<dyn Clock>,
    ids: Box<dyn IdSource>,
}

impl OfflineOperationQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self::with_sources(config, Arc::new(SystemClock), Box::new(UuidIds))
    }

    pub fn with_sources(config: QueueConfig, clock: Arc<dyn Clock>, ids: Box<dyn IdSource>) -> Self {
        Self {
            config,
            records: HashMap::new(),
            order: Vec::new(),
            listeners: Vec::new(),
            next_listener_id: 1,
            clock,
            ids,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn subscribe(&mut self, listener: impl QueueListener + 'static) -> ListenerId {
        let id = self.next_listener_id;
        self.next_listener_id += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        self.listeners.len() != before
    }

    /// Enqueues with [`Priority::Normal`] and the configured retry limit.
    pub fn enqueue_default(
        &mut self,
        op_type: impl Into<String>,
        data: OperationData,
        session_id: impl Into<String>,
    ) -> Result<Operation, QueueError> {
        self.enqueue(op_type, data, session_id, Priority::Normal, None)
    }

    pub fn enqueue(
        &mut self,
        op_type: impl Into<String>,
        data: OperationData,
        session_id: impl Into<String>,
        priority: Priority,
        max_retries: Option<u32>,
    ) -> Result<Operation, QueueError> {
        let now = self.clock.now_ms();
        self.sweep_synced_at(now);
        self.make_room()?;

        let op = Operation {
            id: self.ids.next_id(),
            op_type: op_type.into(),
            session_id: session_id.into(),
            data,
            priority,
            status: OperationStatus::Pending,
            created_at: now,
            retry_count: 0,
            max_retries: max_retries.unwrap_or(self.config.default_max_retries),
            last_error: None,
            last_attempt_at: None,
            synced_at: None,
        };

        debug!(id = %op.id, op_type = %op.op_type, ?priority, "operation enqueued");
        self.insert_entry(op.clone());
        self.emit(QueueEvent::OperationAdded {
            id: op.id.clone(),
            op_type: op.op_type.clone(),
        });
        Ok(op)
    }

    /// Up to `n` pending operations: high before normal before low, oldest
    /// first within a tier, insertion order on equal timestamps.
    pub fn get_next_batch(&self, n: usize) -> Vec<Operation> {
        let mut pending: Vec<&Operation> = self
            .order
            .iter()
            .filter_map(|id| self.records.get(id))
            .filter(|op| op.status == OperationStatus::Pending)
            .collect();
        // Stable sort keeps insertion order for equal keys.
        pending.sort_by_key(|op| (op.priority, op.created_at));
        pending.into_iter().take(n).cloned().collect()
    }

    /// Moves pending operations to `Syncing`; other ids are skipped.
    pub fn mark_syncing<I, S>(&mut self, ids: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let now = self.clock.now_ms();
        let mut moved = 0;
        for id in ids {
            let id = id.as_ref();
            match self.records.get_mut(id) {
                Some(op) if op.status == OperationStatus::Pending => {
                    op.status = OperationStatus::Syncing;
                    op.last_attempt_at = Some(now);
                    moved += 1;
                }
                Some(op) => {
                    debug!(id, status = ?op.status, "skipping mark_syncing on non-pending operation");
                }
                None => debug!(id, "skipping mark_syncing on unknown operation"),
            }
        }
        moved
    }

    pub fn mark_synced(&mut self, id: &str) -> Result<(), QueueError> {
        let now = self.clock.now_ms();
        let op = self
            .records
            .get_mut(id)
            .ok_or_else(|| QueueError::MissingOperation(id.to_string()))?;
        if !matches!(op.status, OperationStatus::Pending | OperationStatus::Syncing) {
            return Err(QueueError::InvalidTransition {
                id: id.to_string(),
                from: op.status,
                to: OperationStatus::Synced,
            });
        }
        op.status = OperationStatus::Synced;
        op.synced_at = Some(now);
        op.last_error = None;

        debug!(id, "operation synced");
        self.emit(QueueEvent::OperationSynced { id: id.to_string() });
        if !self.has_outstanding_work() {
            self.emit(QueueEvent::QueueEmpty);
        }
        Ok(())
    }

    /// Records a failed attempt. Returns the resulting status: `Pending` while
    /// retries remain, `Failed` once they are exhausted.
    pub fn mark_failed(&mut self, id: &str, error: impl Into<String>) -> Result<OperationStatus, QueueError> {
        let error = error.into();
        let op = self
            .records
            .get_mut(id)
            .ok_or_else(|| QueueError::MissingOperation(id.to_string()))?;
        if op.status != OperationStatus::Syncing {
            return Err(QueueError::InvalidTransition {
                id: id.to_string(),
                from: op.status,
                to: OperationStatus::Failed,
            });
        }

        if !op.is_exhausted() {
            op.retry_count += 1;
        }
        op.last_error = Some(error.clone());
        if !op.is_exhausted() {
            op.status = OperationStatus::Pending;
            debug!(id, retry_count = op.retry_count, max_retries = op.max_retries, %error, "operation will retry");
            return Ok(OperationStatus::Pending);
        }

        op.status = OperationStatus::Failed;
        warn!(id, retry_count = op.retry_count, %error, "operation failed permanently");
        self.emit(QueueEvent::OperationFailed {
            id: id.to_string(),
            error,
        });
        Ok(OperationStatus::Failed)
    }

    /// Resets every failed operation to pending with a zero retry count.
    pub fn retry_failed(&mut self) -> usize {
        let mut count = 0;
        for op in self.records.values_mut() {
            if op.status == OperationStatus::Failed {
                op.status = OperationStatus::Pending;
                op.retry_count = 0;
                count += 1;
            }
        }
        if count > 0 {
            info!(count, "failed operations requeued");
        }
        count
    }

    /// Advisory wait before re-sending `id`, doubling per recorded failure.
    pub fn next_retry_delay(&self, id: &str) -> Option<Duration> {
        let op = self.records.get(id)?;
        if op.retry_count == 0 {
            return Some(Duration::ZERO);
        }
        let factor = 1u64.checked_shl(op.retry_count - 1).unwrap_or(u64::MAX);
        let ms = self
            .config
            .base_backoff_ms
            .saturating_mul(factor)
            .min(self.config.max_backoff_ms);
        Some(Duration::from_millis(ms))
    }

    pub fn get(&self, id: &str) -> Option<&Operation> {
        self.records.get(id)
    }

    /// Operations in insertion order.
    pub fn operations(&self) -> Vec<&Operation> {
        self.order.iter().filter_map(|id| self.records.get(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn remove(&mut self, id: &str) -> Option<Operation> {
        self.remove_entry(id)
    }

    pub fn clear_failed(&mut self) -> usize {
        let failed: Vec<OperationId> = self
            .order
            .iter()
            .filter(|id| {
                self.records
                    .get(*id)
                    .is_some_and(|op| op.status == OperationStatus::Failed)
            })
            .cloned()
            .collect();
        for id in &failed {
            self.remove_entry(id);
        }
        failed.len()
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.order.clear();
    }

    /// Drops synced operations whose grace period has elapsed.
    pub fn sweep_synced(&mut self) -> usize {
        let now = self.clock.now_ms();
        self.sweep_synced_at(now)
    }

    pub fn get_stats(&self) -> QueueStats {
        let now = self.clock.now_ms();
        let mut stats = QueueStats {
            total: self.records.len(),
            pending: 0,
            syncing: 0,
            synced: 0,
            failed: 0,
            oldest_pending_age_ms: None,
            average_retry_count: 0.0,
        };
        let mut oldest: Option<TimestampMs> = None;
        let mut retries = 0u64;

        for op in self.records.values() {
            retries += u64::from(op.retry_count);
            match op.status {
                OperationStatus::Pending => {
                    stats.pending += 1;
                    oldest = Some(oldest.map_or(op.created_at, |o| o.min(op.created_at)));
                }
                OperationStatus::Syncing => stats.syncing += 1,
                OperationStatus::Synced => stats.synced += 1,
                OperationStatus::Failed => stats.failed += 1,
            }
        }

        stats.oldest_pending_age_ms = oldest.map(|t| now.saturating_sub(t));
        if stats.total > 0 {
            stats.average_retry_count = retries as f64 / stats.total as f64;
        }
        stats
    }

    pub fn export(&self) -> Result<String, QueueError> {
        let operations = self
            .order
            .iter()
            .filter_map(|id| self.records.get(id).cloned())
            .collect();
        Ok(serde_json::to_string(&QueueSnapshot::new(operations))?)
    }

    /// Merges a payload produced by [`export`](Self::export).
    ///
    /// Records are validated one by one; bad records are reported, never
    /// coerced. Operations persisted mid-flight come back as pending.
    pub fn import(&mut self, payload: &str) -> Result<ImportReport, QueueError> {
        let raw_records = decode_records(payload).map_err(QueueError::Decode)?;
        let mut report = ImportReport::default();
        let mut seen: HashSet<OperationId> = HashSet::new();

        for (idx, raw) in raw_records.into_iter().enumerate() {
            let mut op = match decode_record(raw) {
                Ok(op) => op,
                Err(err) => {
                    warn!(index = idx, %err, "rejecting persisted operation");
                    report.rejected.push((idx, err));
                    continue;
                }
            };
            if self.records.contains_key(&op.id) || !seen.insert(op.id.clone()) {
                report.rejected.push((idx, RecordError::Duplicate(op.id)));
                continue;
            }
            if self.records.len() >= self.config.max_queue_size {
                report.rejected.push((idx, RecordError::OverCapacity(op.id)));
                continue;
            }
            if op.status == OperationStatus::Syncing {
                op.status = OperationStatus::Pending;
            }
            self.insert_entry(op);
            report.imported += 1;
        }

        info!(imported = report.imported, rejected = report.rejected.len(), "queue imported");
        Ok(report)
    }

    /// Writes the exported queue under `key`. In-memory state is untouched
    /// whether or not the write succeeds.
    pub fn save_to(&self, adapter: &mut dyn PersistenceAdapter, key: &str) -> Result<(), QueueError> {
        let payload = self.export()?;
        adapter.set(key, &payload)?;
        Ok(())
    }

    /// Imports whatever is stored under `key`; `None` when nothing is stored.
    pub fn load_from(&mut self, adapter: &dyn PersistenceAdapter, key: &str) -> Result<Option<ImportReport>, QueueError> {
        match adapter.get(key)? {
            Some(payload) => self.import(&payload).map(Some),
            None => Ok(None),
        }
    }

    fn make_room(&mut self) -> Result<(), QueueError> {
        if self.records.len() < self.config.max_queue_size {
            return Ok(());
        }
        let Some(victim) = self.eviction_candidate() else {
            warn!(capacity = self.config.max_queue_size, "queue full, rejecting enqueue");
            return Err(QueueError::QueueFull {
                capacity: self.config.max_queue_size,
            });
        };
        self.remove_entry(&victim);
        debug!(id = %victim, "evicted oldest low-priority operation");
        self.emit(QueueEvent::OperationEvicted { id: victim });
        Ok(())
    }

    fn eviction_candidate(&self) -> Option<OperationId> {
        let mut best: Option<&Operation> = None;
        for op in self.order.iter().filter_map(|id| self.records.get(id)) {
            if op.status != OperationStatus::Pending || op.priority != Priority::Low {
                continue;
            }
            if best.is_none_or(|b| op.created_at < b.created_at) {
                best = Some(op);
            }
        }
        best.map(|op| op.id.clone())
    }

    fn sweep_synced_at(&mut self, now: TimestampMs) -> usize {
        let grace = self.config.synced_grace_ms;
        let expired: Vec<OperationId> = self
            .records
            .values()
            .filter(|op| {
                op.status == OperationStatus::Synced
                    && op.synced_at.is_some_and(|t| now.saturating_sub(t) >= grace)
            })
            .map(|op| op.id.clone())
            .collect();
        for id in &expired {
            self.remove_entry(id);
        }
        expired.len()
    }

    fn has_outstanding_work(&self) -> bool {
        self.records
            .values()
            .any(|op| matches!(op.status, OperationStatus::Pending | OperationStatus::Syncing))
    }

    fn insert_entry(&mut self, op: Operation) {
        self.order.push(op.id.clone());
        self.records.insert(op.id.clone(), op);
    }

    fn remove_entry(&mut self, id: &str) -> Option<Operation> {
        let op = self.records.remove(id)?;
        if let Some(pos) = self.order.iter().position(|x| x == id) {
            self.order.remove(pos);
        }
        Some(op)
    }

    fn emit(&mut self, event: QueueEvent) {
        for (_, listener) in &mut self.listeners {
            listener.on_event(&event);
        }
    }
}
