//! Injectable time and id sources.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::types::{OperationId, TimestampMs};

/// Source of wall-clock milliseconds.
pub trait Clock: Send + Sync {
    /// Current time in milliseconds since the Unix epoch.
    fn now_ms(&self) -> TimestampMs;
}

/// [`Clock`] backed by [`SystemTime`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> TimestampMs {
        now_ms()
    }
}

/// Manually advanced clock. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    /// Creates a clock frozen at `start_ms`.
    pub fn new(start_ms: TimestampMs) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    /// Moves time forward by `ms`.
    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    /// Jumps to an absolute time.
    pub fn set(&self, ms: TimestampMs) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> TimestampMs {
        self.now.load(Ordering::SeqCst)
    }
}

/// Generator of unique operation ids.
pub trait IdSource: Send {
    /// Returns a fresh id.
    fn next_id(&mut self) -> OperationId;
}

/// Random v4 UUIDs.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidIds;

impl IdSource for UuidIds {
    fn next_id(&mut self) -> OperationId {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Deterministic `"<prefix>-<n>"` ids, starting at 1.
#[derive(Debug, Clone)]
pub struct SequentialIds {
    prefix: String,
    next: u64,
}

impl SequentialIds {
    /// Creates a generator producing `prefix-1`, `prefix-2`, ...
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: 1,
        }
    }
}

impl IdSource for SequentialIds {
    fn next_id(&mut self) -> OperationId {
        let id = format!("{}-{}", self.prefix, self.next);
        self.next += 1;
        id
    }
}

/// One [`IdSource`] handed to several owners. Clones draw from the same
/// sequence.
#[derive(Clone)]
pub struct SharedIds {
    inner: Arc<Mutex<Box<dyn IdSource>>>,
}

impl SharedIds {
    pub fn new(ids: Box<dyn IdSource>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ids)),
        }
    }
}

impl IdSource for SharedIds {
    fn next_id(&mut self) -> OperationId {
        let mut ids = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        ids.next_id()
    }
}

pub(crate) fn now_ms() -> TimestampMs {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
