//! Shared primitive IDs and queue/scheduling enums.

use serde::{Deserialize, Serialize};

/// Unique operation identifier.
pub type OperationId = String;
/// Milliseconds since the Unix epoch.
pub type TimestampMs = u64;
/// Handle returned when registering a queue listener.
pub type ListenerId = u64;

/// Queue priority tier.
///
/// Variants are declared in dispatch order, so the derived `Ord` sorts
/// `High` before `Normal` before `Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Dispatched first.
    High,
    /// Default tier.
    #[default]
    Normal,
    /// Dispatched last; the only tier eligible for capacity eviction.
    Low,
}

/// Queue state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    /// Waiting for the next batch.
    Pending,
    /// Handed to the transport, outcome unknown.
    Syncing,
    /// Delivered; removed after the grace period.
    Synced,
    /// Exhausted its retries.
    Failed,
}

/// Priority as seen by the batch scheduler.
///
/// `Critical` exists only at scheduling time and always sends immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulePriority {
    /// Bypasses every network check.
    Critical,
    /// Sends in fair windows, shortest deferral in poor ones.
    High,
    /// Default scheduling tier.
    Normal,
    /// Longest deferral.
    Low,
}

impl From<Priority> for SchedulePriority {
    fn from(value: Priority) -> Self {
        match value {
            Priority::High => Self::High,
            Priority::Normal => Self::Normal,
            Priority::Low => Self::Low,
        }
    }
}
