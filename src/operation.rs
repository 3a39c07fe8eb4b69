//! Queued operation record and its persisted envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{OperationId, OperationStatus, Priority, TimestampMs};

/// Ordered key/value payload of an operation.
pub type OperationData = serde_json::Map<String, Value>;

/// Version number for serialized [`QueueSnapshot`] payloads.
pub const QUEUE_FORMAT_VERSION: u16 = 1;

/// A local mutation waiting to be synced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Operation {
    /// Unique id assigned at enqueue.
    pub id: OperationId,
    /// Application-level operation type, e.g. `"note.update"`.
    #[serde(rename = "type")]
    pub op_type: String,
    /// Session that produced the operation.
    pub session_id: String,
    /// Mutation payload.
    pub data: OperationData,
    /// Dispatch tier.
    pub priority: Priority,
    /// Queue state.
    pub status: OperationStatus,
    /// Enqueue time.
    pub created_at: TimestampMs,
    /// Failed attempts so far.
    pub retry_count: u32,
    /// Attempts allowed before the operation becomes terminal.
    pub max_retries: u32,
    /// Message of the most recent failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Time of the most recent `Syncing` transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<TimestampMs>,
    /// Time the operation was confirmed synced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<TimestampMs>,
}

impl Operation {
    /// Serialized size of `data` in bytes.
    pub fn data_size(&self) -> usize {
        data_size(&self.data)
    }

    /// True once the operation can no longer be retried.
    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Field-level checks applied to every imported record.
    pub fn validate(&self) -> Result<(), RecordError> {
        if self.id.trim().is_empty() {
            return Err(RecordError::EmptyId);
        }
        if self.op_type.trim().is_empty() {
            return Err(RecordError::EmptyType(self.id.clone()));
        }
        if self.retry_count > self.max_retries {
            return Err(RecordError::RetryOverflow {
                id: self.id.clone(),
                retry_count: self.retry_count,
                max_retries: self.max_retries,
            });
        }
        let inconsistent = match self.status {
            OperationStatus::Pending | OperationStatus::Syncing => self.max_retries > 0 && self.is_exhausted(),
            OperationStatus::Failed => !self.is_exhausted(),
            OperationStatus::Synced => false,
        };
        if inconsistent {
            return Err(RecordError::StatusRetryMismatch {
                id: self.id.clone(),
                status: self.status,
                retry_count: self.retry_count,
                max_retries: self.max_retries,
            });
        }
        if self.status == OperationStatus::Synced && self.synced_at.is_none() {
            return Err(RecordError::MissingSyncedAt(self.id.clone()));
        }
        Ok(())
    }
}

/// Why a persisted record was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    /// Shape or type mismatch, unknown field included.
    #[error("malformed operation record: {0}")]
    Malformed(String),
    /// Empty id.
    #[error("operation id is empty")]
    EmptyId,
    /// Empty type.
    #[error("operation {0} has an empty type")]
    EmptyType(OperationId),
    /// More retries recorded than allowed.
    #[error("operation {id} has retry_count {retry_count} above max_retries {max_retries}")]
    RetryOverflow {
        /// Offending id.
        id: OperationId,
        /// Stored retry count.
        retry_count: u32,
        /// Stored retry limit.
        max_retries: u32,
    },
    /// Retry count contradicts the status: retries exhausted but still
    /// live, or failed with retries left.
    #[error("operation {id} is {status:?} with retry_count {retry_count} of max_retries {max_retries}")]
    StatusRetryMismatch {
        /// Offending id.
        id: OperationId,
        /// Stored status.
        status: OperationStatus,
        /// Stored retry count.
        retry_count: u32,
        /// Stored retry limit.
        max_retries: u32,
    },
    /// Synced without a confirmation time.
    #[error("operation {0} is synced but has no syncedAt")]
    MissingSyncedAt(OperationId),
    /// Id already present.
    #[error("duplicate operation id {0}")]
    Duplicate(OperationId),
    /// No room left in the queue.
    #[error("operation {0} does not fit in the queue")]
    OverCapacity(OperationId),
}

/// Versioned wrapper for the exported operation set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    /// Payload format version.
    pub format_version: u16,
    /// Operations in insertion order.
    pub operations: Vec<Operation>,
}

impl QueueSnapshot {
    /// Wraps `operations` using [`QUEUE_FORMAT_VERSION`].
    pub fn new(operations: Vec<Operation>) -> Self {
        Self {
            format_version: QUEUE_FORMAT_VERSION,
            operations,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSnapshot {
    format_version: u16,
    operations: Vec<Value>,
}

/// Splits a persisted payload into raw records without interpreting them.
///
/// Accepts the versioned envelope or a bare array of records.
pub(crate) fn decode_records(payload: &str) -> Result<Vec<Value>, String> {
    if let Ok(raw) = serde_json::from_str::<RawSnapshot>(payload) {
        if raw.format_version != QUEUE_FORMAT_VERSION {
            return Err(format!(
                "unsupported queue format version: {}",
                raw.format_version
            ));
        }
        return Ok(raw.operations);
    }

    serde_json::from_str::<Vec<Value>>(payload)
        .map_err(|e| format!("queue payload decode failed: {e}"))
}

/// Parses and validates one raw record.
pub(crate) fn decode_record(raw: Value) -> Result<Operation, RecordError> {
    let op: Operation =
        serde_json::from_value(raw).map_err(|e| RecordError::Malformed(e.to_string()))?;
    op.validate()?;
    Ok(op)
}

/// Serialized size of an operation payload in bytes.
pub fn data_size(data: &OperationData) -> usize {
    serde_json::to_vec(data).map(|v| v.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> Value {
        json!({
            "id": "op-1",
            "type": "note.update",
            "sessionId": "s1",
            "data": {"title": "hello"},
            "priority": "high",
            "status": "pending",
            "createdAt": 10,
            "retryCount": 0,
            "maxRetries": 3
        })
    }

    #[test]
    fn decodes_valid_record() {
        let op = decode_record(record()).unwrap();
        assert_eq!(op.op_type, "note.update");
        assert_eq!(op.priority, Priority::High);
        assert_eq!(op.data["title"], "hello");
    }

    #[test]
    fn rejects_unknown_fields() {
        let mut raw = record();
        raw["surprise"] = json!(1);
        assert!(matches!(decode_record(raw), Err(RecordError::Malformed(_))));
    }

    #[test]
    fn rejects_retry_overflow() {
        let mut raw = record();
        raw["retryCount"] = json!(4);
        assert!(matches!(
            decode_record(raw),
            Err(RecordError::RetryOverflow { retry_count: 4, .. })
        ));
    }

    #[test]
    fn rejects_wrong_value_types() {
        let mut raw = record();
        raw["priority"] = json!("urgent");
        assert!(decode_record(raw).is_err());

        let mut raw = record();
        raw["data"] = json!([1, 2]);
        assert!(decode_record(raw).is_err());
    }

    #[test]
    fn decode_records_accepts_envelope_and_bare_array() {
        let env = json!({"formatVersion": 1, "operations": [record()]}).to_string();
        assert_eq!(decode_records(&env).unwrap().len(), 1);

        let bare = json!([record(), record()]).to_string();
        assert_eq!(decode_records(&bare).unwrap().len(), 2);

        let future = json!({"formatVersion": 9, "operations": []}).to_string();
        assert!(decode_records(&future).is_err());

        assert!(decode_records("{\"nope\":true}").is_err());
    }
}
