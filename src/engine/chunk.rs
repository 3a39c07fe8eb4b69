//! Splitting compressed payloads into checksummed chunks and back.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use super::compression::CompressedBatch;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkError {
    #[error("chunk size must be at least 1 byte")]
    InvalidChunkSize,
    #[error("no chunks to reassemble")]
    NoChunks,
    #[error("missing chunks: expected {expected}, got {actual}")]
    MissingChunks { expected: usize, actual: usize },
    #[error("inconsistent chunk set: {0}")]
    InconsistentChunks(String),
    #[error("checksum mismatch on chunk {index}")]
    ChecksumMismatch { index: usize },
}

/// One slice of a [`CompressedBatch`] payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressedChunk {
    pub chunk_id: String,
    pub batch_id: String,
    pub bytes: Vec<u8>,
    pub index: usize,
    pub total: usize,
    /// xxh3 of `bytes`; catches transport corruption, not tampering.
    pub checksum: u64,
}

impl CompressedChunk {
    pub fn verify(&self) -> bool {
        checksum(&self.bytes) == self.checksum
    }
}

pub fn checksum(bytes: &[u8]) -> u64 {
    xxh3_64(bytes)
}

/// Slices `batch.compressed` into `chunk_size` pieces; the last may be
/// shorter. An empty payload still yields one (empty) chunk.
pub fn split_into_chunks(batch: &CompressedBatch, chunk_size: usize) -> Result<Vec<CompressedChunk>, ChunkError> {
    if chunk_size == 0 {
        return Err(ChunkError::InvalidChunkSize);
    }

    let payload = batch.compressed.as_slice();
    let total = payload.len().div_ceil(chunk_size).max(1);
    let slices: Vec<&[u8]> = if payload.is_empty() {
        vec![payload]
    } else {
        payload.chunks(chunk_size).collect()
    };

    Ok(slices
        .into_iter()
        .enumerate()
        .map(|(index, bytes)| CompressedChunk {
            chunk_id: format!("{}-{index}", batch.id),
            batch_id: batch.id.clone(),
            bytes: bytes.to_vec(),
            index,
            total,
            checksum: checksum(bytes),
        })
        .collect())
}

/// Rebuilds the payload. All-or-nothing: a short, mixed or corrupt chunk set
/// is an error, never a partial result. Duplicate indices are tolerated; a
/// corrupt copy is only fatal when no other copy of that index verifies.
pub fn reassemble_chunks(chunks: &[CompressedChunk]) -> Result<Vec<u8>, ChunkError> {
    let first = chunks.first().ok_or(ChunkError::NoChunks)?;
    let total = first.total;

    for chunk in chunks {
        if chunk.total != total {
            return Err(ChunkError::InconsistentChunks(format!(
                "chunk {} reports total {}, expected {total}",
                chunk.index, chunk.total
            )));
        }
        if chunk.batch_id != first.batch_id {
            return Err(ChunkError::InconsistentChunks(format!(
                "chunk {} belongs to batch {}, expected {}",
                chunk.index, chunk.batch_id, first.batch_id
            )));
        }
        if chunk.index >= total {
            return Err(ChunkError::InconsistentChunks(format!(
                "chunk index {} out of range for total {total}",
                chunk.index
            )));
        }
    }

    // one copy per index, preferring any copy whose checksum holds
    let mut picked: BTreeMap<usize, &CompressedChunk> = BTreeMap::new();
    for chunk in chunks {
        match picked.get(&chunk.index) {
            Some(kept) if kept.verify() => {}
            _ => {
                picked.insert(chunk.index, chunk);
            }
        }
    }

    if picked.len() != total {
        return Err(ChunkError::MissingChunks {
            expected: total,
            actual: picked.len(),
        });
    }

    let mut out = Vec::with_capacity(picked.values().map(|c| c.bytes.len()).sum());
    for chunk in picked.into_values() {
        if !chunk.verify() {
            return Err(ChunkError::ChecksumMismatch { index: chunk.index });
        }
        out.extend_from_slice(&chunk.bytes);
    }
    Ok(out)
}
