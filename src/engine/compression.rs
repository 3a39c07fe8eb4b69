//! Byte-level compression with a guaranteed pass-through fallback.
//!
//! # Example
//!
//! ```
//! use offsync::config::CompressionConfig;
//! use offsync::engine::compression::{Algorithm, CompressionEngine};
//!
//! let mut engine = CompressionEngine::new(CompressionConfig::default());
//! let batch = engine.compress_str(&"sync ".repeat(100));
//! assert_eq!(batch.algorithm, Algorithm::Gzip);
//! assert!(batch.compression_ratio > 0.5);
//!
//! let restored = engine.decompress(&batch).unwrap();
//! assert_eq!(restored, "sync ".repeat(100).into_bytes());
//! ```

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    clock::{Clock, IdSource, SystemClock, UuidIds},
    config::CompressionConfig,
    types::TimestampMs,
};

use super::{
    chunk::{self, ChunkError, CompressedChunk},
    codec::{CodecError, CompressionBackend, FlateBackend},
};

pub const MIN_LEVEL: u32 = 1;
pub const MAX_LEVEL: u32 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    Gzip,
    Deflate,
    None,
}

#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    /// The batch claims a codec this engine cannot run.
    #[error("no backend available for {0:?}")]
    BackendUnavailable(Algorithm),
    #[error("decompression failed: {0}")]
    DecompressFailed(#[from] CodecError),
    #[error("decompressed {actual} bytes, batch declares {expected}")]
    SizeMismatch { expected: usize, actual: usize },
}

/// One compressed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressedBatch {
    pub id: String,
    pub compressed: Vec<u8>,
    pub original_size: usize,
    pub compressed_size: usize,
    /// `1 - compressed/original`, 0 for an empty input.
    pub compression_ratio: f64,
    pub algorithm: Algorithm,
    pub timestamp: TimestampMs,
}

/// `1 - compressed/original`, defined as 0 when `original` is 0.
pub fn compression_ratio(original: usize, compressed: usize) -> f64 {
    if original == 0 {
        0.0
    } else {
        1.0 - compressed as f64 / original as f64
    }
}

/// Running totals since construction or the last reset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompressionStats {
    pub compress_count: u64,
    pub decompress_count: u64,
    /// Compressions that fell back to `Algorithm::None`.
    pub fallback_count: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub compress_time_ms: f64,
    pub decompress_time_ms: f64,
}

impl CompressionStats {
    /// Aggregate ratio over everything compressed so far.
    pub fn overall_ratio(&self) -> f64 {
        compression_ratio(self.bytes_in as usize, self.bytes_out as usize)
    }

    pub fn average_compress_ms(&self) -> f64 {
        if self.compress_count == 0 {
            0.0
        } else {
            self.compress_time_ms / self.compress_count as f64
        }
    }
}

pub struct CompressionEngine {
    algorithm: Algorithm,
    level: u32,
    backend: Option<Box<dyn CompressionBackend>>,
    clock: Arc<dyn Clock>,
    ids: Box<dyn IdSource>,
    stats: CompressionStats,
}

impl CompressionEngine {
    /// Engine backed by [`FlateBackend`] and the system clock.
    pub fn new(config: CompressionConfig) -> Self {
        Self::with_backend(config, Some(Box::new(FlateBackend)), Arc::new(SystemClock))
    }

    /// `backend = None` models a platform without any native codec.
    pub fn with_backend(
        config: CompressionConfig,
        backend: Option<Box<dyn CompressionBackend>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::with_sources(config, backend, clock, Box::new(UuidIds))
    }

    /// Like [`with_backend`](Self::with_backend), with batch ids drawn from `ids`.
    pub fn with_sources(
        config: CompressionConfig,
        backend: Option<Box<dyn CompressionBackend>>,
        clock: Arc<dyn Clock>,
        ids: Box<dyn IdSource>,
    ) -> Self {
        Self {
            algorithm: config.algorithm,
            level: config.level.clamp(MIN_LEVEL, MAX_LEVEL),
            backend,
            clock,
            ids,
            stats: CompressionStats::default(),
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn set_algorithm(&mut self, algorithm: Algorithm) {
        self.algorithm = algorithm;
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    /// Clamped to 1..=9.
    pub fn set_level(&mut self, level: u32) {
        let level = level.clamp(MIN_LEVEL, MAX_LEVEL);
        if level != self.level {
            debug!(from = self.level, to = level, "compression level changed");
        }
        self.level = level;
    }

    pub fn compress_str(&mut self, text: &str) -> CompressedBatch {
        self.compress(text.as_bytes())
    }

    /// Never fails: any backend problem degrades to `Algorithm::None`.
    pub fn compress(&mut self, input: &[u8]) -> CompressedBatch {
        let started = Instant::now();
        let (algorithm, compressed) = match self.try_native(input) {
            Some(out) => (self.algorithm, out),
            None => (Algorithm::None, input.to_vec()),
        };

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.stats.compress_count += 1;
        self.stats.bytes_in += input.len() as u64;
        self.stats.bytes_out += compressed.len() as u64;
        self.stats.compress_time_ms += elapsed_ms;

        let batch = CompressedBatch {
            id: self.ids.next_id(),
            original_size: input.len(),
            compressed_size: compressed.len(),
            compression_ratio: compression_ratio(input.len(), compressed.len()),
            compressed,
            algorithm,
            timestamp: self.clock.now_ms(),
        };
        debug!(
            id = %batch.id,
            ?algorithm,
            original = batch.original_size,
            compressed = batch.compressed_size,
            "payload compressed"
        );
        batch
    }

    fn try_native(&mut self, input: &[u8]) -> Option<Vec<u8>> {
        if self.algorithm == Algorithm::None {
            return None;
        }
        let result = match self.backend.as_ref() {
            Some(backend) if backend.supports(self.algorithm) => {
                backend.compress(self.algorithm, self.level, input)
            }
            _ => Err(CodecError::Unsupported(self.algorithm)),
        };
        match result {
            Ok(out) => Some(out),
            Err(err) => {
                warn!(algorithm = ?self.algorithm, %err, "native compression unavailable, sending uncompressed");
                self.stats.fallback_count += 1;
                None
            }
        }
    }

    /// `Algorithm::None` is a copy; anything else needs a working backend.
    pub fn decompress(&mut self, batch: &CompressedBatch) -> Result<Vec<u8>, CompressionError> {
        let started = Instant::now();
        let out = match batch.algorithm {
            Algorithm::None => batch.compressed.clone(),
            algorithm => {
                let backend = self
                    .backend
                    .as_ref()
                    .filter(|b| b.supports(algorithm))
                    .ok_or(CompressionError::BackendUnavailable(algorithm))?;
                backend.decompress(algorithm, &batch.compressed)?
            }
        };
        if out.len() != batch.original_size {
            return Err(CompressionError::SizeMismatch {
                expected: batch.original_size,
                actual: out.len(),
            });
        }

        self.stats.decompress_count += 1;
        self.stats.decompress_time_ms += started.elapsed().as_secs_f64() * 1000.0;
        Ok(out)
    }

    pub fn split_into_chunks(
        &self,
        batch: &CompressedBatch,
        chunk_size: usize,
    ) -> Result<Vec<CompressedChunk>, ChunkError> {
        chunk::split_into_chunks(batch, chunk_size)
    }

    pub fn reassemble_chunks(&self, chunks: &[CompressedChunk]) -> Result<Vec<u8>, ChunkError> {
        chunk::reassemble_chunks(chunks)
    }

    pub fn get_stats(&self) -> CompressionStats {
        self.stats.clone()
    }

    pub fn reset_stats(&mut self) {
        self.stats = CompressionStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::codec::NoneBackend;

    fn engine(backend: Option<Box<dyn CompressionBackend>>) -> CompressionEngine {
        CompressionEngine::with_backend(
            CompressionConfig::default(),
            backend,
            Arc::new(ManualClock::new(42)),
        )
    }

    #[test]
    fn ratio_is_zero_for_empty_input() {
        assert_eq!(compression_ratio(0, 0), 0.0);
        assert_eq!(compression_ratio(100, 25), 0.75);
    }

    #[test]
    fn missing_backend_falls_back_to_none() {
        let mut engine = engine(None);
        let batch = engine.compress(b"hello world");
        assert_eq!(batch.algorithm, Algorithm::None);
        assert_eq!(batch.compressed, b"hello world");
        assert_eq!(batch.compression_ratio, 0.0);
        assert_eq!(batch.timestamp, 42);
        assert_eq!(engine.get_stats().fallback_count, 1);
        assert_eq!(engine.decompress(&batch).unwrap(), b"hello world");
    }

    #[test]
    fn unsupporting_backend_falls_back_to_none() {
        let mut engine = engine(Some(Box::new(NoneBackend)));
        let batch = engine.compress(b"abc");
        assert_eq!(batch.algorithm, Algorithm::None);
    }

    #[test]
    fn decompress_claimed_gzip_without_backend_is_hard_error() {
        let mut with = engine(Some(Box::new(FlateBackend)));
        let batch = with.compress(&b"payload ".repeat(50));
        assert_eq!(batch.algorithm, Algorithm::Gzip);

        let mut without = engine(None);
        assert!(matches!(
            without.decompress(&batch),
            Err(CompressionError::BackendUnavailable(Algorithm::Gzip))
        ));
    }

    #[test]
    fn corrupt_payload_fails_decompression() {
        let mut engine = engine(Some(Box::new(FlateBackend)));
        let mut batch = engine.compress(&b"payload ".repeat(50));
        batch.compressed.truncate(batch.compressed.len() / 2);
        assert!(engine.decompress(&batch).is_err());
    }

    #[test]
    fn set_level_clamps() {
        let mut engine = engine(None);
        engine.set_level(0);
        assert_eq!(engine.level(), 1);
        engine.set_level(42);
        assert_eq!(engine.level(), 9);
    }

    #[test]
    fn stats_accumulate_and_reset() {
        let mut engine = engine(Some(Box::new(FlateBackend)));
        let text = "abcabcabc".repeat(100);
        engine.compress_str(&text);
        engine.compress_str(&text);
        let stats = engine.get_stats();
        assert_eq!(stats.compress_count, 2);
        assert_eq!(stats.bytes_in, 1800);
        assert!(stats.overall_ratio() > 0.5);
        engine.reset_stats();
        assert_eq!(engine.get_stats(), CompressionStats::default());
    }
}
