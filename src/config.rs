//! Configuration for the sync pipeline.
//!
//! # Example
//!
//! ```
//! use offsync::config::PipelineConfig;
//!
//! // Minimal config (uses defaults)
//! let config = PipelineConfig::default();
//! assert_eq!(config.queue.max_queue_size, 1000);
//! assert_eq!(config.compression.level, 6);
//!
//! // Partial JSON, everything else defaulted
//! let config = PipelineConfig::from_json_str(r#"{
//!     "chunkSize": 4096,
//!     "queue": { "maxQueueSize": 200 }
//! }"#).unwrap();
//! assert_eq!(config.chunk_size, 4096);
//! assert_eq!(config.queue.max_queue_size, 200);
//! assert_eq!(config.queue.default_max_retries, 3);
//! ```

use serde::{Deserialize, Serialize};

use crate::engine::compression::Algorithm;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config parse failed: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration; every section can be omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub delta: DeltaConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub prefetch: PrefetchConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub adaptive: AdaptiveConfig,
    #[serde(default)]
    pub saver: SaverConfig,

    /// Chunk size for outbound batches in bytes (default: 16 KiB)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Upper bound on operations pulled per batch
    #[serde(default = "default_max_batch_operations")]
    pub max_batch_operations: usize,
}

fn default_chunk_size() -> usize { 16 * 1024 } // 16 KiB
fn default_max_batch_operations() -> usize { 50 }

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            delta: DeltaConfig::default(),
            compression: CompressionConfig::default(),
            prefetch: PrefetchConfig::default(),
            timing: TimingConfig::default(),
            adaptive: AdaptiveConfig::default(),
            saver: SaverConfig::default(),
            chunk_size: default_chunk_size(),
            max_batch_operations: default_max_batch_operations(),
        }
    }
}

impl PipelineConfig {
    /// Parses a JSON document and validates it.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunkSize must be at least 1".into()));
        }
        if self.max_batch_operations == 0 {
            return Err(ConfigError::Invalid("maxBatchOperations must be at least 1".into()));
        }
        if self.queue.max_queue_size == 0 {
            return Err(ConfigError::Invalid("queue.maxQueueSize must be at least 1".into()));
        }
        if !(1..=9).contains(&self.compression.level) {
            return Err(ConfigError::Invalid(format!(
                "compression.level must be within 1..=9, got {}",
                self.compression.level
            )));
        }
        if !(1..=9).contains(&self.adaptive.default_level) {
            return Err(ConfigError::Invalid(format!(
                "adaptive.defaultLevel must be within 1..=9, got {}",
                self.adaptive.default_level
            )));
        }
        if !(0.0..=1.0).contains(&self.prefetch.prefetch_threshold) {
            return Err(ConfigError::Invalid(
                "prefetch.prefetchThreshold must be within 0..=1".into(),
            ));
        }
        if self.timing.window_size == 0 || self.timing.max_history == 0 {
            return Err(ConfigError::Invalid(
                "timing.windowSize and timing.maxHistory must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueueConfig {
    pub max_queue_size: usize,
    pub default_max_retries: u32,
    /// How long a synced operation lingers before removal.
    pub synced_grace_ms: u64,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            default_max_retries: 3,
            synced_grace_ms: 5_000,
            base_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeltaConfig {
    /// Serialized delta size above which a full payload is sent instead.
    pub max_delta_bytes: usize,
    pub max_history_entries: usize,
}

impl Default for DeltaConfig {
    fn default() -> Self {
        Self {
            max_delta_bytes: 10 * 1024,
            max_history_entries: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CompressionConfig {
    pub algorithm: Algorithm,
    /// 1 (fastest) to 9 (smallest).
    pub level: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::Gzip,
            level: 6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PrefetchConfig {
    pub max_history: usize,
    /// Minimum spacing between two pattern analyses.
    pub analysis_interval_ms: u64,
    /// Predictions strictly above this probability are worth prefetching.
    pub prefetch_threshold: f64,
    pub max_cache_per_type: usize,
    pub ttl_ms: u64,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            max_history: 1000,
            analysis_interval_ms: 30_000,
            prefetch_threshold: 0.3,
            max_cache_per_type: 5,
            ttl_ms: 5 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TimingConfig {
    pub max_history: usize,
    /// Samples considered when computing the current window.
    pub window_size: usize,
    pub user_active_window_ms: u64,
    /// Latency standard deviation below which the window counts as stable.
    pub stable_latency_stddev_ms: f64,
    /// Congestion level above which immediate sends get jitter.
    pub congestion_jitter_threshold: f64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            max_history: 50,
            window_size: 10,
            user_active_window_ms: 30_000,
            stable_latency_stddev_ms: 50.0,
            congestion_jitter_threshold: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AdaptiveConfig {
    pub default_level: u32,
    pub max_history: usize,
    /// Samples needed before confidence peaks.
    pub confident_samples: usize,
    pub apply_confidence: f64,
    /// A level jump larger than this is applied regardless of confidence.
    pub large_change: u32,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            default_level: 6,
            max_history: 100,
            confident_samples: 10,
            apply_confidence: 0.8,
            large_change: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SaverConfig {
    /// Adapter key the queue is saved under.
    pub key: String,
    pub debounce_ms: u64,
    pub queue_bound: usize,
    /// Timer-driven attempts on a failing payload before it waits for the
    /// next request or flush. The wait doubles after each failure.
    pub max_write_attempts: u32,
}

impl Default for SaverConfig {
    fn default() -> Self {
        Self {
            key: "offsync.queue".to_string(),
            debounce_ms: 500,
            queue_bound: 64,
            max_write_attempts: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        PipelineConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_out_of_range_level() {
        let err = PipelineConfig::from_json_str(r#"{"compression": {"level": 12}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_zero_chunk_size() {
        let err = PipelineConfig::from_json_str(r#"{"chunkSize": 0}"#).unwrap_err();
        assert!(err.to_string().contains("chunkSize"));
    }

    #[test]
    fn parses_algorithm_names() {
        let config = PipelineConfig::from_json_str(r#"{"compression": {"algorithm": "deflate"}}"#).unwrap();
        assert_eq!(config.compression.algorithm, Algorithm::Deflate);
        assert_eq!(config.compression.level, 6);
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(
            PipelineConfig::from_json_str("{"),
            Err(ConfigError::Parse(_))
        ));
    }
}
