//! Picks a compression level from network and device conditions.
//!
//! Network and device each yield a factor in `[0, 1]` that grows with
//! available capacity; their mean maps linearly onto levels 1 to 9. An
//! offline, constrained device lands on 1, a fast link on a premium device
//! on 9.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::AdaptiveConfig;

use super::compression::{MAX_LEVEL, MIN_LEVEL};

const SLOW_KBPS: f64 = 500.0;
const FAST_KBPS: f64 = 5_000.0;
const CONSTRAINED_MB: u64 = 512;
const PREMIUM_MB: u64 = 4_096;
const UNKNOWN_FACTOR: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkCondition {
    Offline,
    Slow,
    Normal,
    Fast,
}

impl NetworkCondition {
    pub fn classify(speed_kbps: f64, is_online: bool) -> Self {
        if !is_online || speed_kbps <= 0.0 {
            Self::Offline
        } else if speed_kbps < SLOW_KBPS {
            Self::Slow
        } else if speed_kbps > FAST_KBPS {
            Self::Fast
        } else {
            Self::Normal
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Constrained,
    Standard,
    Premium,
}

impl DeviceClass {
    pub fn classify(memory_available_mb: u64) -> Self {
        if memory_available_mb < CONSTRAINED_MB {
            Self::Constrained
        } else if memory_available_mb >= PREMIUM_MB {
            Self::Premium
        } else {
            Self::Standard
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetworkProfile {
    pub speed_kbps: f64,
    pub latency_ms: Option<f64>,
    pub is_online: bool,
    pub condition: NetworkCondition,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceProfile {
    /// 0.0 idle to 1.0 saturated.
    pub cpu_utilization: f64,
    pub memory_available_mb: u64,
    pub low_power: bool,
    pub class: DeviceClass,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelRecommendation {
    pub recommended_level: u32,
    pub reason: String,
    pub confidence: f64,
    pub network_factor: f64,
    pub device_factor: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct PerformanceSample {
    level: u32,
    duration_ms: f64,
    ratio: f64,
}

/// Averages over the rolling history for one level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelPerformance {
    pub level: u32,
    pub samples: usize,
    pub average_ms: f64,
    pub average_ratio: f64,
}

pub struct AdaptiveCompressionOptimizer {
    config: AdaptiveConfig,
    level: u32,
    network: Option<NetworkProfile>,
    device: Option<DeviceProfile>,
    low_power: bool,
    history: VecDeque<PerformanceSample>,
    level_changes: u64,
}

impl AdaptiveCompressionOptimizer {
    pub fn new(config: AdaptiveConfig) -> Self {
        Self {
            level: config.default_level.clamp(MIN_LEVEL, MAX_LEVEL),
            config,
            network: None,
            device: None,
            low_power: false,
            history: VecDeque::new(),
            level_changes: 0,
        }
    }

    pub fn current_level(&self) -> u32 {
        self.level
    }

    pub fn level_changes(&self) -> u64 {
        self.level_changes
    }

    pub fn network(&self) -> Option<&NetworkProfile> {
        self.network.as_ref()
    }

    pub fn device(&self) -> Option<&DeviceProfile> {
        self.device.as_ref()
    }

    /// `is_online` defaults to true when unknown.
    pub fn update_network_conditions(
        &mut self,
        speed_kbps: f64,
        latency_ms: Option<f64>,
        is_online: Option<bool>,
    ) -> NetworkCondition {
        let is_online = is_online.unwrap_or(true);
        let condition = NetworkCondition::classify(speed_kbps, is_online);
        self.network = Some(NetworkProfile {
            speed_kbps: speed_kbps.max(0.0),
            latency_ms,
            is_online,
            condition,
        });
        debug!(speed_kbps, ?condition, "network conditions updated");
        condition
    }

    pub fn update_device_resources(&mut self, cpu_utilization: f64, memory_available_mb: u64) -> DeviceClass {
        let class = DeviceClass::classify(memory_available_mb);
        self.device = Some(DeviceProfile {
            cpu_utilization: cpu_utilization.clamp(0.0, 1.0),
            memory_available_mb,
            low_power: self.low_power,
            class,
        });
        debug!(cpu_utilization, memory_available_mb, ?class, "device resources updated");
        class
    }

    pub fn set_low_power_mode(&mut self, enabled: bool) {
        self.low_power = enabled;
        if let Some(device) = self.device.as_mut() {
            device.low_power = enabled;
        }
    }

    pub fn get_recommended_level(&self) -> LevelRecommendation {
        let network_factor = self.network_factor();
        let device_factor = self.device_factor();
        let avg = (network_factor + device_factor) / 2.0;
        let recommended_level = ((1.0 + 8.0 * avg).round() as u32).clamp(MIN_LEVEL, MAX_LEVEL);

        LevelRecommendation {
            recommended_level,
            reason: self.reason(),
            confidence: self.confidence(),
            network_factor,
            device_factor,
        }
    }

    /// Grows from 0.5 to 0.9 as performance samples accumulate.
    pub fn confidence(&self) -> f64 {
        let target = self.config.confident_samples.max(1);
        let seen = self.history.len().min(target);
        0.5 + 0.4 * seen as f64 / target as f64
    }

    /// Non-decreasing in link speed.
    fn network_factor(&self) -> f64 {
        let Some(net) = self.network.as_ref() else {
            return UNKNOWN_FACTOR;
        };
        match net.condition {
            NetworkCondition::Offline => 0.0,
            NetworkCondition::Slow => 0.2,
            NetworkCondition::Normal if net.speed_kbps < 2_000.0 => 0.4,
            NetworkCondition::Normal => 0.6,
            NetworkCondition::Fast if net.speed_kbps < 20_000.0 => 0.8,
            NetworkCondition::Fast => 1.0,
        }
    }

    /// Increasing in spare capacity.
    fn device_factor(&self) -> f64 {
        let base = match self.device.as_ref() {
            None => UNKNOWN_FACTOR,
            Some(device) => {
                let memory = match device.class {
                    DeviceClass::Constrained => 0.3,
                    DeviceClass::Standard => 0.6,
                    DeviceClass::Premium => 1.0,
                };
                let cpu_penalty = if device.cpu_utilization > 0.8 {
                    0.3
                } else if device.cpu_utilization > 0.5 {
                    0.15
                } else {
                    0.0
                };
                memory - cpu_penalty
            }
        };
        let power_penalty = if self.low_power { 0.2 } else { 0.0 };
        (base - power_penalty).clamp(0.0, 1.0)
    }

    fn reason(&self) -> String {
        let network = match self.network.as_ref().map(|n| n.condition) {
            None => "network unknown",
            Some(NetworkCondition::Offline) => "offline",
            Some(NetworkCondition::Slow) => "slow network",
            Some(NetworkCondition::Normal) => "normal network",
            Some(NetworkCondition::Fast) => "fast network",
        };
        let device = match self.device.as_ref().map(|d| d.class) {
            None => "device unknown",
            Some(DeviceClass::Constrained) => "constrained device",
            Some(DeviceClass::Standard) => "standard device",
            Some(DeviceClass::Premium) => "premium device",
        };
        if self.low_power {
            format!("{network}; {device}; low power mode")
        } else {
            format!("{network}; {device}")
        }
    }

    pub fn record_compression_performance(&mut self, level: u32, duration_ms: f64, ratio: f64) {
        self.history.push_back(PerformanceSample {
            level: level.clamp(MIN_LEVEL, MAX_LEVEL),
            duration_ms,
            ratio,
        });
        while self.history.len() > self.config.max_history {
            self.history.pop_front();
        }
    }

    /// One entry per level present in the history, ascending by level.
    pub fn performance_summary(&self) -> Vec<LevelPerformance> {
        (MIN_LEVEL..=MAX_LEVEL)
            .filter_map(|level| {
                let samples: Vec<&PerformanceSample> = self.history.iter().filter(|s| s.level == level).collect();
                if samples.is_empty() {
                    return None;
                }
                let n = samples.len() as f64;
                Some(LevelPerformance {
                    level,
                    samples: samples.len(),
                    average_ms: samples.iter().map(|s| s.duration_ms).sum::<f64>() / n,
                    average_ratio: samples.iter().map(|s| s.ratio).sum::<f64>() / n,
                })
            })
            .collect()
    }

    /// Moves to the recommended level when confident enough or when the
    /// jump is large. Returns whether the level changed.
    pub fn apply_recommendation(&mut self) -> bool {
        let rec = self.get_recommended_level();
        if rec.recommended_level == self.level {
            return false;
        }
        let jump = rec.recommended_level.abs_diff(self.level);
        if rec.confidence < self.config.apply_confidence && jump <= self.config.large_change {
            debug!(
                current = self.level,
                recommended = rec.recommended_level,
                confidence = rec.confidence,
                "recommendation held back"
            );
            return false;
        }

        info!(
            from = self.level,
            to = rec.recommended_level,
            reason = %rec.reason,
            "compression level changed"
        );
        self.level = rec.recommended_level;
        self.level_changes += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_thresholds() {
        assert_eq!(NetworkCondition::classify(0.0, true), NetworkCondition::Offline);
        assert_eq!(NetworkCondition::classify(10_000.0, false), NetworkCondition::Offline);
        assert_eq!(NetworkCondition::classify(499.0, true), NetworkCondition::Slow);
        assert_eq!(NetworkCondition::classify(500.0, true), NetworkCondition::Normal);
        assert_eq!(NetworkCondition::classify(5_000.0, true), NetworkCondition::Normal);
        assert_eq!(NetworkCondition::classify(5_001.0, true), NetworkCondition::Fast);
    }

    #[test]
    fn device_thresholds() {
        assert_eq!(DeviceClass::classify(511), DeviceClass::Constrained);
        assert_eq!(DeviceClass::classify(512), DeviceClass::Standard);
        assert_eq!(DeviceClass::classify(4_096), DeviceClass::Premium);
    }

    #[test]
    fn unknown_conditions_land_mid_range() {
        let opt = AdaptiveCompressionOptimizer::new(AdaptiveConfig::default());
        let rec = opt.get_recommended_level();
        assert_eq!(rec.recommended_level, 5);
        assert_eq!(rec.confidence, 0.5);
        assert_eq!(opt.current_level(), 6);
    }

    #[test]
    fn low_power_lowers_device_factor() {
        let mut opt = AdaptiveCompressionOptimizer::new(AdaptiveConfig::default());
        opt.update_device_resources(0.1, 8_192);
        let before = opt.get_recommended_level().device_factor;
        opt.set_low_power_mode(true);
        let after = opt.get_recommended_level();
        assert!(after.device_factor < before);
        assert!(after.reason.contains("low power"));
    }

    #[test]
    fn confidence_saturates() {
        let mut opt = AdaptiveCompressionOptimizer::new(AdaptiveConfig::default());
        for _ in 0..25 {
            opt.record_compression_performance(6, 1.0, 0.5);
        }
        assert!((opt.confidence() - 0.9).abs() < 1e-9);
    }
}
