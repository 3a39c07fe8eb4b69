//! Network-aware send scheduling.
//!
//! Samples of latency and bandwidth are folded into a rolling window; each
//! batch then gets a [`SchedulingDecision`] saying whether to send now or
//! how long to hold off. Delays are advisory, the caller owns the timer.

use std::collections::VecDeque;
use std::sync::Arc;

use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    clock::{Clock, SystemClock},
    config::TimingConfig,
    types::{SchedulePriority, TimestampMs},
};

pub const MIN_BATCH_BYTES: usize = 16 * 1024;
pub const MAX_BATCH_BYTES: usize = 1024 * 1024;
const BYTES_PER_MBPS: f64 = 64.0 * 1024.0;

const DEFAULT_LATENCY_MS: f64 = 100.0;
const DEFAULT_BANDWIDTH_MBPS: f64 = 5.0;

const MAX_CONGESTION_JITTER_MS: u64 = 200;
const FAIR_DEFER_MS: (u64, u64) = (1_000, 3_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkQuality {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl NetworkQuality {
    pub fn classify(latency_ms: f64, bandwidth_mbps: f64) -> Self {
        if latency_ms < 50.0 && bandwidth_mbps >= 10.0 {
            Self::Excellent
        } else if latency_ms < 150.0 && bandwidth_mbps >= 2.0 {
            Self::Good
        } else if latency_ms < 400.0 && bandwidth_mbps >= 0.5 {
            Self::Fair
        } else {
            Self::Poor
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSample {
    pub latency_ms: f64,
    pub bandwidth_mbps: f64,
    pub quality: NetworkQuality,
    pub at: TimestampMs,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkWindow {
    pub latency_ms: f64,
    pub bandwidth_mbps: f64,
    pub quality: NetworkQuality,
    pub is_stable: bool,
    /// Fraction of samples in the window classified poor.
    pub congestion_level: f64,
    pub recommended_batch_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulingDecision {
    pub should_send_now: bool,
    pub recommended_delay_ms: u64,
    pub reason: String,
    /// Priority after any user-activity promotion.
    pub priority: SchedulePriority,
    pub estimated_delivery_ms: f64,
    /// Window quality the decision was made under.
    pub quality: NetworkQuality,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimingStats {
    pub measurements: usize,
    pub immediate_count: u64,
    pub deferred_count: u64,
    pub average_wait_ms: f64,
    /// Deferrals made in fair or poor windows.
    pub congestion_avoided: u64,
}

pub struct BatchTimingOptimizer {
    config: TimingConfig,
    history: VecDeque<NetworkSample>,
    last_user_activity: Option<TimestampMs>,
    immediate: u64,
    deferred: u64,
    total_wait_ms: u64,
    congestion_avoided: u64,
    rng: StdRng,
    clock: Arc<dyn Clock>,
}

impl BatchTimingOptimizer {
    pub fn new(config: TimingConfig) -> Self {
        Self::with_sources(config, Arc::new(SystemClock), StdRng::from_entropy())
    }

    /// Deterministic construction for tests and replays.
    pub fn with_sources(config: TimingConfig, clock: Arc<dyn Clock>, rng: StdRng) -> Self {
        Self {
            config,
            history: VecDeque::new(),
            last_user_activity: None,
            immediate: 0,
            deferred: 0,
            total_wait_ms: 0,
            congestion_avoided: 0,
            rng,
            clock,
        }
    }

    pub fn record_network_measurement(&mut self, latency_ms: f64, bandwidth_mbps: f64) -> NetworkQuality {
        let latency_ms = latency_ms.max(0.0);
        let bandwidth_mbps = bandwidth_mbps.max(0.0);
        let quality = NetworkQuality::classify(latency_ms, bandwidth_mbps);
        self.history.push_back(NetworkSample {
            latency_ms,
            bandwidth_mbps,
            quality,
            at: self.clock.now_ms(),
        });
        while self.history.len() > self.config.max_history {
            self.history.pop_front();
        }
        debug!(latency_ms, bandwidth_mbps, ?quality, "network sample recorded");
        quality
    }

    pub fn record_user_activity(&mut self) {
        self.last_user_activity = Some(self.clock.now_ms());
    }

    pub fn is_user_active(&self) -> bool {
        let now = self.clock.now_ms();
        self.last_user_activity
            .is_some_and(|at| now.saturating_sub(at) < self.config.user_active_window_ms)
    }

    pub fn current_window(&self) -> NetworkWindow {
        let take = self.config.window_size.min(self.history.len());
        if take == 0 {
            return NetworkWindow {
                latency_ms: DEFAULT_LATENCY_MS,
                bandwidth_mbps: DEFAULT_BANDWIDTH_MBPS,
                quality: NetworkQuality::Good,
                is_stable: true,
                congestion_level: 0.0,
                recommended_batch_size: optimal_batch_size(DEFAULT_BANDWIDTH_MBPS),
            };
        }

        let recent: Vec<&NetworkSample> = self.history.iter().rev().take(take).collect();
        let n = take as f64;
        let latency_ms = recent.iter().map(|s| s.latency_ms).sum::<f64>() / n;
        let bandwidth_mbps = recent.iter().map(|s| s.bandwidth_mbps).sum::<f64>() / n;
        let variance = recent
            .iter()
            .map(|s| (s.latency_ms - latency_ms).powi(2))
            .sum::<f64>()
            / n;
        let poor = recent.iter().filter(|s| s.quality == NetworkQuality::Poor).count();

        NetworkWindow {
            latency_ms,
            bandwidth_mbps,
            quality: NetworkQuality::classify(latency_ms, bandwidth_mbps),
            is_stable: variance.sqrt() < self.config.stable_latency_stddev_ms,
            congestion_level: poor as f64 / n,
            recommended_batch_size: optimal_batch_size(bandwidth_mbps),
        }
    }

    pub fn get_scheduling_decision(
        &mut self,
        batch_size_bytes: usize,
        priority: SchedulePriority,
        is_user_triggered: bool,
    ) -> SchedulingDecision {
        let window = self.current_window();

        let (priority, delay, reason) = if priority == SchedulePriority::Critical {
            (priority, 0, "critical priority bypasses network checks".to_string())
        } else if is_user_triggered && self.is_user_active() {
            (
                SchedulePriority::High,
                0,
                "user-triggered while active, promoted to high".to_string(),
            )
        } else {
            let (delay, reason) = self.delay_for(&window, priority);
            (priority, delay, reason)
        };

        let decision = SchedulingDecision {
            should_send_now: delay == 0,
            recommended_delay_ms: delay,
            reason,
            priority,
            estimated_delivery_ms: transmission_ms(batch_size_bytes, window.bandwidth_mbps)
                + window.latency_ms
                + delay as f64,
            quality: window.quality,
        };
        debug!(
            send_now = decision.should_send_now,
            delay_ms = decision.recommended_delay_ms,
            ?priority,
            quality = ?window.quality,
            "scheduling decision"
        );
        decision
    }

    fn delay_for(&mut self, window: &NetworkWindow, priority: SchedulePriority) -> (u64, String) {
        match window.quality {
            NetworkQuality::Excellent | NetworkQuality::Good => {
                if window.congestion_level > self.config.congestion_jitter_threshold {
                    let jitter = self.rng.gen_range(0..=MAX_CONGESTION_JITTER_MS);
                    (jitter, format!("{:?} network with congestion, jittered", window.quality))
                } else {
                    (0, format!("{:?} network", window.quality))
                }
            }
            NetworkQuality::Fair => {
                if priority == SchedulePriority::High {
                    (0, "fair network, high priority sends now".to_string())
                } else {
                    let delay = self.rng.gen_range(FAIR_DEFER_MS.0..=FAIR_DEFER_MS.1);
                    (delay, "fair network, deferring".to_string())
                }
            }
            NetworkQuality::Poor => {
                let base = match priority {
                    SchedulePriority::Critical => 0,
                    SchedulePriority::High => 2_000,
                    SchedulePriority::Normal => 5_000,
                    SchedulePriority::Low => 10_000,
                };
                let jitter = self.rng.gen_range(0..=base / 2);
                (base + jitter, "poor network, deferring".to_string())
            }
        }
    }

    /// Folds a decision the caller acted on into the running statistics.
    pub fn apply_scheduling(&mut self, decision: &SchedulingDecision) {
        if decision.should_send_now {
            self.immediate += 1;
        } else {
            self.deferred += 1;
            if matches!(decision.quality, NetworkQuality::Fair | NetworkQuality::Poor) {
                self.congestion_avoided += 1;
            }
        }
        self.total_wait_ms += decision.recommended_delay_ms;
    }

    pub fn get_optimal_batch_size(&self) -> usize {
        self.current_window().recommended_batch_size
    }

    pub fn stats(&self) -> TimingStats {
        let decisions = self.immediate + self.deferred;
        TimingStats {
            measurements: self.history.len(),
            immediate_count: self.immediate,
            deferred_count: self.deferred,
            average_wait_ms: if decisions == 0 {
                0.0
            } else {
                self.total_wait_ms as f64 / decisions as f64
            },
            congestion_avoided: self.congestion_avoided,
        }
    }
}

/// `bandwidth * 64 KiB`, clamped to 16 KiB..=1 MiB.
pub fn optimal_batch_size(bandwidth_mbps: f64) -> usize {
    let raw = (bandwidth_mbps.max(0.0) * BYTES_PER_MBPS) as usize;
    raw.clamp(MIN_BATCH_BYTES, MAX_BATCH_BYTES)
}

fn transmission_ms(bytes: usize, bandwidth_mbps: f64) -> f64 {
    if bandwidth_mbps <= 0.0 {
        return 0.0;
    }
    (bytes as f64 * 8.0) / (bandwidth_mbps * 1_000.0)
}
