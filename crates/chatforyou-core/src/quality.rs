//! Adaptive video quality decisions.
//!
//! The controller in the client crate samples transport statistics every
//! monitoring interval and hands the derived [`QualityMetrics`] to this module.
//! Network and device conditions are scored independently, bucketed into
//! tiers, and combined through a fixed matrix into a target preset. The target
//! is approached through a half-way constraint envelope rather than applied
//! outright.

use crate::media::{ConstraintRange, VideoConstraints};
use crate::stats::{LimitationReason, QualityMetrics};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::str::FromStr;
use tracing::{debug, info};

/// Samples kept for device averages.
pub const DEVICE_HISTORY_LEN: usize = 10;

/// Named capture envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreset {
    Low,
    Medium,
    High,
    #[default]
    Auto,
}

impl QualityPreset {
    pub fn constraints(&self) -> VideoConstraints {
        match self {
            QualityPreset::High => VideoConstraints {
                width: ConstraintRange::new(1920, 1920),
                height: ConstraintRange::new(1080, 1080),
                frame_rate: ConstraintRange::new(30, 30),
            },
            QualityPreset::Medium => VideoConstraints {
                width: ConstraintRange::new(1280, 1280),
                height: ConstraintRange::new(720, 720),
                frame_rate: ConstraintRange::new(15, 20),
            },
            QualityPreset::Low => VideoConstraints {
                width: ConstraintRange::new(640, 640),
                height: ConstraintRange::new(360, 360),
                frame_rate: ConstraintRange::new(10, 15),
            },
            QualityPreset::Auto => VideoConstraints {
                width: ConstraintRange::new(1280, 1920),
                height: ConstraintRange::new(720, 1080),
                frame_rate: ConstraintRange::new(15, 30),
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QualityPreset::Low => "low",
            QualityPreset::Medium => "medium",
            QualityPreset::High => "high",
            QualityPreset::Auto => "auto",
        }
    }
}

impl std::fmt::Display for QualityPreset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QualityPreset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(QualityPreset::Low),
            "medium" => Ok(QualityPreset::Medium),
            "high" => Ok(QualityPreset::High),
            "auto" => Ok(QualityPreset::Auto),
            other => Err(format!("unknown quality preset '{other}'")),
        }
    }
}

/// Coarse bucket of a 0..100 score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Low,
    Medium,
    High,
}

impl QualityTier {
    pub fn from_score(score: f64) -> Self {
        if score >= 80.0 {
            QualityTier::High
        } else if score >= 50.0 {
            QualityTier::Medium
        } else {
            QualityTier::Low
        }
    }
}

impl std::fmt::Display for QualityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            QualityTier::Low => "low",
            QualityTier::Medium => "medium",
            QualityTier::High => "high",
        };
        f.write_str(name)
    }
}

/// Scores the path between this client and the media server.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkEstimator;

impl NetworkEstimator {
    pub fn score(&self, metrics: &QualityMetrics) -> f64 {
        let mut score = 100.0;

        if metrics.bitrate_kbps > 2000.0 {
            // full marks
        } else if metrics.bitrate_kbps > 1000.0 {
            score -= 15.0;
        } else {
            score -= 30.0;
        }

        score -= (metrics.packets_lost as f64 * 2.0).min(40.0);

        if metrics.rtt_ms > 200.0 {
            score -= 20.0;
        } else if metrics.rtt_ms > 100.0 {
            score -= 10.0;
        }

        if metrics.jitter > 0.05 {
            score -= 10.0;
        }

        score
    }

    /// Missing statistics rate as medium.
    pub fn tier(&self, metrics: Option<&QualityMetrics>) -> QualityTier {
        match metrics {
            Some(m) => QualityTier::from_score(self.score(m)),
            None => QualityTier::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct DeviceSample {
    frame_rate: f64,
    encode_time_ms: f64,
}

/// Scores the sender's ability to keep up with encoding.
///
/// Frame rate and encode time are averaged over the last
/// [`DEVICE_HISTORY_LEN`] samples; the drop rate is taken from the latest one.
#[derive(Debug, Clone)]
pub struct DeviceEstimator {
    history: VecDeque<DeviceSample>,
    capacity: usize,
}

impl Default for DeviceEstimator {
    fn default() -> Self {
        Self::new(DEVICE_HISTORY_LEN)
    }
}

impl DeviceEstimator {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            history: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }

    fn record(&mut self, metrics: &QualityMetrics) {
        self.history.push_back(DeviceSample {
            frame_rate: metrics.frame_rate,
            encode_time_ms: metrics.avg_encode_time_ms,
        });
        while self.history.len() > self.capacity {
            self.history.pop_front();
        }
    }

    pub fn average_frame_rate(&self) -> f64 {
        average(self.history.iter().map(|s| s.frame_rate))
    }

    pub fn average_encode_time_ms(&self) -> f64 {
        average(self.history.iter().map(|s| s.encode_time_ms))
    }

    /// Score from the current history plus the latest drop rate.
    pub fn score(&self, frame_drop_rate_pct: f64) -> f64 {
        let mut score = 100.0;
        score -= (frame_drop_rate_pct * 2.0).min(30.0);

        let encode = self.average_encode_time_ms();
        if encode > 20.0 {
            score -= ((encode - 20.0) * 2.0).min(30.0);
        }

        let fps = self.average_frame_rate();
        if fps < 10.0 {
            score -= 20.0;
        } else if fps > 25.0 {
            score += 10.0;
        }

        score
    }

    /// Records the sample and rates the device. Missing statistics rate as medium.
    pub fn observe(&mut self, metrics: Option<&QualityMetrics>) -> QualityTier {
        match metrics {
            Some(m) => {
                self.record(m);
                QualityTier::from_score(self.score(m.frame_drop_rate_pct))
            }
            None => QualityTier::Medium,
        }
    }
}

fn average(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

/// Combines network and device tiers into a concrete preset.
pub fn decide_preset(network: QualityTier, device: QualityTier) -> QualityPreset {
    use QualityTier::*;
    match (network, device) {
        (High, High) => QualityPreset::High,
        (High, Medium) | (High, Low) | (Medium, High) | (Medium, Medium) => QualityPreset::Medium,
        (Medium, Low) | (Low, _) => QualityPreset::Low,
    }
}

/// Half-way envelope between two presets: ideals meet in the middle, the
/// ceiling is already the target's.
pub fn smooth_transition(current: QualityPreset, target: QualityPreset) -> VideoConstraints {
    let from = current.constraints();
    let to = target.constraints();
    VideoConstraints {
        width: midpoint(from.width, to.width),
        height: midpoint(from.height, to.height),
        frame_rate: midpoint(from.frame_rate, to.frame_rate),
    }
}

fn midpoint(from: ConstraintRange, to: ConstraintRange) -> ConstraintRange {
    let ideal = ((from.ideal as f64 + to.ideal as f64) / 2.0).round() as u32;
    ConstraintRange::new(ideal, to.max)
}

/// Outcome of one assessment round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityDecision {
    pub network: QualityTier,
    pub device: QualityTier,
    pub target: QualityPreset,
}

impl QualityDecision {
    pub fn requires_change(&self, current: QualityPreset) -> bool {
        self.target != current
    }
}

/// Holds the estimators and turns samples into decisions.
#[derive(Debug, Clone, Default)]
pub struct QualityAssessor {
    network: NetworkEstimator,
    device: DeviceEstimator,
}

impl QualityAssessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assess(&mut self, metrics: Option<&QualityMetrics>) -> QualityDecision {
        let network = self.network.tier(metrics);
        let device = self.device.observe(metrics);
        let target = decide_preset(network, device);
        debug!(%network, %device, %target, "quality assessed");
        QualityDecision {
            network,
            device,
            target,
        }
    }

    pub fn device(&self) -> &DeviceEstimator {
        &self.device
    }

    pub fn reset(&mut self) {
        self.device.clear();
    }
}

/// Requires the same target on consecutive rounds before a switch goes ahead.
#[derive(Debug, Clone)]
pub struct SwitchPersistence {
    required: usize,
    candidate: Option<QualityPreset>,
    count: usize,
}

impl Default for SwitchPersistence {
    fn default() -> Self {
        Self::new(1)
    }
}

impl SwitchPersistence {
    pub fn new(required: usize) -> Self {
        Self {
            required: required.max(1),
            candidate: None,
            count: 0,
        }
    }

    /// Returns the preset to switch to once the target has persisted long enough.
    pub fn confirm(&mut self, current: QualityPreset, target: QualityPreset) -> Option<QualityPreset> {
        if target == current {
            self.candidate = None;
            self.count = 0;
            return None;
        }

        if self.candidate == Some(target) {
            self.count += 1;
        } else {
            self.candidate = Some(target);
            self.count = 1;
        }

        if self.count >= self.required {
            info!(from = %current, to = %target, rounds = self.count, "quality switch confirmed");
            self.candidate = None;
            self.count = 0;
            Some(target)
        } else {
            None
        }
    }
}

/// One-off constraint tweak for an encoder that reports itself limited.
///
/// Returns `None` when no tweak applies.
pub fn limitation_adjustment(
    current: VideoConstraints,
    reason: LimitationReason,
) -> Option<VideoConstraints> {
    match reason {
        LimitationReason::Cpu => {
            let ideal = current.frame_rate.ideal.saturating_sub(5).max(10);
            if ideal == current.frame_rate.ideal {
                return None;
            }
            Some(VideoConstraints {
                frame_rate: ConstraintRange { ideal, ..current.frame_rate },
                ..current
            })
        }
        LimitationReason::Bandwidth => {
            let scale = |r: ConstraintRange| ConstraintRange {
                ideal: (r.ideal as f64 * 0.8).round() as u32,
                ..r
            };
            Some(VideoConstraints {
                width: scale(current.width),
                height: scale(current.height),
                ..current
            })
        }
        LimitationReason::None | LimitationReason::Other => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarningSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PerformanceWarning {
    pub severity: WarningSeverity,
    pub message: &'static str,
    pub suggestion: &'static str,
}

/// Warnings in priority order; callers usually surface only the first.
pub fn performance_warnings(metrics: &QualityMetrics) -> Vec<PerformanceWarning> {
    let mut warnings = Vec::new();
    if metrics.frame_drop_rate_pct > 20.0 {
        warnings.push(PerformanceWarning {
            severity: WarningSeverity::Critical,
            message: "Severe frame drops",
            suggestion: "Lower the quality or close other programs",
        });
    }
    if metrics.frame_rate < 5.0 {
        warnings.push(PerformanceWarning {
            severity: WarningSeverity::Critical,
            message: "Very low frame rate",
            suggestion: "Check the network connection and lower the quality",
        });
    }
    if metrics.packets_lost > 500 {
        warnings.push(PerformanceWarning {
            severity: WarningSeverity::Warning,
            message: "Unstable network",
            suggestion: "Check the network connection",
        });
    }
    warnings
}

/// Human-readable tuning hints for the latest metrics.
pub fn optimisation_advice(metrics: &QualityMetrics) -> Vec<&'static str> {
    let mut advice = Vec::new();
    if metrics.frame_drop_rate_pct > 10.0 {
        advice.push("Frame drop rate is high: reduce CPU load or lower the quality");
    }
    if metrics.avg_encode_time_ms > 30.0 {
        advice.push("Encoding is slow: lower the resolution or close other programs");
    }
    if metrics.packets_lost > 100 {
        advice.push("Packets are being lost: check the network connection");
    }
    if metrics.frame_rate < 10.0 {
        advice.push("Frame rate is low: enable auto-optimise or lower the quality");
    }
    if metrics.bitrate_kbps < 500.0 {
        advice.push("Sending at a low bitrate: bandwidth may be constrained");
    }
    if advice.is_empty() {
        advice.push("Sharing is running at its best");
    }
    advice
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy() -> QualityMetrics {
        QualityMetrics {
            bitrate_kbps: 2500.0,
            frame_rate: 30.0,
            packets_lost: 0,
            rtt_ms: 40.0,
            jitter: 0.01,
            frame_drop_rate_pct: 0.0,
            avg_encode_time_ms: 8.0,
            limitation_reason: LimitationReason::None,
        }
    }

    #[test]
    fn network_score_penalties() {
        let estimator = NetworkEstimator;
        assert_eq!(estimator.score(&healthy()), 100.0);

        let poor = QualityMetrics {
            bitrate_kbps: 800.0,
            packets_lost: 50,
            rtt_ms: 250.0,
            jitter: 0.08,
            ..healthy()
        };
        // 100 - 30 - 40 - 20 - 10
        assert_eq!(estimator.score(&poor), 0.0);

        let middling = QualityMetrics {
            bitrate_kbps: 1500.0,
            rtt_ms: 150.0,
            ..healthy()
        };
        assert_eq!(estimator.score(&middling), 75.0);
        assert_eq!(estimator.tier(Some(&middling)), QualityTier::Medium);
    }

    #[test]
    fn missing_statistics_rate_medium() {
        let mut device = DeviceEstimator::default();
        assert_eq!(NetworkEstimator.tier(None), QualityTier::Medium);
        assert_eq!(device.observe(None), QualityTier::Medium);
        assert_eq!(device.history_len(), 0);
    }

    #[test]
    fn device_history_is_bounded() {
        let mut device = DeviceEstimator::default();
        for _ in 0..25 {
            device.observe(Some(&healthy()));
        }
        assert_eq!(device.history_len(), DEVICE_HISTORY_LEN);
    }

    #[test]
    fn device_averages_over_history() {
        let mut device = DeviceEstimator::new(2);
        let slow = QualityMetrics {
            avg_encode_time_ms: 40.0,
            frame_rate: 8.0,
            ..healthy()
        };
        device.observe(Some(&healthy()));
        device.observe(Some(&slow));
        assert!((device.average_encode_time_ms() - 24.0).abs() < 1e-9);
        assert!((device.average_frame_rate() - 19.0).abs() < 1e-9);

        // Oldest sample falls out.
        device.observe(Some(&slow));
        assert!((device.average_encode_time_ms() - 40.0).abs() < 1e-9);
        // 100 - 30 (encode) - 20 (fps)
        assert_eq!(device.score(0.0), 50.0);
    }

    #[test]
    fn decision_matrix() {
        use QualityTier::*;
        assert_eq!(decide_preset(High, High), QualityPreset::High);
        assert_eq!(decide_preset(High, Medium), QualityPreset::Medium);
        assert_eq!(decide_preset(High, Low), QualityPreset::Medium);
        assert_eq!(decide_preset(Medium, High), QualityPreset::Medium);
        assert_eq!(decide_preset(Medium, Medium), QualityPreset::Medium);
        assert_eq!(decide_preset(Medium, Low), QualityPreset::Low);
        assert_eq!(decide_preset(Low, High), QualityPreset::Low);
        assert_eq!(decide_preset(Low, Medium), QualityPreset::Low);
        assert_eq!(decide_preset(Low, Low), QualityPreset::Low);
    }

    #[test]
    fn strong_network_with_struggling_device_lands_on_medium() {
        let mut assessor = QualityAssessor::new();
        let struggling = QualityMetrics {
            frame_drop_rate_pct: 25.0,
            avg_encode_time_ms: 45.0,
            frame_rate: 6.0,
            ..healthy()
        };
        let decision = assessor.assess(Some(&struggling));
        assert_eq!(decision.network, QualityTier::High);
        assert_eq!(decision.device, QualityTier::Low);
        assert_eq!(decision.target, QualityPreset::Medium);
        assert!(decision.requires_change(QualityPreset::Auto));
    }

    #[test]
    fn smoothing_from_auto_to_low() {
        let c = smooth_transition(QualityPreset::Auto, QualityPreset::Low);
        assert_eq!(c.width, ConstraintRange::new(960, 640));
        assert_eq!(c.height, ConstraintRange::new(540, 360));
        assert_eq!(c.frame_rate, ConstraintRange::new(13, 15));
    }

    #[test]
    fn smoothing_to_same_preset_is_the_preset() {
        let c = smooth_transition(QualityPreset::Medium, QualityPreset::Medium);
        assert_eq!(c, QualityPreset::Medium.constraints());
    }

    #[test]
    fn persistence_of_one_switches_immediately() {
        let mut gate = SwitchPersistence::default();
        assert_eq!(
            gate.confirm(QualityPreset::Auto, QualityPreset::Low),
            Some(QualityPreset::Low)
        );
        assert_eq!(gate.confirm(QualityPreset::Low, QualityPreset::Low), None);
    }

    #[test]
    fn persistence_resets_when_target_wavers() {
        let mut gate = SwitchPersistence::new(3);
        let cur = QualityPreset::Medium;
        assert_eq!(gate.confirm(cur, QualityPreset::Low), None);
        assert_eq!(gate.confirm(cur, QualityPreset::Low), None);
        assert_eq!(gate.confirm(cur, QualityPreset::High), None);
        assert_eq!(gate.confirm(cur, QualityPreset::Low), None);
        assert_eq!(gate.confirm(cur, QualityPreset::Low), None);
        assert_eq!(gate.confirm(cur, QualityPreset::Low), Some(QualityPreset::Low));
    }

    #[test]
    fn cpu_limitation_lowers_frame_rate_with_floor() {
        let medium = QualityPreset::Medium.constraints();
        let tweaked = limitation_adjustment(medium, LimitationReason::Cpu).unwrap();
        assert_eq!(tweaked.frame_rate.ideal, 10);
        assert_eq!(tweaked.width, medium.width);
        assert!(limitation_adjustment(tweaked, LimitationReason::Cpu).is_none());
    }

    #[test]
    fn bandwidth_limitation_scales_resolution() {
        let high = QualityPreset::High.constraints();
        let tweaked = limitation_adjustment(high, LimitationReason::Bandwidth).unwrap();
        assert_eq!(tweaked.width.ideal, 1536);
        assert_eq!(tweaked.height.ideal, 864);
        assert_eq!(tweaked.width.max, 1920);
        assert!(limitation_adjustment(high, LimitationReason::None).is_none());
    }

    #[test]
    fn warnings_and_advice() {
        assert!(performance_warnings(&healthy()).is_empty());
        assert_eq!(optimisation_advice(&healthy()).len(), 1);

        let bad = QualityMetrics {
            frame_drop_rate_pct: 30.0,
            frame_rate: 3.0,
            packets_lost: 600,
            bitrate_kbps: 200.0,
            avg_encode_time_ms: 50.0,
            ..healthy()
        };
        let warnings = performance_warnings(&bad);
        assert_eq!(warnings.len(), 3);
        assert_eq!(warnings[0].severity, WarningSeverity::Critical);
        assert_eq!(warnings[2].severity, WarningSeverity::Warning);
        assert_eq!(optimisation_advice(&bad).len(), 5);
    }

    #[test]
    fn preset_parsing() {
        assert_eq!("HIGH".parse::<QualityPreset>(), Ok(QualityPreset::High));
        assert_eq!(" auto ".parse::<QualityPreset>(), Ok(QualityPreset::Auto));
        assert!("ultra".parse::<QualityPreset>().is_err());
    }
}
