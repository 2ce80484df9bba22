//! Periodic quality adaptation for the outbound capture track.

use crate::rtc::{RtcError, TrackRef};
use chatforyou_core::{
    limitation_adjustment, optimisation_advice, performance_warnings, smooth_transition,
    LimitationReason, PerformanceWarning, QualityAssessor, QualityDecision, QualityMetrics,
    QualityPreset, StatsSampler, SwitchPersistence, TransportStats, VideoConstraints,
};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(2000);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualityConfig {
    pub interval: Duration,
    pub auto_optimize: bool,
    /// Consecutive identical targets needed before switching.
    pub switch_persistence: usize,
    pub limitation_tuning: bool,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SAMPLE_INTERVAL,
            auto_optimize: true,
            switch_persistence: 1,
            limitation_tuning: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum QualityError {
    #[error("no track is being monitored")]
    NotMonitoring,
    #[error("applying {preset} constraints failed: {source}")]
    Apply {
        preset: QualityPreset,
        source: RtcError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Monitoring,
}

/// A preset switch that reached the track.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityChange {
    pub from: QualityPreset,
    pub to: QualityPreset,
    pub constraints: VideoConstraints,
}

/// Everything one sampling round produced.
#[derive(Debug, Default)]
pub struct TickOutcome {
    pub metrics: Option<QualityMetrics>,
    pub decision: Option<QualityDecision>,
    pub change: Option<QualityChange>,
    /// Set when a switch failed and the previous preset was restored.
    pub rolled_back: Option<QualityError>,
    pub warnings: Vec<PerformanceWarning>,
}

pub struct QualityController {
    config: QualityConfig,
    state: ControllerState,
    current: QualityPreset,
    auto_optimize: bool,
    assessor: QualityAssessor,
    persistence: SwitchPersistence,
    sampler: Option<StatsSampler>,
    track: Option<TrackRef>,
    applied: Option<VideoConstraints>,
    tuned_for: Option<LimitationReason>,
    last_metrics: Option<QualityMetrics>,
}

impl QualityController {
    pub fn new(config: QualityConfig) -> Self {
        let persistence = SwitchPersistence::new(config.switch_persistence);
        Self {
            auto_optimize: config.auto_optimize,
            config,
            state: ControllerState::Idle,
            current: QualityPreset::default(),
            assessor: QualityAssessor::new(),
            persistence,
            sampler: None,
            track: None,
            applied: None,
            tuned_for: None,
            last_metrics: None,
        }
    }

    pub fn config(&self) -> &QualityConfig {
        &self.config
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn is_monitoring(&self) -> bool {
        self.state == ControllerState::Monitoring
    }

    pub fn current_preset(&self) -> QualityPreset {
        self.current
    }

    pub fn auto_optimize(&self) -> bool {
        self.auto_optimize
    }

    pub fn last_metrics(&self) -> Option<&QualityMetrics> {
        self.last_metrics.as_ref()
    }

    /// Starts sampling against `track`. Restarting replaces the previous track
    /// and clears the device history.
    pub fn start(&mut self, track: TrackRef, now: Instant) {
        info!(track = track.id(), preset = %self.current, "quality monitoring started");
        self.track = Some(track);
        self.sampler = Some(StatsSampler::new(now));
        self.assessor.reset();
        self.persistence = SwitchPersistence::new(self.config.switch_persistence);
        self.applied = None;
        self.tuned_for = None;
        self.state = ControllerState::Monitoring;
    }

    /// Uses `stats` as the sampling baseline for the next round.
    pub fn prime(&mut self, stats: &TransportStats, now: Instant) {
        if let Some(sampler) = self.sampler.as_mut() {
            sampler.prime(stats, now);
        }
    }

    pub fn stop(&mut self) {
        if self.state == ControllerState::Idle {
            return;
        }
        self.state = ControllerState::Idle;
        self.track = None;
        self.sampler = None;
        self.applied = None;
        self.tuned_for = None;
        info!("quality monitoring stopped");
    }

    /// Runs one sampling round against the latest statistics.
    pub async fn tick(&mut self, stats: &TransportStats, now: Instant) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        if !self.is_monitoring() {
            return outcome;
        }

        let metrics = self.sampler.as_mut().and_then(|s| s.sample(stats, now));
        if let Some(m) = metrics {
            outcome.warnings = performance_warnings(&m);
            self.last_metrics = Some(m);
        }
        outcome.metrics = metrics;

        if !self.auto_optimize {
            return outcome;
        }

        let decision = self.assessor.assess(metrics.as_ref());
        outcome.decision = Some(decision);

        if let Some(target) = self.persistence.confirm(self.current, decision.target) {
            match self.switch_to(target, smooth_transition(self.current, target)).await {
                Ok(change) => outcome.change = Some(change),
                Err(e) => outcome.rolled_back = Some(e),
            }
            return outcome;
        }

        if let Some(m) = metrics {
            self.tune_for_limitation(m.limitation_reason).await;
        }
        outcome
    }

    /// Selects a preset by hand. A concrete preset pins the envelope and turns
    /// auto-optimise off; `auto` turns it back on.
    pub async fn set_preset(
        &mut self,
        preset: QualityPreset,
    ) -> Result<Option<QualityChange>, QualityError> {
        self.auto_optimize = preset == QualityPreset::Auto;
        self.persistence = SwitchPersistence::new(self.config.switch_persistence);
        if !self.is_monitoring() {
            let from = self.current;
            self.current = preset;
            debug!(%from, to = %preset, "preset recorded while idle");
            return Ok(None);
        }
        self.switch_to(preset, preset.constraints()).await.map(Some)
    }

    pub fn toggle_auto_optimize(&mut self) -> bool {
        self.auto_optimize = !self.auto_optimize;
        info!(enabled = self.auto_optimize, "auto-optimise toggled");
        self.auto_optimize
    }

    /// Immediate decision from the last metrics, skipping persistence, and
    /// re-enables auto-optimise.
    pub async fn optimize_now(&mut self) -> Result<Option<QualityChange>, QualityError> {
        if !self.is_monitoring() {
            return Err(QualityError::NotMonitoring);
        }
        self.auto_optimize = true;
        let metrics = self.last_metrics;
        let decision = self.assessor.assess(metrics.as_ref());
        if !decision.requires_change(self.current) {
            return Ok(None);
        }
        let target = decision.target;
        self.switch_to(target, smooth_transition(self.current, target))
            .await
            .map(Some)
    }

    pub fn advice(&self) -> Vec<&'static str> {
        match &self.last_metrics {
            Some(m) => optimisation_advice(m),
            None => Vec::new(),
        }
    }

    async fn switch_to(
        &mut self,
        target: QualityPreset,
        constraints: VideoConstraints,
    ) -> Result<QualityChange, QualityError> {
        let track = self.track.clone().ok_or(QualityError::NotMonitoring)?;
        let from = self.current;

        if let Err(source) = track.apply_constraints(&constraints).await {
            warn!(%from, to = %target, "constraint update failed, restoring: {}", source);
            let restore = self.applied.unwrap_or_else(|| from.constraints());
            if let Err(e) = track.apply_constraints(&restore).await {
                warn!(preset = %from, "restoring constraints failed: {}", e);
            }
            return Err(QualityError::Apply {
                preset: target,
                source,
            });
        }

        self.current = target;
        self.applied = Some(constraints);
        self.tuned_for = None;
        info!(%from, to = %target, "quality preset changed");
        Ok(QualityChange {
            from,
            to: target,
            constraints,
        })
    }

    async fn tune_for_limitation(&mut self, reason: LimitationReason) {
        if !self.config.limitation_tuning
            || self.current == QualityPreset::Low
            || self.tuned_for == Some(reason)
        {
            return;
        }
        let Some(track) = self.track.clone() else {
            return;
        };
        let base = self.applied.unwrap_or_else(|| self.current.constraints());
        let Some(tweaked) = limitation_adjustment(base, reason) else {
            return;
        };

        match track.apply_constraints(&tweaked).await {
            Ok(()) => {
                debug!(?reason, preset = %self.current, "constraints tuned for limitation");
                self.applied = Some(tweaked);
                self.tuned_for = Some(reason);
            }
            Err(e) => warn!(?reason, "limitation tuning failed: {}", e),
        }
    }
}

impl std::fmt::Debug for QualityController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QualityController")
            .field("state", &self.state)
            .field("current", &self.current)
            .field("auto_optimize", &self.auto_optimize)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackTrack;
    use crate::rtc::TrackKind;
    use chatforyou_core::OutboundVideoStats;
    use std::sync::Arc;

    fn healthy(bytes_sent: u64) -> TransportStats {
        TransportStats {
            outbound_video: Some(OutboundVideoStats {
                bytes_sent,
                frames_per_second: 30.0,
                frames_encoded: 300,
                frames_sent: 300,
                total_encode_time: 1.5,
                ..Default::default()
            }),
            round_trip_time: Some(0.03),
        }
    }

    fn struggling(bytes_sent: u64, packets_lost: u64) -> TransportStats {
        TransportStats {
            outbound_video: Some(OutboundVideoStats {
                bytes_sent,
                packets_lost,
                frames_per_second: 4.0,
                frames_encoded: 100,
                frames_sent: 60,
                total_encode_time: 5.0,
                ..Default::default()
            }),
            round_trip_time: Some(0.4),
        }
    }

    fn started(config: QualityConfig) -> (QualityController, Arc<LoopbackTrack>, Instant) {
        let track = Arc::new(LoopbackTrack::new("screen-1", TrackKind::Video));
        let mut controller = QualityController::new(config);
        let t0 = Instant::now();
        controller.start(track.clone(), t0);
        (controller, track, t0)
    }

    #[tokio::test]
    async fn idle_controller_does_nothing() {
        let mut controller = QualityController::new(QualityConfig::default());
        let outcome = controller.tick(&healthy(1_000_000), Instant::now()).await;
        assert!(outcome.metrics.is_none());
        assert!(outcome.decision.is_none());
        assert_eq!(controller.current_preset(), QualityPreset::Auto);
    }

    #[tokio::test]
    async fn good_conditions_move_to_high_through_the_midpoint() {
        let (mut controller, track, t0) = started(QualityConfig::default());
        // 1 MB over 2 s = 4000 kbps
        let outcome = controller
            .tick(&healthy(1_000_000), t0 + Duration::from_secs(2))
            .await;

        let change = outcome.change.unwrap();
        assert_eq!(change.from, QualityPreset::Auto);
        assert_eq!(change.to, QualityPreset::High);
        assert_eq!(change.constraints.width.ideal, 1600);
        assert_eq!(change.constraints.width.max, 1920);
        assert_eq!(controller.current_preset(), QualityPreset::High);
        assert_eq!(track.applied().last(), Some(&change.constraints));
    }

    #[tokio::test]
    async fn stable_input_does_not_oscillate() {
        let (mut controller, track, t0) = started(QualityConfig::default());
        let mut bytes = 0;
        for round in 1..=6u64 {
            bytes += 1_000_000;
            controller
                .tick(&healthy(bytes), t0 + Duration::from_secs(2 * round))
                .await;
        }
        assert_eq!(controller.current_preset(), QualityPreset::High);
        assert_eq!(track.applied().len(), 1);
    }

    #[tokio::test]
    async fn poor_conditions_drop_to_low_and_warn() {
        let (mut controller, _track, t0) = started(QualityConfig::default());
        let outcome = controller
            .tick(&struggling(10_000, 600), t0 + Duration::from_secs(2))
            .await;

        assert_eq!(outcome.change.map(|c| c.to), Some(QualityPreset::Low));
        assert_eq!(outcome.warnings[0].message, "Severe frame drops");
        assert!(!controller.advice().is_empty());
    }

    #[tokio::test]
    async fn failed_apply_rolls_back_to_previous_envelope() {
        let (mut controller, track, t0) = started(QualityConfig::default());
        track.fail_next_apply();
        let outcome = controller
            .tick(&healthy(1_000_000), t0 + Duration::from_secs(2))
            .await;

        assert!(outcome.change.is_none());
        assert!(matches!(outcome.rolled_back, Some(QualityError::Apply { .. })));
        assert_eq!(controller.current_preset(), QualityPreset::Auto);
        assert_eq!(
            track.applied().last(),
            Some(&QualityPreset::Auto.constraints())
        );
    }

    #[tokio::test]
    async fn persistence_delays_the_switch() {
        let (mut controller, _track, t0) = started(QualityConfig {
            switch_persistence: 2,
            ..QualityConfig::default()
        });
        let first = controller
            .tick(&healthy(1_000_000), t0 + Duration::from_secs(2))
            .await;
        assert!(first.change.is_none());
        let second = controller
            .tick(&healthy(2_000_000), t0 + Duration::from_secs(4))
            .await;
        assert_eq!(second.change.map(|c| c.to), Some(QualityPreset::High));
    }

    #[tokio::test]
    async fn manual_preset_disables_auto_optimise() {
        let (mut controller, track, t0) = started(QualityConfig::default());
        let change = controller.set_preset(QualityPreset::Low).await.unwrap().unwrap();
        assert_eq!(change.constraints, QualityPreset::Low.constraints());
        assert!(!controller.auto_optimize());

        let outcome = controller
            .tick(&healthy(1_000_000), t0 + Duration::from_secs(2))
            .await;
        assert!(outcome.metrics.is_some());
        assert!(outcome.decision.is_none());
        assert_eq!(controller.current_preset(), QualityPreset::Low);
        assert_eq!(track.applied().len(), 1);

        let change = controller.optimize_now().await.unwrap().unwrap();
        assert_eq!(change.to, QualityPreset::High);
        assert!(controller.auto_optimize());
    }

    #[tokio::test]
    async fn cpu_limitation_is_tuned_once() {
        let (mut controller, track, t0) = started(QualityConfig::default());
        controller
            .tick(&healthy(1_000_000), t0 + Duration::from_secs(2))
            .await;
        assert_eq!(track.applied().len(), 1);

        let mut limited = healthy(2_000_000);
        if let Some(v) = limited.outbound_video.as_mut() {
            v.limitation_reason = LimitationReason::Cpu;
        }
        controller.tick(&limited, t0 + Duration::from_secs(4)).await;
        assert_eq!(track.applied().len(), 2);
        // smoothed ideal of 23 fps, less 5
        assert_eq!(track.applied()[1].frame_rate.ideal, 18);

        if let Some(v) = limited.outbound_video.as_mut() {
            v.bytes_sent = 3_000_000;
        }
        controller.tick(&limited, t0 + Duration::from_secs(6)).await;
        assert_eq!(track.applied().len(), 2);
    }

    #[tokio::test]
    async fn stop_returns_to_idle() {
        let (mut controller, _track, _t0) = started(QualityConfig::default());
        controller.stop();
        controller.stop();
        assert_eq!(controller.state(), ControllerState::Idle);
        assert!(matches!(
            controller.optimize_now().await,
            Err(QualityError::NotMonitoring)
        ));
    }
}
