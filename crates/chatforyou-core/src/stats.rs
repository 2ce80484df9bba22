//! Transport statistics snapshots and per-interval quality metrics.

use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Why the encoder is currently holding quality back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitationReason {
    #[default]
    None,
    Cpu,
    Bandwidth,
    Other,
}

impl LimitationReason {
    pub fn parse(value: &str) -> Self {
        match value {
            "" | "none" => LimitationReason::None,
            "cpu" => LimitationReason::Cpu,
            "bandwidth" => LimitationReason::Bandwidth,
            _ => LimitationReason::Other,
        }
    }
}

/// Cumulative counters of the outbound video stream, as reported by the stack.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutboundVideoStats {
    pub bytes_sent: u64,
    pub packets_sent: u64,
    pub packets_lost: u64,
    /// Seconds.
    pub jitter: f64,
    pub frames_per_second: f64,
    pub frames_encoded: u64,
    pub frames_sent: u64,
    /// Seconds spent encoding since the stream started.
    pub total_encode_time: f64,
    pub limitation_reason: LimitationReason,
}

/// One statistics pull from a peer connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransportStats {
    pub outbound_video: Option<OutboundVideoStats>,
    /// Round-trip time of the selected candidate pair, in seconds.
    pub round_trip_time: Option<f64>,
}

/// Derived metrics for one sampling interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub bitrate_kbps: f64,
    pub frame_rate: f64,
    /// Packets lost during the interval.
    pub packets_lost: u64,
    pub rtt_ms: f64,
    /// Seconds.
    pub jitter: f64,
    pub frame_drop_rate_pct: f64,
    pub avg_encode_time_ms: f64,
    pub limitation_reason: LimitationReason,
}

/// Turns cumulative counters into interval metrics.
#[derive(Debug, Clone)]
pub struct StatsSampler {
    last_bytes_sent: u64,
    last_packets_lost: u64,
    last_at: Instant,
}

impl StatsSampler {
    pub fn new(started_at: Instant) -> Self {
        Self {
            last_bytes_sent: 0,
            last_packets_lost: 0,
            last_at: started_at,
        }
    }

    /// Takes the current counters as the baseline without producing metrics,
    /// so traffic from before monitoring began is not counted.
    pub fn prime(&mut self, stats: &TransportStats, now: Instant) {
        if let Some(outbound) = &stats.outbound_video {
            self.last_bytes_sent = outbound.bytes_sent;
            self.last_packets_lost = outbound.packets_lost;
        }
        self.last_at = now;
    }

    /// Returns `None` when there is no outbound video or no time has elapsed.
    pub fn sample(&mut self, stats: &TransportStats, now: Instant) -> Option<QualityMetrics> {
        let outbound = stats.outbound_video.as_ref()?;
        let elapsed = now.checked_duration_since(self.last_at)?.as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }

        let bytes = outbound.bytes_sent.saturating_sub(self.last_bytes_sent);
        let lost = outbound.packets_lost.saturating_sub(self.last_packets_lost);
        self.last_bytes_sent = outbound.bytes_sent;
        self.last_packets_lost = outbound.packets_lost;
        self.last_at = now;

        Some(QualityMetrics {
            bitrate_kbps: (bytes as f64 * 8.0) / (elapsed * 1000.0),
            frame_rate: outbound.frames_per_second,
            packets_lost: lost,
            rtt_ms: stats.round_trip_time.unwrap_or(0.0) * 1000.0,
            jitter: outbound.jitter,
            frame_drop_rate_pct: frame_drop_rate_pct(outbound),
            avg_encode_time_ms: avg_encode_time_ms(outbound),
            limitation_reason: outbound.limitation_reason,
        })
    }
}

/// Share of encoded frames that never left the sender.
pub fn frame_drop_rate_pct(stats: &OutboundVideoStats) -> f64 {
    if stats.frames_sent == 0 || stats.frames_encoded == 0 {
        return 0.0;
    }
    let encoded = stats.frames_encoded as f64;
    ((encoded - stats.frames_sent as f64) / encoded * 100.0).max(0.0)
}

pub fn avg_encode_time_ms(stats: &OutboundVideoStats) -> f64 {
    let frames = stats.frames_encoded.max(1) as f64;
    stats.total_encode_time * 1000.0 / frames
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn outbound(bytes_sent: u64, packets_lost: u64) -> TransportStats {
        TransportStats {
            outbound_video: Some(OutboundVideoStats {
                bytes_sent,
                packets_lost,
                frames_per_second: 24.0,
                frames_encoded: 200,
                frames_sent: 190,
                total_encode_time: 3.0,
                ..Default::default()
            }),
            round_trip_time: Some(0.12),
        }
    }

    #[test]
    fn bitrate_and_loss_are_per_interval() {
        let start = Instant::now();
        let mut sampler = StatsSampler::new(start);

        let first = sampler
            .sample(&outbound(500_000, 10), start + Duration::from_secs(2))
            .unwrap();
        assert!((first.bitrate_kbps - 2000.0).abs() < 1e-6);
        assert_eq!(first.packets_lost, 10);

        let second = sampler
            .sample(&outbound(750_000, 12), start + Duration::from_secs(4))
            .unwrap();
        assert!((second.bitrate_kbps - 1000.0).abs() < 1e-6);
        assert_eq!(second.packets_lost, 2);
        assert!((second.rtt_ms - 120.0).abs() < 1e-6);
    }

    #[test]
    fn primed_baseline_excludes_earlier_traffic() {
        let start = Instant::now();
        let mut sampler = StatsSampler::new(start);
        sampler.prime(&outbound(4_000_000, 90), start + Duration::from_secs(60));

        let m = sampler
            .sample(&outbound(4_250_000, 91), start + Duration::from_secs(62))
            .unwrap();
        assert!((m.bitrate_kbps - 1000.0).abs() < 1e-6);
        assert_eq!(m.packets_lost, 1);
    }

    #[test]
    fn encoder_ratios() {
        let stats = outbound(0, 0).outbound_video.unwrap();
        assert!((frame_drop_rate_pct(&stats) - 5.0).abs() < 1e-9);
        assert!((avg_encode_time_ms(&stats) - 15.0).abs() < 1e-9);
    }

    #[test]
    fn missing_outbound_or_no_elapsed_time_yields_nothing() {
        let start = Instant::now();
        let mut sampler = StatsSampler::new(start);
        assert!(sampler
            .sample(&TransportStats::default(), start + Duration::from_secs(2))
            .is_none());
        assert!(sampler.sample(&outbound(10, 0), start).is_none());
    }

    #[test]
    fn limitation_reason_parsing() {
        assert_eq!(LimitationReason::parse("cpu"), LimitationReason::Cpu);
        assert_eq!(
            LimitationReason::parse("bandwidth"),
            LimitationReason::Bandwidth
        );
        assert_eq!(LimitationReason::parse("none"), LimitationReason::None);
        assert_eq!(LimitationReason::parse("thermal"), LimitationReason::Other);
    }
}
