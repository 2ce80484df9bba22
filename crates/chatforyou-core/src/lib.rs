//! Core call-control algorithms for ChatForYou.
//!
//! Everything in this crate is synchronous and free of IO: the client crate
//! feeds it statistics, signaling order and recognised speech, and applies the
//! decisions it returns.

#![forbid(unsafe_code)]

pub mod caption;
pub mod media;
pub mod negotiation;
pub mod quality;
pub mod stats;

pub use media::{
    AudioConstraints, ConstraintRange, MediaConstraints, PermissionError, PermissionErrorKind,
    VideoConstraints,
};
pub use negotiation::{CandidateBuffer, IceCandidate, NegotiationState};
pub use quality::{
    decide_preset, limitation_adjustment, optimisation_advice, performance_warnings,
    smooth_transition, DeviceEstimator, NetworkEstimator, PerformanceWarning, QualityAssessor,
    QualityDecision, QualityPreset, QualityTier, SwitchPersistence, WarningSeverity,
};
pub use stats::{LimitationReason, OutboundVideoStats, QualityMetrics, StatsSampler, TransportStats};
pub use caption::{CaptionConfig, CaptionFilter, CaptionRejection};
