//! Capture constraints and classification of capture failures.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One numeric constraint with an ideal target and optional bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintRange {
    pub ideal: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<u32>,
    pub max: u32,
}

impl ConstraintRange {
    pub const fn new(ideal: u32, max: u32) -> Self {
        Self {
            ideal,
            min: None,
            max,
        }
    }

    pub const fn with_min(ideal: u32, min: u32, max: u32) -> Self {
        Self {
            ideal,
            min: Some(min),
            max,
        }
    }
}

/// Resolution and frame-rate envelope for a video track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoConstraints {
    pub width: ConstraintRange,
    pub height: ConstraintRange,
    pub frame_rate: ConstraintRange,
}

impl VideoConstraints {
    /// Camera envelope requested once microphone access is confirmed.
    pub const fn camera() -> Self {
        Self {
            width: ConstraintRange::new(1280, 1920),
            height: ConstraintRange::new(720, 1080),
            frame_rate: ConstraintRange::with_min(30, 15, 30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioConstraints {
    pub auto_gain_control: bool,
    pub channel_count: u8,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub sample_rate: u32,
    pub sample_size: u8,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            auto_gain_control: true,
            channel_count: 2,
            echo_cancellation: true,
            noise_suppression: true,
            sample_rate: 48_000,
            sample_size: 16,
        }
    }
}

/// What to ask the capture devices for.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: Option<AudioConstraints>,
    pub video: Option<VideoConstraints>,
}

impl MediaConstraints {
    pub fn audio_only() -> Self {
        Self {
            audio: Some(AudioConstraints::default()),
            video: None,
        }
    }

    pub fn audio_video() -> Self {
        Self {
            audio: Some(AudioConstraints::default()),
            video: Some(VideoConstraints::camera()),
        }
    }

    pub fn without_video(self) -> Self {
        Self {
            video: None,
            ..self
        }
    }
}

/// User-facing categories of device access failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionErrorKind {
    PermissionDenied,
    NoDevice,
    DeviceBusy,
    ConstraintError,
    Unknown,
}

impl PermissionErrorKind {
    /// Maps a platform capture failure name (`NotAllowedError`, ...) to a category.
    pub fn classify(platform_name: &str) -> Self {
        match platform_name {
            "NotAllowedError" | "PermissionDeniedError" | "SecurityError" => {
                PermissionErrorKind::PermissionDenied
            }
            "NotFoundError" | "DevicesNotFoundError" => PermissionErrorKind::NoDevice,
            "NotReadableError" | "TrackStartError" | "AbortError" => {
                PermissionErrorKind::DeviceBusy
            }
            "ConstraintNotSatisfiedError" | "OverconstrainedError" => {
                PermissionErrorKind::ConstraintError
            }
            _ => PermissionErrorKind::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionErrorKind::PermissionDenied => "permission_denied",
            PermissionErrorKind::NoDevice => "no_device",
            PermissionErrorKind::DeviceBusy => "device_busy",
            PermissionErrorKind::ConstraintError => "constraint_error",
            PermissionErrorKind::Unknown => "unknown",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            PermissionErrorKind::PermissionDenied => "Microphone permission is required",
            PermissionErrorKind::NoDevice => "No microphone found",
            PermissionErrorKind::DeviceBusy => "Microphone is in use",
            PermissionErrorKind::ConstraintError => "Requested audio settings are unsupported",
            PermissionErrorKind::Unknown => "Audio device problem",
        }
    }

    /// Remediation steps shown alongside the error.
    pub fn guidance(&self) -> &'static [&'static str] {
        match self {
            PermissionErrorKind::PermissionDenied => &[
                "Allow microphone access for this site in the browser settings",
                "Reload the page after changing the permission",
            ],
            PermissionErrorKind::NoDevice => &[
                "Check that a microphone is connected",
                "Check whether another program has claimed the microphone",
                "Make sure the microphone is enabled in the system settings",
            ],
            PermissionErrorKind::DeviceBusy => &[
                "Close other conferencing programs",
                "Close audio recording programs",
                "Stop using the microphone in other browser tabs",
            ],
            PermissionErrorKind::ConstraintError => &[
                "Select a different input device",
                "Retry with default audio settings",
            ],
            PermissionErrorKind::Unknown => &["Check the microphone settings and try again"],
        }
    }
}

impl std::fmt::Display for PermissionErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device access failure, classified for the user-facing layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {detail}")]
pub struct PermissionError {
    pub kind: PermissionErrorKind,
    pub detail: String,
}

impl PermissionError {
    pub fn new(kind: PermissionErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    /// Builds the error from the platform failure name and message.
    pub fn from_platform(name: &str, message: impl Into<String>) -> Self {
        Self::new(PermissionErrorKind::classify(name), message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_platform_failures() {
        assert_eq!(
            PermissionErrorKind::classify("NotAllowedError"),
            PermissionErrorKind::PermissionDenied
        );
        assert_eq!(
            PermissionErrorKind::classify("NotFoundError"),
            PermissionErrorKind::NoDevice
        );
        assert_eq!(
            PermissionErrorKind::classify("NotReadableError"),
            PermissionErrorKind::DeviceBusy
        );
        assert_eq!(
            PermissionErrorKind::classify("ConstraintNotSatisfiedError"),
            PermissionErrorKind::ConstraintError
        );
        assert_eq!(
            PermissionErrorKind::classify("SomethingElse"),
            PermissionErrorKind::Unknown
        );
    }

    #[test]
    fn every_category_has_guidance() {
        for kind in [
            PermissionErrorKind::PermissionDenied,
            PermissionErrorKind::NoDevice,
            PermissionErrorKind::DeviceBusy,
            PermissionErrorKind::ConstraintError,
            PermissionErrorKind::Unknown,
        ] {
            assert!(!kind.guidance().is_empty());
            assert!(!kind.title().is_empty());
        }
    }

    #[test]
    fn without_video_keeps_audio_settings() {
        let constraints = MediaConstraints::audio_video().without_video();
        assert!(constraints.video.is_none());
        assert_eq!(constraints.audio, Some(AudioConstraints::default()));
    }
}
