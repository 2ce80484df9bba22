//! Local media acquisition with an explicit degraded outcome.

use crate::rtc::{
    EndedCallback, MediaDevices, MediaStream, MediaTrack, RtcError, TrackKind, TrackRef,
};
use async_trait::async_trait;
use chatforyou_core::{MediaConstraints, PermissionError, VideoConstraints};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of asking the devices for local media.
#[derive(Debug, Clone)]
pub enum MediaResult {
    Granted(MediaStream),
    /// Audio was granted but video was not; the stream carries a synthetic
    /// placeholder video track instead.
    Degraded { stream: MediaStream, reason: String },
    Denied(PermissionError),
}

impl MediaResult {
    pub fn stream(&self) -> Option<&MediaStream> {
        match self {
            MediaResult::Granted(stream) | MediaResult::Degraded { stream, .. } => Some(stream),
            MediaResult::Denied(_) => None,
        }
    }
}

pub trait SyntheticTrackFactory: Send + Sync {
    fn placeholder_video(&self) -> TrackRef;
}

/// Produces a blank video track so the peer still negotiates video.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaceholderVideoFactory;

impl SyntheticTrackFactory for PlaceholderVideoFactory {
    fn placeholder_video(&self) -> TrackRef {
        Arc::new(SyntheticVideoTrack::new(format!(
            "placeholder-{}",
            uuid::Uuid::new_v4()
        )))
    }
}

pub struct SyntheticVideoTrack {
    id: String,
    live: AtomicBool,
}

impl SyntheticVideoTrack {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            live: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl MediaTrack for SyntheticVideoTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        TrackKind::Video
    }

    async fn apply_constraints(&self, _constraints: &VideoConstraints) -> Result<(), RtcError> {
        Ok(())
    }

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    // never ended by the platform
    fn on_ended(&self, _callback: EndedCallback) {}
}

/// Checks microphone access before anything else is requested. The test
/// stream is released right away.
pub async fn check_audio_permission(devices: &dyn MediaDevices) -> Result<(), PermissionError> {
    match devices.get_user_media(&MediaConstraints::audio_only()).await {
        Ok(stream) => {
            stream.stop_all();
            Ok(())
        }
        Err(e) => Err(permission_error(&e)),
    }
}

/// Requests `constraints`; when video fails, retries audio-only and fills the
/// video slot with a synthetic track.
pub async fn acquire_media(
    devices: &dyn MediaDevices,
    constraints: &MediaConstraints,
    synthetic: &dyn SyntheticTrackFactory,
) -> MediaResult {
    let first = match devices.get_user_media(constraints).await {
        Ok(stream) => {
            info!(stream = %stream.id, tracks = stream.tracks.len(), "local media granted");
            return MediaResult::Granted(stream);
        }
        Err(e) => e,
    };

    if constraints.video.is_none() {
        return MediaResult::Denied(permission_error(&first));
    }

    warn!("camera unavailable, retrying audio only: {}", first);
    match devices.get_user_media(&constraints.without_video()).await {
        Ok(mut stream) => {
            stream.tracks.push(synthetic.placeholder_video());
            MediaResult::Degraded {
                stream,
                reason: first.to_string(),
            }
        }
        Err(e) => MediaResult::Denied(permission_error(&e)),
    }
}

fn permission_error(error: &RtcError) -> PermissionError {
    match error {
        RtcError::Platform { name, message } => PermissionError::from_platform(name, message.clone()),
        other => PermissionError::from_platform("", other.to_string()),
    }
}
