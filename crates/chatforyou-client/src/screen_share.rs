use crate::quality::QualityController;
use crate::rtc::{MediaDevices, MediaStream, RtcError, RtcPeer, TrackRef};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ScreenShareError {
    #[error("screen capture permission denied")]
    PermissionDenied,
    #[error("no screen or window available to capture")]
    NoSource,
    #[error("screen capture is not supported here")]
    Unsupported,
    #[error("screen sharing is already active")]
    AlreadyActive,
    #[error("no outbound connection to share on")]
    NoConnection,
    #[error("screen sharing failed: {0}")]
    Other(String),
}

impl From<RtcError> for ScreenShareError {
    fn from(error: RtcError) -> Self {
        match error.name() {
            "NotAllowedError" => ScreenShareError::PermissionDenied,
            "NotFoundError" => ScreenShareError::NoSource,
            "NotSupportedError" => ScreenShareError::Unsupported,
            _ => ScreenShareError::Other(error.to_string()),
        }
    }
}

struct ActiveShare {
    capture: MediaStream,
    camera: Option<TrackRef>,
}

/// Lifecycle of one outbound screen capture.
///
/// The capture replaces the camera on the outbound connection without
/// renegotiating. Every teardown path goes through
/// [`ScreenShareSession::stop`], the only place the capture is released.
pub struct ScreenShareSession {
    active: Option<ActiveShare>,
    ended_tx: mpsc::UnboundedSender<String>,
}

impl ScreenShareSession {
    /// `ended_tx` receives the capture stream id when the platform ends the
    /// capture on its own.
    pub fn new(ended_tx: mpsc::UnboundedSender<String>) -> Self {
        Self {
            active: None,
            ended_tx,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn stream_id(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.capture.id.as_str())
    }

    pub async fn start(
        &mut self,
        devices: &dyn MediaDevices,
        peer: Option<&dyn RtcPeer>,
        camera: Option<TrackRef>,
        controller: &mut QualityController,
        now: Instant,
    ) -> Result<String, ScreenShareError> {
        if self.active.is_some() {
            return Err(ScreenShareError::AlreadyActive);
        }
        let peer = peer.ok_or(ScreenShareError::NoConnection)?;

        let envelope = controller.current_preset().constraints();
        let capture = devices.get_display_media(&envelope).await?;
        let Some(track) = capture.video_track() else {
            capture.stop_all();
            return Err(ScreenShareError::Other("capture has no video track".into()));
        };

        if let Err(e) = peer.replace_video_track(Some(track.clone())).await {
            capture.stop_all();
            return Err(ScreenShareError::Other(format!("replacing outbound track: {e}")));
        }

        let stream_id = capture.id.clone();
        let ended_tx = self.ended_tx.clone();
        let ended_id = stream_id.clone();
        track.on_ended(Box::new(move || {
            let _ = ended_tx.send(ended_id);
        }));

        controller.start(track, now);
        info!(stream = %stream_id, preset = %controller.current_preset(), "screen share started");
        self.active = Some(ActiveShare { capture, camera });
        Ok(stream_id)
    }

    /// Restores the camera, releases the capture and halts monitoring.
    /// Returns `false` when nothing was being shared.
    pub async fn stop(
        &mut self,
        peer: Option<&dyn RtcPeer>,
        controller: &mut QualityController,
    ) -> bool {
        let Some(share) = self.active.take() else {
            return false;
        };
        controller.stop();

        if let Some(peer) = peer {
            if let Err(e) = peer.replace_video_track(share.camera).await {
                warn!("failed to restore camera track: {}", e);
            }
        }
        share.capture.stop_all();
        info!(stream = %share.capture.id, "screen share stopped");
        true
    }
}

impl std::fmt::Debug for ScreenShareSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScreenShareSession")
            .field("stream", &self.stream_id())
            .finish()
    }
}
