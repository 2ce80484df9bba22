//! Seams to the real-time media stack.
//!
//! The call logic only ever talks to these traits. A browser-like stack, the
//! webrtc-rs backend and the in-memory loopback all plug in here.

use async_trait::async_trait;
use chatforyou_core::{IceCandidate, MediaConstraints, TransportStats, VideoConstraints};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Error)]
pub enum RtcError {
    /// Failure reported by the platform under a well-known name
    /// (`NotAllowedError`, `InvalidStateError`, ...).
    #[error("{name}: {message}")]
    Platform { name: String, message: String },
    #[error("connection closed")]
    Closed,
    #[error("{0}")]
    Other(String),
}

impl RtcError {
    pub fn platform(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Platform {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn other(msg: impl std::fmt::Display) -> Self {
        Self::Other(msg.to_string())
    }

    /// The platform failure name, or an empty string for non-platform errors.
    pub fn name(&self) -> &str {
        match self {
            RtcError::Platform { name, .. } => name,
            _ => "",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

pub type EndedCallback = Box<dyn FnOnce() + Send>;

#[async_trait]
pub trait MediaTrack: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    async fn apply_constraints(&self, constraints: &VideoConstraints) -> Result<(), RtcError>;
    fn stop(&self);
    fn is_live(&self) -> bool;
    /// Invoked once when the platform ends the track on its own, e.g. the
    /// user revoking a screen capture from the browser chrome.
    fn on_ended(&self, callback: EndedCallback);
}

pub type TrackRef = Arc<dyn MediaTrack>;

#[derive(Clone)]
pub struct MediaStream {
    pub id: String,
    pub tracks: Vec<TrackRef>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, tracks: Vec<TrackRef>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn video_track(&self) -> Option<TrackRef> {
        self.tracks
            .iter()
            .find(|t| t.kind() == TrackKind::Video)
            .cloned()
    }

    pub fn has_audio(&self) -> bool {
        self.tracks.iter().any(|t| t.kind() == TrackKind::Audio)
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

impl std::fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<&str> = self.tracks.iter().map(|t| t.id()).collect();
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field("tracks", &ids)
            .finish()
    }
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(&self, constraints: &MediaConstraints) -> Result<MediaStream, RtcError>;
    async fn get_display_media(&self, constraints: &VideoConstraints)
        -> Result<MediaStream, RtcError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ChannelState::Connecting => "connecting",
            ChannelState::Open => "open",
            ChannelState::Closing => "closing",
            ChannelState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;
    fn ready_state(&self) -> ChannelState;
    async fn send_text(&self, text: &str) -> Result<(), RtcError>;
}

#[async_trait]
pub trait RtcPeer: Send + Sync {
    /// Creates an offer and installs it as the local description.
    async fn create_offer(&self) -> Result<String, RtcError>;
    async fn set_remote_answer(&self, sdp: &str) -> Result<(), RtcError>;
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), RtcError>;
    async fn stats(&self) -> Result<TransportStats, RtcError>;
    /// Swaps the outgoing video without renegotiation. `None` sends nothing.
    async fn replace_video_track(&self, track: Option<TrackRef>) -> Result<(), RtcError>;
    fn data_channel(&self) -> Option<Arc<dyn DataChannel>>;
    async fn close(&self) -> Result<(), RtcError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerDirection {
    /// Publishes the local stream.
    SendRecv,
    /// Receives one remote participant's stream.
    RecvOnly,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PeerSpec {
    pub participant_id: String,
    pub direction: PeerDirection,
    pub local_stream: Option<MediaStream>,
    pub ice_servers: Vec<IceServer>,
}

/// Asynchronous notifications from a peer connection.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    LocalCandidate {
        participant_id: String,
        candidate: IceCandidate,
    },
    DataMessage {
        participant_id: String,
        text: String,
    },
    ChannelState {
        participant_id: String,
        state: ChannelState,
    },
    ConnectionFailed {
        participant_id: String,
        reason: String,
    },
    RemoteStream {
        participant_id: String,
        stream_id: String,
    },
}

pub type PeerEventSink = mpsc::UnboundedSender<PeerEvent>;

#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(
        &self,
        spec: PeerSpec,
        events: PeerEventSink,
    ) -> Result<Arc<dyn RtcPeer>, RtcError>;
}
