//! ChatForYou call client.
//!
//! Joins a room over websocket signaling, keeps one outbound peer connection
//! for the local stream plus one inbound connection per remote participant,
//! multiplexes chat, files, game events and captions over a single data
//! channel, and adapts screen-share quality to measured conditions.
//!
//! The media stack sits behind the traits in [`rtc`]. The [`loopback`]
//! backend runs everything in memory; the `webrtc-rs` feature adds a real
//! one.

#![forbid(unsafe_code)]

pub mod backend;
pub mod config;
pub mod datachannel;
pub mod http;
pub mod loopback;
pub mod media;
pub mod peer;
pub mod quality;
pub mod registry;
pub mod rtc;
pub mod screen_share;
pub mod session;
pub mod signaling;

pub use config::{signaling_url, ClientConfig};
pub use datachannel::{ChannelSender, DataChannelError, DataChannelMultiplexer};
pub use http::{ApiClient, RoomIdentity};
pub use media::{acquire_media, check_audio_permission, MediaResult, PlaceholderVideoFactory};
pub use peer::{NegotiationError, PeerConnectionManager};
pub use quality::{ControllerState, QualityConfig, QualityController, QualityError};
pub use registry::{Participant, ParticipantRegistry};
pub use screen_share::{ScreenShareError, ScreenShareSession};
pub use session::{
    CallSession, LeaveReason, SessionCommand, SessionDeps, SessionEvent, SessionHandle,
};
pub use signaling::{SignalEvent, SignalingChannel, SignalingError, SignalingSender};
