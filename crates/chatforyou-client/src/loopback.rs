//! In-memory media backend.
//!
//! Peers answer their own offers, channels open as soon as an answer is
//! applied and capture devices hand out inert tracks. Used by the test suite
//! and by the binary when no real media stack is compiled in.

use crate::rtc::{
    ChannelState, DataChannel, EndedCallback, MediaDevices, MediaStream, MediaTrack, PeerDirection,
    PeerEvent, PeerEventSink, PeerFactory, PeerSpec, RtcError, RtcPeer, TrackKind, TrackRef,
};
use async_trait::async_trait;
use chatforyou_core::{IceCandidate, MediaConstraints, TransportStats, VideoConstraints};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct LoopbackTrack {
    id: String,
    kind: TrackKind,
    live: AtomicBool,
    fail_next_apply: AtomicBool,
    applied: Mutex<Vec<VideoConstraints>>,
    ended: Mutex<Option<EndedCallback>>,
}

impl LoopbackTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            live: AtomicBool::new(true),
            fail_next_apply: AtomicBool::new(false),
            applied: Mutex::new(Vec::new()),
            ended: Mutex::new(None),
        }
    }

    /// Constraint sets successfully applied so far.
    pub fn applied(&self) -> Vec<VideoConstraints> {
        lock(&self.applied).clone()
    }

    pub fn fail_next_apply(&self) {
        self.fail_next_apply.store(true, Ordering::SeqCst);
    }

    /// Ends the track as the platform would, firing the ended callback.
    pub fn end(&self) {
        self.live.store(false, Ordering::SeqCst);
        let callback = lock(&self.ended).take();
        if let Some(callback) = callback {
            callback();
        }
    }
}

#[async_trait]
impl MediaTrack for LoopbackTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    async fn apply_constraints(&self, constraints: &VideoConstraints) -> Result<(), RtcError> {
        if self.fail_next_apply.swap(false, Ordering::SeqCst) {
            return Err(RtcError::platform(
                "OverconstrainedError",
                "constraints cannot be satisfied",
            ));
        }
        lock(&self.applied).push(*constraints);
        Ok(())
    }

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn on_ended(&self, callback: EndedCallback) {
        *lock(&self.ended) = Some(callback);
    }
}

/// Capture devices that always succeed unless told to fail with a given
/// platform error name.
#[derive(Default)]
pub struct LoopbackDevices {
    deny_audio: Option<String>,
    deny_video: Option<String>,
    deny_display: Option<String>,
    counter: AtomicUsize,
    issued: Mutex<Vec<Arc<LoopbackTrack>>>,
}

impl LoopbackDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny_audio(mut self, name: &str) -> Self {
        self.deny_audio = Some(name.to_string());
        self
    }

    pub fn deny_video(mut self, name: &str) -> Self {
        self.deny_video = Some(name.to_string());
        self
    }

    pub fn deny_display(mut self, name: &str) -> Self {
        self.deny_display = Some(name.to_string());
        self
    }

    /// Every track handed out, in order.
    pub fn issued(&self) -> Vec<Arc<LoopbackTrack>> {
        lock(&self.issued).clone()
    }

    fn issue(&self, prefix: &str, kind: TrackKind) -> TrackRef {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let track = Arc::new(LoopbackTrack::new(format!("{prefix}-{n}"), kind));
        lock(&self.issued).push(track.clone());
        track
    }
}

#[async_trait]
impl MediaDevices for LoopbackDevices {
    async fn get_user_media(&self, constraints: &MediaConstraints) -> Result<MediaStream, RtcError> {
        if let (Some(_), Some(name)) = (&constraints.audio, &self.deny_audio) {
            return Err(RtcError::platform(name.as_str(), "microphone request failed"));
        }
        if let (Some(_), Some(name)) = (&constraints.video, &self.deny_video) {
            return Err(RtcError::platform(name.as_str(), "camera request failed"));
        }

        let mut tracks = Vec::new();
        if constraints.audio.is_some() {
            tracks.push(self.issue("audio", TrackKind::Audio));
        }
        if constraints.video.is_some() {
            tracks.push(self.issue("camera", TrackKind::Video));
        }
        let n = self.counter.load(Ordering::SeqCst);
        Ok(MediaStream::new(format!("local-{n}"), tracks))
    }

    async fn get_display_media(
        &self,
        _constraints: &VideoConstraints,
    ) -> Result<MediaStream, RtcError> {
        if let Some(name) = &self.deny_display {
            return Err(RtcError::platform(name.as_str(), "display capture failed"));
        }
        let track = self.issue("display", TrackKind::Video);
        Ok(MediaStream::new(format!("screen-{}", track.id()), vec![track]))
    }
}

pub struct LoopbackChannel {
    label: String,
    state: Mutex<ChannelState>,
    sent: Mutex<Vec<String>>,
}

impl LoopbackChannel {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            state: Mutex::new(ChannelState::Connecting),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn set_state(&self, state: ChannelState) {
        *lock(&self.state) = state;
    }

    pub fn sent(&self) -> Vec<String> {
        lock(&self.sent).clone()
    }
}

#[async_trait]
impl DataChannel for LoopbackChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn ready_state(&self) -> ChannelState {
        *lock(&self.state)
    }

    async fn send_text(&self, text: &str) -> Result<(), RtcError> {
        if self.ready_state() != ChannelState::Open {
            return Err(RtcError::platform("InvalidStateError", "channel is not open"));
        }
        lock(&self.sent).push(text.to_string());
        Ok(())
    }
}

pub struct LoopbackPeer {
    participant_id: String,
    direction: PeerDirection,
    events: PeerEventSink,
    channel: Arc<LoopbackChannel>,
    hub: Arc<HubState>,
    video_track: Mutex<Option<String>>,
    remote_answer: Mutex<Option<String>>,
    applied: Mutex<Vec<IceCandidate>>,
    closes: AtomicUsize,
}

impl LoopbackPeer {
    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    pub fn direction(&self) -> PeerDirection {
        self.direction
    }

    pub fn channel(&self) -> Arc<LoopbackChannel> {
        self.channel.clone()
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.applied).clone()
    }

    pub fn remote_answer(&self) -> Option<String> {
        lock(&self.remote_answer).clone()
    }

    pub fn video_track_id(&self) -> Option<String> {
        lock(&self.video_track).clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl RtcPeer for LoopbackPeer {
    async fn create_offer(&self) -> Result<String, RtcError> {
        self.emit(PeerEvent::LocalCandidate {
            participant_id: self.participant_id.clone(),
            candidate: IceCandidate {
                candidate: format!("candidate:1 1 udp 2122260223 127.0.0.1 9 typ host ufrag {}", self.participant_id),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            },
        });
        Ok(format!("v=0 offer {}", self.participant_id))
    }

    async fn set_remote_answer(&self, sdp: &str) -> Result<(), RtcError> {
        if lock(&self.hub.failing_answers).contains(&self.participant_id) {
            return Err(RtcError::platform("InvalidAccessError", "malformed answer"));
        }
        *lock(&self.remote_answer) = Some(sdp.to_string());
        self.channel.set_state(ChannelState::Open);
        self.emit(PeerEvent::ChannelState {
            participant_id: self.participant_id.clone(),
            state: ChannelState::Open,
        });
        if self.direction == PeerDirection::RecvOnly {
            self.emit(PeerEvent::RemoteStream {
                participant_id: self.participant_id.clone(),
                stream_id: format!("remote-{}", self.participant_id),
            });
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), RtcError> {
        lock(&self.applied).push(candidate.clone());
        Ok(())
    }

    async fn stats(&self) -> Result<TransportStats, RtcError> {
        Ok(lock(&self.hub.stats)
            .get(&self.participant_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn replace_video_track(&self, track: Option<TrackRef>) -> Result<(), RtcError> {
        if self.closes.load(Ordering::SeqCst) > 0 {
            return Err(RtcError::Closed);
        }
        *lock(&self.video_track) = track.map(|t| t.id().to_string());
        Ok(())
    }

    fn data_channel(&self) -> Option<Arc<dyn DataChannel>> {
        Some(self.channel.clone())
    }

    async fn close(&self) -> Result<(), RtcError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.channel.set_state(ChannelState::Closed);
        debug!(participant = %self.participant_id, "loopback peer closed");
        Ok(())
    }
}

#[derive(Default)]
struct HubState {
    peers: Mutex<HashMap<String, Arc<LoopbackPeer>>>,
    failing_answers: Mutex<HashSet<String>>,
    stats: Mutex<HashMap<String, TransportStats>>,
}

/// Shared view over every loopback peer created through its factory.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<HubState>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory(&self) -> LoopbackPeerFactory {
        LoopbackPeerFactory {
            hub: self.state.clone(),
        }
    }

    /// Latest peer created for `participant_id`.
    pub fn peer(&self, participant_id: &str) -> Option<Arc<LoopbackPeer>> {
        lock(&self.state.peers).get(participant_id).cloned()
    }

    pub fn fail_answers_for(&self, participant_id: &str) {
        lock(&self.state.failing_answers).insert(participant_id.to_string());
    }

    pub fn set_stats(&self, participant_id: &str, stats: TransportStats) {
        lock(&self.state.stats).insert(participant_id.to_string(), stats);
    }

    /// Delivers `text` as if it arrived on the participant's data channel.
    pub fn inject_data(&self, participant_id: &str, text: &str) -> bool {
        match self.peer(participant_id) {
            Some(peer) => {
                peer.emit(PeerEvent::DataMessage {
                    participant_id: participant_id.to_string(),
                    text: text.to_string(),
                });
                true
            }
            None => false,
        }
    }

    /// Reports the participant's connection as failed.
    pub fn fail_connection(&self, participant_id: &str, reason: &str) -> bool {
        match self.peer(participant_id) {
            Some(peer) => {
                peer.emit(PeerEvent::ConnectionFailed {
                    participant_id: participant_id.to_string(),
                    reason: reason.to_string(),
                });
                true
            }
            None => false,
        }
    }

    /// Texts sent over the participant's data channel.
    pub fn sent_data(&self, participant_id: &str) -> Vec<String> {
        self.peer(participant_id)
            .map(|p| p.channel.sent())
            .unwrap_or_default()
    }
}

pub struct LoopbackPeerFactory {
    hub: Arc<HubState>,
}

#[async_trait]
impl PeerFactory for LoopbackPeerFactory {
    async fn create(
        &self,
        spec: PeerSpec,
        events: PeerEventSink,
    ) -> Result<Arc<dyn RtcPeer>, RtcError> {
        let video_track = spec
            .local_stream
            .as_ref()
            .and_then(|s| s.video_track())
            .map(|t| t.id().to_string());
        let peer = Arc::new(LoopbackPeer {
            channel: Arc::new(LoopbackChannel::new(format!("data-{}", spec.participant_id))),
            participant_id: spec.participant_id,
            direction: spec.direction,
            events,
            hub: self.hub.clone(),
            video_track: Mutex::new(video_track),
            remote_answer: Mutex::new(None),
            applied: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
        });
        lock(&self.hub.peers).insert(peer.participant_id.clone(), peer.clone());
        Ok(peer)
    }
}
