//! Peer connections on top of webrtc-rs.
//!
//! The outbound connection carries one Opus and one VP8 sample track. Frames
//! are written into those tracks by whoever owns the encoder; the abstract
//! [`TrackRef`] passed to [`RtcPeer::replace_video_track`] only decides whether
//! the video sender is live and which source it reports.

use crate::rtc::{
    ChannelState, DataChannel, IceServer, PeerDirection, PeerEvent, PeerEventSink, PeerFactory,
    PeerSpec, RtcError, RtcPeer, TrackRef,
};
use anyhow::Result;
use async_trait::async_trait;
use chatforyou_core::{IceCandidate, OutboundVideoStats, TransportStats};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

const DATA_CHANNEL_LABEL: &str = "chatforyou";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn rtc_error(error: webrtc::Error) -> RtcError {
    match error {
        webrtc::Error::ErrConnectionClosed => RtcError::Closed,
        other => RtcError::other(other),
    }
}

impl From<IceServer> for RTCIceServer {
    fn from(server: IceServer) -> Self {
        RTCIceServer {
            urls: server.urls,
            username: server.username.unwrap_or_default(),
            credential: server.credential.unwrap_or_default(),
            ..Default::default()
        }
    }
}

fn channel_state(state: RTCDataChannelState) -> ChannelState {
    match state {
        RTCDataChannelState::Open => ChannelState::Open,
        RTCDataChannelState::Closing => ChannelState::Closing,
        RTCDataChannelState::Closed => ChannelState::Closed,
        _ => ChannelState::Connecting,
    }
}

pub struct WebRtcDataChannel {
    label: String,
    inner: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for WebRtcDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn ready_state(&self) -> ChannelState {
        channel_state(self.inner.ready_state())
    }

    async fn send_text(&self, text: &str) -> Result<(), RtcError> {
        self.inner
            .send_text(text.to_string())
            .await
            .map(|_| ())
            .map_err(rtc_error)
    }
}

pub struct WebRtcPeer {
    participant_id: String,
    pc: Arc<RTCPeerConnection>,
    channel: Arc<WebRtcDataChannel>,
    video: Option<(Arc<RTCRtpSender>, Arc<TrackLocalStaticSample>)>,
    video_source: Mutex<Option<String>>,
}

impl WebRtcPeer {
    /// Sample track feeding the outbound video sender, if this connection
    /// publishes.
    pub fn outbound_video(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.video.as_ref().map(|(_, track)| track.clone())
    }

    /// Id of the abstract track currently selected as video source.
    pub fn video_source(&self) -> Option<String> {
        lock(&self.video_source).clone()
    }
}

#[async_trait]
impl RtcPeer for WebRtcPeer {
    async fn create_offer(&self) -> Result<String, RtcError> {
        let offer = self.pc.create_offer(None).await.map_err(rtc_error)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(rtc_error)?;
        Ok(offer.sdp)
    }

    async fn set_remote_answer(&self, sdp: &str) -> Result<(), RtcError> {
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| RtcError::platform("InvalidAccessError", e.to_string()))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(rtc_error)
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), RtcError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate.clone(),
                sdp_mid: candidate.sdp_mid.clone(),
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(rtc_error)
    }

    async fn stats(&self) -> Result<TransportStats, RtcError> {
        let report = self.pc.get_stats().await;
        let mut stats = TransportStats::default();
        let mut video = OutboundVideoStats::default();
        let mut seen_video = false;

        for entry in report.reports.values() {
            match entry {
                StatsReportType::OutboundRTP(rtp) if rtp.kind == "video" => {
                    seen_video = true;
                    video.bytes_sent += rtp.bytes_sent;
                    video.packets_sent += rtp.packets_sent;
                }
                StatsReportType::RemoteInboundRTP(remote) if remote.kind == "video" => {
                    video.packets_lost += remote.packets_lost.max(0) as u64;
                    if remote.round_trip_time.is_some() {
                        stats.round_trip_time = remote.round_trip_time;
                    }
                }
                _ => {}
            }
        }

        if seen_video {
            stats.outbound_video = Some(video);
        }
        Ok(stats)
    }

    async fn replace_video_track(&self, track: Option<TrackRef>) -> Result<(), RtcError> {
        let Some((sender, local)) = &self.video else {
            return Err(RtcError::platform(
                "InvalidStateError",
                "connection does not publish video",
            ));
        };
        let source = track.map(|t| t.id().to_string());
        let replacement = source
            .as_ref()
            .map(|_| local.clone() as Arc<dyn TrackLocal + Send + Sync>);
        sender.replace_track(replacement).await.map_err(rtc_error)?;
        debug!(participant = %self.participant_id, source = ?source, "outbound video source replaced");
        *lock(&self.video_source) = source;
        Ok(())
    }

    fn data_channel(&self) -> Option<Arc<dyn DataChannel>> {
        Some(self.channel.clone())
    }

    async fn close(&self) -> Result<(), RtcError> {
        self.pc.close().await.map_err(rtc_error)
    }
}

/// Builds webrtc-rs peer connections from one shared API instance.
pub struct WebRtcPeerFactory {
    api: Arc<API>,
}

impl WebRtcPeerFactory {
    pub fn new() -> Result<Self> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let api = APIBuilder::new().with_media_engine(media).build();
        Ok(Self { api: Arc::new(api) })
    }

    async fn build(&self, spec: PeerSpec, events: PeerEventSink) -> Result<WebRtcPeer> {
        let config = RTCConfiguration {
            ice_servers: spec.ice_servers.into_iter().map(RTCIceServer::from).collect(),
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await?);
        let participant_id = spec.participant_id;

        let video = match spec.direction {
            PeerDirection::SendRecv => {
                let audio_track = Arc::new(TrackLocalStaticSample::new(
                    RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_OPUS.to_string(),
                        ..Default::default()
                    },
                    "audio".to_string(),
                    participant_id.clone(),
                ));
                pc.add_track(audio_track as Arc<dyn TrackLocal + Send + Sync>)
                    .await?;

                let video_track = Arc::new(TrackLocalStaticSample::new(
                    RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_VP8.to_string(),
                        ..Default::default()
                    },
                    "video".to_string(),
                    participant_id.clone(),
                ));
                let sender = pc
                    .add_track(video_track.clone() as Arc<dyn TrackLocal + Send + Sync>)
                    .await?;
                Some((sender, video_track))
            }
            PeerDirection::RecvOnly => {
                for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
                    pc.add_transceiver_from_kind(
                        kind,
                        Some(RTCRtpTransceiverInit {
                            direction: RTCRtpTransceiverDirection::Recvonly,
                            send_encodings: Vec::new(),
                        }),
                    )
                    .await?;
                }
                None
            }
        };

        let dc = pc
            .create_data_channel(
                DATA_CHANNEL_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await?;
        wire_data_channel(&dc, &participant_id, &events);
        wire_connection(&pc, &participant_id, &events);

        let video_source = spec
            .local_stream
            .as_ref()
            .and_then(|s| s.video_track())
            .map(|t| t.id().to_string());

        Ok(WebRtcPeer {
            participant_id,
            pc,
            channel: Arc::new(WebRtcDataChannel {
                label: dc.label().to_string(),
                inner: dc,
            }),
            video,
            video_source: Mutex::new(video_source),
        })
    }
}

fn wire_connection(pc: &Arc<RTCPeerConnection>, participant_id: &str, events: &PeerEventSink) {
    let tx = events.clone();
    let id = participant_id.to_string();
    pc.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        let id = id.clone();
        Box::pin(async move {
            let Some(candidate) = c else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = tx.send(PeerEvent::LocalCandidate {
                        participant_id: id,
                        candidate: IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        },
                    });
                }
                Err(e) => warn!(participant = %id, "unserialisable local candidate: {}", e),
            }
        })
    }));

    let tx = events.clone();
    let id = participant_id.to_string();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let tx = tx.clone();
        let id = id.clone();
        Box::pin(async move {
            info!(participant = %id, "peer connection state: {}", state);
            if state == RTCPeerConnectionState::Failed {
                let _ = tx.send(PeerEvent::ConnectionFailed {
                    participant_id: id,
                    reason: "ICE connection failed".into(),
                });
            }
        })
    }));

    let tx = events.clone();
    let id = participant_id.to_string();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let tx = tx.clone();
        let id = id.clone();
        Box::pin(async move {
            let _ = tx.send(PeerEvent::RemoteStream {
                participant_id: id,
                stream_id: track.stream_id().to_string(),
            });
        })
    }));
}

fn wire_data_channel(dc: &Arc<RTCDataChannel>, participant_id: &str, events: &PeerEventSink) {
    let tx = events.clone();
    let id = participant_id.to_string();
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            let _ = tx.send(PeerEvent::ChannelState {
                participant_id: id,
                state: ChannelState::Open,
            });
        })
    }));

    let tx = events.clone();
    let id = participant_id.to_string();
    dc.on_close(Box::new(move || {
        let tx = tx.clone();
        let id = id.clone();
        Box::pin(async move {
            let _ = tx.send(PeerEvent::ChannelState {
                participant_id: id,
                state: ChannelState::Closed,
            });
        })
    }));

    let tx = events.clone();
    let id = participant_id.to_string();
    dc.on_message(Box::new(move |msg| {
        let tx = tx.clone();
        let id = id.clone();
        Box::pin(async move {
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => {
                    let _ = tx.send(PeerEvent::DataMessage {
                        participant_id: id,
                        text,
                    });
                }
                Err(_) => debug!(participant = %id, "dropping binary data channel message"),
            }
        })
    }));
}

#[async_trait]
impl PeerFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        spec: PeerSpec,
        events: PeerEventSink,
    ) -> Result<Arc<dyn RtcPeer>, RtcError> {
        let participant_id = spec.participant_id.clone();
        match self.build(spec, events).await {
            Ok(peer) => Ok(Arc::new(peer)),
            Err(e) => {
                warn!(participant = %participant_id, "peer connection setup failed: {:#}", e);
                Err(RtcError::other(format!("{e:#}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn spec(id: &str, direction: PeerDirection) -> PeerSpec {
        PeerSpec {
            participant_id: id.into(),
            direction,
            local_stream: None,
            ice_servers: Vec::new(),
        }
    }

    #[tokio::test]
    async fn publishing_offer_carries_media_and_data() {
        let factory = WebRtcPeerFactory::new().unwrap();
        let (events, _rx) = mpsc::unbounded_channel();
        let peer = factory
            .create(spec("a", PeerDirection::SendRecv), events)
            .await
            .unwrap();

        let sdp = peer.create_offer().await.unwrap();
        assert!(sdp.contains("m=audio"));
        assert!(sdp.contains("m=video"));
        assert!(sdp.contains("m=application"));

        let channel = peer.data_channel().unwrap();
        assert_eq!(channel.label(), DATA_CHANNEL_LABEL);
        assert_ne!(channel.ready_state(), ChannelState::Open);
        peer.close().await.unwrap();
    }

    #[tokio::test]
    async fn receive_only_peer_cannot_swap_video() {
        let factory = WebRtcPeerFactory::new().unwrap();
        let (events, _rx) = mpsc::unbounded_channel();
        let peer = factory
            .create(spec("b", PeerDirection::RecvOnly), events)
            .await
            .unwrap();

        let err = peer.replace_video_track(None).await.unwrap_err();
        assert_eq!(err.name(), "InvalidStateError");
        assert!(peer.set_remote_answer("garbage").await.is_err());
        peer.close().await.unwrap();
    }
}
