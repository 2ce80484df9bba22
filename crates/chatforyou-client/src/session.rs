//! The call session: one task owning every piece of call state.
//!
//! Signaling events, peer notifications, user commands, capture-ended
//! notices and the quality timer are all handled on the same task, one at a
//! time, so none of the components need locking.

use crate::config::ClientConfig;
use crate::datachannel::{ChannelSender, DataChannelError, DataChannelMultiplexer};
use crate::media::{acquire_media, check_audio_permission, MediaResult, SyntheticTrackFactory};
use crate::peer::{NegotiationError, PeerConnectionManager};
use crate::quality::{QualityChange, QualityController};
use crate::registry::ParticipantRegistry;
use crate::rtc::{
    ChannelState, IceServer, MediaDevices, MediaStream, PeerDirection, PeerEvent, PeerEventSink,
    PeerFactory, PeerSpec,
};
use crate::screen_share::ScreenShareSession;
use crate::signaling::{SignalEvent, SignalingSender};
use anyhow::Result;
use chatforyou_common::envelope::{CaptionPayload, ChatPayload};
use chatforyou_common::file_transfer::{FileMessage, FileReceiver, OutgoingFile};
use chatforyou_common::{DataEnvelope, EventKind, ParticipantInfo, SignalMessage};
use chatforyou_core::{
    CaptionFilter, IceCandidate, MediaConstraints, PermissionError, PermissionErrorKind,
    QualityMetrics, QualityPreset, QualityTier, WarningSeverity,
};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::{task, time};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    /// The user hung up.
    User,
    /// The session is being torn down after a connection failure.
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    SendChat(String),
    SendFile(PathBuf),
    SendGameEvent(Value),
    SubmitCaption {
        text: String,
        confidence: Option<f32>,
    },
    StartScreenShare,
    StopScreenShare,
    SetQuality(QualityPreset),
    ToggleAutoOptimize,
    OptimizeNow,
    ReportQuality,
    Leave(LeaveReason),
}

/// Notifications for the user-facing layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ParticipantJoined {
        id: String,
        nick_name: String,
        is_self: bool,
    },
    ParticipantLeft {
        id: String,
    },
    RemoteStreamAttached {
        participant_id: String,
        stream_id: String,
    },
    ChatReceived {
        from: String,
        nick_name: String,
        text: String,
    },
    GameEventReceived {
        from: String,
        payload: Value,
    },
    /// `from` is `None` for captions relayed by the server.
    CaptionReceived {
        from: Option<String>,
        text: String,
    },
    FileReceived {
        from: String,
        path: PathBuf,
    },
    FileFailed {
        from: String,
        reason: String,
    },
    SendFailed {
        kind: EventKind,
        reason: String,
    },
    QualityChanged {
        preset: QualityPreset,
        network: Option<QualityTier>,
        device: Option<QualityTier>,
    },
    QualityRolledBack {
        preset: QualityPreset,
        reason: String,
    },
    QualityReport {
        preset: QualityPreset,
        auto_optimize: bool,
        metrics: Option<QualityMetrics>,
        advice: Vec<String>,
    },
    AutoOptimizeChanged {
        enabled: bool,
    },
    PerformanceWarning {
        severity: WarningSeverity,
        message: String,
        suggestion: String,
    },
    PermissionDenied {
        kind: PermissionErrorKind,
        title: String,
        guidance: Vec<String>,
    },
    MediaDegraded {
        reason: String,
    },
    ScreenShareStarted {
        stream_id: String,
        preset: QualityPreset,
    },
    ScreenShareStopped,
    ScreenShareFailed {
        reason: String,
    },
    NegotiationFailed {
        participant_id: String,
        reason: String,
    },
    SignalingRejected {
        reason: String,
    },
    /// The signaling transport is gone. Nothing reconnects; the caller decides
    /// whether to leave and start over.
    ConnectionFailed,
    Left {
        reason: LeaveReason,
    },
}

/// Platform pieces the session is built on.
#[derive(Clone)]
pub struct SessionDeps {
    pub factory: Arc<dyn PeerFactory>,
    pub devices: Arc<dyn MediaDevices>,
    pub synthetic: Arc<dyn SyntheticTrackFactory>,
    pub ice_servers: Vec<IceServer>,
}

/// Cloneable command handle for a running [`CallSession`].
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    /// Queues a command. Returns `false` once the session has finished.
    pub fn send(&self, command: SessionCommand) -> bool {
        self.tx.send(command).is_ok()
    }

    pub fn send_chat(&self, text: impl Into<String>) -> bool {
        self.send(SessionCommand::SendChat(text.into()))
    }

    pub fn send_file(&self, path: impl Into<PathBuf>) -> bool {
        self.send(SessionCommand::SendFile(path.into()))
    }

    pub fn send_game_event(&self, payload: Value) -> bool {
        self.send(SessionCommand::SendGameEvent(payload))
    }

    pub fn submit_caption(&self, text: impl Into<String>, confidence: Option<f32>) -> bool {
        self.send(SessionCommand::SubmitCaption {
            text: text.into(),
            confidence,
        })
    }

    pub fn start_screen_share(&self) -> bool {
        self.send(SessionCommand::StartScreenShare)
    }

    pub fn stop_screen_share(&self) -> bool {
        self.send(SessionCommand::StopScreenShare)
    }

    pub fn set_quality(&self, preset: QualityPreset) -> bool {
        self.send(SessionCommand::SetQuality(preset))
    }

    pub fn leave(&self, reason: LeaveReason) -> bool {
        self.send(SessionCommand::Leave(reason))
    }
}

struct Inbox {
    peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
    ended_rx: mpsc::UnboundedReceiver<String>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
}

type EventSink = mpsc::UnboundedSender<SessionEvent>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// Follows the runtime clock so paused-time tests stay consistent.
fn now() -> Instant {
    time::Instant::now().into_std()
}

pub struct CallSession {
    config: ClientConfig,
    deps: SessionDeps,
    signaling: SignalingSender,
    registry: ParticipantRegistry,
    mux: DataChannelMultiplexer,
    quality: QualityController,
    screen_share: ScreenShareSession,
    captions: CaptionFilter,
    files: Arc<Mutex<FileReceiver>>,
    local_stream: Option<MediaStream>,
    peer_tx: PeerEventSink,
    events: EventSink,
    inbox: Option<Inbox>,
    left: bool,
}

impl CallSession {
    pub fn new(
        config: ClientConfig,
        deps: SessionDeps,
        signaling: SignalingSender,
    ) -> (Self, SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();

        let files = Arc::new(Mutex::new(FileReceiver::new(
            config.file_out_dir.clone(),
            config.file_max_bytes,
        )));
        let mut mux = DataChannelMultiplexer::new();
        register_handlers(&mut mux, &events, &files);

        let session = Self {
            quality: QualityController::new(config.quality.clone()),
            config,
            deps,
            signaling,
            registry: ParticipantRegistry::new(),
            mux,
            screen_share: ScreenShareSession::new(ended_tx),
            captions: CaptionFilter::default(),
            files,
            local_stream: None,
            peer_tx,
            events,
            inbox: Some(Inbox {
                peer_rx,
                ended_rx,
                commands,
            }),
            left: false,
        };
        (session, SessionHandle { tx: command_tx }, events_rx)
    }

    /// Drives the session until it leaves the room.
    pub async fn run(mut self, mut signal_rx: mpsc::UnboundedReceiver<SignalEvent>) -> Result<()> {
        let Some(mut inbox) = self.inbox.take() else {
            anyhow::bail!("session is already running");
        };
        let period = self.config.quality.interval;
        let mut quality_interval = time::interval_at(time::Instant::now() + period, period);
        quality_interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        let mut signaling_open = true;

        info!(
            room = %self.config.room_id,
            user = %self.config.user_id,
            "call session running"
        );

        while !self.left {
            let was_monitoring = self.quality.is_monitoring();
            let caption_due = self.captions.next_deadline();
            let caption_sleep = time::sleep_until(
                caption_due
                    .map(time::Instant::from_std)
                    .unwrap_or_else(|| time::Instant::now() + Duration::from_secs(3600)),
            );

            tokio::select! {
                event = signal_rx.recv(), if signaling_open => match event {
                    Some(event) => self.on_signal(event).await,
                    None => {
                        debug!("signaling event stream ended");
                        signaling_open = false;
                    }
                },

                Some(event) = inbox.peer_rx.recv() => self.on_peer_event(event).await,

                command = inbox.commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => self.leave(LeaveReason::User).await,
                },

                // Capture ended by the platform
                Some(stream_id) = inbox.ended_rx.recv() => {
                    if self.screen_share.stream_id() == Some(stream_id.as_str()) {
                        info!(stream = %stream_id, "capture ended by the platform");
                        self.stop_screen_share().await;
                    }
                }

                _ = quality_interval.tick(), if self.quality.is_monitoring() => {
                    self.sample_quality().await;
                }

                _ = caption_sleep, if caption_due.is_some() => self.flush_caption().await,
            }

            if self.quality.is_monitoring() && !was_monitoring {
                quality_interval.reset();
            }
        }

        info!("call session finished");
        Ok(())
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    async fn on_signal(&mut self, event: SignalEvent) {
        match event {
            SignalEvent::Message(message) => self.on_message(message).await,
            SignalEvent::Rejected { reason } => {
                self.emit(SessionEvent::SignalingRejected { reason });
            }
            SignalEvent::ConnectionFail => self.connection_failed(),
        }
    }

    fn connection_failed(&self) {
        error!("signaling connection failed");
        self.emit(SessionEvent::ConnectionFailed);
    }

    async fn on_message(&mut self, message: SignalMessage) {
        match message {
            SignalMessage::ExistingParticipants { data } => self.on_existing_participants(data).await,
            SignalMessage::NewParticipantArrived { data } => self.receive_from(data).await,
            SignalMessage::ReceiveVideoAnswer { name, sdp_answer } => {
                self.on_answer(&name, &sdp_answer).await
            }
            SignalMessage::IceCandidate {
                candidate, name, ..
            } => self.on_remote_candidate(&name, candidate).await,
            SignalMessage::ParticipantLeft { name } => self.on_participant_left(&name).await,
            SignalMessage::TextOverlay { text, .. } => {
                self.emit(SessionEvent::CaptionReceived { from: None, text });
            }
            SignalMessage::GenericDataEvent {
                sender,
                kind,
                payload,
            } => {
                let envelope = DataEnvelope { kind, payload };
                self.mux.dispatch_envelope(&sender, &envelope);
            }
            SignalMessage::ConnectionFail => self.connection_failed(),
            other => debug!(id = other.id(), "ignoring client-bound message"),
        }
    }

    async fn on_existing_participants(&mut self, roster: Vec<ParticipantInfo>) {
        let self_id = self.config.user_id.clone();
        let nick = self.config.nick_name.clone();
        if self.registry.add_self(&self_id, &nick) {
            self.emit(SessionEvent::ParticipantJoined {
                id: self_id.clone(),
                nick_name: nick.clone(),
                is_self: true,
            });
            if let Some(stream) = self.acquire_local_media().await {
                self.publish(stream).await;
            }
        }

        for info in roster {
            if info.user_id != self_id {
                self.receive_from(info).await;
            }
        }
    }

    async fn acquire_local_media(&mut self) -> Option<MediaStream> {
        if let Err(e) = check_audio_permission(self.deps.devices.as_ref()).await {
            self.permission_denied(e);
            return None;
        }
        match acquire_media(
            self.deps.devices.as_ref(),
            &MediaConstraints::audio_video(),
            self.deps.synthetic.as_ref(),
        )
        .await
        {
            MediaResult::Granted(stream) => Some(stream),
            MediaResult::Degraded { stream, reason } => {
                self.emit(SessionEvent::MediaDegraded { reason });
                Some(stream)
            }
            MediaResult::Denied(e) => {
                self.permission_denied(e);
                None
            }
        }
    }

    fn permission_denied(&self, error: PermissionError) {
        warn!(kind = %error.kind, "local media unavailable: {}", error.detail);
        self.emit(SessionEvent::PermissionDenied {
            kind: error.kind,
            title: error.kind.title().to_string(),
            guidance: error.kind.guidance().iter().map(|s| s.to_string()).collect(),
        });
    }

    async fn publish(&mut self, stream: MediaStream) {
        self.local_stream = Some(stream.clone());
        let id = self.config.user_id.clone();
        let nick = self.config.nick_name.clone();
        if self
            .open_peer(&id, &nick, PeerDirection::SendRecv, Some(stream))
            .await
        {
            if let Some(channel) = self.registry.self_peer().and_then(|p| p.data_channel()) {
                self.mux.bind(channel);
            }
        }
    }

    async fn receive_from(&mut self, info: ParticipantInfo) {
        if !self.registry.add_remote(&info.user_id, &info.nick_name) {
            return;
        }
        self.emit(SessionEvent::ParticipantJoined {
            id: info.user_id.clone(),
            nick_name: info.nick_name.clone(),
            is_self: false,
        });
        self.open_peer(&info.user_id, &info.nick_name, PeerDirection::RecvOnly, None)
            .await;
    }

    /// Creates, negotiates and registers the connection for `id`.
    async fn open_peer(
        &mut self,
        id: &str,
        nick: &str,
        direction: PeerDirection,
        local_stream: Option<MediaStream>,
    ) -> bool {
        let spec = PeerSpec {
            participant_id: id.to_string(),
            direction,
            local_stream,
            ice_servers: self.deps.ice_servers.clone(),
        };
        let mut manager = match PeerConnectionManager::create(
            self.deps.factory.as_ref(),
            spec,
            nick,
            self.signaling.clone(),
            self.peer_tx.clone(),
        )
        .await
        {
            Ok(manager) => manager,
            Err(e) => {
                self.negotiation_failed(id, &e);
                return false;
            }
        };

        if let Err(e) = manager.negotiate().await {
            self.negotiation_failed(id, &e);
            manager.dispose().await;
            return false;
        }

        match self.registry.attach_peer(id, manager) {
            Ok(()) => true,
            Err(mut orphan) => {
                orphan.dispose().await;
                false
            }
        }
    }

    fn negotiation_failed(&self, id: &str, error: &NegotiationError) {
        warn!(participant = id, "negotiation failed: {}", error);
        self.emit(SessionEvent::NegotiationFailed {
            participant_id: id.to_string(),
            reason: error.to_string(),
        });
    }

    async fn on_answer(&mut self, id: &str, sdp_answer: &str) {
        let Some(peer) = self.registry.peer_mut(id) else {
            debug!(participant = id, "answer for unknown participant ignored");
            return;
        };
        let result = peer.apply_answer(sdp_answer).await;
        match result {
            Ok(_) => {}
            Err(e @ NegotiationError::Answer { .. }) => {
                self.dispose_peer(id).await;
                self.negotiation_failed(id, &e);
            }
            Err(e) => warn!(participant = id, "answer not applied: {}", e),
        }
    }

    /// Closes the connection for `id`. A share rides on the outbound
    /// connection, so losing it ends the share first.
    async fn dispose_peer(&mut self, id: &str) {
        if self.registry.self_id() == Some(id) {
            self.stop_screen_share().await;
        }
        if let Some(peer) = self.registry.peer_mut(id) {
            peer.dispose().await;
        }
    }

    async fn on_remote_candidate(&mut self, id: &str, candidate: IceCandidate) {
        let Some(peer) = self.registry.peer_mut(id) else {
            debug!(participant = id, "candidate for unknown participant ignored");
            return;
        };
        if let Err(e) = peer.add_remote_candidate(candidate).await {
            debug!(participant = id, "candidate dropped: {}", e);
        }
    }

    async fn on_participant_left(&mut self, id: &str) {
        if self.registry.self_id() == Some(id) {
            warn!(participant = id, "server reported the local participant as gone");
            self.stop_screen_share().await;
        }
        if self.registry.remove(id).await.is_some() {
            lock(&self.files).abandon_sender(id);
            self.emit(SessionEvent::ParticipantLeft { id: id.to_string() });
        }
    }

    async fn on_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate {
                participant_id,
                candidate,
            } => {
                let forwarded = self
                    .registry
                    .get(&participant_id)
                    .and_then(|p| p.peer())
                    .map(|peer| peer.forward_local_candidate(candidate));
                match forwarded {
                    Some(Err(e)) => debug!(participant = %participant_id, "candidate not sent: {}", e),
                    Some(Ok(())) => {}
                    None => debug!(participant = %participant_id, "candidate for unknown connection"),
                }
            }
            PeerEvent::DataMessage {
                participant_id,
                text,
            } => {
                self.mux.dispatch(&participant_id, &text);
            }
            PeerEvent::ChannelState {
                participant_id,
                state,
            } => {
                debug!(participant = %participant_id, %state, "data channel state");
                if state == ChannelState::Closed && self.registry.self_id() == Some(participant_id.as_str()) {
                    warn!("outbound data channel closed");
                }
            }
            PeerEvent::ConnectionFailed {
                participant_id,
                reason,
            } => {
                warn!(participant = %participant_id, "connection failed: {}", reason);
                self.dispose_peer(&participant_id).await;
                self.emit(SessionEvent::NegotiationFailed {
                    participant_id,
                    reason,
                });
            }
            PeerEvent::RemoteStream {
                participant_id,
                stream_id,
            } => {
                self.emit(SessionEvent::RemoteStreamAttached {
                    participant_id,
                    stream_id,
                });
            }
        }
    }

    async fn on_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::SendChat(text) => {
                let chat = ChatPayload {
                    user_id: self.config.user_id.clone(),
                    nick_name: self.config.nick_name.clone(),
                    text,
                };
                let result = self.mux.send_payload(EventKind::Chat, &chat).await;
                self.report_send(EventKind::Chat, result);
            }
            SessionCommand::SendGameEvent(payload) => {
                let result = self.mux.send(EventKind::Game, payload).await;
                self.report_send(EventKind::Game, result);
            }
            SessionCommand::SendFile(path) => self.send_file(path),
            SessionCommand::SubmitCaption { text, confidence } => {
                match self.captions.submit(&text, confidence, now()) {
                    Ok(delay) => debug!(?delay, "caption scheduled"),
                    Err(rejection) => debug!("caption dropped: {}", rejection),
                }
            }
            SessionCommand::StartScreenShare => self.start_screen_share().await,
            SessionCommand::StopScreenShare => self.stop_screen_share().await,
            SessionCommand::SetQuality(preset) => {
                let result = self.quality.set_preset(preset).await;
                self.emit(SessionEvent::AutoOptimizeChanged {
                    enabled: self.quality.auto_optimize(),
                });
                match result {
                    Ok(Some(change)) => self.quality_changed(change, None),
                    Ok(None) => {}
                    Err(e) => self.emit(SessionEvent::QualityRolledBack {
                        preset: self.quality.current_preset(),
                        reason: e.to_string(),
                    }),
                }
            }
            SessionCommand::ToggleAutoOptimize => {
                let enabled = self.quality.toggle_auto_optimize();
                self.emit(SessionEvent::AutoOptimizeChanged { enabled });
            }
            SessionCommand::OptimizeNow => match self.quality.optimize_now().await {
                Ok(Some(change)) => self.quality_changed(change, None),
                Ok(None) => debug!("quality already optimal"),
                Err(e) => warn!("optimise now: {}", e),
            },
            SessionCommand::ReportQuality => {
                let advice = self.quality.advice().into_iter().map(String::from).collect();
                self.emit(SessionEvent::QualityReport {
                    preset: self.quality.current_preset(),
                    auto_optimize: self.quality.auto_optimize(),
                    metrics: self.quality.last_metrics().copied(),
                    advice,
                });
            }
            SessionCommand::Leave(reason) => self.leave(reason).await,
        }
    }

    fn report_send(&self, kind: EventKind, result: Result<(), DataChannelError>) {
        if let Err(e) = result {
            warn!(%kind, "send failed: {}", e);
            self.emit(SessionEvent::SendFailed {
                kind,
                reason: e.to_string(),
            });
        }
    }

    /// Streams a file on its own task; hashing and chunk reads happen on the
    /// blocking pool so the session keeps serving signaling meanwhile.
    fn send_file(&self, path: PathBuf) {
        let sender = match self.mux.sender() {
            Ok(sender) => sender,
            Err(e) => {
                self.report_send(EventKind::File, Err(e));
                return;
            }
        };
        let chunk_size = self.config.file_chunk_size;
        let max_bytes = self.config.file_max_bytes;
        let events = self.events.clone();
        tokio::spawn(async move {
            if let Err(e) = transfer_file(sender, path, chunk_size, max_bytes).await {
                warn!(kind = %EventKind::File, "send failed: {e:#}");
                let _ = events.send(SessionEvent::SendFailed {
                    kind: EventKind::File,
                    reason: format!("{e:#}"),
                });
            }
        });
    }

    async fn flush_caption(&mut self) {
        let Some(text) = self.captions.take_due(now()) else {
            return;
        };
        debug!(%text, "publishing caption");
        if let Err(e) = self.signaling.send(SignalMessage::TextOverlay {
            room_id: self.config.room_id.clone(),
            text: text.clone(),
        }) {
            warn!("caption not published: {}", e);
        }
        if self.mux.is_open() {
            let caption = CaptionPayload {
                user_id: self.config.user_id.clone(),
                text,
            };
            if let Err(e) = self.mux.send_payload(EventKind::Caption, &caption).await {
                debug!("caption not mirrored on data channel: {}", e);
            }
        }
    }

    async fn start_screen_share(&mut self) {
        let camera = self.local_stream.as_ref().and_then(|s| s.video_track());
        let peer = self.registry.self_peer().map(|p| p.peer().clone());
        let started = self
            .screen_share
            .start(
                self.deps.devices.as_ref(),
                peer.as_deref(),
                camera,
                &mut self.quality,
                now(),
            )
            .await;

        match started {
            Ok(stream_id) => {
                if let Some(peer) = &peer {
                    match peer.stats().await {
                        Ok(stats) => self.quality.prime(&stats, now()),
                        Err(e) => debug!("no baseline statistics: {}", e),
                    }
                }
                self.emit(SessionEvent::ScreenShareStarted {
                    stream_id,
                    preset: self.quality.current_preset(),
                });
            }
            Err(e) => {
                warn!("screen share failed: {}", e);
                self.emit(SessionEvent::ScreenShareFailed {
                    reason: e.to_string(),
                });
            }
        }
    }

    async fn stop_screen_share(&mut self) {
        let peer = self.registry.self_peer().map(|p| p.peer().clone());
        if self
            .screen_share
            .stop(peer.as_deref(), &mut self.quality)
            .await
        {
            self.emit(SessionEvent::ScreenShareStopped);
        }
    }

    async fn sample_quality(&mut self) {
        let Some(peer) = self.registry.self_peer() else {
            return;
        };
        let stats = match peer.stats().await {
            Ok(stats) => stats,
            Err(e) => {
                debug!("statistics unavailable, skipping round: {}", e);
                return;
            }
        };

        let outcome = self.quality.tick(&stats, now()).await;
        if let Some(warning) = outcome.warnings.first() {
            self.emit(SessionEvent::PerformanceWarning {
                severity: warning.severity,
                message: warning.message.to_string(),
                suggestion: warning.suggestion.to_string(),
            });
        }
        if let Some(change) = outcome.change {
            self.quality_changed(change, outcome.decision.map(|d| (d.network, d.device)));
        }
        if let Some(e) = outcome.rolled_back {
            self.emit(SessionEvent::QualityRolledBack {
                preset: self.quality.current_preset(),
                reason: e.to_string(),
            });
        }
    }

    fn quality_changed(&self, change: QualityChange, tiers: Option<(QualityTier, QualityTier)>) {
        self.emit(SessionEvent::QualityChanged {
            preset: change.to,
            network: tiers.map(|t| t.0),
            device: tiers.map(|t| t.1),
        });
    }

    /// Leaves the room: farewell notice, leave message, every connection
    /// disposed, signaling closed. Each step runs even if an earlier one fails.
    async fn leave(&mut self, reason: LeaveReason) {
        if self.left {
            return;
        }
        info!(?reason, "leaving room");

        if reason == LeaveReason::User && self.mux.is_open() {
            let farewell = ChatPayload {
                user_id: self.config.user_id.clone(),
                nick_name: self.config.nick_name.clone(),
                text: format!("{} has left the room", self.config.nick_name),
            };
            if let Err(e) = self.mux.send_payload(EventKind::Chat, &farewell).await {
                debug!("farewell not sent: {}", e);
            }
        }

        self.captions.cancel();
        self.stop_screen_share().await;
        self.quality.stop();

        if let Err(e) = self.signaling.send(SignalMessage::LeaveRoom) {
            debug!("leave notice not sent: {}", e);
        }
        let disposed = self.registry.clear().await;
        self.mux.unbind();
        if let Some(stream) = self.local_stream.take() {
            stream.stop_all();
        }
        self.signaling.close();

        self.left = true;
        info!(disposed, "left room");
        self.emit(SessionEvent::Left { reason });
    }
}

async fn transfer_file(
    sender: ChannelSender,
    path: PathBuf,
    chunk_size: usize,
    max_bytes: u64,
) -> Result<()> {
    let file_id = uuid::Uuid::new_v4().to_string();
    let mut outgoing = task::spawn_blocking(move || {
        OutgoingFile::from_path(&path, file_id, chunk_size, max_bytes)
    })
    .await??;

    let offer = FileMessage::Offer(outgoing.offer().clone());
    sender.send_payload(EventKind::File, &offer).await?;
    loop {
        let (file, next) = task::spawn_blocking(move || {
            let next = outgoing.next_message();
            (outgoing, next)
        })
        .await?;
        outgoing = file;
        let Some(message) = next? else {
            break;
        };
        sender.send_payload(EventKind::File, &message).await?;
    }

    info!(
        file = %outgoing.offer().filename,
        chunks = outgoing.offer().total_chunks,
        "file sent"
    );
    Ok(())
}

fn register_handlers(
    mux: &mut DataChannelMultiplexer,
    events: &EventSink,
    files: &Arc<Mutex<FileReceiver>>,
) {
    let tx = events.clone();
    mux.on_receive(EventKind::Chat, move |from, envelope| {
        match envelope.payload_as::<ChatPayload>() {
            Ok(chat) => {
                let _ = tx.send(SessionEvent::ChatReceived {
                    from: from.to_string(),
                    nick_name: chat.nick_name,
                    text: chat.text,
                });
            }
            Err(e) => warn!(from, "malformed chat payload: {}", e),
        }
    });

    let tx = events.clone();
    mux.on_receive(EventKind::Game, move |from, envelope| {
        let _ = tx.send(SessionEvent::GameEventReceived {
            from: from.to_string(),
            payload: envelope.payload.clone(),
        });
    });

    let tx = events.clone();
    mux.on_receive(EventKind::Caption, move |from, envelope| {
        match envelope.payload_as::<CaptionPayload>() {
            Ok(caption) => {
                let _ = tx.send(SessionEvent::CaptionReceived {
                    from: Some(from.to_string()),
                    text: caption.text,
                });
            }
            Err(e) => warn!(from, "malformed caption payload: {}", e),
        }
    });

    let tx = events.clone();
    let files = files.clone();
    mux.on_receive(EventKind::File, move |from, envelope| {
        let result = envelope
            .payload_as::<FileMessage>()
            .map_err(anyhow::Error::from)
            .and_then(|message| lock(&files).handle(from, message));
        let event = match result {
            Ok(Some(path)) => SessionEvent::FileReceived {
                from: from.to_string(),
                path,
            },
            Ok(None) => return,
            Err(e) => {
                warn!(from, "file transfer failed: {:#}", e);
                SessionEvent::FileFailed {
                    from: from.to_string(),
                    reason: format!("{e:#}"),
                }
            }
        };
        let _ = tx.send(event);
    });
}
