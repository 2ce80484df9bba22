//! One peer connection per participant, with its negotiation state.
//!
//! The self participant's connection publishes the local stream; every remote
//! participant gets a receive-only connection toward the media server. Both
//! follow the same offer/answer path.

use crate::rtc::{
    DataChannel, PeerDirection, PeerEventSink, PeerFactory, PeerSpec, RtcError, RtcPeer,
};
use crate::signaling::{SignalingError, SignalingSender};
use chatforyou_common::SignalMessage;
use chatforyou_core::{CandidateBuffer, IceCandidate, NegotiationState, TransportStats};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("creating connection for {participant} failed: {source}")]
    Create { participant: String, source: RtcError },
    #[error("offer for {participant} failed: {source}")]
    Offer { participant: String, source: RtcError },
    #[error("answer for {participant} rejected: {source}")]
    Answer { participant: String, source: RtcError },
    #[error("answer for {participant} arrived while {state}")]
    UnexpectedAnswer {
        participant: String,
        state: NegotiationState,
    },
    #[error("connection for {0} is already disposed")]
    Disposed(String),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

pub struct PeerConnectionManager {
    participant_id: String,
    display_name: String,
    direction: PeerDirection,
    peer: Arc<dyn RtcPeer>,
    signaling: SignalingSender,
    state: NegotiationState,
    pending: CandidateBuffer,
    disposed: bool,
}

impl PeerConnectionManager {
    pub async fn create(
        factory: &dyn PeerFactory,
        spec: PeerSpec,
        display_name: impl Into<String>,
        signaling: SignalingSender,
        events: PeerEventSink,
    ) -> Result<Self, NegotiationError> {
        let participant_id = spec.participant_id.clone();
        let direction = spec.direction;
        let peer = factory
            .create(spec, events)
            .await
            .map_err(|source| NegotiationError::Create {
                participant: participant_id.clone(),
                source,
            })?;
        debug!(participant = %participant_id, ?direction, "peer connection created");

        Ok(Self {
            participant_id,
            display_name: display_name.into(),
            direction,
            peer,
            signaling,
            state: NegotiationState::Uninitiated,
            pending: CandidateBuffer::new(),
            disposed: false,
        })
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    pub fn direction(&self) -> PeerDirection {
        self.direction
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn buffered_candidates(&self) -> usize {
        self.pending.len()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn peer(&self) -> &Arc<dyn RtcPeer> {
        &self.peer
    }

    pub fn data_channel(&self) -> Option<Arc<dyn DataChannel>> {
        self.peer.data_channel()
    }

    fn ensure_live(&self) -> Result<(), NegotiationError> {
        if self.disposed {
            return Err(NegotiationError::Disposed(self.participant_id.clone()));
        }
        Ok(())
    }

    /// Generates the offer and announces it to the server as a request for
    /// this participant's stream.
    pub async fn negotiate(&mut self) -> Result<(), NegotiationError> {
        self.ensure_live()?;
        let sdp_offer = self
            .peer
            .create_offer()
            .await
            .map_err(|source| NegotiationError::Offer {
                participant: self.participant_id.clone(),
                source,
            })?;

        // A disposal may have raced the offer.
        self.ensure_live()?;
        self.state = NegotiationState::OfferSent;
        self.signaling.send(SignalMessage::ReceiveVideoFrom {
            sender: self.participant_id.clone(),
            nick_name: self.display_name.clone(),
            sdp_offer,
        })?;
        info!(participant = %self.participant_id, "offer sent");
        Ok(())
    }

    /// Applies the answer, then every candidate that arrived ahead of it.
    ///
    /// Returns how many buffered candidates were applied.
    pub async fn apply_answer(&mut self, sdp_answer: &str) -> Result<usize, NegotiationError> {
        self.ensure_live()?;
        if !self.state.can_accept_answer() {
            return Err(NegotiationError::UnexpectedAnswer {
                participant: self.participant_id.clone(),
                state: self.state,
            });
        }

        self.peer
            .set_remote_answer(sdp_answer)
            .await
            .map_err(|source| NegotiationError::Answer {
                participant: self.participant_id.clone(),
                source,
            })?;
        self.state = NegotiationState::AnswerReceived;

        let buffered = self.pending.drain();
        let count = buffered.len();
        for candidate in buffered {
            self.apply_candidate(&candidate).await;
        }
        self.state = NegotiationState::Stable;
        info!(
            participant = %self.participant_id,
            flushed = count,
            "remote answer applied"
        );
        Ok(count)
    }

    /// Applies the candidate now if the connection is stable, otherwise keeps
    /// it for [`Self::apply_answer`]. Returns whether it was applied.
    pub async fn add_remote_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<bool, NegotiationError> {
        self.ensure_live()?;
        if self.state.accepts_candidates() {
            self.apply_candidate(&candidate).await;
            Ok(true)
        } else {
            debug!(
                participant = %self.participant_id,
                state = %self.state,
                "buffering remote candidate"
            );
            self.pending.push(candidate);
            Ok(false)
        }
    }

    async fn apply_candidate(&self, candidate: &IceCandidate) {
        if let Err(e) = self.peer.add_ice_candidate(candidate).await {
            warn!(
                participant = %self.participant_id,
                "error adding candidate: {}", e
            );
        }
    }

    /// Trickles a locally gathered candidate to the server.
    pub fn forward_local_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.ensure_live()?;
        self.signaling.send(SignalMessage::OnIceCandidate {
            candidate,
            name: self.participant_id.clone(),
            nick_name: self.display_name.clone(),
        })?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<TransportStats, RtcError> {
        if self.disposed {
            return Err(RtcError::Closed);
        }
        self.peer.stats().await
    }

    /// Closes the connection. Safe to call at any negotiation stage and more
    /// than once.
    pub async fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.pending.clear();
        if let Err(e) = self.peer.close().await {
            warn!(participant = %self.participant_id, "error closing connection: {}", e);
        }
        info!(participant = %self.participant_id, "peer connection disposed");
    }
}

impl std::fmt::Debug for PeerConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnectionManager")
            .field("participant_id", &self.participant_id)
            .field("direction", &self.direction)
            .field("state", &self.state)
            .field("buffered", &self.pending.len())
            .field("disposed", &self.disposed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackHub;
    use crate::signaling::Outbound;
    use tokio::sync::mpsc;

    async fn manager(hub: &LoopbackHub, id: &str) -> (PeerConnectionManager, mpsc::UnboundedReceiver<Outbound>) {
        let (signaling, rx) = SignalingSender::detached();
        let (events, _events_rx) = mpsc::unbounded_channel();
        let spec = PeerSpec {
            participant_id: id.to_string(),
            direction: PeerDirection::RecvOnly,
            local_stream: None,
            ice_servers: Vec::new(),
        };
        let mgr = PeerConnectionManager::create(&hub.factory(), spec, "Bee", signaling, events)
            .await
            .unwrap();
        (mgr, rx)
    }

    #[tokio::test]
    async fn offer_is_announced_with_participant_as_sender() {
        let hub = LoopbackHub::new();
        let (mut mgr, mut rx) = manager(&hub, "b").await;
        mgr.negotiate().await.unwrap();
        assert_eq!(mgr.state(), NegotiationState::OfferSent);

        match rx.try_recv().unwrap() {
            Outbound::Message(SignalMessage::ReceiveVideoFrom {
                sender, nick_name, ..
            }) => {
                assert_eq!(sender, "b");
                assert_eq!(nick_name, "Bee");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn early_candidates_are_buffered_then_flushed_in_order() {
        let hub = LoopbackHub::new();
        let (mut mgr, _rx) = manager(&hub, "b").await;

        assert!(!mgr.add_remote_candidate(IceCandidate::new("c1")).await.unwrap());
        mgr.negotiate().await.unwrap();
        assert!(!mgr.add_remote_candidate(IceCandidate::new("c2")).await.unwrap());
        assert_eq!(mgr.buffered_candidates(), 2);
        assert!(hub.peer("b").unwrap().applied_candidates().is_empty());

        assert_eq!(mgr.apply_answer("v=0 answer").await.unwrap(), 2);
        assert_eq!(mgr.state(), NegotiationState::Stable);
        assert!(mgr.add_remote_candidate(IceCandidate::new("c3")).await.unwrap());

        let applied: Vec<_> = hub
            .peer("b")
            .unwrap()
            .applied_candidates()
            .into_iter()
            .map(|c| c.candidate)
            .collect();
        assert_eq!(applied, vec!["c1", "c2", "c3"]);
    }

    #[tokio::test]
    async fn answer_before_offer_is_refused() {
        let hub = LoopbackHub::new();
        let (mut mgr, _rx) = manager(&hub, "b").await;
        assert!(matches!(
            mgr.apply_answer("v=0").await,
            Err(NegotiationError::UnexpectedAnswer { .. })
        ));
    }

    #[tokio::test]
    async fn dispose_is_idempotent_and_blocks_further_work() {
        let hub = LoopbackHub::new();
        let (mut mgr, _rx) = manager(&hub, "b").await;
        mgr.add_remote_candidate(IceCandidate::new("c1")).await.unwrap();

        mgr.dispose().await;
        mgr.dispose().await;
        assert_eq!(hub.peer("b").unwrap().close_count(), 1);
        assert_eq!(mgr.buffered_candidates(), 0);
        assert!(matches!(
            mgr.negotiate().await,
            Err(NegotiationError::Disposed(_))
        ));
    }

    #[tokio::test]
    async fn rejected_answer_leaves_state_untouched() {
        let hub = LoopbackHub::new();
        hub.fail_answers_for("b");
        let (mut mgr, _rx) = manager(&hub, "b").await;
        mgr.negotiate().await.unwrap();
        assert!(matches!(
            mgr.apply_answer("garbage").await,
            Err(NegotiationError::Answer { .. })
        ));
        assert_eq!(mgr.state(), NegotiationState::OfferSent);
    }
}
