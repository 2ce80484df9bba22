//! Offer/answer progress and ICE candidate buffering for one peer connection.
//!
//! Remote candidates may arrive before the answer that makes them applicable.
//! [`CandidateBuffer`] holds them in receipt order until the remote
//! description is in place; draining is the only way out, so a candidate is
//! handed back at most once.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// A trickled ICE candidate in the browser's JSON shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// Where a peer connection stands in the offer/answer exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NegotiationState {
    #[default]
    Uninitiated,
    OfferSent,
    AnswerReceived,
    Stable,
}

impl NegotiationState {
    /// Remote candidates can only be applied once the remote description is set
    /// and the buffer has been flushed.
    pub fn accepts_candidates(&self) -> bool {
        matches!(self, NegotiationState::Stable)
    }

    pub fn can_accept_answer(&self) -> bool {
        matches!(self, NegotiationState::OfferSent)
    }
}

impl std::fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NegotiationState::Uninitiated => "uninitiated",
            NegotiationState::OfferSent => "offer-sent",
            NegotiationState::AnswerReceived => "answer-received",
            NegotiationState::Stable => "stable",
        };
        f.write_str(name)
    }
}

/// FIFO of remote candidates received ahead of the remote description.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    pending: VecDeque<IceCandidate>,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, candidate: IceCandidate) {
        self.pending.push_back(candidate);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Removes and returns every buffered candidate in receipt order.
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.pending.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
