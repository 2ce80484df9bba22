//! Routing of application messages over the single data channel.
//!
//! Chat, file chunks, game events and captions all share one channel; each
//! message carries its kind in a `{kind, payload}` envelope.

use crate::rtc::{ChannelState, DataChannel, RtcError};
use chatforyou_common::{DataEnvelope, EventKind};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum DataChannelError {
    #[error("no data channel is bound")]
    NotBound,
    #[error("data channel not ready ({0})")]
    NotReady(ChannelState),
    #[error("payload could not be encoded: {0}")]
    Encode(#[from] chatforyou_common::Error),
    #[error("data channel send failed: {0}")]
    Transport(#[from] RtcError),
}

/// Send half of a bound channel. Checks the ready state on every send.
#[derive(Clone)]
pub struct ChannelSender {
    channel: Arc<dyn DataChannel>,
}

impl ChannelSender {
    pub async fn send_payload<T: Serialize>(
        &self,
        kind: EventKind,
        payload: &T,
    ) -> Result<(), DataChannelError> {
        self.send_envelope(&DataEnvelope::wrap(kind, payload)?).await
    }

    async fn send_envelope(&self, envelope: &DataEnvelope) -> Result<(), DataChannelError> {
        let state = self.channel.ready_state();
        if state != ChannelState::Open {
            return Err(DataChannelError::NotReady(state));
        }
        let text = envelope.encode()?;
        self.channel.send_text(&text).await?;
        Ok(())
    }
}

/// Called with the sending participant's id and the decoded envelope.
pub type ReceiveHandler = Box<dyn Fn(&str, &DataEnvelope) + Send + Sync>;

#[derive(Default)]
pub struct DataChannelMultiplexer {
    channel: Option<Arc<dyn DataChannel>>,
    handlers: HashMap<EventKind, ReceiveHandler>,
}

impl DataChannelMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, channel: Arc<dyn DataChannel>) {
        debug!(label = channel.label(), "data channel bound");
        self.channel = Some(channel);
    }

    pub fn unbind(&mut self) {
        self.channel = None;
    }

    pub fn is_open(&self) -> bool {
        self.channel
            .as_ref()
            .is_some_and(|c| c.ready_state() == ChannelState::Open)
    }

    /// Sends a tagged message. Fails unless the channel is open.
    pub async fn send(&self, kind: EventKind, payload: Value) -> Result<(), DataChannelError> {
        self.send_envelope(&DataEnvelope::new(kind, payload)).await
    }

    pub async fn send_payload<T: Serialize>(
        &self,
        kind: EventKind,
        payload: &T,
    ) -> Result<(), DataChannelError> {
        self.send_envelope(&DataEnvelope::wrap(kind, payload)?).await
    }

    async fn send_envelope(&self, envelope: &DataEnvelope) -> Result<(), DataChannelError> {
        self.sender()?.send_envelope(envelope).await
    }

    /// A send handle detached from the multiplexer, for transfers that run
    /// on their own task.
    pub fn sender(&self) -> Result<ChannelSender, DataChannelError> {
        self.channel
            .clone()
            .map(|channel| ChannelSender { channel })
            .ok_or(DataChannelError::NotBound)
    }

    /// Registers the handler for `kind`, replacing any earlier one.
    pub fn on_receive<F>(&mut self, kind: EventKind, handler: F)
    where
        F: Fn(&str, &DataEnvelope) + Send + Sync + 'static,
    {
        self.handlers.insert(kind, Box::new(handler));
    }

    /// Decodes raw channel text and hands it to the registered handler.
    /// Returns whether a handler ran.
    pub fn dispatch(&self, from: &str, text: &str) -> bool {
        match DataEnvelope::decode(text) {
            Ok(envelope) => self.dispatch_envelope(from, &envelope),
            Err(e) => {
                warn!(from, "undecodable data channel message: {}", e);
                false
            }
        }
    }

    pub fn dispatch_envelope(&self, from: &str, envelope: &DataEnvelope) -> bool {
        let handler = envelope
            .event_kind()
            .and_then(|kind| self.handlers.get(&kind));
        match handler {
            Some(handler) => {
                handler(from, envelope);
                true
            }
            None => {
                debug!(from, kind = %envelope.kind, "no handler for data channel kind");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackChannel;
    use chatforyou_common::envelope::ChatPayload;
    use serde_json::json;
    use std::sync::Mutex;

    #[tokio::test]
    async fn send_requires_an_open_channel() {
        let mut mux = DataChannelMultiplexer::new();
        assert!(matches!(
            mux.send(EventKind::Chat, json!({})).await,
            Err(DataChannelError::NotBound)
        ));

        let channel = Arc::new(LoopbackChannel::new("data"));
        mux.bind(channel.clone());
        assert!(matches!(
            mux.send(EventKind::Chat, json!({})).await,
            Err(DataChannelError::NotReady(ChannelState::Connecting))
        ));

        channel.set_state(ChannelState::Open);
        mux.send(EventKind::Game, json!({"x": 3, "y": 4})).await.unwrap();
        let sent = channel.sent();
        assert_eq!(sent.len(), 1);
        let envelope = DataEnvelope::decode(&sent[0]).unwrap();
        assert_eq!(envelope.event_kind(), Some(EventKind::Game));
        assert_eq!(envelope.payload, json!({"x": 3, "y": 4}));

        channel.set_state(ChannelState::Closed);
        assert!(!mux.is_open());
        assert!(mux.send(EventKind::Chat, json!({})).await.is_err());
    }

    #[tokio::test]
    async fn sender_outlives_the_multiplexer_borrow() {
        let mut mux = DataChannelMultiplexer::new();
        assert!(matches!(mux.sender(), Err(DataChannelError::NotBound)));

        let channel = Arc::new(LoopbackChannel::new("data"));
        channel.set_state(ChannelState::Open);
        mux.bind(channel.clone());
        let sender = mux.sender().unwrap();
        mux.unbind();

        sender
            .send_payload(EventKind::File, &json!({"type": "chunk"}))
            .await
            .unwrap();
        assert_eq!(channel.sent().len(), 1);

        channel.set_state(ChannelState::Closing);
        assert!(matches!(
            sender.send_payload(EventKind::File, &json!({})).await,
            Err(DataChannelError::NotReady(ChannelState::Closing))
        ));
    }

    #[test]
    fn dispatch_routes_by_kind_and_skips_unknown() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut mux = DataChannelMultiplexer::new();
        let sink = seen.clone();
        mux.on_receive(EventKind::Chat, move |from, envelope| {
            let chat: ChatPayload = envelope.payload_as().unwrap();
            sink.lock().unwrap().push((from.to_string(), chat.text));
        });

        let chat = r#"{"kind":"chat","payload":{"userId":"b","nickName":"Bo","text":"  hi  "}}"#;
        assert!(mux.dispatch("b", chat));
        assert!(!mux.dispatch("b", r#"{"kind":"whiteboard","payload":{}}"#));
        assert!(!mux.dispatch("b", r#"{"kind":"game","payload":{}}"#));
        assert!(!mux.dispatch("b", "not json"));

        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[("b".to_string(), "  hi  ".to_string())]
        );
    }
}
