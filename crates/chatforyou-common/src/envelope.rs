//! Data-channel payload envelope.
//!
//! Every application message on the data channel is `{"kind": ..., "payload": ...}`.
//! The kind is kept as a free string on the wire so that newer peers can
//! introduce kinds older peers merely log and skip.

use crate::error::Result;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Chat,
    File,
    Game,
    Caption,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::Chat,
        EventKind::File,
        EventKind::Game,
        EventKind::Caption,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Chat => "chat",
            EventKind::File => "file",
            EventKind::Game => "game",
            EventKind::Caption => "caption",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == tag)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataEnvelope {
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl DataEnvelope {
    pub fn new(kind: EventKind, payload: Value) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            payload,
        }
    }

    pub fn wrap<T: Serialize>(kind: EventKind, payload: &T) -> Result<Self> {
        Ok(Self::new(kind, serde_json::to_value(payload)?))
    }

    pub fn event_kind(&self) -> Option<EventKind> {
        EventKind::from_tag(&self.kind)
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Chat line, also used for the farewell notice on leave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    pub user_id: String,
    pub nick_name: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptionPayload {
    pub user_id: String,
    pub text: String,
}
