use crate::error::{Error, Result};
use chatforyou_core::IceCandidate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Roster entry as announced by the signaling server.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub user_id: String,
    pub nick_name: String,
}

/// Signaling frame exchanged with the room server, one JSON object per
/// websocket text message, discriminated by `id`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "id")]
pub enum SignalMessage {
    /// Sent once after the channel opens.
    #[serde(rename = "joinRoom", rename_all = "camelCase")]
    JoinRoom {
        nick_name: String,
        user_id: String,
        room: String,
    },

    /// Roster of everyone already in the room, sent in reply to `joinRoom`.
    #[serde(rename = "existingParticipants")]
    ExistingParticipants { data: Vec<ParticipantInfo> },

    #[serde(rename = "newParticipantArrived")]
    NewParticipantArrived { data: ParticipantInfo },

    /// Offer for the stream published by `sender`.
    #[serde(rename = "receiveVideoFrom", rename_all = "camelCase")]
    ReceiveVideoFrom {
        sender: String,
        nick_name: String,
        sdp_offer: String,
    },

    #[serde(rename = "receiveVideoAnswer", rename_all = "camelCase")]
    ReceiveVideoAnswer { name: String, sdp_answer: String },

    /// Local candidate for the connection identified by `name`.
    #[serde(rename = "onIceCandidate", rename_all = "camelCase")]
    OnIceCandidate {
        candidate: IceCandidate,
        name: String,
        nick_name: String,
    },

    /// Remote candidate for the connection identified by `name`.
    #[serde(rename = "iceCandidate", rename_all = "camelCase")]
    IceCandidate {
        candidate: IceCandidate,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nick_name: Option<String>,
    },

    #[serde(rename = "participantLeft")]
    ParticipantLeft { name: String },

    /// Fatal transport condition. Never retried automatically.
    #[serde(rename = "ConnectionFail")]
    ConnectionFail,

    #[serde(rename = "leaveRoom")]
    LeaveRoom,

    /// Caption text rendered onto the sender's outgoing video.
    #[serde(rename = "textOverlay", rename_all = "camelCase")]
    TextOverlay { room_id: String, text: String },

    /// Application event relayed through the server instead of the data channel.
    #[serde(rename = "genericDataEvent")]
    GenericDataEvent {
        sender: String,
        kind: String,
        #[serde(default)]
        payload: Value,
    },
}

/// Every `id` the protocol defines.
pub const KNOWN_IDS: &[&str] = &[
    "joinRoom",
    "existingParticipants",
    "newParticipantArrived",
    "receiveVideoFrom",
    "receiveVideoAnswer",
    "onIceCandidate",
    "iceCandidate",
    "participantLeft",
    "ConnectionFail",
    "leaveRoom",
    "textOverlay",
    "genericDataEvent",
];

impl SignalMessage {
    pub fn id(&self) -> &'static str {
        match self {
            SignalMessage::JoinRoom { .. } => "joinRoom",
            SignalMessage::ExistingParticipants { .. } => "existingParticipants",
            SignalMessage::NewParticipantArrived { .. } => "newParticipantArrived",
            SignalMessage::ReceiveVideoFrom { .. } => "receiveVideoFrom",
            SignalMessage::ReceiveVideoAnswer { .. } => "receiveVideoAnswer",
            SignalMessage::OnIceCandidate { .. } => "onIceCandidate",
            SignalMessage::IceCandidate { .. } => "iceCandidate",
            SignalMessage::ParticipantLeft { .. } => "participantLeft",
            SignalMessage::ConnectionFail => "ConnectionFail",
            SignalMessage::LeaveRoom => "leaveRoom",
            SignalMessage::TextOverlay { .. } => "textOverlay",
            SignalMessage::GenericDataEvent { .. } => "genericDataEvent",
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses one frame, telling unknown ids apart from malformed payloads.
    pub fn decode(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        let id = value
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::protocol("frame has no string 'id'"))?
            .to_string();
        if !KNOWN_IDS.contains(&id.as_str()) {
            return Err(Error::UnknownMessage(id));
        }
        serde_json::from_value(value).map_err(|err| Error::Malformed {
            id,
            reason: err.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn join_room_wire_shape() {
        let msg = SignalMessage::JoinRoom {
            nick_name: "alice".into(),
            user_id: "u-1".into(),
            room: "r-9".into(),
        };
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"id": "joinRoom", "nickName": "alice", "userId": "u-1", "room": "r-9"})
        );
    }

    #[test]
    fn decodes_roster() {
        let text = r#"{"id":"existingParticipants","data":[{"userId":"a","nickName":"A"},{"userId":"b","nickName":"B"}]}"#;
        match SignalMessage::decode(text).unwrap() {
            SignalMessage::ExistingParticipants { data } => {
                assert_eq!(data.len(), 2);
                assert_eq!(data[1].user_id, "b");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn decodes_remote_candidate_in_browser_shape() {
        let text = r#"{"id":"iceCandidate","name":"b","candidate":{"candidate":"candidate:1 1 udp 2122260223 10.0.0.2 5000 typ host","sdpMid":"0","sdpMLineIndex":0}}"#;
        match SignalMessage::decode(text).unwrap() {
            SignalMessage::IceCandidate {
                candidate,
                name,
                nick_name,
            } => {
                assert_eq!(name, "b");
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
                assert!(nick_name.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn connection_fail_is_bare() {
        assert_eq!(
            SignalMessage::decode(r#"{"id":"ConnectionFail"}"#).unwrap(),
            SignalMessage::ConnectionFail
        );
        assert_eq!(
            SignalMessage::LeaveRoom.encode().unwrap(),
            r#"{"id":"leaveRoom"}"#
        );
    }

    #[test]
    fn unknown_id_is_rejected_not_dropped() {
        let err = SignalMessage::decode(r#"{"id":"stopCommunication"}"#).unwrap_err();
        assert!(matches!(err, Error::UnknownMessage(ref id) if id == "stopCommunication"));
    }

    #[test]
    fn malformed_known_id() {
        let err = SignalMessage::decode(r#"{"id":"participantLeft"}"#).unwrap_err();
        assert!(matches!(err, Error::Malformed { ref id, .. } if id == "participantLeft"));

        let err = SignalMessage::decode(r#"{"name":"x"}"#).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));

        assert!(matches!(
            SignalMessage::decode("not json").unwrap_err(),
            Error::Serialization(_)
        ));
    }

    #[test]
    fn text_overlay_uses_room_id_key() {
        let msg = SignalMessage::TextOverlay {
            room_id: "r-1".into(),
            text: "hello".into(),
        };
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value, json!({"id": "textOverlay", "roomId": "r-1", "text": "hello"}));
        assert_eq!(msg.id(), "textOverlay");
    }
}
