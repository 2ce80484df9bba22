//! REST calls made around a call: relay configuration and room identity.

use crate::rtc::IceServer;
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use tracing::{info, warn};
use url::Url;

/// Relay server credentials, handed to every peer connection.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TurnConfig {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl TurnConfig {
    pub fn into_ice_server(self) -> IceServer {
        IceServer {
            urls: vec![self.url],
            username: self.username,
            credential: self.credential,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub nick_name: Option<String>,
    #[serde(default)]
    pub room_id: Option<String>,
    #[serde(default)]
    pub room_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RoomResponse {
    data: Option<RoomInfo>,
}

/// Who we are in the room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomIdentity {
    pub user_id: String,
    pub nick_name: String,
    pub room_id: String,
    pub room_name: Option<String>,
}

impl RoomInfo {
    pub fn into_identity(self, requested_room: &str) -> Result<RoomIdentity> {
        let user_id = self
            .user_id
            .or(self.uuid)
            .ok_or_else(|| anyhow!("room info carries neither userId nor uuid"))?;
        let nick_name = self
            .nick_name
            .ok_or_else(|| anyhow!("room info carries no nickName"))?;
        Ok(RoomIdentity {
            user_id,
            nick_name,
            room_id: self.room_id.unwrap_or_else(|| requested_room.to_string()),
            room_name: self.room_name,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
}

impl ApiClient {
    pub fn new(base: Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            base,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base.as_str().trim_end_matches('/'), path)
    }

    pub async fn turn_config(&self) -> Result<TurnConfig> {
        let url = self.endpoint("turnconfig");
        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!({}))
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;
        if !resp.status().is_success() {
            return Err(anyhow!("turn config request failed: {}", resp.status()));
        }
        Ok(resp.json::<TurnConfig>().await?)
    }

    /// Relay configuration for this session. Failures leave the peers with
    /// host and server-reflexive candidates only.
    pub async fn ice_servers(&self) -> Vec<IceServer> {
        match self.turn_config().await {
            Ok(turn) => {
                info!(url = %turn.url, "relay configuration loaded");
                vec![turn.into_ice_server()]
            }
            Err(e) => {
                warn!("relay configuration unavailable, continuing without: {:#}", e);
                Vec::new()
            }
        }
    }

    pub async fn room_identity(&self, room_id: &str) -> Result<RoomIdentity> {
        let url = self.endpoint(&format!("chat/room/{room_id}"));
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;
        if !resp.status().is_success() {
            return Err(anyhow!("room lookup failed: {}", resp.status()));
        }
        let body: RoomResponse = resp.json().await?;
        body.data
            .ok_or_else(|| anyhow!("room {room_id} not found"))?
            .into_identity(room_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_info_falls_back_to_uuid() {
        let info: RoomInfo = serde_json::from_str(
            r#"{"uuid":"u-77","nickName":"guest","roomName":"standup","userCount":3}"#,
        )
        .unwrap();
        let identity = info.into_identity("r-1").unwrap();
        assert_eq!(identity.user_id, "u-77");
        assert_eq!(identity.nick_name, "guest");
        assert_eq!(identity.room_id, "r-1");
        assert_eq!(identity.room_name.as_deref(), Some("standup"));
    }

    #[test]
    fn room_info_without_identity_is_an_error() {
        let info: RoomInfo = serde_json::from_str(r#"{"nickName":"ghost"}"#).unwrap();
        assert!(info.into_identity("r-1").is_err());
    }

    #[test]
    fn turn_config_becomes_ice_server() {
        let turn: TurnConfig = serde_json::from_str(
            r#"{"url":"turn:turn.example.org:3478","username":"u","credential":"p"}"#,
        )
        .unwrap();
        let server = turn.into_ice_server();
        assert_eq!(server.urls, vec!["turn:turn.example.org:3478".to_string()]);
        assert_eq!(server.credential.as_deref(), Some("p"));
    }

    #[test]
    fn endpoints_join_without_double_slash() {
        let client = ApiClient::new(Url::parse("https://chat.example.org/api/").unwrap());
        assert_eq!(
            client.endpoint("turnconfig"),
            "https://chat.example.org/api/turnconfig"
        );
    }
}
