use crate::quality::QualityConfig;
use anyhow::{anyhow, Result};
use chatforyou_common::file_transfer::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_FILE_BYTES};
use chatforyou_common::SignalMessage;
use std::path::PathBuf;
use url::Url;

/// Everything a [`crate::CallSession`] needs to know about who and where it is.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub room_id: String,
    pub user_id: String,
    pub nick_name: String,
    pub quality: QualityConfig,
    pub file_out_dir: PathBuf,
    pub file_max_bytes: u64,
    pub file_chunk_size: usize,
}

impl ClientConfig {
    pub fn new(
        room_id: impl Into<String>,
        user_id: impl Into<String>,
        nick_name: impl Into<String>,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            user_id: user_id.into(),
            nick_name: nick_name.into(),
            quality: QualityConfig::default(),
            file_out_dir: PathBuf::from("received-files"),
            file_max_bytes: DEFAULT_MAX_FILE_BYTES,
            file_chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// First frame on a fresh signaling connection.
    pub fn join_message(&self) -> SignalMessage {
        SignalMessage::JoinRoom {
            nick_name: self.nick_name.clone(),
            user_id: self.user_id.clone(),
            room: self.room_id.clone(),
        }
    }
}

/// Websocket endpoint served next to the REST API.
pub fn signaling_url(api_base: &str) -> Result<Url> {
    let mut url = Url::parse(api_base.trim())?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(anyhow!("unsupported API scheme '{other}'")),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("cannot switch {api_base} to {scheme}"))?;
    let path = format!("{}/signal", url.path().trim_end_matches('/'));
    url.set_path(&path);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_websocket_url_from_api_base() {
        assert_eq!(
            signaling_url("http://localhost:8080").unwrap().as_str(),
            "ws://localhost:8080/signal"
        );
        assert_eq!(
            signaling_url("https://chat.example.org/api/").unwrap().as_str(),
            "wss://chat.example.org/api/signal"
        );
    }

    #[test]
    fn join_message_carries_identity() {
        let config = ClientConfig::new("r-1", "u-1", "Ann");
        assert_eq!(
            config.join_message().encode().unwrap(),
            r#"{"id":"joinRoom","nickName":"Ann","userId":"u-1","room":"r-1"}"#
        );
    }

    #[test]
    fn rejects_other_schemes() {
        assert!(signaling_url("ftp://example.org").is_err());
        assert!(signaling_url("not a url").is_err());
    }
}
