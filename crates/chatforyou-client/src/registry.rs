use crate::peer::PeerConnectionManager;
use std::collections::HashMap;
use tracing::{debug, info};

/// One member of the call.
#[derive(Debug)]
pub struct Participant {
    pub id: String,
    pub display_name: String,
    pub is_self: bool,
    peer: Option<PeerConnectionManager>,
}

impl Participant {
    pub fn peer(&self) -> Option<&PeerConnectionManager> {
        self.peer.as_ref()
    }

    pub fn peer_mut(&mut self) -> Option<&mut PeerConnectionManager> {
        self.peer.as_mut()
    }
}

/// Who is in the call. Entries are keyed by participant id and each owns its
/// peer connection.
#[derive(Debug, Default)]
pub struct ParticipantRegistry {
    participants: HashMap<String, Participant>,
    self_id: Option<String>,
}

impl ParticipantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn self_id(&self) -> Option<&str> {
        self.self_id.as_deref()
    }

    /// Registers the local participant. Returns `false` if already present.
    pub fn add_self(&mut self, id: &str, display_name: &str) -> bool {
        self.self_id = Some(id.to_string());
        self.insert(id, display_name, true)
    }

    /// Registers a remote participant. Duplicate announcements are ignored and
    /// return `false`.
    pub fn add_remote(&mut self, id: &str, display_name: &str) -> bool {
        self.insert(id, display_name, false)
    }

    fn insert(&mut self, id: &str, display_name: &str, is_self: bool) -> bool {
        if self.participants.contains_key(id) {
            debug!(participant = id, "participant already registered");
            return false;
        }
        self.participants.insert(
            id.to_string(),
            Participant {
                id: id.to_string(),
                display_name: display_name.to_string(),
                is_self,
                peer: None,
            },
        );
        info!(participant = id, name = display_name, is_self, "participant added");
        true
    }

    /// Hands the peer connection to its participant. Returns the peer back if
    /// the participant is gone, so the caller can dispose it.
    pub fn attach_peer(
        &mut self,
        id: &str,
        peer: PeerConnectionManager,
    ) -> Result<(), PeerConnectionManager> {
        match self.participants.get_mut(id) {
            Some(p) => {
                p.peer = Some(peer);
                Ok(())
            }
            None => Err(peer),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.participants.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Participant> {
        self.participants.get(id)
    }

    pub fn peer_mut(&mut self, id: &str) -> Option<&mut PeerConnectionManager> {
        self.participants.get_mut(id).and_then(|p| p.peer.as_mut())
    }

    pub fn self_peer(&self) -> Option<&PeerConnectionManager> {
        let id = self.self_id.as_deref()?;
        self.participants.get(id).and_then(|p| p.peer.as_ref())
    }

    pub fn all(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    /// Participant ids in a stable order.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.participants.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Removes the participant and disposes its connection. Unknown ids are
    /// a no-op.
    pub async fn remove(&mut self, id: &str) -> Option<Participant> {
        let mut participant = self.participants.remove(id)?;
        if let Some(peer) = participant.peer.as_mut() {
            peer.dispose().await;
        }
        if self.self_id.as_deref() == Some(id) {
            self.self_id = None;
        }
        info!(participant = id, "participant removed");
        Some(participant)
    }

    /// Removes everyone, disposing each connection independently.
    pub async fn clear(&mut self) -> usize {
        let ids = self.ids();
        for id in &ids {
            self.remove(id).await;
        }
        ids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackHub;
    use crate::rtc::{PeerDirection, PeerSpec};
    use crate::signaling::SignalingSender;
    use tokio::sync::mpsc;

    #[test]
    fn membership_follows_announcements() {
        let mut registry = ParticipantRegistry::new();
        assert!(registry.add_self("a", "Ann"));
        assert!(registry.add_remote("b", "Bo"));
        assert!(!registry.add_remote("b", "Bo again"));
        assert_eq!(registry.ids(), vec!["a", "b"]);
        assert_eq!(registry.get("b").unwrap().display_name, "Bo");
        assert!(registry.get("a").unwrap().is_self);
        assert_eq!(registry.self_id(), Some("a"));
    }

    #[tokio::test]
    async fn removing_unknown_participant_is_a_noop() {
        let mut registry = ParticipantRegistry::new();
        registry.add_remote("b", "Bo");
        assert!(registry.remove("zzz").await.is_none());
        assert!(registry.remove("b").await.is_some());
        assert!(registry.remove("b").await.is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn remove_disposes_the_peer_once() {
        let hub = LoopbackHub::new();
        let (signaling, _rx) = SignalingSender::detached();
        let (events, _events_rx) = mpsc::unbounded_channel();
        let spec = PeerSpec {
            participant_id: "b".into(),
            direction: PeerDirection::RecvOnly,
            local_stream: None,
            ice_servers: Vec::new(),
        };
        let peer = PeerConnectionManager::create(&hub.factory(), spec, "Bo", signaling, events)
            .await
            .unwrap();

        let mut registry = ParticipantRegistry::new();
        registry.add_remote("b", "Bo");
        registry.attach_peer("b", peer).unwrap();
        let removed = registry.remove("b").await.unwrap();

        assert!(removed.peer().unwrap().is_disposed());
        assert_eq!(hub.peer("b").unwrap().close_count(), 1);
    }

    #[tokio::test]
    async fn attaching_to_missing_participant_returns_the_peer() {
        let hub = LoopbackHub::new();
        let (signaling, _rx) = SignalingSender::detached();
        let (events, _events_rx) = mpsc::unbounded_channel();
        let spec = PeerSpec {
            participant_id: "gone".into(),
            direction: PeerDirection::RecvOnly,
            local_stream: None,
            ice_servers: Vec::new(),
        };
        let peer = PeerConnectionManager::create(&hub.factory(), spec, "Gone", signaling, events)
            .await
            .unwrap();

        let mut registry = ParticipantRegistry::new();
        assert!(registry.attach_peer("gone", peer).is_err());
    }
}
