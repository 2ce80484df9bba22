use chatforyou_common::{Error as ProtocolError, SignalMessage};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("signaling channel is closed")]
    Closed,
    #[error("signaling transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// What the session sees coming out of the signaling channel.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalEvent {
    Message(SignalMessage),
    /// A frame that could not be decoded. The channel stays up.
    Rejected { reason: String },
    /// The transport is gone or the server declared the connection failed.
    /// Nothing reconnects on its own.
    ConnectionFail,
}

/// Frames queued for the writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(SignalMessage),
    Close,
}

/// Cloneable handle for queueing outbound signaling frames.
#[derive(Debug, Clone)]
pub struct SignalingSender {
    tx: mpsc::UnboundedSender<Outbound>,
    closed: Arc<AtomicBool>,
}

impl SignalingSender {
    /// A sender not attached to any transport; frames land in the returned
    /// receiver.
    pub fn detached() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                closed: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    pub fn send(&self, message: SignalMessage) -> Result<(), SignalingError> {
        if self.is_closed() {
            return Err(SignalingError::Closed);
        }
        debug!(id = message.id(), "queueing signaling message");
        self.tx
            .send(Outbound::Message(message))
            .map_err(|_| SignalingError::Closed)
    }

    /// Closes the channel. Further sends fail; the transport closing
    /// afterwards is not reported as a failure.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.tx.send(Outbound::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Websocket connection to the room server.
pub struct SignalingChannel;

impl SignalingChannel {
    /// Connects, sends `join` as the first frame and spawns the reader and
    /// writer tasks.
    pub async fn connect(
        url: &str,
        join: SignalMessage,
    ) -> Result<(SignalingSender, mpsc::UnboundedReceiver<SignalEvent>), SignalingError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| SignalingError::Transport(e.to_string()))?;
        info!("connected to signaling server: {}", url);

        let (mut write, mut read) = ws_stream.split();
        let (sender, mut outbound_rx) = SignalingSender::detached();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        sender.send(join)?;

        let closed = sender.closed.clone();
        let writer_events = event_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                match frame {
                    Outbound::Message(message) => {
                        let text = match message.encode() {
                            Ok(text) => text,
                            Err(e) => {
                                error!("failed to encode {} message: {}", message.id(), e);
                                continue;
                            }
                        };
                        if let Err(e) = write.send(WsMessage::Text(text.into())).await {
                            error!("failed to send signaling message: {}", e);
                            if !closed.load(Ordering::SeqCst) {
                                let _ = writer_events.send(SignalEvent::ConnectionFail);
                            }
                            break;
                        }
                    }
                    Outbound::Close => {
                        let _ = write.send(WsMessage::Close(None)).await;
                        break;
                    }
                }
            }
            debug!("signaling writer finished");
        });

        let closed = sender.closed.clone();
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => {
                        let event = match SignalMessage::decode(text.as_str()) {
                            Ok(SignalMessage::ConnectionFail) => SignalEvent::ConnectionFail,
                            Ok(message) => SignalEvent::Message(message),
                            Err(e) => {
                                warn!("rejected signaling frame: {}", e);
                                SignalEvent::Rejected {
                                    reason: e.to_string(),
                                }
                            }
                        };
                        if event_tx.send(event).is_err() {
                            return;
                        }
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        if !closed.load(Ordering::SeqCst) {
                            error!("signaling websocket error: {}", e);
                        }
                        break;
                    }
                }
            }
            if !closed.load(Ordering::SeqCst) {
                warn!("signaling connection lost");
                let _ = event_tx.send(SignalEvent::ConnectionFail);
            }
        });

        Ok((sender, event_rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detached_sender_queues_frames_in_order() {
        let (sender, mut rx) = SignalingSender::detached();
        sender.send(SignalMessage::LeaveRoom).unwrap();
        sender
            .send(SignalMessage::ParticipantLeft { name: "x".into() })
            .unwrap();

        assert_eq!(rx.try_recv().unwrap(), Outbound::Message(SignalMessage::LeaveRoom));
        assert!(matches!(
            rx.try_recv().unwrap(),
            Outbound::Message(SignalMessage::ParticipantLeft { .. })
        ));
    }

    #[test]
    fn close_is_idempotent_and_blocks_sends() {
        let (sender, mut rx) = SignalingSender::detached();
        let clone = sender.clone();
        sender.close();
        clone.close();

        assert_eq!(rx.try_recv().unwrap(), Outbound::Close);
        assert!(rx.try_recv().is_err());
        assert!(matches!(
            clone.send(SignalMessage::LeaveRoom),
            Err(SignalingError::Closed)
        ));
    }

    #[tokio::test]
    async fn connect_to_unreachable_server_is_a_transport_error() {
        let result = SignalingChannel::connect(
            "ws://127.0.0.1:9/signal",
            SignalMessage::LeaveRoom,
        )
        .await;
        assert!(matches!(result, Err(SignalingError::Transport(_))));
    }
}
