//! Peer representation
//!
//! `Peer` models a connected client and holds the sending side of a
//! per-connection channel used by the broker to push frames to it.

use tokio::sync::mpsc::UnboundedSender;
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

use crate::transport::message::ServerFrame;

#[derive(Debug)]
pub struct Peer {
    /// Unique identifier for the connection.
    pub id: String,

    /// Channel to send WebSocket messages to the client.
    pub sender: UnboundedSender<WsMessage>,
}

impl Peer {
    pub fn new(sender: UnboundedSender<WsMessage>) -> Self {
        Self {
            id: format!("conn-{}", Uuid::new_v4()),
            sender,
        }
    }

    /// Serializes and queues a frame for this peer. Returns `false` if the
    /// peer's send loop is gone.
    pub fn send(&self, frame: &ServerFrame) -> bool {
        let text = match serde_json::to_string(frame) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(peer = %self.id, "failed to serialize frame: {e}");
                return false;
            }
        };
        self.sender.send(WsMessage::text(text)).is_ok()
    }
}
