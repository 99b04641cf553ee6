//! WebSocket transport
//!
//! This file implements the broker's network front: it accepts TCP/WebSocket
//! connections, registers a `Peer` for each one, greets it with a `welcome`
//! frame and translates incoming JSON frames into broker operations.
//! Responsibilities:
//! - one writer task per connection drains the peer's outbound channel
//! - the reader loop applies frames in arrival order
//! - on disconnect the peer is cleaned up exactly once, which requeues every
//!   delivery it had not settled

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::spawn;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::broker::Broker;
use crate::broker::peer::Peer;
use crate::transport::message::{ClientFrame, ErrorCode, ServerFrame};

pub async fn bind(addr: &str) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    info!("broker listening on ws://{}", listener.local_addr()?);
    Ok(listener)
}

/// Serves connections from `listener` until the listener fails.
pub async fn start_websocket_server(listener: TcpListener, broker: Arc<Mutex<Broker>>) {
    while let Ok((stream, remote)) = listener.accept().await {
        let broker = broker.clone();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!(%remote, "WebSocket handshake error: {e}");
                    return;
                }
            };
            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
            let peer = Peer::new(tx);
            let peer_id = peer.id.clone();

            peer.send(&ServerFrame::Welcome {
                connection: peer_id.clone(),
                server: format!("taskfan/{}", env!("CARGO_PKG_VERSION")),
            });
            lock(&broker).register_peer(peer);
            info!(peer = %peer_id, %remote, "connection opened");

            let cleanup_called = Arc::new(AtomicBool::new(false));

            let do_cleanup = {
                let broker = broker.clone();
                let peer_id = peer_id.clone();
                let cleanup_called = cleanup_called.clone();

                move || {
                    if !cleanup_called.swap(true, Ordering::SeqCst) {
                        lock(&broker).cleanup_peer(&peer_id);
                        info!(peer = %peer_id, "connection closed");
                    }
                }
            };

            {
                let peer_id = peer_id.clone();
                let do_cleanup = do_cleanup.clone();

                spawn(async move {
                    while let Some(msg) = rx.recv().await {
                        if let Err(e) = ws_sender.send(msg).await {
                            debug!(peer = %peer_id, "failed to send frame: {e}");
                            break;
                        }
                    }

                    do_cleanup();
                });
            }

            while let Some(Ok(msg)) = ws_receiver.next().await {
                if msg.is_close() {
                    break;
                }
                let Ok(text) = msg.to_text() else {
                    continue;
                };
                if text.is_empty() {
                    continue;
                }

                match serde_json::from_str::<ClientFrame>(text) {
                    Ok(frame) => {
                        debug!(peer = %peer_id, ?frame, "frame received");
                        lock(&broker).handle_frame(&peer_id, frame);
                    }
                    Err(err) => {
                        warn!(
                            peer = %peer_id,
                            "invalid client frame: {err} | {}",
                            text.chars().take(100).collect::<String>()
                        );
                        let guard = lock(&broker);
                        if let Some(peer) = guard.peers.get(&peer_id) {
                            peer.send(&ServerFrame::Error {
                                channel: 0,
                                request: None,
                                code: ErrorCode::FrameError,
                                message: err.to_string(),
                                channel_closed: false,
                            });
                        }
                    }
                }
            }

            do_cleanup();
        });
    }
}

/// Recovers the guard from a poisoned lock.
fn lock(broker: &Mutex<Broker>) -> std::sync::MutexGuard<'_, Broker> {
    broker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
