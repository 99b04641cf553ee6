//! Client connection
//!
//! A `Connection` owns one WebSocket to the broker. Two background tasks
//! serve it: a writer that drains the outbound frame channel into the socket,
//! and a reader that routes replies to waiting requests and deliveries to
//! their consumers. Channels are multiplexed over the connection by id.
//!
//! Connection loss fails every in-flight request with `ConnectionClosed` and
//! closes every channel, which ends all consumer streams.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::client::channel::{Channel, ChannelStatus};
use crate::client::delivery::Delivery;
use crate::transport::message::{ChannelId, ClientFrame, ErrorCode, Reply, RequestId, ServerFrame};
use crate::utils::error::ClientError;

pub const DEFAULT_PORT: u16 = 5680;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

struct RemoteFailure {
    code: ErrorCode,
    message: String,
}

type Pending = oneshot::Sender<Result<Reply, RemoteFailure>>;

pub(crate) struct Route {
    pub(crate) status: Arc<ChannelStatus>,
    pub(crate) consumers: HashMap<String, mpsc::UnboundedSender<Delivery>>,
}

#[derive(Default)]
pub(crate) struct State {
    pending: HashMap<RequestId, Pending>,
    pub(crate) channels: HashMap<ChannelId, Route>,
}

pub(crate) struct Shared {
    host: String,
    id: String,
    outbound: mpsc::UnboundedSender<WsMessage>,
    closed: AtomicBool,
    next_request: AtomicU64,
    next_channel: AtomicU16,
    state: Mutex<State>,
    writer: Mutex<Option<JoinHandle<()>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    pub(crate) fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// Sends a request and waits for its reply. Broker-side failures come
    /// back as `ClientError::Remote`.
    pub(crate) async fn call(
        &self,
        frame_for: impl FnOnce(RequestId) -> ClientFrame,
    ) -> Result<Reply, ClientError> {
        let request = self.next_request.fetch_add(1, Ordering::SeqCst);
        let frame = frame_for(request);
        let text = serde_json::to_string(&frame).map_err(|e| ClientError::Protocol(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state();
            // checked under the state lock so `fail` cannot miss this request
            if !self.is_open() {
                return Err(ClientError::ConnectionClosed);
            }
            state.pending.insert(request, tx);
        }

        if self.outbound.send(WsMessage::text(text)).is_err() {
            self.state().pending.remove(&request);
            return Err(ClientError::ConnectionClosed);
        }

        match rx.await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(failure)) => Err(ClientError::Remote {
                code: failure.code,
                message: failure.message,
            }),
            Err(_) => Err(ClientError::ConnectionClosed),
        }
    }

    /// Marks the connection dead: pending requests fail and every channel
    /// closes with `reason`.
    fn fail(&self, reason: &str) {
        let mut state = self.state();
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        state.pending.clear();
        for (_, route) in state.channels.drain() {
            route.status.close(reason);
        }
        debug!(connection = %self.id, reason, "connection marked closed");
    }

    fn route(self: &Arc<Self>, frame: ServerFrame) {
        match frame {
            ServerFrame::Ok { request, reply, .. } => {
                if let Some(tx) = self.state().pending.remove(&request) {
                    let _ = tx.send(Ok(reply));
                }
            }
            ServerFrame::Error {
                channel,
                request,
                code,
                message,
                channel_closed,
            } => {
                let mut state = self.state();
                if channel_closed {
                    if let Some(route) = state.channels.remove(&channel) {
                        route.status.close(&format!("{code}: {message}"));
                    }
                }
                match request.and_then(|r| state.pending.remove(&r)) {
                    Some(tx) => {
                        let _ = tx.send(Err(RemoteFailure { code, message }));
                    }
                    None => warn!(connection = %self.id, channel, %code, "broker error: {message}"),
                }
            }
            ServerFrame::Deliver {
                channel,
                consumer_tag,
                delivery_tag,
                redelivered,
                queue,
                payload,
            } => {
                let state = self.state();
                let Some(route) = state.channels.get(&channel) else {
                    warn!(channel, delivery_tag, "delivery for a closed channel");
                    return;
                };
                let delivery = Delivery {
                    payload,
                    delivery_tag,
                    redelivered,
                    queue,
                    consumer_tag: consumer_tag.clone(),
                    channel: Channel::attach(self.clone(), channel, route.status.clone()),
                };
                let routed = route
                    .consumers
                    .get(&consumer_tag)
                    .is_some_and(|tx| tx.send(delivery).is_ok());
                if !routed {
                    warn!(
                        channel,
                        delivery_tag,
                        consumer = %consumer_tag,
                        "no consumer for delivery; it is requeued when the channel closes"
                    );
                }
            }
            ServerFrame::Welcome { .. } => {
                warn!(connection = %self.id, "unexpected welcome frame");
            }
        }
    }
}

async fn read_loop<S>(shared: Weak<Shared>, mut stream: S)
where
    S: Stream<Item = Result<WsMessage, tungstenite::Error>> + Unpin,
{
    let reason = loop {
        let msg = match stream.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => break e.to_string(),
            None => break "connection closed by broker".to_string(),
        };
        if msg.is_close() {
            break "connection closed by broker".to_string();
        }
        let Some(shared) = shared.upgrade() else {
            return;
        };
        let Ok(text) = msg.to_text() else {
            continue;
        };
        match serde_json::from_str::<ServerFrame>(text) {
            Ok(frame) => shared.route(frame),
            Err(e) => warn!(connection = %shared.id, "unreadable frame from broker: {e}"),
        }
    };

    if let Some(shared) = shared.upgrade() {
        if shared.is_open() {
            warn!(host = %shared.host, "lost connection to broker: {reason}");
        }
        shared.fail(&reason);
    }
}

fn ws_url(host: &str) -> String {
    if host.starts_with("ws://") || host.starts_with("wss://") {
        host.to_string()
    } else if host.contains(':') {
        format!("ws://{host}")
    } else {
        format!("ws://{host}:{DEFAULT_PORT}")
    }
}

/// A live session with the broker.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Connects to `host` (`name` or `name:port`) with the default timeout.
    pub async fn open(host: &str) -> Result<Self, ClientError> {
        Self::open_with(host, DEFAULT_CONNECT_TIMEOUT).await
    }

    /// Connects and waits for the broker's `welcome` frame. Any failure,
    /// including the timeout, is a `ClientError::Connection`.
    pub async fn open_with(host: &str, timeout: Duration) -> Result<Self, ClientError> {
        let fail = |reason: String| ClientError::Connection {
            host: host.to_string(),
            reason,
        };
        let url = ws_url(host);

        let handshake = async {
            let (ws, _) = connect_async(url.as_str()).await.map_err(|e| e.to_string())?;
            let (sink, mut stream) = ws.split();
            let first = match stream.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => return Err(e.to_string()),
                None => return Err("connection closed during handshake".to_string()),
            };
            let text = first.to_text().map_err(|e| e.to_string())?;
            match serde_json::from_str::<ServerFrame>(text) {
                Ok(ServerFrame::Welcome { connection, server }) => Ok((sink, stream, connection, server)),
                Ok(other) => Err(format!("unexpected handshake frame: {other:?}")),
                Err(e) => Err(format!("unreadable handshake frame: {e}")),
            }
        };

        let (mut sink, stream, id, server) = tokio::time::timeout(timeout, handshake)
            .await
            .map_err(|_| fail(format!("no handshake within {timeout:?}")))?
            .map_err(fail)?;
        info!(host, connection = %id, %server, "connected to broker");

        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
        let shared = Arc::new(Shared {
            host: host.to_string(),
            id,
            outbound: tx,
            closed: AtomicBool::new(false),
            next_request: AtomicU64::new(1),
            next_channel: AtomicU16::new(1),
            state: Mutex::new(State::default()),
            writer: Mutex::new(None),
            reader: Mutex::new(None),
        });

        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = msg.is_close();
                if sink.send(msg).await.is_err() || closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });
        let reader = tokio::spawn(read_loop(Arc::downgrade(&shared), stream));
        *lock(&shared.writer) = Some(writer);
        *lock(&shared.reader) = Some(reader);

        Ok(Self { shared })
    }

    pub fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    /// Opens a new channel on this connection.
    pub async fn channel(&self) -> Result<Channel, ClientError> {
        let id = self.shared.next_channel.fetch_add(1, Ordering::SeqCst);
        let status = Arc::new(ChannelStatus::default());
        self.shared.state().channels.insert(
            id,
            Route {
                status: status.clone(),
                consumers: HashMap::new(),
            },
        );

        match self
            .shared
            .call(|request| ClientFrame::OpenChannel { channel: id, request })
            .await
        {
            Ok(_) => {
                debug!(channel = id, "channel opened");
                Ok(Channel::attach(self.shared.clone(), id, status))
            }
            Err(e) => {
                self.shared.state().channels.remove(&id);
                Err(e)
            }
        }
    }

    /// Closes every channel and the socket. Closing a closed connection is a
    /// no-op.
    pub async fn close(&self) {
        if !self.is_open() {
            return;
        }
        self.shared.fail("connection closed by client");
        let _ = self.shared.outbound.send(WsMessage::Close(None));

        if let Some(reader) = lock(&self.shared.reader).take() {
            reader.abort();
        }
        let writer = lock(&self.shared.writer).take();
        if let Some(writer) = writer {
            let _ = tokio::time::timeout(Duration::from_secs(1), writer).await;
        }
        info!(host = %self.shared.host, "connection closed");
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.shared.host)
            .field("id", &self.shared.id)
            .field("open", &self.is_open())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
