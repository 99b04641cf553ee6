use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::client::connection::Shared;
use crate::client::consumer::Consumer;
use crate::transport::message::{ChannelId, ClientFrame, DeliveryTag, ErrorCode, Reply, RequestId};
use crate::utils::error::ClientError;

/// Whether the broker writes a message to disk when its queue is durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    Transient,
    #[default]
    Persistent,
}

/// Reply to a queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: usize,
    pub consumer_count: usize,
}

/// Shared close state of one channel. The first close reason wins.
#[derive(Debug, Default)]
pub(crate) struct ChannelStatus {
    closed: Mutex<Option<String>>,
}

impl ChannelStatus {
    pub(crate) fn close(&self, reason: &str) {
        let mut closed = self.closed.lock().unwrap_or_else(|p| p.into_inner());
        if closed.is_none() {
            *closed = Some(reason.to_string());
        }
    }

    pub(crate) fn reason(&self) -> Option<String> {
        self.closed.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

/// A logical path over a `Connection`. Cheap to clone; every clone refers to
/// the same broker-side channel.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<Shared>,
    id: ChannelId,
    status: Arc<ChannelStatus>,
}

impl Channel {
    pub(crate) fn attach(shared: Arc<Shared>, id: ChannelId, status: Arc<ChannelStatus>) -> Self {
        Self { shared, id, status }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.status.reason().is_none() && self.shared.is_open()
    }

    /// Why the channel closed, if it has.
    pub fn close_reason(&self) -> Option<String> {
        self.status.reason()
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        match self.status.reason() {
            Some(reason) => Err(ClientError::ChannelClosed {
                channel: self.id,
                reason,
            }),
            None => Ok(()),
        }
    }

    async fn call(&self, frame_for: impl FnOnce(RequestId) -> ClientFrame) -> Result<Reply, ClientError> {
        self.ensure_open()?;
        self.shared.call(frame_for).await
    }

    /// Declares `name` with the given durability. Redeclaring with the same
    /// flag returns the existing queue; a different flag fails with
    /// `QueueConflict` and the broker closes this channel.
    pub async fn declare_queue(&self, name: &str, durable: bool) -> Result<QueueInfo, ClientError> {
        let reply = self
            .call(|request| ClientFrame::DeclareQueue {
                channel: self.id,
                request,
                queue: name.to_string(),
                durable,
            })
            .await
            .map_err(|e| match e {
                ClientError::Remote {
                    code: ErrorCode::PreconditionFailed,
                    message,
                } => ClientError::QueueConflict {
                    queue: name.to_string(),
                    reason: message,
                },
                other => other,
            })?;

        match reply {
            Reply::QueueDeclared {
                queue,
                message_count,
                consumer_count,
            } => Ok(QueueInfo {
                name: queue,
                message_count,
                consumer_count,
            }),
            other => Err(unexpected(other)),
        }
    }

    /// Bounds the deliveries the broker keeps in flight on this channel.
    /// `0` removes the bound.
    pub async fn basic_qos(&self, prefetch: u16) -> Result<(), ClientError> {
        match self
            .call(|request| ClientFrame::Qos {
                channel: self.id,
                request,
                prefetch,
            })
            .await?
        {
            Reply::QosOk => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Publishes `payload` to `queue` through the default exchange and waits
    /// for the broker's confirm.
    pub async fn publish(&self, queue: &str, payload: &[u8], mode: DeliveryMode) -> Result<(), ClientError> {
        let publish_error = |reason: String| ClientError::Publish {
            queue: queue.to_string(),
            reason,
        };

        let reply = self
            .call(|request| ClientFrame::Publish {
                channel: self.id,
                request,
                queue: queue.to_string(),
                payload: payload.to_vec(),
                persistent: mode == DeliveryMode::Persistent,
            })
            .await
            .map_err(|e| publish_error(e.to_string()))?;

        match reply {
            Reply::Confirmed => Ok(()),
            other => Err(publish_error(format!("unexpected reply {other:?}"))),
        }
    }

    /// Starts consuming `queue`. An empty `consumer_tag` gets a generated one.
    pub async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<Consumer, ClientError> {
        self.ensure_open()?;
        let tag = if consumer_tag.is_empty() {
            format!("ctag-{}", Uuid::new_v4())
        } else {
            consumer_tag.to_string()
        };

        // route first: deliveries may arrive right behind the consume-ok
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.shared.state();
            let Some(route) = state.channels.get_mut(&self.id) else {
                return Err(ClientError::ChannelClosed {
                    channel: self.id,
                    reason: self.close_reason().unwrap_or_else(|| "channel not open".into()),
                });
            };
            if route.consumers.contains_key(&tag) {
                return Err(ClientError::Protocol(format!(
                    "consumer tag '{tag}' already in use"
                )));
            }
            route.consumers.insert(tag.clone(), tx);
        }

        let result = self
            .call(|request| ClientFrame::Consume {
                channel: self.id,
                request,
                queue: queue.to_string(),
                consumer_tag: tag.clone(),
            })
            .await;

        match result {
            Ok(Reply::ConsumeOk { consumer_tag }) => {
                debug!(channel = self.id, queue, consumer = %consumer_tag, "consuming");
                Ok(Consumer::new(consumer_tag, self.clone(), rx))
            }
            Ok(other) => {
                self.forget_consumer(&tag);
                Err(unexpected(other))
            }
            Err(e) => {
                self.forget_consumer(&tag);
                Err(e)
            }
        }
    }

    /// Stops deliveries to `consumer_tag`. Deliveries already received stay
    /// with the consumer and still need settling.
    pub async fn cancel(&self, consumer_tag: &str) -> Result<(), ClientError> {
        let result = self
            .call(|request| ClientFrame::Cancel {
                channel: self.id,
                request,
                consumer_tag: consumer_tag.to_string(),
            })
            .await;
        self.forget_consumer(consumer_tag);
        match result? {
            Reply::CancelOk => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    fn forget_consumer(&self, consumer_tag: &str) {
        if let Some(route) = self.shared.state().channels.get_mut(&self.id) {
            route.consumers.remove(consumer_tag);
        }
    }

    pub(crate) async fn ack(&self, delivery_tag: DeliveryTag) -> Result<(), ClientError> {
        match self
            .call(|request| ClientFrame::Ack {
                channel: self.id,
                request,
                delivery_tag,
            })
            .await?
        {
            Reply::Acked => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub(crate) async fn nack(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<(), ClientError> {
        match self
            .call(|request| ClientFrame::Nack {
                channel: self.id,
                request,
                delivery_tag,
                requeue,
            })
            .await?
        {
            Reply::Nacked => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Closes the channel; the broker requeues whatever it still had in
    /// flight here. Closing a closed channel is a no-op.
    pub async fn close(&self) -> Result<(), ClientError> {
        if !self.is_open() {
            return Ok(());
        }
        let result = self
            .shared
            .call(|request| ClientFrame::CloseChannel {
                channel: self.id,
                request,
            })
            .await;

        self.status.close("closed by client");
        self.shared.state().channels.remove(&self.id);
        debug!(channel = self.id, "channel closed");

        match result {
            Ok(_) | Err(ClientError::ConnectionClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn unexpected(reply: Reply) -> ClientError {
    ClientError::Protocol(format!("unexpected reply {reply:?}"))
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .finish()
    }
}
