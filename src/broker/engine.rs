//! Broker engine
//!
//! This module contains the broker implementation responsible for:
//! - declaring named queues, durable or transient, idempotently
//! - tracking per-channel prefetch limits and unacknowledged deliveries
//! - dispatching ready messages round-robin to consumers with capacity
//! - settling deliveries on ack/nack and requeueing them when a channel or
//!   connection goes away before they were settled
//! - writing durable queues and persistent messages through `Persistence`
//!
//! Concurrency and usage notes:
//! - The public API here is synchronous and designed to be held behind a
//!   lock (`Arc<Mutex<Broker>>`) by the transport layer. Frames to peers are
//!   pushed into unbounded per-connection channels, so no network I/O happens
//!   while the lock is held.
//! - The reply to a request is queued before any delivery that request
//!   triggers.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::message::QueuedMessage;
use crate::broker::peer::Peer;
use crate::broker::queue::{ConsumerRef, Queue, QueueStats};
use crate::persistence::Persistence;
use crate::transport::message::{ChannelId, ClientFrame, DeliveryTag, Reply, ServerFrame};
use crate::utils::error::BrokerError;

type ChannelKey = (String, ChannelId);

#[derive(Debug)]
struct Unacked {
    queue: String,
    message: QueuedMessage,
}

#[derive(Debug, Default)]
struct ChannelState {
    /// 0 means unlimited.
    prefetch: u16,
    next_tag: DeliveryTag,
    unacked: BTreeMap<DeliveryTag, Unacked>,
    /// consumer tag -> queue name
    consumers: HashMap<String, String>,
}

impl ChannelState {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.unacked.len() < usize::from(self.prefetch)
    }
}

/// A failed request, with whether the broker closed the channel because of it.
#[derive(Debug)]
struct Failure {
    error: BrokerError,
    channel_closed: bool,
}

impl From<BrokerError> for Failure {
    fn from(error: BrokerError) -> Self {
        Self {
            error,
            channel_closed: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct Broker {
    pub queues: HashMap<String, Queue>,
    pub peers: HashMap<String, Peer>,
    channels: HashMap<ChannelKey, ChannelState>,
    persistence: Option<Persistence>,
    next_message_id: u64,
    dirty: BTreeSet<String>,
}

impl Broker {
    /// A broker that keeps everything in memory.
    pub fn new() -> Self {
        Self {
            next_message_id: 1,
            ..Self::default()
        }
    }

    /// A broker backed by `persistence`, restoring durable queues and their
    /// persistent messages from it.
    pub fn with_persistence(persistence: Persistence) -> Result<Self, BrokerError> {
        let mut broker = Self::new();
        let mut restored_messages = 0usize;

        for stored in persistence.load_queues()? {
            if !stored.durable {
                continue;
            }
            let mut queue = Queue::new(&stored.name, true);
            for msg in persistence.load_messages(&stored.name)? {
                broker.next_message_id = broker.next_message_id.max(msg.id + 1);
                queue.ready.push_back(QueuedMessage {
                    id: msg.id,
                    payload: msg.payload,
                    persistent: true,
                    redelivered: false,
                    timestamp: msg.timestamp,
                });
            }
            restored_messages += queue.ready.len();
            broker.queues.insert(stored.name, queue);
        }

        info!(
            queues = broker.queues.len(),
            messages = restored_messages,
            "restored durable state"
        );
        broker.persistence = Some(persistence);
        Ok(broker)
    }

    /// Flushes pending writes to disk, if the broker is persistent.
    pub fn flush(&self) -> Result<(), BrokerError> {
        if let Some(persistence) = &self.persistence {
            persistence.flush()?;
        }
        Ok(())
    }

    pub fn register_peer(&mut self, peer: Peer) {
        debug!(peer = %peer.id, "peer registered");
        self.peers.insert(peer.id.clone(), peer);
    }

    /// Closes every channel of a connection, requeueing its unacknowledged
    /// deliveries, and forgets the peer.
    pub fn cleanup_peer(&mut self, connection: &str) {
        let keys: Vec<ChannelKey> = self
            .channels
            .keys()
            .filter(|(conn, _)| conn == connection)
            .cloned()
            .collect();

        for key in keys {
            if let Some(state) = self.channels.remove(&key) {
                self.release(&key, state);
            }
        }
        self.peers.remove(connection);
        self.dispatch_dirty();

        debug!(peer = %connection, "cleaned up peer");
    }

    pub fn queue_stats(&self, name: &str) -> Option<QueueStats> {
        self.queues.get(name).map(|q| QueueStats {
            durable: q.durable,
            ready: q.ready.len(),
            unacked: q.unacked,
            consumers: q.consumers.len(),
        })
    }

    /// Applies one client request and answers it on the peer's connection.
    pub fn handle_frame(&mut self, connection: &str, frame: ClientFrame) {
        let channel = frame.channel();
        let request = frame.request();

        let response = match self.apply(connection, frame) {
            Ok(reply) => ServerFrame::Ok {
                channel,
                request,
                reply,
            },
            Err(failure) => {
                warn!(
                    peer = %connection,
                    channel,
                    closed = failure.channel_closed,
                    "request failed: {}",
                    failure.error
                );
                ServerFrame::Error {
                    channel,
                    request: Some(request),
                    code: failure.error.code(),
                    message: failure.error.to_string(),
                    channel_closed: failure.channel_closed,
                }
            }
        };

        if let Some(peer) = self.peers.get(connection) {
            if !peer.send(&response) {
                warn!(peer = %connection, "send loop gone, dropping response");
            }
        }

        self.dispatch_dirty();
    }

    fn apply(&mut self, conn: &str, frame: ClientFrame) -> Result<Reply, Failure> {
        match frame {
            ClientFrame::OpenChannel { channel, .. } => Ok(self.open_channel(conn, channel)?),
            ClientFrame::CloseChannel { channel, .. } => Ok(self.close_channel(conn, channel)),
            ClientFrame::DeclareQueue {
                channel,
                queue,
                durable,
                ..
            } => self
                .declare_queue(conn, channel, &queue, durable)
                .map_err(|e| self.channel_exception(conn, channel, e)),
            ClientFrame::Qos {
                channel, prefetch, ..
            } => Ok(self.set_qos(conn, channel, prefetch)?),
            ClientFrame::Publish {
                channel,
                queue,
                payload,
                persistent,
                ..
            } => Ok(self.publish(conn, channel, &queue, payload, persistent)?),
            ClientFrame::Consume {
                channel,
                queue,
                consumer_tag,
                ..
            } => self
                .consume(conn, channel, &queue, consumer_tag)
                .map_err(|e| self.channel_exception(conn, channel, e)),
            ClientFrame::Cancel {
                channel,
                consumer_tag,
                ..
            } => Ok(self.cancel(conn, channel, &consumer_tag)?),
            ClientFrame::Ack {
                channel,
                delivery_tag,
                ..
            } => self
                .ack(conn, channel, delivery_tag)
                .map_err(|e| self.channel_exception(conn, channel, e)),
            ClientFrame::Nack {
                channel,
                delivery_tag,
                requeue,
                ..
            } => self
                .nack(conn, channel, delivery_tag, requeue)
                .map_err(|e| self.channel_exception(conn, channel, e)),
        }
    }

    /// Closes the channel a failed request arrived on, if it is open.
    fn channel_exception(&mut self, conn: &str, channel: ChannelId, error: BrokerError) -> Failure {
        let key = (conn.to_string(), channel);
        let channel_closed = match self.channels.remove(&key) {
            Some(state) => {
                self.release(&key, state);
                true
            }
            None => false,
        };
        Failure {
            error,
            channel_closed,
        }
    }

    fn channel_mut(&mut self, conn: &str, channel: ChannelId) -> Result<&mut ChannelState, BrokerError> {
        self.channels
            .get_mut(&(conn.to_string(), channel))
            .ok_or(BrokerError::ChannelNotOpen(channel))
    }

    pub fn open_channel(&mut self, conn: &str, channel: ChannelId) -> Result<Reply, BrokerError> {
        let key = (conn.to_string(), channel);
        if self.channels.contains_key(&key) {
            return Err(BrokerError::ChannelAlreadyOpen(channel));
        }
        self.channels.insert(key, ChannelState::default());
        Ok(Reply::ChannelOpened)
    }

    /// Closing a channel that is not open is a no-op.
    pub fn close_channel(&mut self, conn: &str, channel: ChannelId) -> Reply {
        let key = (conn.to_string(), channel);
        if let Some(state) = self.channels.remove(&key) {
            self.release(&key, state);
        }
        Reply::ChannelClosed
    }

    /// Requeues a closed channel's unacked deliveries at the head of their
    /// queues, in delivery order, and detaches its consumers.
    fn release(&mut self, key: &ChannelKey, state: ChannelState) {
        let requeued = state.unacked.len();
        for (_, unacked) in state.unacked.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                queue.unacked = queue.unacked.saturating_sub(1);
                queue.requeue(unacked.message);
                self.dirty.insert(unacked.queue);
            }
        }

        for (tag, queue_name) in state.consumers {
            if let Some(queue) = self.queues.get_mut(&queue_name) {
                queue.detach(|c| c.connection == key.0 && c.channel == key.1 && c.tag == tag);
            }
        }

        if requeued > 0 {
            debug!(peer = %key.0, channel = key.1, requeued, "channel released");
        }
    }

    pub fn declare_queue(
        &mut self,
        conn: &str,
        channel: ChannelId,
        name: &str,
        durable: bool,
    ) -> Result<Reply, BrokerError> {
        self.channel_mut(conn, channel)?;
        if name.is_empty() {
            return Err(BrokerError::Invalid("queue name must not be empty".into()));
        }

        if let Some(queue) = self.queues.get(name) {
            if queue.durable != durable {
                return Err(BrokerError::QueueConflict {
                    queue: name.to_string(),
                    existing: queue.durable,
                });
            }
            return Ok(Reply::QueueDeclared {
                queue: name.to_string(),
                message_count: queue.ready.len(),
                consumer_count: queue.consumers.len(),
            });
        }

        if durable {
            if let Some(persistence) = &self.persistence {
                persistence.store_queue(name, durable)?;
            }
        }
        self.queues.insert(name.to_string(), Queue::new(name, durable));
        info!(queue = name, durable, "queue declared");

        Ok(Reply::QueueDeclared {
            queue: name.to_string(),
            message_count: 0,
            consumer_count: 0,
        })
    }

    pub fn set_qos(&mut self, conn: &str, channel: ChannelId, prefetch: u16) -> Result<Reply, BrokerError> {
        let state = self.channel_mut(conn, channel)?;
        state.prefetch = prefetch;
        let queues: Vec<String> = state.consumers.values().cloned().collect();
        self.dirty.extend(queues);
        Ok(Reply::QosOk)
    }

    /// Enqueues a message on `queue` through the default exchange. The
    /// message is on disk before the confirm is returned when both the queue
    /// is durable and the message persistent.
    pub fn publish(
        &mut self,
        conn: &str,
        channel: ChannelId,
        queue: &str,
        payload: Vec<u8>,
        persistent: bool,
    ) -> Result<Reply, BrokerError> {
        self.channel_mut(conn, channel)?;
        let target = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::NotFound(queue.to_string()))?;

        let id = self.next_message_id;
        self.next_message_id += 1;

        if target.stores(persistent) {
            if let Some(persistence) = &self.persistence {
                persistence.store_message(queue, id, &payload)?;
            }
        }
        target.ready.push_back(QueuedMessage::new(id, payload, persistent));
        self.dirty.insert(queue.to_string());

        debug!(queue, id, "message enqueued");
        Ok(Reply::Confirmed)
    }

    pub fn consume(
        &mut self,
        conn: &str,
        channel: ChannelId,
        queue: &str,
        consumer_tag: String,
    ) -> Result<Reply, BrokerError> {
        if !self.queues.contains_key(queue) {
            self.channel_mut(conn, channel)?;
            return Err(BrokerError::NotFound(queue.to_string()));
        }

        let tag = if consumer_tag.is_empty() {
            format!("ctag-{}", Uuid::new_v4())
        } else {
            consumer_tag
        };

        let state = self.channel_mut(conn, channel)?;
        if state.consumers.contains_key(&tag) {
            return Err(BrokerError::DuplicateConsumer(tag));
        }
        state.consumers.insert(tag.clone(), queue.to_string());

        if let Some(target) = self.queues.get_mut(queue) {
            target.attach(ConsumerRef {
                connection: conn.to_string(),
                channel,
                tag: tag.clone(),
            });
        }
        self.dirty.insert(queue.to_string());

        debug!(peer = %conn, channel, queue, consumer = %tag, "consumer attached");
        Ok(Reply::ConsumeOk { consumer_tag: tag })
    }

    /// Cancelling an unknown consumer tag is a no-op.
    pub fn cancel(&mut self, conn: &str, channel: ChannelId, consumer_tag: &str) -> Result<Reply, BrokerError> {
        let state = self.channel_mut(conn, channel)?;
        if let Some(queue_name) = state.consumers.remove(consumer_tag) {
            if let Some(queue) = self.queues.get_mut(&queue_name) {
                queue.detach(|c| c.connection == conn && c.channel == channel && c.tag == consumer_tag);
            }
        }
        Ok(Reply::CancelOk)
    }

    fn settle(&mut self, conn: &str, channel: ChannelId, tag: DeliveryTag) -> Result<Unacked, BrokerError> {
        let state = self.channel_mut(conn, channel)?;
        let unacked = state
            .unacked
            .remove(&tag)
            .ok_or(BrokerError::UnknownDeliveryTag(tag))?;
        if let Some(queue) = self.queues.get_mut(&unacked.queue) {
            queue.unacked = queue.unacked.saturating_sub(1);
        }
        self.dirty.insert(unacked.queue.clone());
        Ok(unacked)
    }

    /// Deletes the stored copy of an unsettled delivery. The delivery stays
    /// unacked, so a failure here leaves it to be requeued with its channel.
    fn forget(&self, conn: &str, channel: ChannelId, tag: DeliveryTag) -> Result<(), BrokerError> {
        let unacked = self
            .channels
            .get(&(conn.to_string(), channel))
            .ok_or(BrokerError::ChannelNotOpen(channel))?
            .unacked
            .get(&tag)
            .ok_or(BrokerError::UnknownDeliveryTag(tag))?;
        let stored = self
            .queues
            .get(&unacked.queue)
            .is_some_and(|q| q.stores(unacked.message.persistent));
        if stored {
            if let Some(persistence) = &self.persistence {
                persistence.remove_message(&unacked.queue, unacked.message.id)?;
            }
        }
        Ok(())
    }

    /// Removes the delivered message permanently.
    pub fn ack(&mut self, conn: &str, channel: ChannelId, tag: DeliveryTag) -> Result<Reply, BrokerError> {
        self.forget(conn, channel, tag)?;
        let unacked = self.settle(conn, channel, tag)?;
        debug!(queue = %unacked.queue, tag, "delivery acked");
        Ok(Reply::Acked)
    }

    pub fn nack(
        &mut self,
        conn: &str,
        channel: ChannelId,
        tag: DeliveryTag,
        requeue: bool,
    ) -> Result<Reply, BrokerError> {
        if !requeue {
            self.forget(conn, channel, tag)?;
        }
        let unacked = self.settle(conn, channel, tag)?;
        if requeue {
            if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                queue.requeue(unacked.message);
            }
        }
        debug!(queue = %unacked.queue, tag, requeue, "delivery rejected");
        Ok(Reply::Nacked)
    }

    fn dispatch_dirty(&mut self) {
        let dirty = std::mem::take(&mut self.dirty);
        for name in dirty {
            self.dispatch(&name);
        }
    }

    /// Hands ready messages to consumers round-robin until the queue is empty
    /// or every consumer's channel is at its prefetch limit.
    fn dispatch(&mut self, name: &str) {
        let Some(queue) = self.queues.get_mut(name) else {
            return;
        };

        let mut idle = 0;
        while !queue.ready.is_empty() && idle < queue.consumers.len() {
            let Some(consumer) = queue.consumers.pop_front() else {
                break;
            };
            let key = (consumer.connection.clone(), consumer.channel);
            let state = match self.channels.get_mut(&key) {
                Some(state) if state.has_capacity() => state,
                _ => {
                    queue.consumers.push_back(consumer);
                    idle += 1;
                    continue;
                }
            };
            let Some(message) = queue.ready.pop_front() else {
                queue.consumers.push_front(consumer);
                break;
            };

            state.next_tag += 1;
            let tag = state.next_tag;
            let frame = ServerFrame::Deliver {
                channel: consumer.channel,
                consumer_tag: consumer.tag.clone(),
                delivery_tag: tag,
                redelivered: message.redelivered,
                queue: name.to_string(),
                payload: message.payload.clone(),
            };
            state.unacked.insert(
                tag,
                Unacked {
                    queue: name.to_string(),
                    message,
                },
            );
            queue.unacked += 1;

            let sent = self
                .peers
                .get(&consumer.connection)
                .is_some_and(|peer| peer.send(&frame));
            if !sent {
                warn!(
                    peer = %consumer.connection,
                    queue = name,
                    tag,
                    "delivery not sent; it is requeued when the peer is cleaned up"
                );
            }

            queue.consumers.push_back(consumer);
            idle = 0;
        }
    }
}
