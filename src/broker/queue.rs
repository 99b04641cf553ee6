use std::collections::VecDeque;

use crate::broker::message::QueuedMessage;
use crate::transport::message::ChannelId;

/// A consumer attached to a queue, addressed by the channel it lives on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerRef {
    pub connection: String,
    pub channel: ChannelId,
    pub tag: String,
}

/// A named queue held by the broker.
///
/// `ready` holds messages waiting for a consumer; `unacked` counts messages
/// handed to consumers that have not been settled yet. Consumers are kept in
/// rotation order for round-robin dispatch.
#[derive(Debug)]
pub struct Queue {
    pub name: String,
    pub durable: bool,
    pub ready: VecDeque<QueuedMessage>,
    pub unacked: usize,
    pub consumers: VecDeque<ConsumerRef>,
}

impl Queue {
    pub fn new(name: &str, durable: bool) -> Self {
        Self {
            name: name.to_string(),
            durable,
            ready: VecDeque::new(),
            unacked: 0,
            consumers: VecDeque::new(),
        }
    }

    /// Whether a message published in `persistent` mode must be written to disk.
    pub fn stores(&self, persistent: bool) -> bool {
        self.durable && persistent
    }

    pub fn attach(&mut self, consumer: ConsumerRef) {
        self.consumers.push_back(consumer);
    }

    /// Removes every consumer matching `pred`. Has no effect when none match.
    pub fn detach(&mut self, pred: impl Fn(&ConsumerRef) -> bool) {
        self.consumers.retain(|c| !pred(c));
    }

    /// Returns a message to the head of the queue, flagged as redelivered.
    pub fn requeue(&mut self, mut message: QueuedMessage) {
        message.redelivered = true;
        self.ready.push_front(message);
    }
}

/// Point-in-time view of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub durable: bool,
    pub ready: usize,
    pub unacked: usize,
    pub consumers: usize,
}
