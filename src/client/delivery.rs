use crate::client::channel::Channel;
use crate::transport::message::DeliveryTag;
use crate::utils::error::ClientError;

/// A message handed to a consumer, together with the tag and channel needed
/// to settle it.
///
/// `ack` and `reject` consume the delivery, so each one is settled at most
/// once. A delivery dropped without settling stays unacknowledged until its
/// channel closes, at which point the broker requeues it.
#[derive(Debug)]
pub struct Delivery {
    pub payload: Vec<u8>,
    pub delivery_tag: DeliveryTag,
    pub redelivered: bool,
    pub queue: String,
    pub consumer_tag: String,
    pub(crate) channel: Channel,
}

impl Delivery {
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Removes the message from its queue permanently.
    pub async fn ack(self) -> Result<(), ClientError> {
        self.channel.ack(self.delivery_tag).await
    }

    /// Returns the message to the head of its queue (`requeue`) or discards it.
    pub async fn reject(self, requeue: bool) -> Result<(), ClientError> {
        self.channel.nack(self.delivery_tag, requeue).await
    }
}
