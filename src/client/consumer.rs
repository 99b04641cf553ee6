use tokio::sync::mpsc::UnboundedReceiver;

use crate::client::channel::Channel;
use crate::client::delivery::Delivery;
use crate::utils::error::ClientError;

/// Stream of deliveries for one consumer tag.
///
/// The stream ends (`next` returns `None`) once the consumer is cancelled and
/// its buffer drained, or when its channel or connection closes.
#[derive(Debug)]
pub struct Consumer {
    tag: String,
    channel: Channel,
    deliveries: UnboundedReceiver<Delivery>,
}

impl Consumer {
    pub(crate) fn new(tag: String, channel: Channel, deliveries: UnboundedReceiver<Delivery>) -> Self {
        Self {
            tag,
            channel,
            deliveries,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Waits for the next delivery.
    pub async fn next(&mut self) -> Option<Delivery> {
        self.deliveries.recv().await
    }

    /// A delivery that has already arrived, without waiting.
    pub fn try_next(&mut self) -> Option<Delivery> {
        self.deliveries.try_recv().ok()
    }

    pub async fn cancel(&self) -> Result<(), ClientError> {
        self.channel.cancel(&self.tag).await
    }
}
