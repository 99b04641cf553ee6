//! Wire frames exchanged between clients and the broker.
//!
//! Every frame is a JSON object tagged by `type`. Requests carry a
//! connection-unique `request` id and are answered by exactly one `ok` or
//! `error` frame with the same id. `deliver` frames are pushed by the broker
//! whenever a consumer's channel has prefetch capacity.

use std::fmt;

use serde::{Deserialize, Serialize};

pub type ChannelId = u16;
pub type RequestId = u64;
pub type DeliveryTag = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    OpenChannel {
        channel: ChannelId,
        request: RequestId,
    },
    CloseChannel {
        channel: ChannelId,
        request: RequestId,
    },
    DeclareQueue {
        channel: ChannelId,
        request: RequestId,
        queue: String,
        durable: bool,
    },
    Qos {
        channel: ChannelId,
        request: RequestId,
        prefetch: u16,
    },
    Publish {
        channel: ChannelId,
        request: RequestId,
        queue: String,
        payload: Vec<u8>,
        persistent: bool,
    },
    Consume {
        channel: ChannelId,
        request: RequestId,
        queue: String,
        consumer_tag: String,
    },
    Cancel {
        channel: ChannelId,
        request: RequestId,
        consumer_tag: String,
    },
    Ack {
        channel: ChannelId,
        request: RequestId,
        delivery_tag: DeliveryTag,
    },
    Nack {
        channel: ChannelId,
        request: RequestId,
        delivery_tag: DeliveryTag,
        requeue: bool,
    },
}

impl ClientFrame {
    pub fn channel(&self) -> ChannelId {
        match self {
            Self::OpenChannel { channel, .. }
            | Self::CloseChannel { channel, .. }
            | Self::DeclareQueue { channel, .. }
            | Self::Qos { channel, .. }
            | Self::Publish { channel, .. }
            | Self::Consume { channel, .. }
            | Self::Cancel { channel, .. }
            | Self::Ack { channel, .. }
            | Self::Nack { channel, .. } => *channel,
        }
    }

    pub fn request(&self) -> RequestId {
        match self {
            Self::OpenChannel { request, .. }
            | Self::CloseChannel { request, .. }
            | Self::DeclareQueue { request, .. }
            | Self::Qos { request, .. }
            | Self::Publish { request, .. }
            | Self::Consume { request, .. }
            | Self::Cancel { request, .. }
            | Self::Ack { request, .. }
            | Self::Nack { request, .. } => *request,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Welcome {
        connection: String,
        server: String,
    },
    Ok {
        channel: ChannelId,
        request: RequestId,
        reply: Reply,
    },
    Error {
        channel: ChannelId,
        request: Option<RequestId>,
        code: ErrorCode,
        message: String,
        channel_closed: bool,
    },
    Deliver {
        channel: ChannelId,
        consumer_tag: String,
        delivery_tag: DeliveryTag,
        redelivered: bool,
        queue: String,
        payload: Vec<u8>,
    },
}

/// Successful outcome of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reply {
    ChannelOpened,
    ChannelClosed,
    QueueDeclared {
        queue: String,
        message_count: usize,
        consumer_count: usize,
    },
    QosOk,
    Confirmed,
    ConsumeOk {
        consumer_tag: String,
    },
    CancelOk,
    Acked,
    Nacked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    PreconditionFailed,
    ChannelError,
    Invalid,
    FrameError,
    InternalError,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotFound => "not_found",
            Self::PreconditionFailed => "precondition_failed",
            Self::ChannelError => "channel_error",
            Self::Invalid => "invalid",
            Self::FrameError => "frame_error",
            Self::InternalError => "internal_error",
        };
        f.write_str(name)
    }
}
