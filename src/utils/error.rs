//! The `error` module defines the error types used across `taskfan`.
//!
//! Errors are split by the side of the wire they occur on: `BrokerError` is
//! raised inside the broker engine and travels to clients as an `error` frame,
//! `ClientError` is what the client library surfaces to publishers and workers.
//! Pipeline collaborators (record source, handler sinks) have their own small
//! enums, and `AppError` gathers everything at the process boundary.

use thiserror::Error;

use crate::transport::message::ErrorCode;

/// Errors produced by the broker engine while serving a request.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("no queue '{0}'")]
    NotFound(String),

    #[error("queue '{queue}' already declared with durable={existing}")]
    QueueConflict { queue: String, existing: bool },

    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),

    #[error("channel {0} is not open")]
    ChannelNotOpen(u16),

    #[error("channel {0} is already open")]
    ChannelAlreadyOpen(u16),

    #[error("consumer tag '{0}' already in use on this channel")]
    DuplicateConsumer(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("persistence failure: {0}")]
    Persistence(#[from] sled::Error),
}

impl BrokerError {
    /// Wire code reported to the client.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::QueueConflict { .. } | Self::UnknownDeliveryTag(_) | Self::DuplicateConsumer(_) => {
                ErrorCode::PreconditionFailed
            }
            Self::ChannelNotOpen(_) | Self::ChannelAlreadyOpen(_) => ErrorCode::ChannelError,
            Self::Invalid(_) => ErrorCode::Invalid,
            Self::Persistence(_) => ErrorCode::InternalError,
        }
    }
}

/// Errors surfaced by the client library.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The broker is unreachable or refused the handshake.
    #[error("connection to broker at {host} failed: {reason}")]
    Connection { host: String, reason: String },

    /// A queue exists with a different durability flag.
    #[error("queue '{queue}' conflicts with an existing declaration: {reason}")]
    QueueConflict { queue: String, reason: String },

    /// A single publish was not confirmed by the broker.
    #[error("publish to '{queue}' failed: {reason}")]
    Publish { queue: String, reason: String },

    #[error("channel {channel} closed: {reason}")]
    ChannelClosed { channel: u16, reason: String },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("broker error ({code}): {message}")]
    Remote { code: ErrorCode, message: String },

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Failure while persisting a handler's output row.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("sink {path} write failed: {source}")]
    Sink {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("row encoding failed: {0}")]
    Encode(#[from] csv::Error),
}

/// Failure while reading records.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("cannot read {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: csv::Error,
    },

    #[error("malformed record: {0}")]
    Record(#[from] csv::Error),
}

/// Top-level failure of a `taskfan` command.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("broker storage error: {0}")]
    Storage(#[from] BrokerError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("task failed: {0}")]
    Task(String),
}

impl AppError {
    /// Process exit status for this failure.
    ///
    /// Every error that reaches the process boundary is unrecoverable, so the
    /// status is always `1`; a clean or interrupted run exits with `0`.
    pub fn exit_code(&self) -> u8 {
        1
    }
}
