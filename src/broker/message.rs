//! Message definitions for the broker
//!
//! `QueuedMessage` is the broker's internal representation of an enqueued
//! message. Notes on fields:
//! - `id`: broker-wide sequence number, also the persistence key
//! - `payload`: opaque bytes, delivered byte-exact
//! - `persistent`: set by the publisher; only persistent messages on durable
//!   queues are written to disk
//! - `redelivered`: true once the message has been handed to a consumer and
//!   returned to the queue without an ack
//! - `timestamp`: milliseconds since UNIX epoch; set by the broker on publish

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub id: u64,
    pub payload: Vec<u8>,
    pub persistent: bool,
    pub redelivered: bool,
    pub timestamp: i64,
}

impl QueuedMessage {
    pub fn new(id: u64, payload: Vec<u8>, persistent: bool) -> Self {
        Self {
            id,
            payload,
            persistent,
            redelivered: false,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}
