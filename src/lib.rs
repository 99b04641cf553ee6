//! # taskfan
//!
//! `taskfan` splits records from a CSV source into independent streams and
//! fans them out as durable messages to one queue per stream. Workers drain
//! each queue with a bounded number of in-flight deliveries, classify every
//! payload, append the result to a CSV sink and acknowledge only after the
//! row is written.
//!
//! ## Core Modules
//!
//! - `broker`: queues, channels, prefetch-bounded dispatch, ack/nack and
//!   redelivery of unsettled messages.
//! - `persistence`: `sled` storage for durable queues and persistent messages.
//! - `transport`: the JSON frame protocol and the WebSocket server.
//! - `client`: connections, channels, consumers and deliveries.
//! - `pipeline`: record sources, the publisher, handlers, sinks and workers.
//! - `config`: layered settings (defaults, file, environment).
//! - `app`: the broker, emitter and listener commands.
//! - `utils`: error types and logging.

pub mod app;
pub mod broker;
pub mod client;
pub mod config;
pub mod persistence;
pub mod pipeline;
pub mod transport;
pub mod utils;

#[cfg(test)]
mod test_support;
