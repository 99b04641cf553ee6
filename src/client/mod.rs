//! The `client` module is the client side of the broker protocol.
//!
//! - `Connection`: a live session with the broker, opened with
//!   `Connection::open(host)` and closed idempotently with `close`.
//! - `Channel`: a logical path over a connection for declaring queues,
//!   publishing, setting prefetch and consuming.
//! - `Consumer` / `Delivery`: the stream of messages pushed to a consumer
//!   and the values used to acknowledge or reject each one.

pub mod channel;
pub mod connection;
pub mod consumer;
pub mod delivery;

pub use channel::{Channel, DeliveryMode, QueueInfo};
pub use connection::Connection;
pub use consumer::Consumer;
pub use delivery::Delivery;

#[cfg(test)]
mod tests;
