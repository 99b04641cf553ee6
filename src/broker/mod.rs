//! The `broker` module is the message broker itself: durable and transient
//! queues, channels with prefetch limits, and ack-gated delivery.

pub mod engine;
pub mod message;
pub mod peer;
pub mod queue;

pub use engine::Broker;
pub use queue::QueueStats;

#[cfg(test)]
mod tests;
