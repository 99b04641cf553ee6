//! The `persistence` module stores what must survive a broker restart:
//! definitions of durable queues and the persistent messages they hold.
//!
//! It uses `sled` as an embedded key-value store.

pub mod sled_store;

pub use sled_store::Persistence;
