//! The `transport` module is responsible for network communication between
//! the broker and its clients over WebSockets.
//!
//! It defines the frame protocol (`message`) and implements the broker-side
//! WebSocket server (`websocket`). The client side of the protocol lives in
//! the `client` module.

pub mod message;
pub mod websocket;

pub use websocket::{bind, start_websocket_server};
