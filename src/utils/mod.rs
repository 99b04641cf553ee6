//! The `utils` module provides shared definitions used across `taskfan`:
//! the error taxonomy and logging initialization.

pub mod error;
pub mod logging;
