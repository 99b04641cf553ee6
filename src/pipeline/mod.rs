//! The task pipeline built on the client: records are split by column into
//! per-stream messages (`Publisher`), and each stream's queue is drained by a
//! `Worker` that classifies payloads and appends them to a CSV sink.
//!
//! Long-running operations take a `watch::Receiver<bool>` as their shutdown
//! signal. They stop once it holds `true` or its sender is dropped.

pub mod handler;
pub mod publisher;
pub mod sink;
pub mod source;
pub mod worker;

use std::time::Duration;

use tokio::sync::watch;

pub use handler::{Classification, Handler, OutputRow, StreamHandler, StreamKind};
pub use publisher::{PublishReport, Publisher, Route};
pub use sink::CsvSink;
pub use source::{CsvSource, Record, RecordSource};
pub use worker::{FailurePolicy, Worker, WorkerConfig, WorkerReport, WorkerState};

/// Whether `shutdown` holds `true` or its sender is gone.
pub(crate) fn stop_requested(shutdown: &watch::Receiver<bool>) -> bool {
    shutdown.has_changed().is_err() || *shutdown.borrow()
}

/// Sleeps for `delay` unless shutdown comes first; returns whether it did.
pub(crate) async fn sleep_or_stop(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.wait_for(|stop| *stop) => true,
    }
}
