//! Publisher
//!
//! Maps each record to one message per routed column and publishes them in
//! route order, each to its own durable queue. Publishes of one record are
//! not atomic: a failure part way leaves the earlier ones enqueued.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::client::{Channel, DeliveryMode};
use crate::pipeline::{sleep_or_stop, stop_requested};
use crate::pipeline::source::{Record, RecordSource};
use crate::utils::error::{AppError, ClientError};

/// A record column and the queue its values go to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub queue: String,
    pub column: usize,
}

impl Route {
    pub fn new(queue: impl Into<String>, column: usize) -> Self {
        Self {
            queue: queue.into(),
            column,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub records: usize,
    pub skipped: usize,
    pub messages: usize,
    /// Set when the run stopped on a shutdown signal.
    pub interrupted: bool,
}

#[derive(Debug)]
pub struct Publisher {
    channel: Channel,
    routes: Vec<Route>,
    record_delay: Duration,
    mode: DeliveryMode,
}

impl Publisher {
    pub fn new(channel: Channel, routes: Vec<Route>) -> Self {
        Self {
            channel,
            routes,
            record_delay: Duration::ZERO,
            mode: DeliveryMode::Persistent,
        }
    }

    /// Pause between successive records; fields of one record go out back
    /// to back.
    pub fn record_delay(mut self, delay: Duration) -> Self {
        self.record_delay = delay;
        self
    }

    pub fn delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.mode = mode;
        self
    }

    /// Declares every routed queue as durable.
    pub async fn declare_queues(&self) -> Result<(), ClientError> {
        for route in &self.routes {
            let info = self.channel.declare_queue(&route.queue, true).await?;
            debug!(queue = %info.name, ready = info.message_count, "queue ready");
        }
        Ok(())
    }

    pub async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), ClientError> {
        self.channel.publish(queue, payload, self.mode).await
    }

    /// Publishes one message per route and returns how many went out. A
    /// record missing any routed column publishes nothing.
    pub async fn publish_record(&self, record: &Record) -> Result<usize, ClientError> {
        let Some(values) = self
            .routes
            .iter()
            .map(|route| record.field(route.column))
            .collect::<Option<Vec<_>>>()
        else {
            warn!(line = ?record.line, fields = record.fields.len(), "record lacks a routed column, skipped");
            return Ok(0);
        };

        for (route, value) in self.routes.iter().zip(values) {
            self.publish(&route.queue, value.as_bytes()).await?;
            info!(queue = %route.queue, "sent '{value}'");
        }
        Ok(self.routes.len())
    }

    /// Publishes every record of `source`, pausing between records, until
    /// the source ends or `shutdown` fires.
    pub async fn run<S>(&self, source: &S, shutdown: &mut watch::Receiver<bool>) -> Result<PublishReport, AppError>
    where
        S: RecordSource + Sync,
    {
        let mut report = PublishReport::default();

        for (index, record) in source.records()?.enumerate() {
            if stop_requested(shutdown) {
                report.interrupted = true;
                break;
            }
            if index > 0 && !self.record_delay.is_zero() && sleep_or_stop(self.record_delay, shutdown).await {
                report.interrupted = true;
                break;
            }

            let record = record?;
            report.records += 1;
            match self.publish_record(&record).await? {
                0 => report.skipped += 1,
                sent => report.messages += sent,
            }
        }

        info!(
            records = report.records,
            messages = report.messages,
            skipped = report.skipped,
            interrupted = report.interrupted,
            "publishing finished"
        );
        Ok(report)
    }
}
