//! Worker
//!
//! Consumes one queue with a bounded number of unacknowledged deliveries,
//! runs each payload through its `Handler` and settles the delivery only
//! after the handler returns.
//!
//! States: `Idle → Connected → Consuming → Processing → Acking | Rejecting →
//! Consuming`, with `Stopped` reachable from anywhere on shutdown or error.
//! On shutdown the worker cancels its consumer, returns every delivery it had
//! not processed to the queue and closes its channel.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::client::{Channel, Connection, Consumer, Delivery};
use crate::pipeline::handler::Handler;
use crate::pipeline::sleep_or_stop;
use crate::utils::error::ClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Connected,
    Consuming,
    Processing,
    Acking,
    Rejecting,
    Stopped,
}

/// What to do with a delivery whose handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Log and acknowledge; the message is not retried.
    #[default]
    Ack,
    Requeue,
    Drop,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::Ack => f.write_str("ack"),
            FailurePolicy::Requeue => f.write_str("requeue"),
            FailurePolicy::Drop => f.write_str("drop"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub queue: String,
    /// Empty lets the broker pick one.
    pub consumer_tag: String,
    /// Unacknowledged deliveries the broker may push at once; 0 is unlimited.
    pub prefetch: u16,
    pub failure_policy: FailurePolicy,
    /// Simulated work per `.` byte in a payload.
    pub work_per_dot: Duration,
}

impl WorkerConfig {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            consumer_tag: String::new(),
            prefetch: 1,
            failure_policy: FailurePolicy::Ack,
            work_per_dot: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub processed: usize,
    pub failed: usize,
    /// Deliveries handed back to the queue on shutdown or by policy.
    pub requeued: usize,
}

pub struct Worker<H> {
    config: WorkerConfig,
    handler: H,
    state: watch::Sender<WorkerState>,
    report: WorkerReport,
}

impl<H: Handler> Worker<H> {
    pub fn new(config: WorkerConfig, handler: H) -> Self {
        let (state, _) = watch::channel(WorkerState::Idle);
        Self {
            config,
            handler,
            state,
            report: WorkerReport::default(),
        }
    }

    /// Sets the prefetch limit applied when the worker starts consuming.
    pub fn configure(&mut self, prefetch: u16) {
        self.config.prefetch = prefetch;
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Follows state transitions while `run` holds the worker.
    pub fn watch_state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: WorkerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(queue = %self.config.queue, ?previous, ?state, "worker state");
        }
    }

    /// Consumes until `shutdown` turns true (or its sender is dropped) or the
    /// channel fails. The channel is closed before returning either way.
    pub async fn run(
        &mut self,
        connection: &Connection,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<WorkerReport, ClientError> {
        let channel = match connection.channel().await {
            Ok(channel) => channel,
            Err(e) => {
                self.set_state(WorkerState::Stopped);
                return Err(e);
            }
        };
        self.set_state(WorkerState::Connected);

        let result = self.consume(&channel, &mut shutdown).await;

        if let Err(e) = channel.close().await {
            warn!(queue = %self.config.queue, "closing channel failed: {e}");
        }
        self.set_state(WorkerState::Stopped);

        match result {
            Ok(()) => {
                info!(
                    queue = %self.config.queue,
                    processed = self.report.processed,
                    failed = self.report.failed,
                    requeued = self.report.requeued,
                    "worker stopped"
                );
                Ok(self.report.clone())
            }
            Err(e) => Err(e),
        }
    }

    async fn consume(&mut self, channel: &Channel, shutdown: &mut watch::Receiver<bool>) -> Result<(), ClientError> {
        channel.declare_queue(&self.config.queue, true).await?;
        channel.basic_qos(self.config.prefetch).await?;
        let mut consumer = channel.consume(&self.config.queue, &self.config.consumer_tag).await?;
        self.set_state(WorkerState::Consuming);
        info!(
            queue = %self.config.queue,
            consumer = consumer.tag(),
            prefetch = self.config.prefetch,
            "waiting for messages"
        );

        let interrupted = loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => break None,
                next = consumer.next() => next,
            };
            let Some(delivery) = next else {
                return Err(match channel.close_reason() {
                    Some(reason) => ClientError::ChannelClosed {
                        channel: channel.id(),
                        reason,
                    },
                    None => ClientError::ConnectionClosed,
                });
            };
            if let Some(unsettled) = self.process(delivery, shutdown).await? {
                break Some(unsettled);
            }
        };

        self.drain(&mut consumer, interrupted).await
    }

    /// Handles one delivery. A delivery handed back means shutdown arrived
    /// before it was processed.
    async fn process(
        &mut self,
        delivery: Delivery,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<Delivery>, ClientError> {
        self.set_state(WorkerState::Processing);
        debug!(
            queue = %delivery.queue,
            tag = delivery.delivery_tag,
            redelivered = delivery.redelivered,
            "received delivery"
        );

        let dots = delivery.payload.iter().filter(|b| **b == b'.').count();
        let work = self
            .config
            .work_per_dot
            .saturating_mul(u32::try_from(dots).unwrap_or(u32::MAX));
        if !work.is_zero() && sleep_or_stop(work, shutdown).await {
            return Ok(Some(delivery));
        }

        match self.handler.handle(&delivery.payload) {
            Ok(row) => {
                info!(queue = %delivery.queue, "processed '{}' as {}", row.original, row.classification);
                self.set_state(WorkerState::Acking);
                delivery.ack().await?;
                self.report.processed += 1;
            }
            Err(e) => {
                self.report.failed += 1;
                warn!(
                    queue = %delivery.queue,
                    tag = delivery.delivery_tag,
                    policy = %self.config.failure_policy,
                    "handler failed: {e}"
                );
                match self.config.failure_policy {
                    FailurePolicy::Ack => {
                        self.set_state(WorkerState::Acking);
                        delivery.ack().await?;
                    }
                    FailurePolicy::Requeue => {
                        self.set_state(WorkerState::Rejecting);
                        delivery.reject(true).await?;
                        self.report.requeued += 1;
                    }
                    FailurePolicy::Drop => {
                        self.set_state(WorkerState::Rejecting);
                        delivery.reject(false).await?;
                    }
                }
            }
        }

        self.set_state(WorkerState::Consuming);
        Ok(None)
    }

    /// Stops deliveries and hands every unprocessed one back to the queue.
    /// Requeueing puts a message at the head, so they go back newest first
    /// to keep their original order.
    async fn drain(&mut self, consumer: &mut Consumer, interrupted: Option<Delivery>) -> Result<(), ClientError> {
        consumer.cancel().await?;

        let mut unprocessed: Vec<Delivery> = interrupted.into_iter().collect();
        while let Some(delivery) = consumer.try_next() {
            unprocessed.push(delivery);
        }
        if !unprocessed.is_empty() {
            self.set_state(WorkerState::Rejecting);
        }
        for delivery in unprocessed.into_iter().rev() {
            delivery.reject(true).await?;
            self.report.requeued += 1;
        }
        Ok(())
    }
}

impl<H> fmt::Debug for Worker<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("config", &self.config)
            .field("state", &*self.state.borrow())
            .field("report", &self.report)
            .finish()
    }
}
