//! Command bodies behind the `taskfan` binary.
//!
//! - `run_broker`: serve the broker until shutdown, with durable state under
//!   `broker.data_dir`.
//! - `run_emitter`: publish every record of the input file, one message per
//!   configured stream.
//! - `run_listeners`: one worker per stream, each on its own task and its own
//!   connection, until shutdown or the first worker failure.
//!
//! Each takes a `watch::Receiver<bool>` that turns `true` on interrupt.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::broker::Broker;
use crate::client::Connection;
use crate::config::{BrokerSettings, Settings, StreamSettings, WorkerSettings};
use crate::persistence::Persistence;
use crate::pipeline::{CsvSink, CsvSource, PublishReport, Publisher, StreamHandler, Worker, WorkerReport};
use crate::transport::{bind, start_websocket_server};
use crate::utils::error::{AppError, BrokerError};

pub async fn run_broker(settings: &Settings, mut shutdown: watch::Receiver<bool>) -> Result<(), AppError> {
    let persistence = Persistence::open(&settings.broker.data_dir).map_err(BrokerError::from)?;
    let broker = Arc::new(Mutex::new(Broker::with_persistence(persistence)?));
    let listener = bind(&settings.broker.address()).await?;

    tokio::select! {
        _ = start_websocket_server(listener, broker.clone()) => {
            error!("WebSocket server exited unexpectedly.");
        }
        _ = shutdown.wait_for(|stop| *stop) => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    let guard = broker.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    guard.flush()?;
    Ok(())
}

pub async fn run_emitter(settings: &Settings, mut shutdown: watch::Receiver<bool>) -> Result<PublishReport, AppError> {
    let host = settings.broker.address();
    let connection = Connection::open_with(&host, settings.broker.connect_timeout()).await?;
    info!(broker = %host, input = %settings.producer.input_file, "emitter started");

    let result = emit(settings, &connection, &mut shutdown).await;
    connection.close().await;
    result
}

async fn emit(
    settings: &Settings,
    connection: &Connection,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<PublishReport, AppError> {
    let routes = settings.streams.iter().map(StreamSettings::route).collect();
    let publisher = Publisher::new(connection.channel().await?, routes)
        .record_delay(Duration::from_millis(settings.producer.record_delay_ms));
    publisher.declare_queues().await?;

    let source = CsvSource::new(&settings.producer.input_file).has_headers(settings.producer.has_headers);
    publisher.run(&source, shutdown).await
}

pub async fn run_listeners(
    settings: &Settings,
    mut shutdown: watch::Receiver<bool>,
) -> Result<Vec<WorkerReport>, AppError> {
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();
    for stream in &settings.streams {
        tasks.spawn(run_listener(
            settings.broker.clone(),
            stream.clone(),
            settings.worker.clone(),
            stop_rx.clone(),
        ));
    }

    let mut reports = Vec::new();
    let mut failure = None;
    let mut stopping = false;
    loop {
        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop), if !stopping => {
                info!("Shutdown signal received. Stopping workers.");
                stopping = true;
                stop_tx.send_replace(true);
            }
            joined = tasks.join_next() => {
                let outcome = match joined {
                    None => break,
                    Some(Ok(outcome)) => outcome,
                    Some(Err(e)) => Err(AppError::Task(e.to_string())),
                };
                match outcome {
                    Ok(report) => reports.push(report),
                    Err(e) => {
                        error!("worker failed: {e}");
                        if !stopping {
                            warn!("stopping remaining workers");
                            stopping = true;
                            stop_tx.send_replace(true);
                        }
                        failure.get_or_insert(e);
                    }
                }
            }
        }
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(reports),
    }
}

async fn run_listener(
    broker: BrokerSettings,
    stream: StreamSettings,
    worker: WorkerSettings,
    shutdown: watch::Receiver<bool>,
) -> Result<WorkerReport, AppError> {
    let connection = Connection::open_with(&broker.address(), broker.connect_timeout()).await?;

    let handler = StreamHandler::new(stream.kind, CsvSink::new(&stream.output));
    let mut worker = Worker::new(stream.worker_config(&worker), handler);
    let result = worker.run(&connection, shutdown).await;

    connection.close().await;
    Ok(result?)
}
