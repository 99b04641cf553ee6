//! CLI for taskfan
//!
//! Subcommands:
//! - `broker`: run the message broker
//! - `emit`: publish the input records, one message per configured stream
//! - `listen`: run one worker per stream until interrupted

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};

use taskfan::app;
use taskfan::config::{Settings, load_config_from};
use taskfan::utils::error::AppError;
use taskfan::utils::logging;

#[derive(Parser)]
#[command(name = "taskfan", version, about = "Durable task fan-out over a message broker")]
struct Cli {
    /// Configuration file read instead of `config/default`
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log level used when `RUST_LOG` is unset
    #[arg(long, global = true, env = "TASKFAN_LOG", default_value = "info")]
    log_level: String,

    /// Broker host (overrides `broker.host`)
    #[arg(long, global = true)]
    host: Option<String>,

    /// Broker port (overrides `broker.port`)
    #[arg(long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the broker
    Broker {
        /// Directory for durable queues and persistent messages
        #[arg(long)]
        data_dir: Option<String>,
    },
    /// Publish every record of the input file
    Emit {
        /// CSV file to read (overrides `producer.input_file`)
        #[arg(long)]
        input: Option<String>,
        /// Pause between records in milliseconds
        #[arg(long)]
        delay_ms: Option<u64>,
    },
    /// Consume every configured stream
    Listen,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("taskfan: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let mut settings = load_config_from(cli.config.as_deref())?;
    apply_overrides(&mut settings, &cli);
    let shutdown = shutdown_signal();

    match cli.command {
        Command::Broker { .. } => app::run_broker(&settings, shutdown).await,
        Command::Emit { .. } => {
            let report = app::run_emitter(&settings, shutdown).await?;
            if report.interrupted {
                info!("interrupted after {} records", report.records);
            }
            Ok(())
        }
        Command::Listen => {
            app::run_listeners(&settings, shutdown).await?;
            Ok(())
        }
    }
}

fn apply_overrides(settings: &mut Settings, cli: &Cli) {
    if let Some(host) = &cli.host {
        settings.broker.host = host.clone();
    }
    if let Some(port) = cli.port {
        settings.broker.port = port;
    }
    match &cli.command {
        Command::Broker { data_dir } => {
            if let Some(dir) = data_dir {
                settings.broker.data_dir = dir.clone();
            }
        }
        Command::Emit { input, delay_ms } => {
            if let Some(input) = input {
                settings.producer.input_file = input.clone();
            }
            if let Some(delay) = delay_ms {
                settings.producer.record_delay_ms = *delay;
            }
        }
        Command::Listen => {}
    }
}

/// Flips to `true` on Ctrl-C.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received.");
                let _ = tx.send(true);
            }
            Err(e) => {
                warn!("cannot listen for Ctrl-C: {e}");
                // hold the sender: dropping it would stop every task
                std::future::pending::<()>().await;
            }
        }
    });
    rx
}
