use std::fs::{File, OpenOptions};
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use rmq_bulk_loader::cli::Cli;
use rmq_bulk_loader::dlq::{CsvDLQ, LogDLQ};
use rmq_bulk_loader::domain::{DeadLetterQueue, Error, QueueConsumer};
use rmq_bulk_loader::output::StdOutClient;
use rmq_bulk_loader::replay::ReplayConsumer;
use rmq_bulk_loader::{LoaderConfig, PipelineDriver, ShutdownHandle};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!(error = %e, "Bulk loader failed");
            std::process::exit(1);
        }
    }
}

fn init_tracing(fallback: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<i32, Error> {
    let config = cli.loader_config()?;

    let dlq: Arc<dyn DeadLetterQueue> = match &cli.rejected {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            info!(path = %path.display(), "Writing rejected rows to file");
            Arc::new(CsvDLQ::new(file))
        }
        None => Arc::new(LogDLQ::default()),
    };

    match &cli.replay {
        Some(path) => run_with(config, replay_consumer(path)?, dlq).await,
        None => broker(config, dlq).await,
    }
}

fn replay_consumer(path: &Path) -> Result<ReplayConsumer, Error> {
    if path == Path::new("-") {
        return Ok(ReplayConsumer::from_reader(io::stdin().lock())?);
    }
    let file = File::open(path)?;
    Ok(ReplayConsumer::from_reader(BufReader::new(file))?)
}

#[cfg(feature = "amqp")]
async fn broker(config: LoaderConfig, dlq: Arc<dyn DeadLetterQueue>) -> Result<i32, Error> {
    run_with(config, rmq_bulk_loader::amqp::AmqpConsumer::new(), dlq).await
}

#[cfg(not(feature = "amqp"))]
async fn broker(_config: LoaderConfig, _dlq: Arc<dyn DeadLetterQueue>) -> Result<i32, Error> {
    Err(Error::Config(
        "built without the `amqp` feature; use --replay to read messages from a file".into(),
    ))
}

async fn run_with<C>(
    config: LoaderConfig,
    consumer: C,
    dlq: Arc<dyn DeadLetterQueue>,
) -> Result<i32, Error>
where
    C: QueueConsumer + 'static,
{
    let client = Arc::new(StdOutClient::new());
    let mut driver = PipelineDriver::new(config, consumer, client, dlq);
    tokio::spawn(stop_on_signal(driver.shutdown_handle()));

    let outcome = driver.run().await?;
    Ok(outcome.exit_code())
}

async fn stop_on_signal(handle: ShutdownHandle) {
    shutdown_signal().await;
    handle.stop();
}

/// Waits for SIGINT or SIGTERM.
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!(error = %e, "Failed to set up SIGTERM handler");
            wait_ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = wait_ctrl_c() => {}
        _ = sigterm.recv() => {
            info!(signal = "SIGTERM", "Signal received");
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    wait_ctrl_c().await;
}

async fn wait_ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!(signal = "SIGINT", "Signal received"),
        Err(e) => {
            warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    }
}
