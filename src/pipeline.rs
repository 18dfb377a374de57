//! Consume, parse, load.
//!
//! The driver moves through `Idle -> Connecting -> Streaming -> Draining ->
//! Closed`, or ends in `Aborted` on a fatal error. Reading and parsing run
//! on a blocking thread, since waiting for the next delivery blocks; rows
//! reach the driver through a bounded channel. The driver owns the loader and
//! the flush timer.
//!
//! Shutdown always runs in the same order: stop the consumer, close the
//! loader (final flush and drain), close the database client. A tripped
//! error gate wakes the driver directly, even while the queue is idle. Rows
//! still in the channel at shutdown are counted as dropped.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{LoaderConfig, ParseErrorPolicy};
use crate::domain::{DatabaseClient, DeadLetterQueue, Error, QueueConsumer, Row};
use crate::gate::{ErrorGate, GateTrip};
use crate::loader::{BatchLoader, LoadStats};
use crate::parser::RecordParser;
use crate::stream::MessageStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Connecting,
    Streaming,
    Draining,
    Closed,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The stream ended on its own.
    EndOfInput,
    /// An operator asked the pipeline to stop.
    Interrupted,
    ErrorBudgetExhausted,
    FatalStatus,
    Transport(String),
    Parse(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOutcome {
    pub state: PipelineState,
    pub reason: StopReason,
    pub rows_read: u64,
    pub failures: u64,
    pub stats: LoadStats,
}

impl PipelineOutcome {
    pub fn exit_code(&self) -> i32 {
        match (self.state, &self.reason) {
            (PipelineState::Aborted, _) => 1,
            (_, StopReason::ErrorBudgetExhausted) => 2,
            _ => 0,
        }
    }
}

/// Stops a running pipeline from anywhere. Stopping twice is harmless.
#[derive(Debug, Clone)]
pub struct ShutdownHandle(CancellationToken);

impl ShutdownHandle {
    pub fn stop(&self) {
        if !self.0.is_cancelled() {
            info!("Stop requested");
            self.0.cancel();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.0.is_cancelled()
    }
}

struct ReaderSummary {
    rows: u64,
    result: Result<(), Error>,
}

pub struct PipelineDriver<C, D>
where
    C: QueueConsumer + 'static,
    D: DatabaseClient,
{
    config: LoaderConfig,
    consumer: Option<C>,
    client: Arc<D>,
    dlq: Arc<dyn DeadLetterQueue>,
    gate: Arc<ErrorGate>,
    shutdown: CancellationToken,
    state: PipelineState,
    outcome: Option<PipelineOutcome>,
}

impl<C, D> PipelineDriver<C, D>
where
    C: QueueConsumer + 'static,
    D: DatabaseClient,
{
    pub fn new(
        config: LoaderConfig,
        consumer: C,
        client: Arc<D>,
        dlq: Arc<dyn DeadLetterQueue>,
    ) -> Self {
        let gate = Arc::new(ErrorGate::new(config.max_errors));
        Self {
            config,
            consumer: Some(consumer),
            client,
            dlq,
            gate,
            shutdown: CancellationToken::new(),
            state: PipelineState::Idle,
            outcome: None,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn gate(&self) -> Arc<ErrorGate> {
        Arc::clone(&self.gate)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown.clone())
    }

    pub fn stop(&self) {
        self.shutdown_handle().stop();
    }

    /// Runs the pipeline to completion. Running again returns the first
    /// outcome without touching any collaborator.
    pub async fn run(&mut self) -> Result<PipelineOutcome, Error> {
        if let Some(outcome) = &self.outcome {
            return Ok(outcome.clone());
        }
        self.config.validate()?;
        let Some(consumer) = self.consumer.take() else {
            return Err(Error::Config("pipeline has no queue consumer".into()));
        };

        self.transition(PipelineState::Connecting);
        if let Err(e) = self.client.connect(&self.config.database).await {
            error!(error = %e, "Failed to connect to the database");
            self.close_client().await;
            let outcome = self.finish(
                PipelineState::Aborted,
                StopReason::Transport(e.to_string()),
                0,
                LoadStats::default(),
            );
            return Ok(outcome);
        }

        let mut loader = BatchLoader::new(
            Arc::clone(&self.client),
            self.config.target.clone(),
            self.config.batch_size,
            self.config.flush_interval,
            Arc::clone(&self.gate),
            Arc::clone(&self.dlq),
        )
        .with_drain_timeout(self.config.drain_timeout);

        let (tx, mut rx) = mpsc::channel(self.config.row_channel_capacity);
        let stream = MessageStream::new(
            consumer,
            self.config.queue.clone(),
            self.shutdown.clone(),
            Handle::current(),
        );
        let reader = spawn_reader(
            stream,
            self.config.parse_errors,
            self.config.strict_columns,
            tx,
        );

        info!(
            host = %self.config.queue.host,
            queue = self.config.queue.queue_name(),
            target = %self.config.target,
            "Consumer started"
        );
        self.transition(PipelineState::Streaming);

        let mut rows_read = 0u64;
        let mut reason = loop {
            tokio::select! {
                biased;
                _ = self.gate.tripped() => {}
                row = rx.recv() => match row {
                    Some(row) => {
                        rows_read += 1;
                        if let Err(e) = loader.insert_row(row) {
                            error!(error = %e, "Row submission failed");
                            break StopReason::Transport(e.to_string());
                        }
                    }
                    None => break StopReason::EndOfInput,
                },
                _ = tokio::time::sleep_until(loader.flush_deadline()) => {
                    if let Err(e) = loader.periodic_flush().await {
                        error!(error = %e, "Periodic flush failed");
                        break StopReason::Transport(e.to_string());
                    }
                }
            }
            if let Some(trip) = self.gate.trip() {
                break match trip {
                    GateTrip::BudgetExhausted => StopReason::ErrorBudgetExhausted,
                    GateTrip::FatalStatus => StopReason::FatalStatus,
                };
            }
        };

        self.transition(PipelineState::Draining);

        // Stop the consumer first; the reader thread closes the stream.
        let interrupted = self.shutdown.is_cancelled();
        self.shutdown.cancel();

        // Whatever was parsed after the stop came from acked deliveries.
        let mut unloaded = 0u64;
        while let Some(_row) = rx.recv().await {
            unloaded += 1;
        }
        if unloaded > 0 {
            rows_read += unloaded;
            warn!(rows = unloaded, reason = ?reason, "Discarding rows read after ingestion stopped");
            loader.drop_rows(unloaded, "ingestion stopped");
        }

        match reader.await {
            Ok(summary) => {
                debug!(rows = summary.rows, "Reader finished");
                if let Err(e) = summary.result {
                    if reason == StopReason::EndOfInput {
                        error!(error = %e, "Reading from the queue failed");
                        reason = match e {
                            Error::Parse { .. } => StopReason::Parse(e.to_string()),
                            other => StopReason::Transport(other.to_string()),
                        };
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "Reader thread failed");
                reason = StopReason::Transport(e.to_string());
            }
        }
        if reason == StopReason::EndOfInput && interrupted {
            reason = StopReason::Interrupted;
        }

        if let Err(e) = loader.close().await {
            error!(error = %e, "Final flush failed");
            if !matches!(reason, StopReason::Transport(_) | StopReason::Parse(_)) {
                reason = StopReason::Transport(e.to_string());
            }
        }
        self.close_client().await;

        let state = match reason {
            StopReason::EndOfInput | StopReason::Interrupted | StopReason::ErrorBudgetExhausted => {
                PipelineState::Closed
            }
            StopReason::FatalStatus | StopReason::Transport(_) | StopReason::Parse(_) => {
                PipelineState::Aborted
            }
        };
        Ok(self.finish(state, reason, rows_read, loader.stats()))
    }

    async fn close_client(&self) {
        if let Err(e) = self.client.close().await {
            warn!(error = %e, "Failed to close the database client");
        }
    }

    fn transition(&mut self, next: PipelineState) {
        debug!(from = ?self.state, to = ?next, "Pipeline state change");
        self.state = next;
    }

    fn finish(
        &mut self,
        state: PipelineState,
        reason: StopReason,
        rows_read: u64,
        stats: LoadStats,
    ) -> PipelineOutcome {
        self.transition(state);
        let outcome = PipelineOutcome {
            state,
            reason,
            rows_read,
            failures: self.gate.failures(),
            stats,
        };
        match state {
            PipelineState::Aborted => error!(
                reason = ?outcome.reason,
                rows_read,
                loaded = stats.loaded,
                rejected = stats.rejected,
                "Bulk loader aborted"
            ),
            _ => info!(
                reason = ?outcome.reason,
                rows_read,
                loaded = stats.loaded,
                rejected = stats.rejected,
                dropped = stats.dropped,
                "Bulk loader finished"
            ),
        }
        self.outcome = Some(outcome.clone());
        outcome
    }
}

fn spawn_reader<C: QueueConsumer + 'static>(
    stream: MessageStream<C>,
    policy: ParseErrorPolicy,
    strict_columns: bool,
    tx: mpsc::Sender<Row>,
) -> JoinHandle<ReaderSummary> {
    tokio::task::spawn_blocking(move || {
        let mut parser = RecordParser::with_options(stream, policy, strict_columns);
        let result = loop {
            match parser.next_row() {
                Ok(Some(row)) => {
                    if tx.blocking_send(row).is_err() {
                        // the driver stopped listening
                        break Ok(());
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        let rows = parser.rows_parsed();
        if let Err(e) = parser.source_mut().close_blocking() {
            warn!(error = %e, "Failed to close the message stream");
        }
        ReaderSummary { rows, result }
    })
}
