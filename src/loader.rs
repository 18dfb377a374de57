//! Buffered submission of rows to the database.
//!
//! Table targets are inserted in batches of `batch_size` rows; procedure
//! targets are invoked once per row. Submissions never wait for the database:
//! outcomes come back through the [`SubmissionTracker`], which feeds the
//! [`ErrorGate`] and the dead letter queue from whatever thread the client
//! completes on.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::domain::{
    DatabaseClient, DeadLetterQueue, Error, LoadTarget, ResponseHandler, ResponseStatus, Row,
    RowMeta,
};
use crate::gate::ErrorGate;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoadStats {
    pub submitted: u64,
    pub loaded: u64,
    pub rejected: u64,
    /// Rows discarded without an insertion attempt after the gate tripped.
    pub dropped: u64,
}

/// Per-row bookkeeping shared with the client's completion callbacks.
pub struct SubmissionTracker {
    gate: Arc<ErrorGate>,
    dlq: Arc<dyn DeadLetterQueue>,
    outstanding: AtomicU64,
    loaded: AtomicU64,
    rejected: AtomicU64,
    idle: Notify,
}

impl SubmissionTracker {
    pub fn new(gate: Arc<ErrorGate>, dlq: Arc<dyn DeadLetterQueue>) -> Self {
        Self {
            gate,
            dlq,
            outstanding: AtomicU64::new(0),
            loaded: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            idle: Notify::new(),
        }
    }

    pub fn outstanding(&self) -> u64 {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn loaded(&self) -> u64 {
        self.loaded.load(Ordering::Acquire)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Acquire)
    }

    fn begin(&self, rows: u64) {
        self.outstanding.fetch_add(rows, Ordering::AcqRel);
    }

    /// Undo `begin` for rows the client never accepted.
    fn abandon(&self, rows: u64) {
        self.finish(rows);
    }

    fn finish(&self, rows: u64) {
        let before = self.outstanding.fetch_sub(rows, Ordering::AcqRel);
        if before == rows {
            self.idle.notify_waiters();
        }
    }

    /// Waits until every submitted row has been answered. Returns false when
    /// `timeout` elapsed first.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // register before checking so a completion in between is not missed
            notified.as_mut().enable();
            if self.outstanding() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.outstanding() == 0;
            }
        }
    }
}

impl ResponseHandler for SubmissionTracker {
    fn on_response(&self, meta: &RowMeta, status: ResponseStatus, detail: Option<&str>) {
        if status.is_success() {
            self.loaded.fetch_add(1, Ordering::AcqRel);
        } else {
            self.rejected.fetch_add(1, Ordering::AcqRel);
            error!(
                row = meta.number,
                %status,
                detail = detail.unwrap_or_default(),
                line = %meta.raw_line,
                "Failed to insert row"
            );
            self.dlq.report(meta, status, detail);
            self.gate.record_failure(status);
        }
        self.finish(1);
    }
}

pub struct BatchLoader<D: DatabaseClient> {
    client: Arc<D>,
    target: LoadTarget,
    batch_size: usize,
    flush_interval: Duration,
    drain_timeout: Duration,
    gate: Arc<ErrorGate>,
    tracker: Arc<SubmissionTracker>,
    pending: Vec<Row>,
    last_flush: Instant,
    submitted: u64,
    dropped: u64,
    closed: bool,
}

impl<D: DatabaseClient> BatchLoader<D> {
    pub fn new(
        client: Arc<D>,
        target: LoadTarget,
        batch_size: usize,
        flush_interval: Duration,
        gate: Arc<ErrorGate>,
        dlq: Arc<dyn DeadLetterQueue>,
    ) -> Self {
        // batching only applies to tables
        let batch_size = if target.is_batched() { batch_size.max(1) } else { 1 };
        let tracker = Arc::new(SubmissionTracker::new(Arc::clone(&gate), dlq));
        Self {
            client,
            target,
            batch_size,
            flush_interval,
            drain_timeout: crate::config::DEFAULT_DRAIN_TIMEOUT,
            gate,
            tracker,
            pending: Vec::with_capacity(batch_size),
            last_flush: Instant::now(),
            submitted: 0,
            dropped: 0,
            closed: false,
        }
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn tracker(&self) -> Arc<SubmissionTracker> {
        Arc::clone(&self.tracker)
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> LoadStats {
        LoadStats {
            submitted: self.submitted,
            loaded: self.tracker.loaded(),
            rejected: self.tracker.rejected(),
            dropped: self.dropped,
        }
    }

    /// Hands a row to the database, or buffers it until the batch is full.
    ///
    /// Only local failures (the client refusing the submission) are returned;
    /// database rejections arrive through the tracker.
    pub fn insert_row(&mut self, row: Row) -> Result<(), Error> {
        if self.closed {
            return Err(Error::LoaderClosed);
        }
        if self.gate.has_reached_limit() {
            self.drop_rows(1, "error limit reached");
            return Ok(());
        }

        match &self.target {
            LoadTarget::Procedure(procedure) => {
                self.tracker.begin(1);
                let handler: Arc<dyn ResponseHandler> = self.tracker.clone();
                if let Err(e) = self.client.call_procedure(procedure, row, handler) {
                    self.tracker.abandon(1);
                    return Err(e);
                }
                self.submitted += 1;
                Ok(())
            }
            LoadTarget::Table(_) => {
                self.pending.push(row);
                if self.pending.len() >= self.batch_size {
                    self.flush()?;
                }
                Ok(())
            }
        }
    }

    /// Submits whatever is buffered, full batch or not.
    pub fn flush(&mut self) -> Result<(), Error> {
        self.last_flush = Instant::now();
        if self.pending.is_empty() {
            return Ok(());
        }
        if self.gate.has_reached_limit() {
            let rows = self.pending.len() as u64;
            self.pending.clear();
            self.drop_rows(rows, "error limit reached");
            return Ok(());
        }

        // only table targets ever buffer rows
        let LoadTarget::Table(table) = &self.target else {
            return Ok(());
        };
        let rows = std::mem::replace(&mut self.pending, Vec::with_capacity(self.batch_size));
        let count = rows.len() as u64;

        self.tracker.begin(count);
        let handler: Arc<dyn ResponseHandler> = self.tracker.clone();
        if let Err(e) = self.client.insert_batch(table, rows, handler) {
            self.tracker.abandon(count);
            return Err(e);
        }
        self.submitted += count;
        debug!(table = %table, rows = count, "Batch submitted");
        Ok(())
    }

    pub fn is_flush_due(&self) -> bool {
        self.last_flush.elapsed() >= self.flush_interval
    }

    /// When the timer should next flush, counted from the last flush of any kind.
    pub fn flush_deadline(&self) -> Instant {
        self.last_flush + self.flush_interval
    }

    /// Timer-driven flush. Submits the buffer, then waits for outstanding
    /// rows, giving up after one flush interval or when the gate trips.
    pub async fn periodic_flush(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        self.flush()?;
        tokio::select! {
            idle = self.tracker.wait_idle(self.flush_interval) => {
                if !idle {
                    debug!(
                        outstanding = self.tracker.outstanding(),
                        "Periodic flush did not see every row answered"
                    );
                }
            }
            _ = self.gate.tripped() => {}
        }
        let stats = self.stats();
        debug!(
            submitted = stats.submitted,
            loaded = stats.loaded,
            rejected = stats.rejected,
            "Periodic flush"
        );
        Ok(())
    }

    /// Flushes the buffer and waits for every outstanding submission, bounded
    /// by the drain timeout. Does not close the client. Safe to call twice.
    pub async fn close(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let flushed = self.flush();
        if !self.tracker.wait_idle(self.drain_timeout).await {
            warn!(
                outstanding = self.tracker.outstanding(),
                timeout = ?self.drain_timeout,
                "Gave up waiting for outstanding rows"
            );
        }
        let stats = self.stats();
        info!(
            target = %self.target,
            submitted = stats.submitted,
            loaded = stats.loaded,
            rejected = stats.rejected,
            dropped = stats.dropped,
            "Loader closed"
        );
        flushed
    }

    /// Counts rows that will never be submitted.
    pub fn drop_rows(&mut self, rows: u64, reason: &str) {
        self.dropped += rows;
        debug!(rows, reason, "Dropping rows without insertion");
    }
}
