#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rmq_bulk_loader::config::{DatabaseConfig, QueueConfig};
use rmq_bulk_loader::domain::{
    DatabaseClient, DeadLetterQueue, Error, ResponseHandler, ResponseStatus, Row, RowMeta,
};
use rmq_bulk_loader::{LoadTarget, LoaderConfig};

#[derive(Debug, Default, Clone)]
pub struct Recorded {
    pub connects: u32,
    pub closes: u32,
    pub batches: Vec<Vec<u64>>,
    pub calls: Vec<u64>,
}

/// In-memory database. Answers every row inline, or from another thread
/// after `answer_delay`.
#[derive(Default)]
pub struct RecordingClient {
    recorded: Mutex<Recorded>,
    reject: Vec<(u64, ResponseStatus)>,
    refuse_connect: bool,
    answer_delay: Option<Duration>,
}

impl RecordingClient {
    pub fn rejecting(reject: Vec<(u64, ResponseStatus)>) -> Self {
        Self {
            reject,
            ..Self::default()
        }
    }

    pub fn answering_after(delay: Duration, reject: Vec<(u64, ResponseStatus)>) -> Self {
        Self {
            reject,
            answer_delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn unreachable() -> Self {
        Self {
            refuse_connect: true,
            ..Self::default()
        }
    }

    pub fn recorded(&self) -> Recorded {
        self.recorded.lock().unwrap().clone()
    }

    /// Every row that reached the database, in submission order.
    pub fn rows_seen(&self) -> Vec<u64> {
        let recorded = self.recorded();
        let mut rows: Vec<u64> = recorded.batches.into_iter().flatten().collect();
        rows.extend(recorded.calls);
        rows
    }

    fn answer(&self, meta: &RowMeta, handler: &Arc<dyn ResponseHandler>) {
        let status = self
            .reject
            .iter()
            .find(|(n, _)| *n == meta.number)
            .map_or(ResponseStatus::Success, |(_, s)| *s);
        match self.answer_delay {
            None => handler.on_response(meta, status, None),
            Some(delay) => {
                let meta = meta.clone();
                let handler = Arc::clone(handler);
                std::thread::spawn(move || {
                    std::thread::sleep(delay);
                    handler.on_response(&meta, status, None);
                });
            }
        }
    }
}

impl DatabaseClient for RecordingClient {
    async fn connect(&self, _config: &DatabaseConfig) -> Result<(), Error> {
        self.recorded.lock().unwrap().connects += 1;
        if self.refuse_connect {
            return Err(Error::Database("connection refused".into()));
        }
        Ok(())
    }

    fn insert_batch(
        &self,
        _table: &str,
        rows: Vec<Row>,
        handler: Arc<dyn ResponseHandler>,
    ) -> Result<(), Error> {
        self.recorded
            .lock()
            .unwrap()
            .batches
            .push(rows.iter().map(Row::number).collect());
        for row in &rows {
            self.answer(&row.meta, &handler);
        }
        Ok(())
    }

    fn call_procedure(
        &self,
        _procedure: &str,
        row: Row,
        handler: Arc<dyn ResponseHandler>,
    ) -> Result<(), Error> {
        self.recorded.lock().unwrap().calls.push(row.number());
        self.answer(&row.meta, &handler);
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        self.recorded.lock().unwrap().closes += 1;
        Ok(())
    }
}

#[derive(Default)]
pub struct CollectingDlq(pub Mutex<Vec<(u64, ResponseStatus)>>);

impl CollectingDlq {
    pub fn rows(&self) -> Vec<u64> {
        self.0.lock().unwrap().iter().map(|(n, _)| *n).collect()
    }
}

impl DeadLetterQueue for CollectingDlq {
    fn report(&self, meta: &RowMeta, status: ResponseStatus, _detail: Option<&str>) {
        self.0.lock().unwrap().push((meta.number, status));
    }
}

pub fn table_config(table: &str) -> LoaderConfig {
    LoaderConfig::new(
        QueueConfig::for_queue("rows"),
        LoadTarget::Table(table.into()),
    )
}

/// One `n,row-n` message per row number.
pub fn numbered_messages(rows: std::ops::RangeInclusive<u64>) -> Vec<String> {
    rows.map(|n| format!("{n},row-{n}")).collect()
}
