use std::io::{self, Write};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info};

use crate::config::DatabaseConfig;
use crate::domain::{DatabaseClient, Error, ResponseHandler, ResponseStatus, Row};

/// Database stand-in that prints every accepted row as CSV.
///
/// Each row is answered as soon as it is written, with `Success`, or with
/// `ConnectionLost` when the writer fails.
pub struct StdOutClient<W: Write + Send = io::Stdout> {
    writer: Mutex<csv::Writer<W>>,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl StdOutClient {
    pub fn new() -> Self {
        Self::with_writer(io::stdout())
    }
}

impl Default for StdOutClient {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: Write + Send> StdOutClient<W> {
    pub fn with_writer(sink: W) -> Self {
        Self {
            writer: Mutex::new(
                csv::WriterBuilder::new()
                    .flexible(true)
                    .from_writer(sink),
            ),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn into_inner(self) -> Option<W> {
        self.writer.into_inner().ok()?.into_inner().ok()
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Database("client is closed".into()));
        }
        if !self.connected.load(Ordering::Acquire) {
            return Err(Error::Database("client is not connected".into()));
        }
        Ok(())
    }

    fn write_row(&self, row: &Row) -> ResponseStatus {
        let Ok(mut writer) = self.writer.lock() else {
            return ResponseStatus::ConnectionLost;
        };
        match writer.write_record(&row.fields) {
            Ok(()) => ResponseStatus::Success,
            Err(_) => ResponseStatus::ConnectionLost,
        }
    }
}

impl<W: Write + Send + 'static> DatabaseClient for StdOutClient<W> {
    async fn connect(&self, config: &DatabaseConfig) -> Result<(), Error> {
        for (host, port) in config.endpoints() {
            debug!(host, port, "Connected");
        }
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    fn insert_batch(
        &self,
        table: &str,
        rows: Vec<Row>,
        handler: Arc<dyn ResponseHandler>,
    ) -> Result<(), Error> {
        self.ensure_open()?;
        debug!(table, rows = rows.len(), "Inserting batch");
        for row in rows {
            let status = self.write_row(&row);
            handler.on_response(&row.meta, status, None);
        }
        Ok(())
    }

    fn call_procedure(
        &self,
        procedure: &str,
        row: Row,
        handler: Arc<dyn ResponseHandler>,
    ) -> Result<(), Error> {
        self.ensure_open()?;
        debug!(procedure, row = row.number(), "Calling procedure");
        let status = self.write_row(&row);
        handler.on_response(&row.meta, status, None);
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| Error::Database("writer lock poisoned".into()))?;
        writer.flush()?;
        info!("Database client closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;

    use super::*;
    use crate::domain::RowMeta;

    #[derive(Default)]
    struct Answers(AtomicU64);

    impl ResponseHandler for Answers {
        fn on_response(&self, _meta: &RowMeta, status: ResponseStatus, _detail: Option<&str>) {
            assert!(status.is_success());
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn writes_rows_as_csv_and_answers_each() {
        let client = StdOutClient::with_writer(Vec::new());
        client.connect(&DatabaseConfig::default()).await.unwrap();

        let answers = Arc::new(Answers::default());
        let rows = vec![
            Row::new(vec!["1".into(), "a, b".into()], "1,\"a, b\"", 1),
            Row::new(vec!["2".into()], "2", 2),
        ];
        client.insert_batch("T", rows, answers.clone()).unwrap();
        client
            .call_procedure("P", Row::new(vec!["3".into(), "c".into()], "3,c", 3), answers.clone())
            .unwrap();
        client.close().await.unwrap();
        client.close().await.unwrap();

        assert_eq!(answers.0.load(Ordering::SeqCst), 3);
        let out = String::from_utf8(client.into_inner().unwrap()).unwrap();
        assert_eq!(out, "1,\"a, b\"\n2\n3,c\n");
    }

    #[tokio::test]
    async fn refuses_work_unless_connected_and_open() {
        let client = StdOutClient::with_writer(Vec::new());
        let answers: Arc<dyn ResponseHandler> = Arc::new(Answers::default());
        assert!(client.insert_batch("T", vec![], answers.clone()).is_err());

        client.connect(&DatabaseConfig::default()).await.unwrap();
        client.close().await.unwrap();
        assert!(client.insert_batch("T", vec![], answers).is_err());
    }
}
