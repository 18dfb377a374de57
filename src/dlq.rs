use std::io::Write;
use std::sync::Mutex;

use serde::Serialize;
use tracing::{error, warn};

use crate::domain::{DeadLetterQueue, ResponseStatus, RowMeta};

#[derive(Default, Debug)]
pub struct LogDLQ {}

impl DeadLetterQueue for LogDLQ {
    fn report(&self, meta: &RowMeta, status: ResponseStatus, detail: Option<&str>) {
        warn!(
            target: "dlq",
            row = meta.number,
            %status,
            detail = detail.unwrap_or_default(),
            line = %meta.raw_line,
            "Rejected row"
        );
    }
}

/// One line of the rejected-rows file.
#[derive(Debug, Serialize)]
struct RejectedRecord<'a> {
    row: u64,
    status: i8,
    detail: &'a str,
    line: &'a str,
}

/// Appends rejected rows as `row,status,detail,line` CSV records so they can
/// be inspected or replayed later.
pub struct CsvDLQ<W: Write + Send> {
    writer: Mutex<csv::Writer<W>>,
}

impl<W: Write + Send> CsvDLQ<W> {
    pub fn new(sink: W) -> Self {
        // appended to across runs, so no header
        let writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(sink);
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> Option<W> {
        let writer = self.writer.into_inner().ok()?;
        writer.into_inner().ok()
    }
}

impl<W: Write + Send> DeadLetterQueue for CsvDLQ<W> {
    fn report(&self, meta: &RowMeta, status: ResponseStatus, detail: Option<&str>) {
        let Ok(mut writer) = self.writer.lock() else {
            error!(row = meta.number, "Dead letter writer is poisoned");
            return;
        };
        let record = RejectedRecord {
            row: meta.number,
            status: status.code(),
            detail: detail.unwrap_or_default(),
            line: &meta.raw_line,
        };
        let written = writer
            .serialize(&record)
            .and_then(|_| writer.flush().map_err(Into::into));
        if let Err(e) = written {
            error!(row = meta.number, error = %e, "Failed to record rejected row");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_rows_are_written_as_csv() {
        let dlq = CsvDLQ::new(Vec::new());
        let meta = RowMeta {
            raw_line: "5,\"x, y\"".into(),
            number: 5,
        };
        dlq.report(&meta, ResponseStatus::GracefulFailure, Some("constraint"));
        let meta = RowMeta {
            raw_line: "6".into(),
            number: 6,
        };
        dlq.report(&meta, ResponseStatus::UnexpectedFailure, None);

        let out = String::from_utf8(dlq.into_inner().unwrap()).unwrap();
        assert_eq!(out, "5,-2,constraint,\"5,\"\"x, y\"\"\"\n6,-3,,6\n");
    }
}
