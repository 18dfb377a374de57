use std::io::Read;

use tracing::warn;

use crate::config::ParseErrorPolicy;
use crate::domain::{Error, Row};

/// Records every byte the CSV reader pulls so the untokenized text of a row
/// can be recovered after it has been parsed.
#[derive(Debug)]
pub struct RawCapture<R> {
    inner: R,
    captured: Vec<u8>,
    /// Stream offset of `captured[0]`.
    base: u64,
}

impl<R> RawCapture<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            captured: Vec::new(),
            base: 0,
        }
    }

    fn text(&self, start: u64, end: u64) -> String {
        let from = start.saturating_sub(self.base) as usize;
        let to = (end.saturating_sub(self.base) as usize).min(self.captured.len());
        let raw = String::from_utf8_lossy(&self.captured[from.min(to)..to]);
        raw.trim_matches(|c| c == '\r' || c == '\n').to_string()
    }

    fn discard_until(&mut self, offset: u64) {
        let n = (offset.saturating_sub(self.base) as usize).min(self.captured.len());
        self.captured.drain(..n);
        self.base += n as u64;
    }
}

impl<R: Read> Read for RawCapture<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.captured.extend_from_slice(&buf[..n]);
        Ok(n)
    }
}

/// Single-slot lookahead.
#[derive(Debug)]
enum RowCache {
    Empty,
    Full(Row),
}

/// Turns a character stream into numbered rows.
///
/// Not meant to be shared between callers; `has_next` and `next_row` may be
/// interleaved freely by the one consumer that owns it.
pub struct RecordParser<R: Read> {
    reader: csv::Reader<RawCapture<R>>,
    record: csv::StringRecord,
    cache: RowCache,
    count: u64,
    done: bool,
    policy: ParseErrorPolicy,
}

impl<R: Read> RecordParser<R> {
    pub fn new(reader: R) -> Self {
        Self::with_options(reader, ParseErrorPolicy::default(), false)
    }

    pub fn with_options(reader: R, policy: ParseErrorPolicy, strict_columns: bool) -> Self {
        let reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(!strict_columns)
            .from_reader(RawCapture::new(reader));

        Self {
            reader,
            record: csv::StringRecord::new(),
            cache: RowCache::Empty,
            count: 0,
            done: false,
            policy,
        }
    }

    /// Whether another row is available, without consuming it.
    pub fn has_next(&mut self) -> Result<bool, Error> {
        self.cache_row_as_needed()?;
        Ok(matches!(self.cache, RowCache::Full(_)))
    }

    /// `Ok(None)` is end of input.
    pub fn next_row(&mut self) -> Result<Option<Row>, Error> {
        self.cache_row_as_needed()?;
        match std::mem::replace(&mut self.cache, RowCache::Empty) {
            RowCache::Full(row) => Ok(Some(row)),
            RowCache::Empty => Ok(None),
        }
    }

    /// Rows parsed so far.
    pub fn rows_parsed(&self) -> u64 {
        self.count
    }

    pub fn source_mut(&mut self) -> &mut R {
        &mut self.reader.get_mut().inner
    }

    pub fn into_inner(self) -> R {
        self.reader.into_inner().inner
    }

    fn cache_row_as_needed(&mut self) -> Result<(), Error> {
        while !self.done && matches!(self.cache, RowCache::Empty) {
            match self.reader.read_record(&mut self.record) {
                Ok(true) => {
                    self.count += 1;
                    let raw_line = self.raw_line();
                    let fields = self.record.iter().map(str::to_string).collect();
                    self.cache = RowCache::Full(Row::new(fields, raw_line, self.count));
                }
                Ok(false) => self.done = true,
                Err(e) => self.on_error(e)?,
            }
        }
        Ok(())
    }

    fn raw_line(&mut self) -> String {
        let start = self.record.position().map_or(0, |pos| pos.byte());
        let end = self.reader.position().byte();
        let capture = self.reader.get_mut();
        let text = capture.text(start, end);
        capture.discard_until(end);
        text
    }

    fn on_error(&mut self, e: csv::Error) -> Result<(), Error> {
        let row = self.count + 1;
        if let csv::ErrorKind::Io(_) = e.kind() {
            self.done = true;
            return match e.into_kind() {
                csv::ErrorKind::Io(io) => Err(Error::IO(io)),
                other => Err(Error::Parse {
                    row,
                    message: format!("{other:?}"),
                }),
            };
        }

        let end = self.reader.position().byte();
        self.reader.get_mut().discard_until(end);

        match self.policy {
            ParseErrorPolicy::End => {
                warn!(row, error = %e, "Unparseable input, treating it as end of stream");
                self.done = true;
                Ok(())
            }
            ParseErrorPolicy::Skip => {
                warn!(row, error = %e, "Skipping unparseable line");
                Ok(())
            }
            ParseErrorPolicy::Fail => {
                self.done = true;
                Err(Error::Parse {
                    row,
                    message: e.to_string(),
                })
            }
        }
    }
}

impl<R: Read> Iterator for RecordParser<R> {
    type Item = Result<Row, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_row().transpose()
    }
}
