/// Diagnostics carried alongside every parsed row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowMeta {
    /// Untokenized line text, without its line terminator.
    pub raw_line: String,
    /// 1-based position of the row in the stream.
    pub number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub fields: Vec<String>,
    pub meta: RowMeta,
}

impl Row {
    pub fn new(fields: Vec<String>, raw_line: impl Into<String>, number: u64) -> Self {
        Self {
            fields,
            meta: RowMeta {
                raw_line: raw_line.into(),
                number,
            },
        }
    }

    pub fn number(&self) -> u64 {
        self.meta.number
    }
}

impl core::fmt::Display for Row {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "row {}: {}", self.meta.number, self.meta.raw_line)
    }
}
