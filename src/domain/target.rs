/// Where parsed rows end up. Exactly one of the two is configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadTarget {
    /// Rows are buffered and inserted in batches.
    Table(String),
    /// Every row is one stored procedure invocation.
    Procedure(String),
}

impl LoadTarget {
    pub fn name(&self) -> &str {
        match self {
            LoadTarget::Table(name) | LoadTarget::Procedure(name) => name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            LoadTarget::Table(_) => "table",
            LoadTarget::Procedure(_) => "procedure",
        }
    }

    pub fn is_batched(&self) -> bool {
        matches!(self, LoadTarget::Table(_))
    }
}

impl core::fmt::Display for LoadTarget {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}: {}", self.kind(), self.name())
    }
}
