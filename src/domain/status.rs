/// Outcome the database reports for one submitted row.
///
/// The numeric codes follow the cluster's wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseStatus {
    Success,
    UserAbort,
    GracefulFailure,
    UnexpectedFailure,
    ConnectionLost,
    ServerUnavailable,
    ConnectionTimeout,
    ResponseUnknown,
    TxnRestart,
    OperationalFailure,
    /// A code this build does not know about.
    Other(i8),
}

impl ResponseStatus {
    pub fn from_code(code: i8) -> Self {
        match code {
            1 => Self::Success,
            -1 => Self::UserAbort,
            -2 => Self::GracefulFailure,
            -3 => Self::UnexpectedFailure,
            -4 => Self::ConnectionLost,
            -5 => Self::ServerUnavailable,
            -6 => Self::ConnectionTimeout,
            -7 => Self::ResponseUnknown,
            -8 => Self::TxnRestart,
            -9 => Self::OperationalFailure,
            other => Self::Other(other),
        }
    }

    pub fn code(&self) -> i8 {
        match self {
            Self::Success => 1,
            Self::UserAbort => -1,
            Self::GracefulFailure => -2,
            Self::UnexpectedFailure => -3,
            Self::ConnectionLost => -4,
            Self::ServerUnavailable => -5,
            Self::ConnectionTimeout => -6,
            Self::ResponseUnknown => -7,
            Self::TxnRestart => -8,
            Self::OperationalFailure => -9,
            Self::Other(code) => *code,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Only an explicit user abort or a graceful constraint failure is
    /// tolerable. Anything else that is not a success halts ingestion.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Success | Self::UserAbort | Self::GracefulFailure)
    }
}

impl core::fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}
