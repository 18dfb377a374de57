#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    IO(#[from] std::io::Error),

    #[error("Queue failed with: {0}")]
    Queue(#[from] QueueError),

    #[error("Database failed with: {0}")]
    Database(String),

    #[error("Parsing row {row} failed with: {message}")]
    Parse { row: u64, message: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Loader is closed")]
    LoaderClosed,
}

/// Failures raised by a [`QueueConsumer`](crate::domain::QueueConsumer).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("connection to {0} failed")]
    Connect(String),

    #[error("declaring {0} failed")]
    Declare(String),

    #[error("broker shut the channel down: {0}")]
    Shutdown(String),

    #[error("consumer was cancelled by the broker")]
    ConsumerCancelled,

    #[error("acknowledging delivery {0} failed")]
    Ack(u64),

    #[error("consumer is closed")]
    Closed,
}

impl Error {
    /// Transport failures (queue or database connectivity) abort the pipeline.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Queue(_) | Error::Database(_) | Error::IO(_))
    }
}
