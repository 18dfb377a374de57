use std::future::Future;
use std::sync::Arc;

use crate::config::{DatabaseConfig, QueueConfig};
use crate::domain::{Error, QueueError, ResponseStatus, Row, RowMeta};

/// Broker-assigned identifier used to acknowledge a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryTag(pub u64);

/// One message handed out by the broker. Removed from the queue only once acked.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub body: Vec<u8>,
}

/// Ordered, manually acknowledged message source.
///
/// `next_delivery` resolves to `Ok(None)` only for finite sources that have
/// nothing left to hand out. A broker connection never does.
pub trait QueueConsumer: Send {
    fn open(&mut self, config: &QueueConfig) -> impl Future<Output = Result<(), QueueError>> + Send;

    fn declare_exchange(
        &mut self,
        exchange: &str,
        kind: &str,
    ) -> impl Future<Output = Result<(), QueueError>> + Send;

    fn declare_queue(
        &mut self,
        queue: &str,
        durable: bool,
    ) -> impl Future<Output = Result<(), QueueError>> + Send;

    fn bind_queue(
        &mut self,
        queue: &str,
        exchange: &str,
        binding_key: &str,
    ) -> impl Future<Output = Result<(), QueueError>> + Send;

    fn set_prefetch(&mut self, count: u16) -> impl Future<Output = Result<(), QueueError>> + Send;

    fn start_consuming(&mut self, queue: &str)
    -> impl Future<Output = Result<(), QueueError>> + Send;

    fn next_delivery(
        &mut self,
    ) -> impl Future<Output = Result<Option<Delivery>, QueueError>> + Send;

    fn ack(&mut self, tag: DeliveryTag) -> impl Future<Output = Result<(), QueueError>> + Send;

    /// Releases the channel and the connection.
    fn close(&mut self) -> impl Future<Output = Result<(), QueueError>> + Send;
}

/// Per-row completion callback.
///
/// Invoked exactly once per submitted row, possibly from the client's own
/// connection thread, concurrently with the pipeline. Implementations may only
/// touch thread-safe state.
pub trait ResponseHandler: Send + Sync {
    fn on_response(&self, meta: &RowMeta, status: ResponseStatus, detail: Option<&str>);
}

/// Cluster client. Submissions return once the request is handed off; the
/// outcome of every row arrives later through the [`ResponseHandler`].
pub trait DatabaseClient: Send + Sync + 'static {
    fn connect(&self, config: &DatabaseConfig) -> impl Future<Output = Result<(), Error>> + Send;

    fn insert_batch(
        &self,
        table: &str,
        rows: Vec<Row>,
        handler: Arc<dyn ResponseHandler>,
    ) -> Result<(), Error>;

    fn call_procedure(
        &self,
        procedure: &str,
        row: Row,
        handler: Arc<dyn ResponseHandler>,
    ) -> Result<(), Error>;

    fn close(&self) -> impl Future<Output = Result<(), Error>> + Send;
}

pub trait DeadLetterQueue: Send + Sync {
    fn report(&self, meta: &RowMeta, status: ResponseStatus, detail: Option<&str>);
}
