pub mod error;
pub mod row;
pub mod status;
pub mod target;
pub mod traits;

pub use error::{Error, QueueError};
pub use row::{Row, RowMeta};
pub use status::ResponseStatus;
pub use target::LoadTarget;
pub use traits::{
    DatabaseClient, DeadLetterQueue, Delivery, DeliveryTag, QueueConsumer, ResponseHandler,
};
