//! Streams delimited text records from a message queue into a database.
//!
//! A [`MessageStream`](stream::MessageStream) turns queue deliveries into a
//! character stream, a [`RecordParser`](parser::RecordParser) cuts it into
//! rows, and a [`BatchLoader`](loader::BatchLoader) submits them. The
//! [`ErrorGate`](gate::ErrorGate) decides when rejected rows must halt
//! ingestion. [`PipelineDriver`](pipeline::PipelineDriver) ties them together.

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod cli;
pub mod config;
pub mod dlq;
pub mod domain;
pub mod gate;
pub mod loader;
pub mod output;
pub mod parser;
pub mod pipeline;
pub mod replay;
pub mod stream;

pub use config::LoaderConfig;
pub use domain::{Error, LoadTarget, Row};
pub use pipeline::{PipelineDriver, PipelineOutcome, PipelineState, ShutdownHandle, StopReason};
