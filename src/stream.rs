//! Pull-based byte source over a queue consumer.
//!
//! [`MessageStream`] hands out the text of one delivery at a time, each
//! followed by a line terminator. A delivery is acknowledged only once every
//! byte it contributed has been returned by an earlier `read`, so a crash in
//! the middle of a message leaves it on the broker for redelivery.
//!
//! Operator shutdown (the cancellation token) ends the stream gracefully.
//! Broker shutdown or consumer cancellation is a read failure.

use std::io::{self, Read};

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::QueueConfig;
use crate::domain::{Delivery, DeliveryTag, Error, QueueConsumer, QueueError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Unopened,
    Open,
    Closed,
}

/// The delivery currently being drained.
#[derive(Debug)]
struct CharacterCursor {
    tag: DeliveryTag,
    text: Vec<u8>,
    pos: usize,
}

impl CharacterCursor {
    fn new(delivery: Delivery) -> Self {
        let mut text = String::from_utf8_lossy(&delivery.body).into_owned().into_bytes();
        text.push(b'\n');
        Self {
            tag: delivery.tag,
            text,
            pos: 0,
        }
    }

    fn is_drained(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn copy_into(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.text.len() - self.pos);
        buf[..n].copy_from_slice(&self.text[self.pos..self.pos + n]);
        self.pos += n;
        n
    }
}

pub struct MessageStream<C: QueueConsumer> {
    consumer: C,
    config: QueueConfig,
    runtime: Handle,
    shutdown: CancellationToken,
    state: StreamState,
    cursor: Option<CharacterCursor>,
    delivered: u64,
    acked: u64,
}

impl<C: QueueConsumer> MessageStream<C> {
    /// The connection is not opened until the first read.
    pub fn new(
        consumer: C,
        config: QueueConfig,
        shutdown: CancellationToken,
        runtime: Handle,
    ) -> Self {
        Self {
            consumer,
            config,
            runtime,
            shutdown,
            state: StreamState::Unopened,
            cursor: None,
            delivered: 0,
            acked: 0,
        }
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn acked(&self) -> u64 {
        self.acked
    }

    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }

    /// Copies up to `buf.len()` bytes. `Ok(0)` is end of stream.
    pub async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.state {
            StreamState::Closed => return Ok(0),
            StreamState::Unopened => {
                let shutdown = self.shutdown.clone();
                let opened = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => None,
                    result = self.open() => Some(result),
                };
                match opened {
                    Some(Ok(())) => {}
                    Some(Err(e)) => {
                        self.close_quietly().await;
                        return Err(e.into());
                    }
                    None => {
                        debug!("Shutdown requested while connecting");
                        self.close_quietly().await;
                        return Ok(0);
                    }
                }
            }
            StreamState::Open => {}
        }

        loop {
            if let Some(cursor) = self.cursor.as_mut() {
                if !cursor.is_drained() {
                    return Ok(cursor.copy_into(buf));
                }
            }

            // Everything from the previous delivery has been handed out.
            if let Err(e) = self.ack_drained().await {
                self.close_quietly().await;
                return Err(e.into());
            }

            match self.wait_for_delivery().await {
                Ok(Some(delivery)) => {
                    self.delivered += 1;
                    trace!(tag = delivery.tag.0, bytes = delivery.body.len(), "Delivery received");
                    self.cursor = Some(CharacterCursor::new(delivery));
                }
                Ok(None) => {
                    self.close_quietly().await;
                    return Ok(0);
                }
                Err(e) => {
                    warn!(error = %e, "Queue delivery failed");
                    self.close_quietly().await;
                    return Err(e.into());
                }
            }
        }
    }

    /// Releases the channel and the connection. Later calls are no-ops.
    pub async fn close(&mut self) -> Result<(), Error> {
        let previous = std::mem::replace(&mut self.state, StreamState::Closed);
        if previous != StreamState::Open {
            self.cursor = None;
            return Ok(());
        }

        if let Err(e) = self.ack_drained().await {
            warn!(error = %e, "Failed to acknowledge the last delivery");
        }
        if let Some(cursor) = self.cursor.take() {
            debug!(
                tag = cursor.tag.0,
                served = cursor.pos,
                total = cursor.text.len(),
                "Leaving partially read delivery unacknowledged"
            );
        }

        self.consumer.close().await?;
        info!(delivered = self.delivered, acked = self.acked, "Message stream closed");
        Ok(())
    }

    /// Blocking variant of [`close`](Self::close) for the reader thread.
    pub fn close_blocking(&mut self) -> Result<(), Error> {
        let runtime = self.runtime.clone();
        runtime.block_on(self.close())
    }

    pub fn into_consumer(self) -> C {
        self.consumer
    }

    async fn open(&mut self) -> Result<(), QueueError> {
        // From here on close() must release whatever got established.
        self.state = StreamState::Open;

        let config = &self.config;
        self.consumer.open(config).await?;

        if let Some(exchange) = &config.exchange {
            if let Some(kind) = &config.exchange_type {
                self.consumer.declare_exchange(exchange, kind).await?;
            }
        }

        let queue = config.queue_name();
        self.consumer.declare_queue(queue, config.durable).await?;

        if let Some(exchange) = &config.exchange {
            for binding_key in &config.bindings {
                self.consumer.bind_queue(queue, exchange, binding_key).await?;
            }
        }

        self.consumer.set_prefetch(config.prefetch).await?;
        self.consumer.start_consuming(queue).await?;

        info!(host = %config.host, queue, exchange = ?config.exchange, "Consuming from queue");
        Ok(())
    }

    async fn wait_for_delivery(&mut self) -> Result<Option<Delivery>, QueueError> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                debug!("Shutdown requested while waiting for a delivery");
                Ok(None)
            }
            delivery = self.consumer.next_delivery() => delivery,
        }
    }

    async fn ack_drained(&mut self) -> Result<(), QueueError> {
        if let Some(cursor) = self.cursor.take_if(|cursor| cursor.is_drained()) {
            self.consumer.ack(cursor.tag).await?;
            self.acked += 1;
            trace!(tag = cursor.tag.0, "Delivery acknowledged");
        }
        Ok(())
    }

    async fn close_quietly(&mut self) {
        if let Err(e) = self.close().await {
            warn!(error = %e, "Failed to close message stream");
        }
    }
}

impl<C: QueueConsumer> Read for MessageStream<C> {
    /// Blocks the calling thread. Must not be called from an async context.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let runtime = self.runtime.clone();
        runtime.block_on(self.read_chunk(buf)).map_err(io::Error::other)
    }
}
