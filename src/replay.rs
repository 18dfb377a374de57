//! Finite queue consumer that replays recorded messages.
//!
//! Used for dry runs (`--replay file`) and to drive the pipeline without a
//! broker. Every call is recorded in a shared [`ReplayLog`].

use std::collections::VecDeque;
use std::io::BufRead;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::QueueConfig;
use crate::domain::{Delivery, DeliveryTag, QueueConsumer, QueueError};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplaySnapshot {
    /// Connection and topology calls, in order.
    pub declared: Vec<String>,
    pub acked: Vec<DeliveryTag>,
    pub delivered: u64,
    pub closes: u64,
}

/// Cloneable view on what a [`ReplayConsumer`] has been asked to do.
#[derive(Debug, Default, Clone)]
pub struct ReplayLog(Arc<Mutex<ReplaySnapshot>>);

impl ReplayLog {
    pub fn snapshot(&self) -> ReplaySnapshot {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, ReplaySnapshot> {
        // a poisoned log is still a valid log
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug)]
pub struct ReplayConsumer {
    pending: VecDeque<Vec<u8>>,
    next_tag: u64,
    consuming: bool,
    closed: bool,
    idle_when_exhausted: bool,
    failure: Option<(u64, QueueError)>,
    log: ReplayLog,
}

impl ReplayConsumer {
    pub fn from_messages<I, M>(messages: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: Into<Vec<u8>>,
    {
        Self {
            pending: messages.into_iter().map(Into::into).collect(),
            next_tag: 1,
            consuming: false,
            closed: false,
            idle_when_exhausted: false,
            failure: None,
            log: ReplayLog::default(),
        }
    }

    /// One message per input line.
    pub fn from_reader<R: BufRead>(reader: R) -> std::io::Result<Self> {
        let lines = reader.lines().collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_messages(lines))
    }

    /// Behave like a live queue: once drained, wait for deliveries forever.
    pub fn idle_when_exhausted(mut self) -> Self {
        self.idle_when_exhausted = true;
        self
    }

    /// Fail `next_delivery` with `error` once `deliveries` messages went out.
    pub fn fail_after(mut self, deliveries: u64, error: QueueError) -> Self {
        self.failure = Some((deliveries, error));
        self
    }

    pub fn log(&self) -> ReplayLog {
        self.log.clone()
    }

    fn record(&self, call: String) {
        self.log.lock().declared.push(call);
    }

    fn ensure_usable(&self) -> Result<(), QueueError> {
        if self.closed {
            Err(QueueError::Closed)
        } else {
            Ok(())
        }
    }
}

impl QueueConsumer for ReplayConsumer {
    async fn open(&mut self, _config: &QueueConfig) -> Result<(), QueueError> {
        self.ensure_usable()?;
        self.record("open".to_string());
        Ok(())
    }

    async fn declare_exchange(&mut self, exchange: &str, kind: &str) -> Result<(), QueueError> {
        self.ensure_usable()?;
        self.record(format!("exchange {exchange} {kind}"));
        Ok(())
    }

    async fn declare_queue(&mut self, queue: &str, durable: bool) -> Result<(), QueueError> {
        self.ensure_usable()?;
        self.record(format!("queue {queue} durable={durable}"));
        Ok(())
    }

    async fn bind_queue(
        &mut self,
        queue: &str,
        exchange: &str,
        binding_key: &str,
    ) -> Result<(), QueueError> {
        self.ensure_usable()?;
        self.record(format!("bind {queue} {exchange} {binding_key}"));
        Ok(())
    }

    async fn set_prefetch(&mut self, count: u16) -> Result<(), QueueError> {
        self.ensure_usable()?;
        self.record(format!("prefetch {count}"));
        Ok(())
    }

    async fn start_consuming(&mut self, queue: &str) -> Result<(), QueueError> {
        self.ensure_usable()?;
        self.consuming = true;
        self.record(format!("consume {queue}"));
        Ok(())
    }

    async fn next_delivery(&mut self) -> Result<Option<Delivery>, QueueError> {
        self.ensure_usable()?;
        if !self.consuming {
            return Err(QueueError::ConsumerCancelled);
        }

        let delivered = self.log.lock().delivered;
        if let Some((limit, error)) = &self.failure {
            if delivered >= *limit {
                return Err(error.clone());
            }
        }

        match self.pending.pop_front() {
            Some(body) => {
                let tag = DeliveryTag(self.next_tag);
                self.next_tag += 1;
                self.log.lock().delivered += 1;
                Ok(Some(Delivery { tag, body }))
            }
            None if self.idle_when_exhausted => std::future::pending().await,
            None => Ok(None),
        }
    }

    async fn ack(&mut self, tag: DeliveryTag) -> Result<(), QueueError> {
        if self.closed {
            return Err(QueueError::Ack(tag.0));
        }
        self.log.lock().acked.push(tag);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), QueueError> {
        if !self.closed {
            self.closed = true;
            self.consuming = false;
            self.log.lock().closes += 1;
        }
        Ok(())
    }
}
