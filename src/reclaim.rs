//! Process-and-ack and the reclaim pass
//!
//! Every delivered entry goes through [`Supervisor::process_and_ack`]:
//! decode, hand to the handler, acknowledge on success. Malformed entries
//! are acknowledged immediately as poison. Handler failures stay in the
//! pending entries list (PEL).
//!
//! [`Supervisor::reclaim`] runs after each read. It walks one page of the
//! group's PEL and either discards records that have used up the retry
//! budget or claims them for this consumer and processes them again.
//! Each claim bumps the delivery count on the backend, so no counter is
//! kept here.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::backend::{BackendError, StreamBackend};
use crate::envelope::Envelope;
use crate::error::{Result, StreamError};
use crate::handler::MessageHandler;
use crate::types::{ClaimOptions, EntryId, StreamEntry, RANGE_END, RANGE_START};

/// Default number of PEL records inspected per reclaim pass.
pub const DEFAULT_RECLAIM_PAGE: usize = 10;

/// What happened to one delivered entry.
#[derive(Debug)]
pub enum Outcome {
    /// The handler accepted the entry and it was acknowledged
    Acknowledged,

    /// The entry could not be decoded and was acknowledged without
    /// invoking the handler
    Poison(StreamError),

    /// The handler failed; the entry stays pending
    Failed(StreamError),
}

/// Counters from one reclaim pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    /// PEL records inspected
    pub inspected: usize,
    /// Entries claimed and re-processed
    pub reclaimed: usize,
    /// Entries force-acknowledged after exhausting the retry budget
    pub discarded: usize,
    /// Reclaimed entries the handler accepted
    pub acknowledged: usize,
    /// Reclaimed entries the handler rejected again
    pub failed: usize,
    /// Reclaimed entries that turned out to be poison
    pub poison: usize,
}

/// Runs process-and-ack and the reclaim pass for one consumer.
#[derive(Clone)]
pub struct Supervisor {
    backend: Arc<dyn StreamBackend>,
    stream: String,
    group: String,
    consumer: String,
    retry_limit: u64,
    page_size: usize,
}

impl Supervisor {
    /// Create a supervisor for `consumer` in `group` on `stream`.
    pub fn new(
        backend: Arc<dyn StreamBackend>,
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
        retry_limit: u64,
    ) -> Self {
        Self {
            backend,
            stream: stream.into(),
            group: group.into(),
            consumer: consumer.into(),
            retry_limit: retry_limit.max(1),
            page_size: DEFAULT_RECLAIM_PAGE,
        }
    }

    /// Inspect up to `page_size` PEL records per pass.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Deliveries allowed before an entry is discarded.
    pub fn retry_limit(&self) -> u64 {
        self.retry_limit
    }

    /// Wrap a backend failure from the read or reclaim cycle.
    pub fn backend_error(&self, op: &str, err: BackendError) -> StreamError {
        let message = format!("{} failed: {}", op, err);
        if err.is_connection() {
            StreamError::Connection {
                stream: self.stream.clone(),
                message,
                source: Some(Box::new(err)),
            }
        } else {
            StreamError::Consume {
                stream: self.stream.clone(),
                group: self.group.clone(),
                consumer: self.consumer.clone(),
                message,
                source: Some(Box::new(err)),
            }
        }
    }

    async fn ack(&self, id: EntryId) -> Result<()> {
        self.backend
            .ack(&self.stream, &self.group, &[id])
            .await
            .map_err(|e| self.backend_error("XACK", e))?;
        Ok(())
    }

    /// Decode `entry`, run the handler and acknowledge on success.
    ///
    /// `attempt` is the entry's delivery count and only feeds logs and
    /// errors. Only backend failures are returned as `Err`.
    pub async fn process_and_ack<H>(
        &self,
        handler: &H,
        entry: &StreamEntry,
        attempt: u64,
    ) -> Result<Outcome>
    where
        H: MessageHandler + ?Sized,
    {
        let envelope = match Envelope::decode(&self.stream, entry) {
            Ok(envelope) => envelope,
            Err(poison) => {
                warn!(
                    stream = %self.stream,
                    group = %self.group,
                    consumer = %self.consumer,
                    id = %entry.id,
                    error = %poison,
                    "acknowledging poison message"
                );
                self.ack(entry.id).await?;
                return Ok(Outcome::Poison(poison));
            }
        };

        match handler.handle(&envelope, entry.id).await {
            Ok(()) => {
                self.ack(entry.id).await?;
                debug!(
                    stream = %self.stream,
                    id = %entry.id,
                    event = %envelope.event,
                    attempt,
                    "processed entry"
                );
                Ok(Outcome::Acknowledged)
            }
            Err(source) => {
                let err = StreamError::MessageProcessing {
                    stream: self.stream.clone(),
                    id: entry.id,
                    attempt,
                    message: source.to_string(),
                    source: Some(source),
                };
                warn!(
                    stream = %self.stream,
                    group = %self.group,
                    consumer = %self.consumer,
                    id = %entry.id,
                    attempt,
                    error = %err,
                    "handler failed; entry left pending"
                );
                Ok(Outcome::Failed(err))
            }
        }
    }

    /// Walk one page of the group's PEL: discard exhausted entries, claim
    /// and re-process the rest.
    pub async fn reclaim<H>(&self, handler: &H) -> Result<ReclaimReport>
    where
        H: MessageHandler + ?Sized,
    {
        let pending = self
            .backend
            .pending(
                &self.stream,
                &self.group,
                RANGE_START,
                RANGE_END,
                self.page_size,
                None,
            )
            .await
            .map_err(|e| self.backend_error("XPENDING", e))?;

        let mut report = ReclaimReport {
            inspected: pending.len(),
            ..Default::default()
        };

        for record in pending {
            if record.delivery_count >= self.retry_limit {
                self.ack(record.id).await?;
                warn!(
                    stream = %self.stream,
                    group = %self.group,
                    id = %record.id,
                    owner = %record.consumer,
                    delivery_count = record.delivery_count,
                    retry_limit = self.retry_limit,
                    "retry limit exhausted; discarding entry"
                );
                report.discarded += 1;
                continue;
            }

            let claimed = self
                .backend
                .claim(
                    &self.stream,
                    &self.group,
                    &self.consumer,
                    Duration::ZERO,
                    &[record.id],
                    ClaimOptions::default(),
                )
                .await
                .map_err(|e| self.backend_error("XCLAIM", e))?;

            for entry in claimed {
                report.reclaimed += 1;
                let attempt = record.delivery_count + 1;
                match self.process_and_ack(handler, &entry, attempt).await? {
                    Outcome::Acknowledged => report.acknowledged += 1,
                    Outcome::Failed(_) => report.failed += 1,
                    Outcome::Poison(_) => report.poison += 1,
                }
            }
        }

        Ok(report)
    }
}
