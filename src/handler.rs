//! Message handler trait
//!
//! Handlers receive each decoded envelope with its entry ID. Returning
//! `Err` leaves the entry pending so the reclaim pass can retry it.
//! Delivery is at-least-once: a handler may see the same entry again and
//! must be idempotent.

use async_trait::async_trait;
use tracing::info;

pub use crate::error::BoxError;

use crate::envelope::Envelope;
use crate::types::EntryId;

/// Processes one delivered entry.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle an envelope. `Ok` acknowledges the entry.
    async fn handle(&self, envelope: &Envelope, id: EntryId) -> Result<(), BoxError>;
}

#[async_trait]
impl<F, E> MessageHandler for F
where
    F: Fn(&Envelope, EntryId) -> Result<(), E> + Send + Sync,
    E: Into<BoxError> + 'static,
{
    async fn handle(&self, envelope: &Envelope, id: EntryId) -> Result<(), BoxError> {
        self(envelope, id).map_err(Into::into)
    }
}

/// Handler that logs every envelope and accepts it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHandler;

#[async_trait]
impl MessageHandler for LogHandler {
    async fn handle(&self, envelope: &Envelope, id: EntryId) -> Result<(), BoxError> {
        info!(
            %id,
            event = %envelope.event,
            timestamp = %envelope.timestamp,
            payload = %envelope.payload,
            "received event"
        );
        Ok(())
    }
}
