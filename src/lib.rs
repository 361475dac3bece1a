//! # Redstream
//!
//! At-least-once event delivery over Redis-compatible streams.
//!
//! Producers wrap events in a JSON [`Envelope`] and append them with an
//! auto-assigned ID, optionally capping the stream length. Consumers join
//! a consumer group, read new entries, acknowledge what their handler
//! accepts and periodically reclaim entries that stayed pending, giving up
//! on an entry once it has been delivered `retry_limit` times.
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`backend`] | Driver-neutral stream operations with native RESP and `redis` crate adapters |
//! | [`envelope`] | JSON envelope stored in each entry's `message` field |
//! | [`producer`] | Single and pipelined batch publishing, trimming |
//! | [`consumer`] | Consumer group loop with backoff and cooperative shutdown |
//! | [`reclaim`] | Process-and-ack and the pending-entry reclaim pass |
//! | [`client`] | Facade that connects once and hands out producers and consumers |
//! | [`config`] | TOML configuration |
//!
//! ## Example
//!
//! ```no_run
//! use redstream::{Config, LogHandler, StreamClient};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> redstream::Result<()> {
//! let client = StreamClient::connect(Config::default()).await?;
//! client
//!     .producer()
//!     .publish("order.created", &serde_json::json!({"id": 42}), Default::default())
//!     .await?;
//!
//! let shutdown = CancellationToken::new();
//! client.consumer().consume(&LogHandler, shutdown).await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod client;
pub mod config;
pub mod consumer;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod producer;
pub mod reclaim;
pub mod types;

pub use backend::{BackendError, BackendKind, StreamBackend};
pub use client::StreamClient;
pub use config::{Config, ConsumeErrorPolicy, ConnectionConfig, StreamsConfig};
pub use consumer::{Consumer, ConsumerOptions, ConsumerState, CycleReport};
pub use envelope::Envelope;
pub use error::{BoxError, Result, StreamError};
pub use handler::{LogHandler, MessageHandler};
pub use producer::{BatchEntry, Producer, ProducerRegistry};
pub use reclaim::{Outcome, ReclaimReport, Supervisor};
pub use types::{EntryId, MaxLen, PendingEntry, StreamEntry};
