//! Stream backend capability and driver selection
//!
//! The consumer and producer only ever talk to [`StreamBackend`]. Two
//! drivers implement it against a live server:
//!
//! - [`native`]: a hand-written RESP2 client that marshals commands as
//!   flat positional arguments and normalizes flat alternating field
//!   arrays into [`Fields`].
//! - [`library`]: the `redis` crate, using its typed stream option
//!   builders and pre-paired reply maps.
//!
//! [`memory`] holds an in-process store with the same observable
//! behavior, used to exercise the reliability protocol without a server.
//!
//! The driver is chosen once from configuration through [`connect`].

pub mod connection;
pub mod error;
pub mod library;
pub mod memory;
pub mod native;
pub mod resp;
pub mod value;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

pub use error::{BackendError, BackendResult};

use crate::config::ConnectionConfig;
use crate::error::{Result, StreamError};
use crate::types::{
    ClaimOptions, EntryId, Fields, MaxLen, PendingEntry, ReadGroupOptions, StreamEntry,
};

/// Entries returned by a group read, keyed by stream name.
pub type StreamReadReply = BTreeMap<String, Vec<StreamEntry>>;

/// Outcome of a create-group call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupCreation {
    /// The group was created
    Created,
    /// The group already existed (not an error)
    AlreadyExists,
}

/// Backend capability set used by producers and consumers.
///
/// Every implementation returns the same canonical shapes regardless of
/// how its driver marshals arguments or pairs up reply fields.
#[async_trait]
pub trait StreamBackend: Send + Sync {
    /// Driver name for logs.
    fn name(&self) -> &'static str;

    /// Append an entry with an auto-assigned ID, optionally capping the stream length.
    async fn append(
        &self,
        stream: &str,
        fields: &Fields,
        maxlen: Option<MaxLen>,
    ) -> BackendResult<EntryId>;

    /// Entries between `start` and `end` inclusive, in ID order.
    ///
    /// `start`/`end` accept entry IDs or the `-`/`+` range markers.
    async fn range(
        &self,
        stream: &str,
        start: &str,
        end: &str,
        count: Option<usize>,
    ) -> BackendResult<Vec<StreamEntry>>;

    /// Create a consumer group positioned at `start_id`.
    ///
    /// An existing group is reported as [`GroupCreation::AlreadyExists`].
    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
        mkstream: bool,
    ) -> BackendResult<GroupCreation>;

    /// Read entries never delivered to `group` (`>`) from each stream,
    /// recording them in the PEL as owned by `consumer`.
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[&str],
        options: ReadGroupOptions,
    ) -> BackendResult<StreamReadReply>;

    /// Acknowledge entries, removing them from the PEL.
    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> BackendResult<u64>;

    /// PEL records between `start` and `end`, optionally for one consumer.
    async fn pending(
        &self,
        stream: &str,
        group: &str,
        start: &str,
        end: &str,
        count: usize,
        consumer: Option<&str>,
    ) -> BackendResult<Vec<PendingEntry>>;

    /// Reassign pending entries idle for at least `min_idle` to `consumer`.
    ///
    /// Entries that no longer exist in the stream are dropped from the
    /// PEL and not returned.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
        options: ClaimOptions,
    ) -> BackendResult<Vec<StreamEntry>>;

    /// Trim the stream and return the number of entries removed.
    async fn trim(&self, stream: &str, maxlen: MaxLen) -> BackendResult<u64>;

    /// Number of entries in the stream.
    async fn len(&self, stream: &str) -> BackendResult<u64>;

    /// Delete the stream and its groups. Returns false if it did not exist.
    async fn delete(&self, stream: &str) -> BackendResult<bool>;

    /// Send a batch of commands in one round trip.
    ///
    /// Commands apply in order; there is no rollback when a later one fails.
    async fn execute_pipeline(
        &self,
        commands: Vec<PipelineCommand>,
    ) -> BackendResult<Vec<PipelineReply>>;
}

impl dyn StreamBackend {
    /// Start a deferred command batch against this backend.
    pub fn pipeline(&self) -> Pipeline<'_> {
        Pipeline::new(self)
    }
}

/// A command queued in a [`Pipeline`].
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineCommand {
    /// Append with an auto-assigned ID
    Append {
        /// Stream name
        stream: String,
        /// Entry fields
        fields: Fields,
        /// Optional length cap
        maxlen: Option<MaxLen>,
    },
    /// Acknowledge entries
    Ack {
        /// Stream name
        stream: String,
        /// Consumer group
        group: String,
        /// Entry IDs
        ids: Vec<EntryId>,
    },
    /// Trim the stream
    Trim {
        /// Stream name
        stream: String,
        /// Length cap
        maxlen: MaxLen,
    },
}

/// Result of one pipelined command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineReply {
    /// ID assigned by an append
    Id(EntryId),
    /// Count returned by an ack or trim
    Count(u64),
}

impl PipelineReply {
    /// The assigned ID, if this is an append reply.
    pub fn id(&self) -> Option<EntryId> {
        match self {
            PipelineReply::Id(id) => Some(*id),
            PipelineReply::Count(_) => None,
        }
    }
}

/// Deferred batch of commands, sent together by [`Pipeline::execute`].
pub struct Pipeline<'a> {
    backend: &'a dyn StreamBackend,
    commands: Vec<PipelineCommand>,
}

impl<'a> Pipeline<'a> {
    /// Create an empty pipeline for `backend`.
    pub fn new(backend: &'a dyn StreamBackend) -> Self {
        Self {
            backend,
            commands: Vec::new(),
        }
    }

    /// Queue an append.
    pub fn append(&mut self, stream: &str, fields: Fields, maxlen: Option<MaxLen>) -> &mut Self {
        self.commands.push(PipelineCommand::Append {
            stream: stream.to_string(),
            fields,
            maxlen,
        });
        self
    }

    /// Queue an acknowledge.
    pub fn ack(&mut self, stream: &str, group: &str, ids: &[EntryId]) -> &mut Self {
        self.commands.push(PipelineCommand::Ack {
            stream: stream.to_string(),
            group: group.to_string(),
            ids: ids.to_vec(),
        });
        self
    }

    /// Queue a trim.
    pub fn trim(&mut self, stream: &str, maxlen: MaxLen) -> &mut Self {
        self.commands.push(PipelineCommand::Trim {
            stream: stream.to_string(),
            maxlen,
        });
        self
    }

    /// Number of queued commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether nothing has been queued.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Send every queued command and return one reply per command, in order.
    pub async fn execute(self) -> BackendResult<Vec<PipelineReply>> {
        if self.commands.is_empty() {
            return Ok(Vec::new());
        }
        self.backend.execute_pipeline(self.commands).await
    }
}

/// Concrete driver behind a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Hand-written RESP2 driver
    Native,
    /// `redis` crate driver
    Library,
}

impl BackendKind {
    /// Configuration name of the driver.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Native => "native",
            BackendKind::Library => "library",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "native" => Ok(BackendKind::Native),
            "library" => Ok(BackendKind::Library),
            other => Err(StreamError::Configuration(format!(
                "unsupported stream driver '{}'; expected 'native' or 'library'",
                other
            ))),
        }
    }
}

/// Connect the driver named by `config`.
///
/// Called once at construction; the returned handle is shared by every
/// producer and consumer built from it.
pub async fn connect(config: &ConnectionConfig) -> Result<Arc<dyn StreamBackend>> {
    let kind = config.backend_kind()?;
    let addr = config.address();

    let backend: Arc<dyn StreamBackend> = match kind {
        BackendKind::Native => Arc::new(
            native::NativeBackend::connect(config.clone())
                .await
                .map_err(|e| connect_error(&addr, e))?,
        ),
        BackendKind::Library => Arc::new(
            library::LibraryBackend::connect(config)
                .await
                .map_err(|e| connect_error(&addr, e))?,
        ),
    };

    info!(driver = %kind, %addr, "stream backend connected");
    Ok(backend)
}

fn connect_error(addr: &str, err: BackendError) -> StreamError {
    if err.is_connection() {
        StreamError::Connection {
            stream: addr.to_string(),
            message: format!("connect failed: {}", err),
            source: Some(Box::new(err)),
        }
    } else {
        StreamError::Configuration(format!("connect to {} failed: {}", addr, err))
    }
}
