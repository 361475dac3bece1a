//! Stream data types shared by every backend.
//!
//! These are the canonical shapes the backend adapters normalize into:
//! entry IDs, field maps, pending-entry records and the option structs
//! that describe trimming, group reads and claims.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// ID argument asking the backend to assign the next entry ID.
pub const AUTO_ID: &str = "*";

/// Group-read ID meaning "only entries never delivered to this group".
pub const NEW_ENTRIES: &str = ">";

/// Smallest possible ID in a range query.
pub const RANGE_START: &str = "-";

/// Largest possible ID in a range query.
pub const RANGE_END: &str = "+";

/// Group start position that includes the whole historical backlog.
pub const STREAM_BEGINNING: &str = "0";

/// Canonical field map of a stream entry.
pub type Fields = BTreeMap<String, String>;

/// Error returned when an entry ID string is not `<ms>-<seq>` or `<ms>`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid stream entry ID: {0:?}")]
pub struct ParseEntryIdError(pub String);

/// Stream entry ID (timestamp-sequence)
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct EntryId {
    /// Milliseconds timestamp
    pub ms: u64,
    /// Sequence number within the millisecond
    pub seq: u64,
}

impl EntryId {
    /// The zero ID, lower than any ID a backend assigns.
    pub const MIN: EntryId = EntryId { ms: 0, seq: 0 };

    /// Create a new stream entry ID
    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// The ID immediately after this one.
    pub fn next(&self) -> Self {
        if self.seq == u64::MAX {
            Self::new(self.ms.saturating_add(1), 0)
        } else {
            Self::new(self.ms, self.seq + 1)
        }
    }
}

impl FromStr for EntryId {
    type Err = ParseEntryIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseEntryIdError(s.to_string());
        match s.split_once('-') {
            Some((ms, seq)) => Ok(Self {
                ms: ms.parse().map_err(|_| invalid())?,
                seq: seq.parse().map_err(|_| invalid())?,
            }),
            None => Ok(Self {
                ms: s.parse().map_err(|_| invalid())?,
                seq: 0,
            }),
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

/// A stream entry containing its field map
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEntry {
    /// The entry ID
    pub id: EntryId,
    /// Field-value pairs
    pub fields: Fields,
    /// Fields whose raw value was not valid UTF-8. They are left out of
    /// `fields` rather than rewritten.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub undecodable: BTreeSet<String>,
}

impl StreamEntry {
    /// Create an entry from an ID and fields.
    pub fn new(id: EntryId, fields: Fields) -> Self {
        Self {
            id,
            fields,
            undecodable: BTreeSet::new(),
        }
    }

    /// Record a field value given as raw bytes, keeping it only when it is
    /// valid UTF-8.
    pub fn insert_raw(&mut self, name: String, raw: &[u8]) {
        match std::str::from_utf8(raw) {
            Ok(text) => {
                self.undecodable.remove(&name);
                self.fields.insert(name, text.to_string());
            }
            Err(_) => {
                self.fields.remove(&name);
                self.undecodable.insert(name);
            }
        }
    }

    /// Whether `name` arrived with a value that was not valid UTF-8.
    pub fn is_undecodable(&self, name: &str) -> bool {
        self.undecodable.contains(name)
    }

    /// Look up a single field value.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// One record of a consumer group's Pending Entries List.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEntry {
    /// The message ID
    pub id: EntryId,
    /// Consumer that currently owns the entry
    pub consumer: String,
    /// Milliseconds since the entry was last delivered
    pub idle_ms: u64,
    /// Number of times the entry was delivered
    pub delivery_count: u64,
}

impl PendingEntry {
    /// Idle time as a [`Duration`].
    pub fn idle(&self) -> Duration {
        Duration::from_millis(self.idle_ms)
    }
}

/// How aggressively `MAXLEN` trimming removes old entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TrimStrategy {
    /// `MAXLEN ~ N`: the backend may keep a few extra entries.
    #[default]
    Approximate,
    /// `MAXLEN N`: the stream is cut to exactly N entries.
    Exact,
}

/// Length cap applied on append or by an explicit trim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaxLen {
    /// Trimming precision
    pub strategy: TrimStrategy,
    /// Maximum number of entries to keep
    pub threshold: usize,
}

impl MaxLen {
    /// Approximate cap (`MAXLEN ~ N`).
    pub fn approximate(threshold: usize) -> Self {
        Self {
            strategy: TrimStrategy::Approximate,
            threshold,
        }
    }

    /// Exact cap (`MAXLEN N`).
    pub fn exact(threshold: usize) -> Self {
        Self {
            strategy: TrimStrategy::Exact,
            threshold,
        }
    }

    /// Whether the cap is approximate.
    pub fn is_approximate(&self) -> bool {
        self.strategy == TrimStrategy::Approximate
    }
}

/// Options for a consumer-group read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadGroupOptions {
    /// Maximum number of entries to return
    pub count: usize,
    /// Block for up to this long waiting for new entries
    pub block: Option<Duration>,
}

impl ReadGroupOptions {
    /// Read up to `count` entries without blocking.
    pub fn new(count: usize) -> Self {
        Self { count, block: None }
    }

    /// Block for up to `block` when nothing is available.
    pub fn block(mut self, block: Duration) -> Self {
        self.block = Some(block);
        self
    }
}

/// Optional modifiers for a claim.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClaimOptions {
    /// Set the idle time of the claimed entries (IDLE)
    pub idle_ms: Option<u64>,
    /// Set the delivery counter instead of incrementing it (RETRYCOUNT)
    pub retry_count: Option<u64>,
    /// Create PEL records for IDs that are not pending (FORCE)
    pub force: bool,
    /// Return IDs only and leave the delivery counter untouched (JUSTID)
    pub just_id: bool,
}
