//! In-process stream store.
//!
//! Implements the full [`StreamBackend`] contract (auto IDs, consumer
//! groups with a last-delivered watermark, the pending entries list,
//! claims and trimming) without a server. Failures can be injected per
//! operation to drive the consumer's error paths.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::error::{BackendError, BackendResult};
use super::{GroupCreation, PipelineCommand, PipelineReply, StreamBackend, StreamReadReply};
use crate::types::{
    ClaimOptions, EntryId, Fields, MaxLen, PendingEntry, ReadGroupOptions, StreamEntry,
    RANGE_END, RANGE_START, STREAM_BEGINNING,
};

/// Entries per internal node. Approximate trims only drop whole nodes,
/// so an approximately trimmed stream keeps fewer than this many extra
/// entries.
pub const APPROX_NODE_SIZE: usize = 4;

/// Backend operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// `append`
    Append,
    /// `range`
    Range,
    /// `create_group`
    CreateGroup,
    /// `read_group`
    ReadGroup,
    /// `ack`
    Ack,
    /// `pending`
    Pending,
    /// `claim`
    Claim,
    /// `trim`
    Trim,
    /// `len`
    Len,
    /// `delete`
    Delete,
    /// `execute_pipeline`
    Pipeline,
}

#[derive(Debug)]
struct PendingRecord {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
}

#[derive(Debug)]
struct Group {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, PendingRecord>,
}

#[derive(Debug, Default)]
struct MemoryStream {
    entries: BTreeMap<EntryId, Fields>,
    last_id: EntryId,
    groups: HashMap<String, Group>,
}

impl MemoryStream {
    fn next_id(&self) -> EntryId {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        if now_ms > self.last_id.ms {
            EntryId::new(now_ms, 0)
        } else {
            self.last_id.next()
        }
    }

    fn append(&mut self, fields: Fields, maxlen: Option<MaxLen>) -> EntryId {
        let id = self.next_id();
        self.entries.insert(id, fields);
        self.last_id = id;
        if let Some(maxlen) = maxlen {
            self.trim(maxlen);
        }
        id
    }

    fn trim(&mut self, maxlen: MaxLen) -> u64 {
        let excess = self.entries.len().saturating_sub(maxlen.threshold);
        let remove = if maxlen.is_approximate() {
            excess / APPROX_NODE_SIZE * APPROX_NODE_SIZE
        } else {
            excess
        };
        for _ in 0..remove {
            self.entries.pop_first();
        }
        remove as u64
    }
}

#[derive(Default)]
struct Inner {
    streams: HashMap<String, MemoryStream>,
}

fn no_group(stream: &str, group: &str) -> BackendError {
    BackendError::Server(format!(
        "NOGROUP No such key '{}' or consumer group '{}'",
        stream, group
    ))
}

fn parse_bound(raw: &str) -> BackendResult<EntryId> {
    match raw {
        RANGE_START => Ok(EntryId::MIN),
        RANGE_END => Ok(EntryId::new(u64::MAX, u64::MAX)),
        other => other.parse().map_err(|_| {
            BackendError::Server(
                "ERR Invalid stream ID specified as stream command argument".into(),
            )
        }),
    }
}

fn idle_ms(since: Instant) -> u64 {
    Instant::now().saturating_duration_since(since).as_millis() as u64
}

impl Inner {
    /// The group and the stream's entries, borrowed together.
    fn group_mut(
        &mut self,
        stream: &str,
        group: &str,
    ) -> BackendResult<(&mut Group, &BTreeMap<EntryId, Fields>)> {
        let s = self
            .streams
            .get_mut(stream)
            .ok_or_else(|| no_group(stream, group))?;
        let entries = &s.entries;
        let g = s.groups.get_mut(group).ok_or_else(|| no_group(stream, group))?;
        Ok((g, entries))
    }

    fn append(&mut self, stream: &str, fields: Fields, maxlen: Option<MaxLen>) -> EntryId {
        self.streams
            .entry(stream.to_string())
            .or_default()
            .append(fields, maxlen)
    }

    fn ack(&mut self, stream: &str, group: &str, ids: &[EntryId]) -> u64 {
        let Some(g) = self
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
        else {
            return 0;
        };
        ids.iter()
            .filter(|id| g.pending.remove(*id).is_some())
            .count() as u64
    }

    fn trim(&mut self, stream: &str, maxlen: MaxLen) -> u64 {
        self.streams
            .get_mut(stream)
            .map(|s| s.trim(maxlen))
            .unwrap_or(0)
    }

    fn read_group(
        &mut self,
        group: &str,
        consumer: &str,
        streams: &[&str],
        count: usize,
    ) -> BackendResult<StreamReadReply> {
        let mut reply = BTreeMap::new();
        for stream in streams {
            let (g, entries) = self.group_mut(stream, group)?;
            let start = g.last_delivered.next();
            let batch: Vec<StreamEntry> = entries
                .range(start..)
                .take(count)
                .map(|(id, fields)| StreamEntry::new(*id, fields.clone()))
                .collect();
            if batch.is_empty() {
                continue;
            }

            let now = Instant::now();
            for entry in &batch {
                g.pending.insert(
                    entry.id,
                    PendingRecord {
                        consumer: consumer.to_string(),
                        delivered_at: now,
                        delivery_count: 1,
                    },
                );
                g.last_delivered = entry.id;
            }
            reply.insert(stream.to_string(), batch);
        }
        Ok(reply)
    }
}

/// In-memory [`StreamBackend`].
#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
    failures: Mutex<HashMap<Op, VecDeque<BackendError>>>,
    calls: Mutex<HashMap<Op, usize>>,
}

impl MemoryBackend {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call to `op` fail with `err`. Calls queue up.
    pub fn fail_next(&self, op: Op, err: BackendError) {
        self.failures.lock().entry(op).or_default().push_back(err);
    }

    /// Number of times `op` has been called, including failed calls.
    pub fn calls(&self, op: Op) -> usize {
        self.calls.lock().get(&op).copied().unwrap_or(0)
    }

    fn enter(&self, op: Op) -> BackendResult<()> {
        *self.calls.lock().entry(op).or_insert(0) += 1;
        match self.failures.lock().get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl StreamBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn append(
        &self,
        stream: &str,
        fields: &Fields,
        maxlen: Option<MaxLen>,
    ) -> BackendResult<EntryId> {
        self.enter(Op::Append)?;
        Ok(self.inner.lock().append(stream, fields.clone(), maxlen))
    }

    async fn range(
        &self,
        stream: &str,
        start: &str,
        end: &str,
        count: Option<usize>,
    ) -> BackendResult<Vec<StreamEntry>> {
        self.enter(Op::Range)?;
        let start = parse_bound(start)?;
        let end = parse_bound(end)?;
        if start > end {
            return Ok(Vec::new());
        }

        let inner = self.inner.lock();
        let Some(s) = inner.streams.get(stream) else {
            return Ok(Vec::new());
        };
        Ok(s.entries
            .range(start..=end)
            .take(count.unwrap_or(usize::MAX))
            .map(|(id, fields)| StreamEntry::new(*id, fields.clone()))
            .collect())
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
        mkstream: bool,
    ) -> BackendResult<GroupCreation> {
        self.enter(Op::CreateGroup)?;
        let mut inner = self.inner.lock();
        if !mkstream && !inner.streams.contains_key(stream) {
            return Err(BackendError::Server(
                "ERR The XGROUP subcommand requires the key to exist".into(),
            ));
        }
        let s = inner.streams.entry(stream.to_string()).or_default();
        if s.groups.contains_key(group) {
            return Ok(GroupCreation::AlreadyExists);
        }

        let last_delivered = match start_id {
            "$" => s.last_id,
            STREAM_BEGINNING => EntryId::MIN,
            other => parse_bound(other)?,
        };
        s.groups.insert(
            group.to_string(),
            Group {
                last_delivered,
                pending: BTreeMap::new(),
            },
        );
        Ok(GroupCreation::Created)
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[&str],
        options: ReadGroupOptions,
    ) -> BackendResult<StreamReadReply> {
        self.enter(Op::ReadGroup)?;
        let reply = self
            .inner
            .lock()
            .read_group(group, consumer, streams, options.count)?;
        match options.block {
            Some(block) if reply.is_empty() => {
                tokio::time::sleep(block).await;
                self.inner
                    .lock()
                    .read_group(group, consumer, streams, options.count)
            }
            _ => Ok(reply),
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> BackendResult<u64> {
        self.enter(Op::Ack)?;
        Ok(self.inner.lock().ack(stream, group, ids))
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        start: &str,
        end: &str,
        count: usize,
        consumer: Option<&str>,
    ) -> BackendResult<Vec<PendingEntry>> {
        self.enter(Op::Pending)?;
        let start = parse_bound(start)?;
        let end = parse_bound(end)?;
        if start > end {
            return Ok(Vec::new());
        }

        let mut inner = self.inner.lock();
        let (g, _) = inner.group_mut(stream, group)?;
        Ok(g.pending
            .range(start..=end)
            .filter(|(_, record)| consumer.map_or(true, |c| record.consumer == c))
            .take(count)
            .map(|(id, record)| PendingEntry {
                id: *id,
                consumer: record.consumer.clone(),
                idle_ms: idle_ms(record.delivered_at),
                delivery_count: record.delivery_count,
            })
            .collect())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
        options: ClaimOptions,
    ) -> BackendResult<Vec<StreamEntry>> {
        self.enter(Op::Claim)?;
        let mut inner = self.inner.lock();
        let (g, entries) = inner.group_mut(stream, group)?;
        let min_idle_ms = min_idle.as_millis() as u64;
        let now = Instant::now();
        let delivered_at = options
            .idle_ms
            .and_then(|idle| now.checked_sub(Duration::from_millis(idle)))
            .unwrap_or(now);

        let mut claimed = Vec::new();
        for id in ids {
            let Some(fields) = entries.get(id) else {
                // Deleted or trimmed away while pending.
                g.pending.remove(id);
                continue;
            };

            let previous = match g.pending.get(id) {
                Some(record) if idle_ms(record.delivered_at) < min_idle_ms => continue,
                Some(record) => Some(record.delivery_count),
                None if options.force => None,
                None => continue,
            };

            let delivery_count = match (options.retry_count, previous) {
                (Some(n), _) => n,
                (None, Some(n)) if options.just_id => n,
                (None, Some(n)) => n + 1,
                (None, None) => 1,
            };
            g.pending.insert(
                *id,
                PendingRecord {
                    consumer: consumer.to_string(),
                    delivered_at,
                    delivery_count,
                },
            );

            let fields = if options.just_id {
                Fields::new()
            } else {
                fields.clone()
            };
            claimed.push(StreamEntry::new(*id, fields));
        }
        Ok(claimed)
    }

    async fn trim(&self, stream: &str, maxlen: MaxLen) -> BackendResult<u64> {
        self.enter(Op::Trim)?;
        Ok(self.inner.lock().trim(stream, maxlen))
    }

    async fn len(&self, stream: &str) -> BackendResult<u64> {
        self.enter(Op::Len)?;
        Ok(self
            .inner
            .lock()
            .streams
            .get(stream)
            .map(|s| s.entries.len() as u64)
            .unwrap_or(0))
    }

    async fn delete(&self, stream: &str) -> BackendResult<bool> {
        self.enter(Op::Delete)?;
        Ok(self.inner.lock().streams.remove(stream).is_some())
    }

    async fn execute_pipeline(
        &self,
        commands: Vec<PipelineCommand>,
    ) -> BackendResult<Vec<PipelineReply>> {
        self.enter(Op::Pipeline)?;
        let mut inner = self.inner.lock();
        Ok(commands
            .into_iter()
            .map(|command| match command {
                PipelineCommand::Append {
                    stream,
                    fields,
                    maxlen,
                } => PipelineReply::Id(inner.append(&stream, fields, maxlen)),
                PipelineCommand::Ack { stream, group, ids } => {
                    PipelineReply::Count(inner.ack(&stream, &group, &ids))
                }
                PipelineCommand::Trim { stream, maxlen } => {
                    PipelineReply::Count(inner.trim(&stream, maxlen))
                }
            })
            .collect())
    }
}
