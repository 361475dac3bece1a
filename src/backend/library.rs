//! Abstraction-library driver built on the `redis` crate.
//!
//! Options are expressed with the crate's typed builders
//! ([`StreamReadOptions`], [`StreamMaxlen`], [`StreamClaimOptions`]) and
//! replies arrive as pre-paired maps, which are converted into the
//! canonical [`Fields`] shape.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{
    StreamClaimOptions, StreamClaimReply, StreamId, StreamMaxlen, StreamPendingCountReply,
    StreamRangeReply, StreamReadOptions, StreamReadReply as RedisReadReply,
};
use redis::{AsyncCommands, ConnectionAddr, ConnectionInfo, RedisConnectionInfo};

use super::error::{BackendError, BackendResult};
use super::{GroupCreation, PipelineCommand, PipelineReply, StreamBackend, StreamReadReply};
use crate::config::ConnectionConfig;
use crate::types::{
    ClaimOptions, EntryId, Fields, MaxLen, PendingEntry, ReadGroupOptions, StreamEntry, AUTO_ID,
    NEW_ENTRIES,
};

/// Stream backend using a multiplexed `redis` crate connection.
pub struct LibraryBackend {
    connection: MultiplexedConnection,
}

impl LibraryBackend {
    /// Connect with the address and credentials in `config`.
    pub async fn connect(config: &ConnectionConfig) -> BackendResult<Self> {
        let client = redis::Client::open(connection_info(config))?;
        let timeout = Duration::from_millis(config.connect_timeout_ms);
        let connection = tokio::time::timeout(timeout, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| BackendError::Timeout(timeout))??;
        Ok(Self { connection })
    }

    /// Wrap an already established connection.
    pub fn from_connection(connection: MultiplexedConnection) -> Self {
        Self { connection }
    }

    fn con(&self) -> MultiplexedConnection {
        self.connection.clone()
    }
}

/// Structured connection settings. Credentials are passed as-is, so they
/// never need URL escaping.
fn connection_info(config: &ConnectionConfig) -> ConnectionInfo {
    ConnectionInfo {
        addr: ConnectionAddr::Tcp(config.host.clone(), config.port),
        redis: RedisConnectionInfo {
            db: i64::from(config.database),
            username: config.username.clone(),
            password: config.password.clone(),
            ..Default::default()
        },
    }
}

fn to_redis_maxlen(maxlen: MaxLen) -> StreamMaxlen {
    if maxlen.is_approximate() {
        StreamMaxlen::Approx(maxlen.threshold)
    } else {
        StreamMaxlen::Equals(maxlen.threshold)
    }
}

fn to_claim_options(options: ClaimOptions) -> StreamClaimOptions {
    let mut opts = StreamClaimOptions::default();
    if let Some(idle) = options.idle_ms {
        opts = opts.idle(idle as usize);
    }
    if let Some(retry) = options.retry_count {
        opts = opts.retry(retry as usize);
    }
    if options.force {
        opts = opts.with_force();
    }
    if options.just_id {
        opts = opts.with_justid();
    }
    opts
}

fn parse_id(raw: &str) -> BackendResult<EntryId> {
    raw.parse()
        .map_err(|e: crate::types::ParseEntryIdError| BackendError::Protocol(e.to_string()))
}

/// Convert a pre-paired `redis` entry into the canonical shape.
fn to_entry(stream_id: StreamId) -> BackendResult<StreamEntry> {
    let mut entry = StreamEntry::new(parse_id(&stream_id.id)?, Fields::new());
    for (field, value) in stream_id.map {
        match value {
            redis::Value::BulkString(raw) => entry.insert_raw(field, &raw),
            other => {
                let text: String = redis::from_redis_value(&other)?;
                entry.fields.insert(field, text);
            }
        }
    }
    Ok(entry)
}

/// Entries deleted while still pending come back with no fields; they are
/// skipped, as every stored entry has at least one field.
fn to_entries(ids: Vec<StreamId>) -> BackendResult<Vec<StreamEntry>> {
    ids.into_iter()
        .filter(|stream_id| !stream_id.map.is_empty())
        .map(to_entry)
        .collect()
}

fn item_pairs(fields: &Fields) -> Vec<(&str, &str)> {
    fields
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect()
}

fn id_strings(ids: &[EntryId]) -> Vec<String> {
    ids.iter().map(ToString::to_string).collect()
}

#[async_trait]
impl StreamBackend for LibraryBackend {
    fn name(&self) -> &'static str {
        "library"
    }

    async fn append(
        &self,
        stream: &str,
        fields: &Fields,
        maxlen: Option<MaxLen>,
    ) -> BackendResult<EntryId> {
        let mut con = self.con();
        let items = item_pairs(fields);
        let id: String = match maxlen {
            Some(maxlen) => {
                con.xadd_maxlen(stream, to_redis_maxlen(maxlen), AUTO_ID, &items)
                    .await?
            }
            None => con.xadd(stream, AUTO_ID, &items).await?,
        };
        parse_id(&id)
    }

    async fn range(
        &self,
        stream: &str,
        start: &str,
        end: &str,
        count: Option<usize>,
    ) -> BackendResult<Vec<StreamEntry>> {
        let mut con = self.con();
        let reply: StreamRangeReply = match count {
            Some(count) => con.xrange_count(stream, start, end, count).await?,
            None => con.xrange(stream, start, end).await?,
        };
        to_entries(reply.ids)
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
        mkstream: bool,
    ) -> BackendResult<GroupCreation> {
        let mut con = self.con();
        let result: redis::RedisResult<()> = if mkstream {
            con.xgroup_create_mkstream(stream, group, start_id).await
        } else {
            con.xgroup_create(stream, group, start_id).await
        };

        match result.map_err(BackendError::from) {
            Ok(()) => Ok(GroupCreation::Created),
            Err(e) if e.is_busy_group() => Ok(GroupCreation::AlreadyExists),
            Err(e) => Err(e),
        }
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[&str],
        options: ReadGroupOptions,
    ) -> BackendResult<StreamReadReply> {
        let mut con = self.con();
        let mut opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(options.count);
        if let Some(block) = options.block {
            opts = opts.block(block.as_millis() as usize);
        }
        let ids = vec![NEW_ENTRIES; streams.len()];

        let reply: Option<RedisReadReply> = con.xread_options(streams, &ids, &opts).await?;
        let mut out = BTreeMap::new();
        for key in reply.map(|r| r.keys).unwrap_or_default() {
            out.insert(key.key, to_entries(key.ids)?);
        }
        Ok(out)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> BackendResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut con = self.con();
        let n: u64 = con.xack(stream, group, &id_strings(ids)).await?;
        Ok(n)
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
        let mut con = self.con();
        let reply: StreamPendingCountReply = match consumer {
            Some(consumer) => {
                con.xpending_consumer_count(stream, group, start, end, count, consumer)
                    .await?
            }
            None => con.xpending_count(stream, group, start, end, count).await?,
        };

        reply
            .ids
            .into_iter()
            .map(|p| -> BackendResult<PendingEntry> {
                Ok(PendingEntry {
                    id: parse_id(&p.id)?,
                    consumer: p.consumer,
                    idle_ms: p.last_delivered_ms as u64,
                    delivery_count: p.times_delivered as u64,
                })
            })
            .collect()
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
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut con = self.con();
        let min_idle = min_idle.as_millis() as usize;
        let ids = id_strings(ids);
        let opts = to_claim_options(options);

        if options.just_id {
            let claimed: Vec<String> = con
                .xclaim_options(stream, group, consumer, min_idle, &ids, opts)
                .await?;
            return claimed
                .iter()
                .map(|id| -> BackendResult<StreamEntry> {
                    Ok(StreamEntry::new(parse_id(id)?, Fields::new()))
                })
                .collect();
        }

        let reply: StreamClaimReply = con
            .xclaim_options(stream, group, consumer, min_idle, &ids, opts)
            .await?;
        to_entries(reply.ids)
    }

    async fn trim(&self, stream: &str, maxlen: MaxLen) -> BackendResult<u64> {
        let mut con = self.con();
        let n: u64 = con.xtrim(stream, to_redis_maxlen(maxlen)).await?;
        Ok(n)
    }

    async fn len(&self, stream: &str) -> BackendResult<u64> {
        let mut con = self.con();
        let n: u64 = con.xlen(stream).await?;
        Ok(n)
    }

    async fn delete(&self, stream: &str) -> BackendResult<bool> {
        let mut con = self.con();
        let n: u64 = con.del(stream).await?;
        Ok(n > 0)
    }

    async fn execute_pipeline(
        &self,
        commands: Vec<PipelineCommand>,
    ) -> BackendResult<Vec<PipelineReply>> {
        let mut pipe = redis::pipe();
        for command in &commands {
            match command {
                PipelineCommand::Append {
                    stream,
                    fields,
                    maxlen,
                } => {
                    let items = item_pairs(fields);
                    match maxlen {
                        Some(maxlen) => {
                            pipe.xadd_maxlen(stream, to_redis_maxlen(*maxlen), AUTO_ID, &items);
                        }
                        None => {
                            pipe.xadd(stream, AUTO_ID, &items);
                        }
                    }
                }
                PipelineCommand::Ack { stream, group, ids } => {
                    pipe.xack(stream, group, &id_strings(ids));
                }
                PipelineCommand::Trim { stream, maxlen } => {
                    pipe.xtrim(stream, to_redis_maxlen(*maxlen));
                }
            }
        }

        let mut con = self.con();
        let values: Vec<redis::Value> = pipe.query_async(&mut con).await?;
        if values.len() != commands.len() {
            return Err(BackendError::Protocol(format!(
                "pipeline returned {} replies for {} commands",
                values.len(),
                commands.len()
            )));
        }

        commands
            .iter()
            .zip(values)
            .map(|(command, value)| -> BackendResult<PipelineReply> {
                match command {
                    PipelineCommand::Append { .. } => {
                        let id: String = redis::from_redis_value(&value)?;
                        Ok(PipelineReply::Id(parse_id(&id)?))
                    }
                    PipelineCommand::Ack { .. } | PipelineCommand::Trim { .. } => {
                        let n: u64 = redis::from_redis_value(&value)?;
                        Ok(PipelineReply::Count(n))
                    }
                }
            })
            .collect()
    }
}
