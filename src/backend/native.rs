//! Native low-level driver.
//!
//! Commands are marshalled as flat positional argument arrays and sent
//! over a single [`Connection`]. Stream replies arrive as flat
//! alternating `field, value` arrays and are paired up here into
//! [`Fields`].
//!
//! The connection is opened at construction. After a connectivity or
//! framing failure, or when a command future is dropped before its reply
//! arrives, it is discarded and the next command reconnects.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::connection::Connection;
use super::error::{BackendError, BackendResult};
use super::value::{ToArg, Value};
use super::{GroupCreation, PipelineCommand, PipelineReply, StreamBackend, StreamReadReply};
use crate::config::ConnectionConfig;
use crate::types::{
    ClaimOptions, EntryId, Fields, MaxLen, PendingEntry, ReadGroupOptions, StreamEntry, AUTO_ID,
    NEW_ENTRIES,
};

/// Stream backend speaking RESP2 directly.
pub struct NativeBackend {
    config: ConnectionConfig,
    conn: Mutex<Option<Connection>>,
}

impl NativeBackend {
    /// Open the connection described by `config`.
    pub async fn connect(config: ConnectionConfig) -> BackendResult<Self> {
        let conn = Connection::connect(&config).await?;
        Ok(Self {
            config,
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Run one command, reconnecting first if the previous one broke the link.
    async fn execute(&self, args: Vec<Bytes>) -> BackendResult<Value> {
        let mut slot = self.conn.lock().await;
        let mut conn = self.check_out(&mut slot).await?;
        let result = conn.execute(&args).await;
        check_in(&mut slot, conn, &result);
        result
    }

    async fn execute_many(&self, commands: &[Vec<Bytes>]) -> BackendResult<Vec<Value>> {
        let mut slot = self.conn.lock().await;
        let mut conn = self.check_out(&mut slot).await?;
        let result = conn.execute_pipeline(commands).await;
        check_in(&mut slot, conn, &result);
        result
    }

    /// Take the connection out of its slot, opening a new one if empty.
    ///
    /// The slot stays empty while a command is in flight, so a caller that
    /// drops the future mid-command leaves no unread reply for the next one.
    async fn check_out(&self, slot: &mut Option<Connection>) -> BackendResult<Connection> {
        match slot.take() {
            Some(conn) => Ok(conn),
            None => {
                debug!(addr = %self.config.address(), "reconnecting native stream connection");
                Connection::connect(&self.config).await
            }
        }
    }
}

/// Return the connection once its reply has been read in full.
fn check_in<T>(slot: &mut Option<Connection>, conn: Connection, result: &BackendResult<T>) {
    match result {
        Err(e) if should_reset(e) => {
            warn!(error = %e, "dropping native stream connection");
        }
        _ => *slot = Some(conn),
    }
}

/// A failed read leaves unread replies on the wire; the link cannot be reused.
fn should_reset(err: &BackendError) -> bool {
    err.is_connection() || matches!(err, BackendError::Protocol(_))
}

fn push_maxlen(args: &mut Vec<Bytes>, maxlen: MaxLen) {
    args.push(Bytes::from("MAXLEN"));
    if maxlen.is_approximate() {
        args.push(Bytes::from("~"));
    }
    args.push(maxlen.threshold.to_arg());
}

fn xadd_args(stream: &str, fields: &Fields, maxlen: Option<MaxLen>) -> Vec<Bytes> {
    let mut args = vec![Bytes::from("XADD"), stream.to_arg()];
    if let Some(maxlen) = maxlen {
        push_maxlen(&mut args, maxlen);
    }
    args.push(AUTO_ID.to_arg());
    for (field, value) in fields {
        args.push(field.to_arg());
        args.push(value.to_arg());
    }
    args
}

fn xack_args(stream: &str, group: &str, ids: &[EntryId]) -> Vec<Bytes> {
    let mut args = vec![Bytes::from("XACK"), stream.to_arg(), group.to_arg()];
    args.extend(ids.iter().map(ToArg::to_arg));
    args
}

fn xtrim_args(stream: &str, maxlen: MaxLen) -> Vec<Bytes> {
    let mut args = vec![Bytes::from("XTRIM"), stream.to_arg()];
    push_maxlen(&mut args, maxlen);
    args
}

/// Pair a flat `[field, value, field, value, ...]` array into an entry.
///
/// Bulk values keep their exact bytes: anything that is not UTF-8 is
/// marked undecodable instead of being rewritten.
fn pair_fields(id: EntryId, flat: Value) -> BackendResult<StreamEntry> {
    let items = flat.into_array()?;
    if items.len() % 2 != 0 {
        return Err(BackendError::Protocol(format!(
            "odd number of field items: {}",
            items.len()
        )));
    }

    let mut entry = StreamEntry::new(id, Fields::new());
    let mut iter = items.into_iter();
    while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
        let name = field.into_string()?;
        match value {
            Value::String(raw) => entry.insert_raw(name, &raw),
            other => {
                entry.fields.insert(name, other.into_string()?);
            }
        }
    }
    Ok(entry)
}

/// Parse one `[id, [field, value, ...]]` entry.
///
/// Returns `None` for entries whose fields are nil (deleted from the
/// stream while still pending).
fn parse_entry(value: Value) -> BackendResult<Option<StreamEntry>> {
    let mut parts = value.into_array()?.into_iter();
    let (Some(id), fields) = (parts.next(), parts.next()) else {
        return Err(BackendError::Protocol("empty stream entry".into()));
    };
    let id = id.into_entry_id()?;
    match fields {
        None | Some(Value::Nil) => Ok(None),
        Some(flat) => Ok(Some(pair_fields(id, flat)?)),
    }
}

fn parse_entries(value: Value) -> BackendResult<Vec<StreamEntry>> {
    let mut entries = Vec::new();
    for item in value.into_array()? {
        if let Some(entry) = parse_entry(item)? {
            entries.push(entry);
        }
    }
    Ok(entries)
}

fn parse_pending(value: Value) -> BackendResult<Vec<PendingEntry>> {
    value
        .into_array()?
        .into_iter()
        .map(|record| -> BackendResult<PendingEntry> {
            let mut parts = record.into_array()?.into_iter();
            match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(id), Some(consumer), Some(idle), Some(count)) => Ok(PendingEntry {
                    id: id.into_entry_id()?,
                    consumer: consumer.into_string()?,
                    idle_ms: non_negative(idle.into_integer()?),
                    delivery_count: non_negative(count.into_integer()?),
                }),
                _ => Err(BackendError::Protocol(
                    "pending record must have four elements".into(),
                )),
            }
        })
        .collect()
}

fn non_negative(n: i64) -> u64 {
    u64::try_from(n).unwrap_or(0)
}

fn parse_pipeline_reply(command: &PipelineCommand, value: Value) -> BackendResult<PipelineReply> {
    match command {
        PipelineCommand::Append { .. } => Ok(PipelineReply::Id(value.into_entry_id()?)),
        PipelineCommand::Ack { .. } | PipelineCommand::Trim { .. } => {
            Ok(PipelineReply::Count(non_negative(value.into_integer()?)))
        }
    }
}

#[async_trait]
impl StreamBackend for NativeBackend {
    fn name(&self) -> &'static str {
        "native"
    }

    async fn append(
        &self,
        stream: &str,
        fields: &Fields,
        maxlen: Option<MaxLen>,
    ) -> BackendResult<EntryId> {
        self.execute(xadd_args(stream, fields, maxlen))
            .await?
            .into_entry_id()
    }

    async fn range(
        &self,
        stream: &str,
        start: &str,
        end: &str,
        count: Option<usize>,
    ) -> BackendResult<Vec<StreamEntry>> {
        let mut args = vec![
            Bytes::from("XRANGE"),
            stream.to_arg(),
            start.to_arg(),
            end.to_arg(),
        ];
        if let Some(count) = count {
            args.push(Bytes::from("COUNT"));
            args.push(count.to_arg());
        }
        parse_entries(self.execute(args).await?)
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
        mkstream: bool,
    ) -> BackendResult<GroupCreation> {
        let mut args = vec![
            Bytes::from("XGROUP"),
            Bytes::from("CREATE"),
            stream.to_arg(),
            group.to_arg(),
            start_id.to_arg(),
        ];
        if mkstream {
            args.push(Bytes::from("MKSTREAM"));
        }

        match self.execute(args).await?.into_result() {
            Ok(_) => Ok(GroupCreation::Created),
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
        let mut args = vec![
            Bytes::from("XREADGROUP"),
            Bytes::from("GROUP"),
            group.to_arg(),
            consumer.to_arg(),
            Bytes::from("COUNT"),
            options.count.to_arg(),
        ];
        if let Some(block) = options.block {
            args.push(Bytes::from("BLOCK"));
            args.push((block.as_millis() as u64).to_arg());
        }
        args.push(Bytes::from("STREAMS"));
        args.extend(streams.iter().map(|s| s.to_arg()));
        args.extend(streams.iter().map(|_| NEW_ENTRIES.to_arg()));

        // Reply: nil on timeout, otherwise [[stream, [entry, ...]], ...]
        let mut reply = BTreeMap::new();
        for item in self.execute(args).await?.into_array()? {
            let mut parts = item.into_array()?.into_iter();
            let (Some(name), Some(entries)) = (parts.next(), parts.next()) else {
                return Err(BackendError::Protocol("malformed XREADGROUP reply".into()));
            };
            reply.insert(name.into_string()?, parse_entries(entries)?);
        }
        Ok(reply)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> BackendResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let n = self
            .execute(xack_args(stream, group, ids))
            .await?
            .into_integer()?;
        Ok(non_negative(n))
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
        let mut args = vec![
            Bytes::from("XPENDING"),
            stream.to_arg(),
            group.to_arg(),
            start.to_arg(),
            end.to_arg(),
            count.to_arg(),
        ];
        if let Some(consumer) = consumer {
            args.push(consumer.to_arg());
        }
        parse_pending(self.execute(args).await?)
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
        let mut args = vec![
            Bytes::from("XCLAIM"),
            stream.to_arg(),
            group.to_arg(),
            consumer.to_arg(),
            (min_idle.as_millis() as u64).to_arg(),
        ];
        args.extend(ids.iter().map(ToArg::to_arg));
        if let Some(idle) = options.idle_ms {
            args.push(Bytes::from("IDLE"));
            args.push(idle.to_arg());
        }
        if let Some(retry) = options.retry_count {
            args.push(Bytes::from("RETRYCOUNT"));
            args.push(retry.to_arg());
        }
        if options.force {
            args.push(Bytes::from("FORCE"));
        }
        if options.just_id {
            args.push(Bytes::from("JUSTID"));
        }

        let reply = self.execute(args).await?;
        if options.just_id {
            return reply
                .into_array()?
                .into_iter()
                .map(|id| -> BackendResult<StreamEntry> {
                    Ok(StreamEntry::new(id.into_entry_id()?, Fields::new()))
                })
                .collect();
        }
        parse_entries(reply)
    }

    async fn trim(&self, stream: &str, maxlen: MaxLen) -> BackendResult<u64> {
        let n = self.execute(xtrim_args(stream, maxlen)).await?.into_integer()?;
        Ok(non_negative(n))
    }

    async fn len(&self, stream: &str) -> BackendResult<u64> {
        let n = self
            .execute(vec![Bytes::from("XLEN"), stream.to_arg()])
            .await?
            .into_integer()?;
        Ok(non_negative(n))
    }

    async fn delete(&self, stream: &str) -> BackendResult<bool> {
        let n = self
            .execute(vec![Bytes::from("DEL"), stream.to_arg()])
            .await?
            .into_integer()?;
        Ok(n > 0)
    }

    async fn execute_pipeline(
        &self,
        commands: Vec<PipelineCommand>,
    ) -> BackendResult<Vec<PipelineReply>> {
        let encoded: Vec<Vec<Bytes>> = commands
            .iter()
            .map(|command| match command {
                PipelineCommand::Append {
                    stream,
                    fields,
                    maxlen,
                } => xadd_args(stream, fields, *maxlen),
                PipelineCommand::Ack { stream, group, ids } => xack_args(stream, group, ids),
                PipelineCommand::Trim { stream, maxlen } => xtrim_args(stream, *maxlen),
            })
            .collect();

        let values = self.execute_many(&encoded).await?;
        commands
            .iter()
            .zip(values)
            .map(|(command, value)| parse_pipeline_reply(command, value))
            .collect()
    }
}
