//! Shared test utilities for Redstream integration tests.
//!
//! Import via `mod common;` in integration test files:
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use serde_json::Value as Json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use redstream::backend::memory::MemoryBackend;
use redstream::backend::resp::decode_value;
use redstream::backend::value::Value;
use redstream::backend::StreamBackend;
use redstream::config::ConnectionConfig;
use redstream::envelope::{Envelope, MESSAGE_FIELD};
use redstream::handler::{BoxError, MessageHandler};
use redstream::types::{EntryId, Fields};

// ============================================================================
// Backend helpers
// ============================================================================

/// A fresh in-memory store, both as itself (for failure injection) and as
/// the trait object the library consumes.
#[allow(dead_code)]
pub fn memory() -> (Arc<MemoryBackend>, Arc<dyn StreamBackend>) {
    let mem = Arc::new(MemoryBackend::new());
    let backend: Arc<dyn StreamBackend> = mem.clone();
    (mem, backend)
}

/// Encoded fields for a well-formed envelope.
#[allow(dead_code)]
pub fn envelope_fields(event: &str, payload: Json) -> Fields {
    Envelope::new(event, payload)
        .encode()
        .expect("envelope should encode")
}

/// Fields whose `message` is not a valid envelope.
#[allow(dead_code)]
pub fn raw_fields(body: &str) -> Fields {
    let mut fields = Fields::new();
    fields.insert(MESSAGE_FIELD.to_string(), body.to_string());
    fields
}

/// Append `n` envelopes tagged `event-<i>` with payload `{"n": i}`.
#[allow(dead_code)]
pub async fn seed(backend: &Arc<dyn StreamBackend>, stream: &str, n: usize) -> Vec<EntryId> {
    let mut ids = Vec::with_capacity(n);
    for i in 0..n {
        let fields = envelope_fields(&format!("event-{}", i), serde_json::json!({ "n": i }));
        ids.push(
            backend
                .append(stream, &fields, None)
                .await
                .expect("append should succeed"),
        );
    }
    ids
}

// ============================================================================
// Handlers
// ============================================================================

/// Handler that records every invocation and fails the first `fail_first`
/// deliveries of each entry.
#[allow(dead_code)]
pub struct RecordingHandler {
    fail_first: usize,
    calls: Mutex<Vec<(EntryId, String)>>,
    per_entry: Mutex<HashMap<EntryId, usize>>,
}

#[allow(dead_code)]
impl RecordingHandler {
    /// Accept every entry.
    pub fn accepting() -> Self {
        Self::failing_first(0)
    }

    /// Fail the first `n` deliveries of each entry, then accept.
    pub fn failing_first(n: usize) -> Self {
        Self {
            fail_first: n,
            calls: Mutex::new(Vec::new()),
            per_entry: Mutex::new(HashMap::new()),
        }
    }

    /// Reject every delivery.
    pub fn rejecting() -> Self {
        Self::failing_first(usize::MAX)
    }

    /// Every `(id, event)` the handler saw, in order.
    pub fn calls(&self) -> Vec<(EntryId, String)> {
        self.calls.lock().clone()
    }

    /// Total invocations.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Invocations for one entry.
    pub fn deliveries(&self, id: EntryId) -> usize {
        self.per_entry.lock().get(&id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, envelope: &Envelope, id: EntryId) -> Result<(), BoxError> {
        self.calls.lock().push((id, envelope.event.clone()));
        let seen = {
            let mut per_entry = self.per_entry.lock();
            let count = per_entry.entry(id).or_insert(0);
            *count += 1;
            *count
        };
        if seen <= self.fail_first {
            return Err(format!("rejecting {} (delivery {})", id, seen).into());
        }
        Ok(())
    }
}

// ============================================================================
// Fake RESP server
// ============================================================================

/// A single-purpose RESP2 server that records every command it receives
/// and answers with a scripted reply.
///
/// `CLIENT` commands (the `redis` crate's connection handshake) are
/// answered with `OK` and not recorded.
#[allow(dead_code)]
pub struct FakeServer {
    port: u16,
    commands: Arc<Mutex<Vec<Vec<String>>>>,
}

/// Shared per-server state handed to every connection task.
struct Script<F> {
    respond: F,
    recorded: Arc<Mutex<Vec<Vec<String>>>>,
    first_reply_delay: Mutex<Option<Duration>>,
}

#[allow(dead_code)]
impl FakeServer {
    /// Bind to a random port and answer each command with `respond`.
    pub async fn start<F>(respond: F) -> Self
    where
        F: Fn(&[String]) -> Value + Send + Sync + 'static,
    {
        Self::start_inner(respond, None).await
    }

    /// Like [`FakeServer::start`], but hold back the very first reply
    /// (across all connections) for `delay`.
    pub async fn start_with_first_reply_delay<F>(delay: Duration, respond: F) -> Self
    where
        F: Fn(&[String]) -> Value + Send + Sync + 'static,
    {
        Self::start_inner(respond, Some(delay)).await
    }

    async fn start_inner<F>(respond: F, delay: Option<Duration>) -> Self
    where
        F: Fn(&[String]) -> Value + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("should bind to random port");
        let port = listener.local_addr().expect("should have local addr").port();
        let commands = Arc::new(Mutex::new(Vec::new()));
        let script = Arc::new(Script {
            respond,
            recorded: Arc::clone(&commands),
            first_reply_delay: Mutex::new(delay),
        });

        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let script = Arc::clone(&script);
                tokio::spawn(async move {
                    let _ = serve(socket, script).await;
                });
            }
        });

        Self { port, commands }
    }

    /// Connection settings pointing at this server.
    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            host: "127.0.0.1".to_string(),
            port: self.port,
            ..Default::default()
        }
    }

    /// Connection settings for the `redis` crate driver.
    pub fn library_connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            driver: "library".to_string(),
            ..self.connection()
        }
    }

    /// Commands received so far, each as its argument strings.
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.commands.lock().clone()
    }

    /// The most recent command whose name is `name`.
    pub fn last(&self, name: &str) -> Option<Vec<String>> {
        self.commands
            .lock()
            .iter()
            .rev()
            .find(|args| args.first().is_some_and(|n| n.eq_ignore_ascii_case(name)))
            .cloned()
    }
}

async fn serve<F>(mut socket: TcpStream, script: Arc<Script<F>>) -> std::io::Result<()>
where
    F: Fn(&[String]) -> Value + Send + Sync + 'static,
{
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        if socket.read_buf(&mut buf).await? == 0 {
            return Ok(());
        }

        let mut out = BytesMut::new();
        while let Ok(Some(value)) = decode_value(&mut buf) {
            let args: Vec<String> = match value {
                Value::Array(items) => items
                    .into_iter()
                    .filter_map(|item| item.into_string().ok())
                    .collect(),
                _ => continue,
            };
            if args.first().is_some_and(|n| n.eq_ignore_ascii_case("CLIENT")) {
                encode_reply(&Value::Status("OK".into()), &mut out);
                continue;
            }
            let reply = (script.respond)(&args);
            script.recorded.lock().push(args);
            encode_reply(&reply, &mut out);
        }

        let delay = if out.is_empty() {
            None
        } else {
            script.first_reply_delay.lock().take()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        socket.write_all(&out).await?;
    }
}

/// Serialize a reply value in RESP2.
#[allow(dead_code)]
pub fn encode_reply(value: &Value, out: &mut BytesMut) {
    match value {
        Value::Status(s) => {
            out.put_u8(b'+');
            out.put_slice(s.as_bytes());
            out.put_slice(b"\r\n");
        }
        Value::Error(e) => {
            out.put_u8(b'-');
            out.put_slice(e.as_bytes());
            out.put_slice(b"\r\n");
        }
        Value::Integer(n) => {
            out.put_slice(format!(":{}\r\n", n).as_bytes());
        }
        Value::String(b) => {
            out.put_slice(format!("${}\r\n", b.len()).as_bytes());
            out.put_slice(b);
            out.put_slice(b"\r\n");
        }
        Value::Nil => out.put_slice(b"$-1\r\n"),
        Value::Array(items) => {
            out.put_slice(format!("*{}\r\n", items.len()).as_bytes());
            for item in items {
                encode_reply(item, out);
            }
        }
    }
}

/// Bulk string reply.
#[allow(dead_code)]
pub fn bulk(s: &str) -> Value {
    Value::String(Bytes::copy_from_slice(s.as_bytes()))
}

/// `[id, [field, value, ...]]` entry reply with flat alternating fields.
#[allow(dead_code)]
pub fn entry_reply(id: &str, fields: &[(&str, &str)]) -> Value {
    let flat = fields
        .iter()
        .flat_map(|(k, v)| [bulk(k), bulk(v)])
        .collect();
    Value::Array(vec![bulk(id), Value::Array(flat)])
}

/// `[id, [field, value]]` entry reply whose value is arbitrary bytes.
#[allow(dead_code)]
pub fn raw_entry_reply(id: &str, field: &str, value: &[u8]) -> Value {
    Value::Array(vec![
        bulk(id),
        Value::Array(vec![bulk(field), Value::String(Bytes::copy_from_slice(value))]),
    ])
}

/// Bytes that are not valid UTF-8.
#[allow(dead_code)]
pub const NOT_UTF8: &[u8] = &[0xff, 0xfe, b'{'];

/// A port with nothing listening on it.
#[allow(dead_code)]
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("should bind to random port");
    let port = listener.local_addr().expect("should have local addr").port();
    drop(listener);
    port
}
