#![allow(clippy::unwrap_used)]
//! Library driver integration tests
//!
//! Runs the `redis` crate driver against the same scripted fake server as
//! the native tests, checking that:
//! - Typed option builders produce the expected commands
//! - Pre-paired replies normalize into the same entries as the native driver
//! - Group, pending, claim and pipeline replies map onto the canonical shapes
//! - Consumer cycles, poison entries and vanished groups behave identically
//! - Credentials reach the server unescaped

mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map};

use common::*;
use redstream::backend::value::Value;
use redstream::backend::{self, GroupCreation, PipelineReply, StreamBackend};
use redstream::config::ConnectionConfig;
use redstream::types::{ClaimOptions, EntryId, MaxLen, ReadGroupOptions};
use redstream::{BatchEntry, Consumer, ConsumerOptions, Envelope, Producer, StreamError};

fn ok() -> Value {
    Value::Status("OK".into())
}

async fn library(server: &FakeServer) -> Arc<dyn StreamBackend> {
    let backend = backend::connect(&server.library_connection()).await.unwrap();
    assert_eq!(backend.name(), "library");
    backend
}

// ============================================================================
// Argument marshalling
// ============================================================================

#[tokio::test]
async fn test_xadd_with_approximate_cap() {
    let server = FakeServer::start(|args| match args[0].as_str() {
        "XADD" => bulk("1700000000000-3"),
        _ => Value::Error("ERR unexpected".into()),
    })
    .await;
    let backend = library(&server).await;

    let id = Producer::new(backend, "orders")
        .with_max_len(Some(MaxLen::approximate(100)))
        .publish("order.created", &json!({"id": 7}), Map::new())
        .await
        .unwrap();
    assert_eq!(id, EntryId::new(1_700_000_000_000, 3));

    let args = server.last("XADD").unwrap();
    assert_eq!(&args[..7], ["XADD", "orders", "MAXLEN", "~", "100", "*", "message"]);
    let body: serde_json::Value = serde_json::from_str(&args[7]).unwrap();
    assert_eq!(body["event"], "order.created");
    assert_eq!(body["payload"], json!({"id": 7}));
}

#[tokio::test]
async fn test_exact_trim() {
    let server = FakeServer::start(|args| match args[0].as_str() {
        "XTRIM" => Value::Integer(4),
        _ => Value::Error("ERR unexpected".into()),
    })
    .await;
    let backend = library(&server).await;

    let removed = Producer::new(backend, "orders").trim(5, true).await.unwrap();
    assert_eq!(removed, 4);
    assert_eq!(
        server.last("XTRIM").unwrap(),
        ["XTRIM", "orders", "MAXLEN", "=", "5"]
    );
}

// ============================================================================
// Reply normalization
// ============================================================================

#[tokio::test]
async fn test_read_group_entries() {
    let body = envelope_fields("ping", json!(1))["message"].clone();
    let reply_body = body.clone();
    let server = FakeServer::start(move |args| match args[0].as_str() {
        "XREADGROUP" => Value::Array(vec![Value::Array(vec![
            bulk("orders"),
            Value::Array(vec![
                entry_reply("5-0", &[("message", reply_body.as_str())]),
                entry_reply("5-1", &[("message", reply_body.as_str()), ("extra", "x")]),
            ]),
        ])]),
        _ => Value::Error("ERR unexpected".into()),
    })
    .await;
    let backend = library(&server).await;

    let reply = backend
        .read_group(
            "g1",
            "c1",
            &["orders"],
            ReadGroupOptions::new(5).block(Duration::from_millis(250)),
        )
        .await
        .unwrap();

    assert_eq!(
        server.last("XREADGROUP").unwrap(),
        [
            "XREADGROUP", "GROUP", "g1", "c1", "BLOCK", "250", "COUNT", "5", "STREAMS", "orders",
            ">"
        ]
    );
    let entries = &reply["orders"];
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].id, EntryId::new(5, 0));
    assert_eq!(entries[0].field("message"), Some(body.as_str()));
    assert_eq!(entries[1].id, EntryId::new(5, 1));
    assert_eq!(entries[1].field("extra"), Some("x"));
}

#[tokio::test]
async fn test_read_group_nil_is_empty() {
    let server = FakeServer::start(|_| Value::Nil).await;
    let backend = library(&server).await;
    let reply = backend
        .read_group("g", "c", &["orders"], ReadGroupOptions::new(10))
        .await
        .unwrap();
    assert!(reply.is_empty());
}

#[tokio::test]
async fn test_busy_group_is_already_exists() {
    let server = FakeServer::start(|args| match args[0].as_str() {
        "XGROUP" => Value::Error("BUSYGROUP Consumer Group name already exists".into()),
        _ => Value::Error("ERR unexpected".into()),
    })
    .await;
    let backend = library(&server).await;

    let created = backend
        .create_group("orders", "g1", "0", true)
        .await
        .unwrap();
    assert_eq!(created, GroupCreation::AlreadyExists);
    assert_eq!(
        server.last("XGROUP").unwrap(),
        ["XGROUP", "CREATE", "orders", "g1", "0", "MKSTREAM"]
    );
}

#[tokio::test]
async fn test_pending_records() {
    let server = FakeServer::start(|args| match args[0].as_str() {
        "XPENDING" => Value::Array(vec![
            Value::Array(vec![
                bulk("10-0"),
                bulk("c1"),
                Value::Integer(1500),
                Value::Integer(2),
            ]),
            Value::Array(vec![
                bulk("10-1"),
                bulk("c2"),
                Value::Integer(20),
                Value::Integer(1),
            ]),
        ]),
        _ => Value::Error("ERR unexpected".into()),
    })
    .await;
    let backend = library(&server).await;

    let pending = backend
        .pending("orders", "g1", "-", "+", 10, Some("c1"))
        .await
        .unwrap();
    assert_eq!(
        server.last("XPENDING").unwrap(),
        ["XPENDING", "orders", "g1", "-", "+", "10", "c1"]
    );
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].id, EntryId::new(10, 0));
    assert_eq!(pending[0].consumer, "c1");
    assert_eq!(pending[0].idle_ms, 1500);
    assert_eq!(pending[0].delivery_count, 2);
    assert_eq!(pending[1].idle(), Duration::from_millis(20));
}

#[tokio::test]
async fn test_claim_options_and_deleted_entries() {
    let server = FakeServer::start(|args| match args[0].as_str() {
        "XCLAIM" => Value::Array(vec![
            entry_reply("3-0", &[("message", "{}")]),
            Value::Array(vec![bulk("3-1"), Value::Nil]),
        ]),
        _ => Value::Error("ERR unexpected".into()),
    })
    .await;
    let backend = library(&server).await;

    let options = ClaimOptions {
        retry_count: Some(4),
        force: true,
        ..Default::default()
    };
    let claimed = backend
        .claim(
            "orders",
            "g1",
            "c2",
            Duration::from_millis(60_000),
            &[EntryId::new(3, 0), EntryId::new(3, 1)],
            options,
        )
        .await
        .unwrap();

    assert_eq!(
        server.last("XCLAIM").unwrap(),
        ["XCLAIM", "orders", "g1", "c2", "60000", "3-0", "3-1", "RETRYCOUNT", "4", "FORCE"]
    );
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, EntryId::new(3, 0));
    assert_eq!(claimed[0].field("message"), Some("{}"));
}

// ============================================================================
// Pipelines and full cycles
// ============================================================================

#[tokio::test]
async fn test_batch_is_pipelined() {
    let seq = AtomicU64::new(0);
    let server = FakeServer::start(move |args| match args[0].as_str() {
        "XADD" => bulk(&format!("42-{}", seq.fetch_add(1, Ordering::SeqCst))),
        _ => Value::Error("ERR unexpected".into()),
    })
    .await;
    let backend = library(&server).await;

    let batch: Vec<_> = (0..3)
        .map(|i| BatchEntry::new(format!("e{}", i), json!({"i": i})))
        .collect();
    let ids = Producer::new(backend, "orders")
        .publish_batch(&batch)
        .await
        .unwrap();

    assert_eq!(
        ids,
        [EntryId::new(42, 0), EntryId::new(42, 1), EntryId::new(42, 2)]
    );
    let commands = server.commands();
    assert_eq!(commands.len(), 3);
    assert!(commands.iter().all(|c| c[0] == "XADD" && c[1] == "orders"));
}

#[tokio::test]
async fn test_mixed_pipeline_replies() {
    let server = FakeServer::start(|args| match args[0].as_str() {
        "XADD" => bulk("7-0"),
        "XACK" => Value::Integer(2),
        "XTRIM" => Value::Integer(5),
        _ => Value::Error("ERR unexpected".into()),
    })
    .await;
    let backend = library(&server).await;

    let mut pipe = backend.pipeline();
    pipe.append("orders", raw_fields("{}"), None)
        .ack("orders", "g1", &[EntryId::new(1, 0), EntryId::new(1, 1)])
        .trim("orders", MaxLen::approximate(10));
    let replies = pipe.execute().await.unwrap();

    assert_eq!(
        replies,
        [
            PipelineReply::Id(EntryId::new(7, 0)),
            PipelineReply::Count(2),
            PipelineReply::Count(5),
        ]
    );
    assert_eq!(
        server.last("XACK").unwrap(),
        ["XACK", "orders", "g1", "1-0", "1-1"]
    );
}

#[tokio::test]
async fn test_consumer_cycle() {
    let body = envelope_fields("order.created", json!({"id": 1}))["message"].clone();
    let server = FakeServer::start(move |args| match args[0].as_str() {
        "XGROUP" => ok(),
        "XREADGROUP" => Value::Array(vec![Value::Array(vec![
            bulk("orders"),
            Value::Array(vec![entry_reply("8-0", &[("message", body.as_str())])]),
        ])]),
        "XACK" => Value::Integer(1),
        "XPENDING" => Value::Array(vec![]),
        _ => Value::Error("ERR unexpected".into()),
    })
    .await;
    let backend = library(&server).await;
    let consumer = Consumer::new(backend, ConsumerOptions::new("orders", "g1", "c1"));
    let handler = RecordingHandler::accepting();

    let report = consumer.poll_once(&handler).await.unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(report.acknowledged, 1);
    assert_eq!(
        handler.calls(),
        [(EntryId::new(8, 0), "order.created".to_string())]
    );

    let names: Vec<_> = server.commands().into_iter().map(|c| c[0].clone()).collect();
    assert_eq!(names, ["XGROUP", "XREADGROUP", "XACK", "XPENDING"]);
    assert_eq!(
        server.last("XACK").unwrap(),
        ["XACK", "orders", "g1", "8-0"]
    );
}

#[tokio::test]
async fn test_non_utf8_entry_is_poison() {
    let server = FakeServer::start(|args| match args[0].as_str() {
        "XGROUP" => ok(),
        "XREADGROUP" => Value::Array(vec![Value::Array(vec![
            bulk("orders"),
            Value::Array(vec![raw_entry_reply("8-1", "message", NOT_UTF8)]),
        ])]),
        "XACK" => Value::Integer(1),
        "XPENDING" => Value::Array(vec![]),
        _ => Value::Error("ERR unexpected".into()),
    })
    .await;
    let backend = library(&server).await;
    let consumer = Consumer::new(backend, ConsumerOptions::new("orders", "g1", "c1"));
    let handler = RecordingHandler::accepting();

    let report = consumer.poll_once(&handler).await.unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(report.poison, 1);
    assert_eq!(handler.call_count(), 0);
    assert_eq!(
        server.last("XACK").unwrap(),
        ["XACK", "orders", "g1", "8-1"]
    );
}

#[tokio::test]
async fn test_missing_group_is_recreated() {
    let reads = AtomicU64::new(0);
    let server = FakeServer::start(move |args| match args[0].as_str() {
        "XGROUP" => ok(),
        "XREADGROUP" if reads.fetch_add(1, Ordering::SeqCst) == 0 => Value::Error(
            "NOGROUP No such key 'orders' or consumer group 'g1' in XREADGROUP with GROUP option"
                .into(),
        ),
        "XREADGROUP" => Value::Nil,
        "XPENDING" => Value::Array(vec![]),
        _ => Value::Error("ERR unexpected".into()),
    })
    .await;
    let backend = library(&server).await;
    let consumer = Consumer::new(backend, ConsumerOptions::new("orders", "g1", "c1"));
    let handler = RecordingHandler::accepting();

    let err = consumer.poll_once(&handler).await.unwrap_err();
    assert!(matches!(err, StreamError::Consume { .. }), "{:?}", err);

    assert!(consumer.poll_once(&handler).await.unwrap().is_idle());
    let names: Vec<_> = server.commands().into_iter().map(|c| c[0].clone()).collect();
    assert_eq!(names, ["XGROUP", "XREADGROUP", "XGROUP", "XREADGROUP", "XPENDING"]);
}

#[tokio::test]
async fn test_envelope_survives_round_trip() {
    let stored = Arc::new(parking_lot::Mutex::new(String::new()));
    let sink = Arc::clone(&stored);
    let server = FakeServer::start(move |args| match args[0].as_str() {
        "XADD" => {
            *sink.lock() = args[args.len() - 1].clone();
            bulk("9-0")
        }
        "XRANGE" => Value::Array(vec![entry_reply("9-0", &[("message", sink.lock().as_str())])]),
        _ => Value::Error("ERR unexpected".into()),
    })
    .await;
    let backend = library(&server).await;

    let mut extra = Map::new();
    extra.insert("source".into(), json!("checkout"));
    Producer::new(Arc::clone(&backend), "orders")
        .publish("order.paid", &json!({"total": 12.5}), extra)
        .await
        .unwrap();

    let entries = backend.range("orders", "-", "+", None).await.unwrap();
    let envelope = Envelope::decode("orders", &entries[0]).unwrap();
    assert_eq!(envelope.event, "order.paid");
    assert_eq!(envelope.payload, json!({"total": 12.5}));
    assert_eq!(envelope.meta("source"), Some(&json!("checkout")));
}

// ============================================================================
// Connection setup and failure classification
// ============================================================================

#[tokio::test]
async fn test_credentials_sent_unescaped_by_both_drivers() {
    for driver in ["native", "library"] {
        let server = FakeServer::start(|args| match args[0].as_str() {
            "AUTH" | "SELECT" => ok(),
            "XLEN" => Value::Integer(3),
            _ => Value::Error("ERR unexpected".into()),
        })
        .await;
        let config = ConnectionConfig {
            driver: driver.into(),
            username: Some("app".into()),
            password: Some("p@ss/w#rd".into()),
            database: 2,
            ..server.connection()
        };

        let backend = backend::connect(&config).await.unwrap();
        assert_eq!(backend.len("orders").await.unwrap(), 3, "{} driver", driver);

        let commands = server.commands();
        assert_eq!(commands[0], ["AUTH", "app", "p@ss/w#rd"], "{} driver", driver);
        assert_eq!(commands[1], ["SELECT", "2"], "{} driver", driver);
        assert_eq!(commands[2], ["XLEN", "orders"], "{} driver", driver);
    }
}

#[tokio::test]
async fn test_server_error_is_publish_failure() {
    let server = FakeServer::start(|_| {
        Value::Error("WRONGTYPE Operation against a key holding the wrong kind of value".into())
    })
    .await;
    let backend = library(&server).await;

    let err = Producer::new(backend, "orders")
        .publish("x", &1, Map::new())
        .await
        .unwrap_err();
    assert!(matches!(err, StreamError::Publish { .. }));
    assert!(!err.is_connection());
}
