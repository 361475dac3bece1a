//! Event producer
//!
//! Wraps events in an [`Envelope`] and appends them with an
//! auto-assigned ID, applying the configured length cap.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::backend::StreamBackend;
use crate::config::StreamsConfig;
use crate::envelope::Envelope;
use crate::error::{Result, StreamError};
use crate::types::{EntryId, MaxLen};

/// One event in a [`Producer::publish_batch`] call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchEntry {
    /// Event tag
    #[serde(default)]
    pub event: String,

    /// Event payload; `None` or `null` fails validation
    #[serde(default)]
    pub payload: Option<Value>,

    /// Extra metadata merged into the envelope
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl BatchEntry {
    /// Create a batch entry.
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload: Some(payload),
            extra: Map::new(),
        }
    }

    /// Attach extra metadata.
    pub fn with_extra(mut self, extra: Map<String, Value>) -> Self {
        self.extra = extra;
        self
    }

    fn validate(&self, index: usize) -> Result<()> {
        if self.event.trim().is_empty() {
            return Err(StreamError::InvalidArgument(format!(
                "batch entry {} is missing an event",
                index
            )));
        }
        match self.payload {
            None | Some(Value::Null) => Err(StreamError::InvalidArgument(format!(
                "batch entry {} ({}) is missing a payload",
                index, self.event
            ))),
            Some(_) => Ok(()),
        }
    }
}

/// Appends events to one stream.
#[derive(Clone)]
pub struct Producer {
    backend: Arc<dyn StreamBackend>,
    stream: String,
    maxlen: Option<MaxLen>,
}

impl Producer {
    /// Create a producer with no length cap.
    pub fn new(backend: Arc<dyn StreamBackend>, stream: impl Into<String>) -> Self {
        Self {
            backend,
            stream: stream.into(),
            maxlen: None,
        }
    }

    /// Create a producer using the trimming policy from `config`.
    pub fn from_config(
        backend: Arc<dyn StreamBackend>,
        stream: impl Into<String>,
        config: &StreamsConfig,
    ) -> Self {
        Self::new(backend, stream).with_max_len(config.trim_policy())
    }

    /// Set the length cap applied on every append.
    pub fn with_max_len(mut self, maxlen: Option<MaxLen>) -> Self {
        self.maxlen = maxlen.filter(|m| m.threshold > 0);
        self
    }

    /// Target stream.
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Length cap applied on append.
    pub fn max_len(&self) -> Option<MaxLen> {
        self.maxlen
    }

    /// Publish one event and return the ID the backend assigned.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        event: &str,
        payload: &T,
        extra: Map<String, Value>,
    ) -> Result<EntryId> {
        let payload = serde_json::to_value(payload)?;
        let envelope = Envelope::new(event, payload).with_extra(extra);
        self.publish_envelope(&envelope).await
    }

    /// Append a pre-built envelope.
    pub async fn publish_envelope(&self, envelope: &Envelope) -> Result<EntryId> {
        let fields = envelope.encode()?;
        let id = self
            .backend
            .append(&self.stream, &fields, self.maxlen)
            .await
            .map_err(|e| StreamError::from_backend(&self.stream, "XADD", e))?;

        debug!(stream = %self.stream, %id, event = %envelope.event, "published event");
        Ok(id)
    }

    /// Publish several events in one pipelined round trip.
    ///
    /// Every entry is validated before anything is sent. The batch is not
    /// atomic: if the backend fails partway, earlier entries stay appended.
    pub async fn publish_batch(&self, entries: &[BatchEntry]) -> Result<Vec<EntryId>> {
        for (index, entry) in entries.iter().enumerate() {
            entry.validate(index)?;
        }
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let mut encoded = Vec::with_capacity(entries.len());
        for entry in entries {
            let payload = entry.payload.clone().unwrap_or(Value::Null);
            let envelope =
                Envelope::new(entry.event.as_str(), payload).with_extra(entry.extra.clone());
            encoded.push(envelope.encode()?);
        }

        let mut pipe = self.backend.pipeline();
        for fields in encoded {
            pipe.append(&self.stream, fields, self.maxlen);
        }
        let replies = pipe
            .execute()
            .await
            .map_err(|e| StreamError::from_backend(&self.stream, "XADD pipeline", e))?;

        let ids = replies
            .into_iter()
            .map(|reply| {
                reply.id().ok_or_else(|| StreamError::Publish {
                    stream: self.stream.clone(),
                    message: "pipeline returned a count where an entry ID was expected".into(),
                    source: None,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(stream = %self.stream, count = ids.len(), "published batch");
        Ok(ids)
    }

    /// Trim the stream to `max_len` entries and return how many were removed.
    pub async fn trim(&self, max_len: i64, exact: bool) -> Result<u64> {
        if max_len <= 0 {
            return Err(StreamError::InvalidArgument(format!(
                "max_len must be greater than 0, got {}",
                max_len
            )));
        }
        let threshold = max_len as usize;
        let maxlen = if exact {
            MaxLen::exact(threshold)
        } else {
            MaxLen::approximate(threshold)
        };

        let removed = self
            .backend
            .trim(&self.stream, maxlen)
            .await
            .map_err(|e| StreamError::from_backend(&self.stream, "XTRIM", e))?;
        debug!(stream = %self.stream, max_len, exact, removed, "trimmed stream");
        Ok(removed)
    }

    /// Current stream length.
    pub async fn len(&self) -> Result<u64> {
        self.backend
            .len(&self.stream)
            .await
            .map_err(|e| StreamError::from_backend(&self.stream, "XLEN", e))
    }
}

/// Producers for the named custom streams (`stream_<name>` keys).
#[derive(Clone, Default)]
pub struct ProducerRegistry {
    producers: BTreeMap<String, Producer>,
}

impl ProducerRegistry {
    /// Build one producer per custom stream, each inheriting the trimming policy.
    pub fn from_config(backend: Arc<dyn StreamBackend>, config: &StreamsConfig) -> Self {
        let producers = config
            .custom_streams()
            .into_iter()
            .map(|(name, stream)| {
                let producer = Producer::from_config(Arc::clone(&backend), stream, config);
                (name, producer)
            })
            .collect();
        Self { producers }
    }

    /// Producer registered under `name`.
    pub fn get(&self, name: &str) -> Option<&Producer> {
        self.producers.get(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.producers.keys().map(String::as_str)
    }

    /// Number of registered producers.
    pub fn len(&self) -> usize {
        self.producers.len()
    }

    /// Whether no custom streams are configured.
    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }
}
