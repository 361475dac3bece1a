//! Event envelope stored in every stream entry
//!
//! An entry carries exactly one field, `message`, whose value is a JSON
//! object with `event`, `payload`, `timestamp` and any extra metadata
//! keys merged in at the top level.
//!
//! Timestamps are written as RFC3339. On read, the producer formats seen
//! in the wild are also accepted: `YYYY-MM-DD HH:MM:SS` (taken as UTC)
//! and unix epoch seconds or milliseconds.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, StreamError};
use crate::types::{Fields, StreamEntry};

/// Name of the single field holding the serialized envelope.
pub const MESSAGE_FIELD: &str = "message";

/// Keys owned by the envelope itself; extra metadata cannot override them.
pub const RESERVED_KEYS: [&str; 3] = ["event", "payload", "timestamp"];

/// The logical event carried by a stream entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event tag
    pub event: String,

    /// Event payload (string or structured value)
    pub payload: Value,

    /// Creation time
    #[serde(deserialize_with = "lenient_timestamp")]
    pub timestamp: DateTime<Utc>,

    /// Caller-supplied metadata
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Envelope {
    /// Create an envelope stamped with the current time.
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
            timestamp: Utc::now(),
            extra: Map::new(),
        }
    }

    /// Merge extra metadata. Reserved keys are ignored.
    pub fn with_extra(mut self, extra: Map<String, Value>) -> Self {
        for (key, value) in extra {
            if !RESERVED_KEYS.contains(&key.as_str()) {
                self.extra.insert(key, value);
            }
        }
        self
    }

    /// Look up one metadata value.
    pub fn meta(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    /// Deserialize the payload into a concrete type.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Serialize into the field map appended to the stream.
    pub fn encode(&self) -> Result<Fields> {
        let json = serde_json::to_string(self)?;
        let mut fields = Fields::new();
        fields.insert(MESSAGE_FIELD.to_string(), json);
        Ok(fields)
    }

    /// Decode the envelope carried by `entry`.
    ///
    /// Any failure is a [`StreamError::Poison`]: a malformed entry can
    /// never become valid by retrying it.
    pub fn decode(stream: &str, entry: &StreamEntry) -> Result<Self> {
        let poison = |reason: String| StreamError::Poison {
            stream: stream.to_string(),
            id: entry.id,
            reason,
        };

        if entry.is_undecodable(MESSAGE_FIELD) {
            return Err(poison(format!("'{}' field is not valid UTF-8", MESSAGE_FIELD)));
        }

        let raw = entry
            .field(MESSAGE_FIELD)
            .ok_or_else(|| poison(format!("missing '{}' field", MESSAGE_FIELD)))?;

        serde_json::from_str(raw).map_err(|e| poison(e.to_string()))
    }
}

/// Epoch values above this are taken as milliseconds.
const EPOCH_MILLIS_THRESHOLD: u64 = 100_000_000_000;

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"];

fn lenient_timestamp<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Value::deserialize(deserializer)?;
    parse_timestamp(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("unrecognized timestamp: {}", raw)))
}

/// Parse an envelope timestamp in any of the accepted formats.
pub fn parse_timestamp(raw: &Value) -> Option<DateTime<Utc>> {
    match raw {
        Value::String(text) => {
            if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
                return Some(parsed.with_timezone(&Utc));
            }
            NAIVE_FORMATS
                .iter()
                .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
                .map(|naive| Utc.from_utc_datetime(&naive))
        }
        Value::Number(n) => {
            if let Some(secs) = n.as_i64() {
                if secs.unsigned_abs() > EPOCH_MILLIS_THRESHOLD {
                    Utc.timestamp_millis_opt(secs).single()
                } else {
                    Utc.timestamp_opt(secs, 0).single()
                }
            } else {
                let secs = n.as_f64()?;
                if !secs.is_finite() {
                    return None;
                }
                let whole = secs.floor();
                let nanos = ((secs - whole) * 1e9) as u32;
                Utc.timestamp_opt(whole as i64, nanos).single()
            }
        }
        _ => None,
    }
}
