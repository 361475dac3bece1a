//! Reply values for the native RESP driver.

use bytes::Bytes;
use std::fmt;

use super::error::{BackendError, BackendResult};
use crate::types::EntryId;

/// A reply decoded from the RESP2 wire format.
///
/// Error replies are kept as values so that a pipelined batch can be
/// read to the end before individual failures are reported.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// A bulk string.
    String(Bytes),

    /// An integer reply.
    Integer(i64),

    /// An array of replies.
    Array(Vec<Value>),

    /// A null bulk string or null array.
    Nil,

    /// A status reply such as `+OK`.
    Status(String),

    /// An error reply such as `-ERR ...`.
    Error(String),
}

impl Value {
    /// Returns the value as a string slice, if it is valid UTF-8 text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(b) => std::str::from_utf8(b).ok(),
            Value::Status(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Returns `true` if the value is nil.
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Turn an error reply into `Err`, passing every other value through.
    pub fn into_result(self) -> BackendResult<Value> {
        match self {
            Value::Error(msg) => Err(BackendError::Server(msg)),
            other => Ok(other),
        }
    }

    /// Converts the value into a `String`.
    ///
    /// Invalid UTF-8 is replaced. Only used for names and status text;
    /// entry field values keep their raw bytes (see
    /// [`StreamEntry::insert_raw`](crate::types::StreamEntry::insert_raw)).
    pub fn into_string(self) -> BackendResult<String> {
        match self.into_result()? {
            Value::String(b) => Ok(String::from_utf8_lossy(&b).into_owned()),
            Value::Status(s) => Ok(s),
            Value::Integer(n) => Ok(n.to_string()),
            other => Err(BackendError::UnexpectedResponse {
                expected: "string",
                actual: other.type_name().to_string(),
            }),
        }
    }

    /// Converts the value into an `i64`.
    pub fn into_integer(self) -> BackendResult<i64> {
        match self.into_result()? {
            Value::Integer(n) => Ok(n),
            other => Err(BackendError::UnexpectedResponse {
                expected: "integer",
                actual: other.type_name().to_string(),
            }),
        }
    }

    /// Converts the value into a `Vec<Value>`; nil becomes an empty vector.
    pub fn into_array(self) -> BackendResult<Vec<Value>> {
        match self.into_result()? {
            Value::Array(arr) => Ok(arr),
            Value::Nil => Ok(vec![]),
            other => Err(BackendError::UnexpectedResponse {
                expected: "array",
                actual: other.type_name().to_string(),
            }),
        }
    }

    /// Converts the value into an [`EntryId`].
    pub fn into_entry_id(self) -> BackendResult<EntryId> {
        let raw = self.into_string()?;
        raw.parse()
            .map_err(|e: crate::types::ParseEntryIdError| BackendError::Protocol(e.to_string()))
    }

    /// Returns a human-readable type name for this value.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::String(_) => "string",
            Value::Integer(_) => "integer",
            Value::Array(_) => "array",
            Value::Nil => "nil",
            Value::Status(_) => "status",
            Value::Error(_) => "error",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(b) => match std::str::from_utf8(b) {
                Ok(s) => write!(f, "\"{}\"", s),
                Err(_) => write!(f, "<binary {} bytes>", b.len()),
            },
            Value::Integer(n) => write!(f, "(integer) {}", n),
            Value::Array(arr) => {
                for (i, val) in arr.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}) {}", i + 1, val)?;
                }
                Ok(())
            }
            Value::Nil => write!(f, "(nil)"),
            Value::Status(s) => write!(f, "{}", s),
            Value::Error(s) => write!(f, "(error) {}", s),
        }
    }
}

/// Trait for types that can be converted into command arguments.
pub trait ToArg {
    /// Encode this value as a RESP bulk string argument.
    fn to_arg(&self) -> Bytes;
}

impl ToArg for &str {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl ToArg for String {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl ToArg for u64 {
    fn to_arg(&self) -> Bytes {
        Bytes::from(self.to_string())
    }
}

impl ToArg for usize {
    fn to_arg(&self) -> Bytes {
        Bytes::from(self.to_string())
    }
}

impl ToArg for EntryId {
    fn to_arg(&self) -> Bytes {
        Bytes::from(self.to_string())
    }
}
