//! RESP2 encoder and decoder for the native driver.
//!
//! Commands go out as arrays of bulk strings; replies come back as
//! [`Value`]s. Decoding is incremental: a partial frame leaves the buffer
//! untouched so the caller can read more bytes and try again.
//!
//! Large replies arrive over many reads. [`FrameScanner`] remembers how
//! far the pending frame has been checked, so a reply is decoded once,
//! after its last byte is in.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::{BackendError, BackendResult};
use super::value::Value;

/// Largest bulk string accepted, matching the server's own limit.
pub const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Upper bound on array slots reserved before the items are read.
const MAX_PREALLOC: usize = 1024;

/// Encode a command as a RESP2 array of bulk strings.
///
/// ```text
/// *3\r\n$4\r\nXLEN\r\n$6\r\norders\r\n
/// ```
pub fn encode_command(args: &[Bytes], buf: &mut BytesMut) {
    buf.put_u8(b'*');
    buf.put_slice(args.len().to_string().as_bytes());
    buf.put_slice(b"\r\n");

    for arg in args {
        buf.put_u8(b'$');
        buf.put_slice(arg.len().to_string().as_bytes());
        buf.put_slice(b"\r\n");
        buf.put_slice(arg);
        buf.put_slice(b"\r\n");
    }
}

/// Attempt to decode one RESP2 value from the front of `buf`.
///
/// Returns `Ok(Some(value))` and consumes the frame if it is complete,
/// `Ok(None)` if more data is needed, or `Err` if the data is malformed.
pub fn decode_value(buf: &mut BytesMut) -> BackendResult<Option<Value>> {
    let mut reader = Reader { data: &buf[..], pos: 0 };
    match reader.value()? {
        Some(value) => {
            let consumed = reader.pos;
            buf.advance(consumed);
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Cursor over a borrowed buffer. Every method returns `Ok(None)` when
/// the frame is cut short.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn value(&mut self) -> BackendResult<Option<Value>> {
        let Some(&tag) = self.data.get(self.pos) else {
            return Ok(None);
        };
        self.pos += 1;

        match tag {
            b'+' => Ok(self.line()?.map(|l| Value::Status(l.into_owned()))),
            b'-' => Ok(self.line()?.map(|l| Value::Error(l.into_owned()))),
            b':' => Ok(self.decimal()?.map(Value::Integer)),
            b'$' => {
                let Some(len) = self.decimal()? else {
                    return Ok(None);
                };
                match len {
                    -1 => Ok(Some(Value::Nil)),
                    n => self.bulk(bulk_len(n)?),
                }
            }
            b'*' => {
                let Some(count) = self.decimal()? else {
                    return Ok(None);
                };
                match count {
                    -1 => Ok(Some(Value::Nil)),
                    n => {
                        let n = array_len(n)?;
                        let mut items = Vec::with_capacity(n.min(MAX_PREALLOC));
                        for _ in 0..n {
                            match self.value()? {
                                Some(item) => items.push(item),
                                None => return Ok(None),
                            }
                        }
                        Ok(Some(Value::Array(items)))
                    }
                }
            }
            byte => Err(BackendError::Protocol(format!(
                "unexpected byte: 0x{:02x}",
                byte
            ))),
        }
    }

    fn line(&mut self) -> BackendResult<Option<std::borrow::Cow<'a, str>>> {
        let data: &'a [u8] = self.data;
        let rest = &data[self.pos..];
        let Some(end) = rest.windows(2).position(|w| w == b"\r\n") else {
            return Ok(None);
        };
        let line = &rest[..end];
        self.pos += end + 2;
        Ok(Some(String::from_utf8_lossy(line)))
    }

    fn decimal(&mut self) -> BackendResult<Option<i64>> {
        let Some(line) = self.line()? else {
            return Ok(None);
        };
        line.parse::<i64>()
            .map(Some)
            .map_err(|_| BackendError::Protocol(format!("invalid integer: {}", line)))
    }

    fn bulk(&mut self, len: usize) -> BackendResult<Option<Value>> {
        let end = self.pos + len;
        if self.data.len() < end.saturating_add(2) {
            return Ok(None);
        }
        if &self.data[end..end + 2] != b"\r\n" {
            return Err(BackendError::Protocol("expected CRLF".into()));
        }
        let value = Bytes::copy_from_slice(&self.data[self.pos..end]);
        self.pos = end + 2;
        Ok(Some(Value::String(value)))
    }
}

fn bulk_len(n: i64) -> BackendResult<usize> {
    match usize::try_from(n) {
        Ok(len) if len <= MAX_BULK_LEN => Ok(len),
        _ => Err(BackendError::Protocol(format!("invalid bulk string length: {}", n))),
    }
}

fn array_len(n: i64) -> BackendResult<usize> {
    usize::try_from(n).map_err(|_| BackendError::Protocol(format!("invalid array length: {}", n)))
}

fn parse_header(line: &[u8]) -> BackendResult<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            BackendError::Protocol(format!(
                "invalid integer: {}",
                String::from_utf8_lossy(line)
            ))
        })
}

/// Finds the end of the first complete frame in a growing buffer.
///
/// State carries over between calls, so bytes already checked are not
/// checked again when more data arrives. Call [`FrameScanner::scan`] with
/// the same buffer (possibly extended) until it returns a length, then
/// consume that many bytes and [`reset`](FrameScanner::reset).
#[derive(Debug, Default)]
pub struct FrameScanner {
    pos: usize,
    /// Items still owed by each open array, innermost last.
    open: Vec<usize>,
    done: bool,
}

impl FrameScanner {
    /// Create a scanner positioned at the start of a frame.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the previous frame.
    pub fn reset(&mut self) {
        self.pos = 0;
        self.open.clear();
        self.done = false;
    }

    /// Length of the first complete frame in `data`, or `None` if more
    /// bytes are needed.
    pub fn scan(&mut self, data: &[u8]) -> BackendResult<Option<usize>> {
        while !self.done {
            let Some(&tag) = data.get(self.pos) else {
                return Ok(None);
            };
            let header = self.pos + 1;
            let Some(len) = data[header..].windows(2).position(|w| w == b"\r\n") else {
                return Ok(None);
            };
            let next = header + len + 2;

            match tag {
                b'+' | b'-' | b':' => {
                    self.pos = next;
                    self.item_done();
                }
                b'$' => match parse_header(&data[header..header + len])? {
                    -1 => {
                        self.pos = next;
                        self.item_done();
                    }
                    n => {
                        let end = next + bulk_len(n)? + 2;
                        if data.len() < end {
                            return Ok(None);
                        }
                        self.pos = end;
                        self.item_done();
                    }
                },
                b'*' => match parse_header(&data[header..header + len])? {
                    -1 | 0 => {
                        self.pos = next;
                        self.item_done();
                    }
                    n => {
                        self.pos = next;
                        self.open.push(array_len(n)?);
                    }
                },
                byte => {
                    return Err(BackendError::Protocol(format!(
                        "unexpected byte: 0x{:02x}",
                        byte
                    )))
                }
            }
        }
        Ok(Some(self.pos))
    }

    fn item_done(&mut self) {
        while let Some(remaining) = self.open.last_mut() {
            *remaining -= 1;
            if *remaining > 0 {
                return;
            }
            self.open.pop();
        }
        self.done = true;
    }
}
