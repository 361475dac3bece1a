//! Buffered TCP connection speaking RESP2.
//!
//! One connection carries one command at a time. Pipelining writes a
//! whole batch before reading the replies back in order.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::error::{BackendError, BackendResult};
use super::resp;
use super::value::Value;
use crate::config::ConnectionConfig;

/// Default read/write buffer size (8 KB).
const DEFAULT_BUF_SIZE: usize = 8 * 1024;

/// A TCP stream with buffered RESP I/O.
pub struct Connection {
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
    scanner: resp::FrameScanner,
}

impl Connection {
    /// Open a connection, authenticate and select the database.
    pub async fn connect(config: &ConnectionConfig) -> BackendResult<Self> {
        let addr = config.address();
        let timeout = Duration::from_millis(config.connect_timeout_ms);
        let tcp = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| BackendError::Timeout(timeout))??;
        tcp.set_nodelay(true)?;
        debug!(%addr, "native stream connection established");

        let mut conn = Self {
            stream: tcp,
            read_buf: BytesMut::with_capacity(DEFAULT_BUF_SIZE),
            write_buf: BytesMut::with_capacity(DEFAULT_BUF_SIZE),
            scanner: resp::FrameScanner::new(),
        };

        if let Some(ref password) = config.password {
            let mut args = vec![Bytes::from("AUTH")];
            if let Some(ref username) = config.username {
                args.push(Bytes::copy_from_slice(username.as_bytes()));
            }
            args.push(Bytes::copy_from_slice(password.as_bytes()));
            match conn.execute(&args).await? {
                Value::Status(ref s) if s == "OK" => {}
                Value::Error(msg) => return Err(BackendError::Auth(msg)),
                other => {
                    return Err(BackendError::Auth(format!(
                        "unexpected AUTH response: {}",
                        other
                    )))
                }
            }
        }

        if config.database != 0 {
            let reply = conn
                .execute(&[
                    Bytes::from("SELECT"),
                    Bytes::from(config.database.to_string()),
                ])
                .await?
                .into_result()?;
            if reply != Value::Status("OK".into()) {
                return Err(BackendError::Protocol(format!(
                    "unexpected SELECT response: {}",
                    reply
                )));
            }
        }

        Ok(conn)
    }

    /// Send a command and read its reply.
    ///
    /// Error replies come back as [`Value::Error`]; only transport and
    /// framing failures are returned as `Err`.
    pub async fn execute(&mut self, args: &[Bytes]) -> BackendResult<Value> {
        self.write_buf.clear();
        resp::encode_command(args, &mut self.write_buf);
        self.flush().await?;
        self.read_response().await
    }

    /// Send every command, then read one reply per command in order.
    pub async fn execute_pipeline(&mut self, commands: &[Vec<Bytes>]) -> BackendResult<Vec<Value>> {
        self.write_buf.clear();
        for args in commands {
            resp::encode_command(args, &mut self.write_buf);
        }
        self.flush().await?;

        let mut replies = Vec::with_capacity(commands.len());
        for _ in commands {
            replies.push(self.read_response().await?);
        }
        Ok(replies)
    }

    async fn flush(&mut self) -> BackendResult<()> {
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;
        self.write_buf.clear();
        Ok(())
    }

    async fn read_response(&mut self) -> BackendResult<Value> {
        loop {
            if let Some(len) = self.scanner.scan(&self.read_buf)? {
                self.scanner.reset();
                let mut frame = self.read_buf.split_to(len);
                return resp::decode_value(&mut frame)?
                    .ok_or_else(|| BackendError::Protocol("truncated reply frame".into()));
            }

            self.read_buf.reserve(DEFAULT_BUF_SIZE);
            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(BackendError::ConnectionClosed);
            }
        }
    }
}
