//! Asynchronous Socket
//!
//! Client connection with an outbound queue. [`AsyncSocket::send`] only
//! encodes and enqueues; bytes reach the wire in [`AsyncSocket::flush`], which
//! stops at its deadline and keeps whatever it did not get to.
//!
//! # Queue
//!
//! ```text
//!   send ──► [frame][frame][frame] ──► flush ──► stream
//!              ▲
//!              └─ offset: bytes of the front frame already written
//! ```
//!
//! A flush that times out mid-frame leaves the offset pointing into the front
//! frame, and the next flush resumes exactly there.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::Instant;

use super::frame::{self, FrameDecoder};
use crate::env::IpcEnv;
use crate::error::{IpcError, IpcResult};
use crate::message::Message;

/// Result of a flush that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    /// The queue is empty
    Flushed,
    /// The deadline passed with bytes still queued
    TimedOut,
}

/// Buffered connection to a named service
#[derive(Debug)]
pub struct AsyncSocket {
    service: String,
    /// None once closed
    stream: Option<UnixStream>,
    queue: VecDeque<Vec<u8>>,
    /// Bytes of the front frame already written
    offset: usize,
    decoder: FrameDecoder,
    connected: bool,
    max_message_size: usize,
}

impl AsyncSocket {
    /// Connect to the service `name`, waiting at most `timeout`
    ///
    /// # Errors
    ///
    /// Returns `IpcError::InvalidName` for unusable names and
    /// `IpcError::Connect` if nobody is listening or the attempt times out.
    pub async fn open(env: &IpcEnv, name: &str, timeout: Duration) -> IpcResult<Self> {
        let path = env.socket_path(name)?;

        let connect_error = |source: std::io::Error| IpcError::Connect {
            service: name.to_string(),
            path: path.clone(),
            source,
        };

        let stream = match tokio::time::timeout(timeout, UnixStream::connect(&path)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(connect_error(e)),
            Err(_) => {
                return Err(connect_error(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connect timed out",
                )))
            }
        };

        tracing::debug!(service = %name, path = %path.display(), "Async socket connected");

        Ok(Self {
            service: name.to_string(),
            stream: Some(stream),
            queue: VecDeque::new(),
            offset: 0,
            decoder: FrameDecoder::with_max_size(env.max_message_size()),
            connected: true,
            max_message_size: env.max_message_size(),
        })
    }

    /// Name of the service this socket is connected to
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service
    }

    /// Last known liveness; performs no I/O
    #[must_use]
    pub fn connected(&self) -> bool {
        self.connected
    }

    /// Queue one message without touching the network
    ///
    /// # Errors
    ///
    /// Returns `IpcError::SocketClosed` after close and `IpcError::Protocol`
    /// for oversize payloads.
    pub fn send(&mut self, code: u32, data: &[u8]) -> IpcResult<()> {
        if self.stream.is_none() {
            return Err(IpcError::SocketClosed);
        }
        let frame = frame::encode(code, data, self.max_message_size)?;
        self.queue.push_back(frame);
        Ok(())
    }

    /// Whether any bytes are still queued
    #[must_use]
    pub fn check_unsent(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Number of queued bytes not yet written
    #[must_use]
    pub fn unsent_bytes(&self) -> usize {
        self.queue.iter().map(Vec::len).sum::<usize>() - self.offset
    }

    /// Write queued bytes until the queue is empty or `timeout` passes
    ///
    /// A zero timeout still writes whatever the socket accepts without
    /// waiting. Progress made before the deadline is kept.
    ///
    /// # Errors
    ///
    /// Returns `IpcError::SocketClosed` after close, or `IpcError::Io` if the
    /// connection fails; the socket is then marked disconnected.
    pub async fn flush(&mut self, timeout: Duration) -> IpcResult<FlushStatus> {
        let deadline = Instant::now() + timeout;
        let stream = self.stream.as_mut().ok_or(IpcError::SocketClosed)?;

        while let Some(front) = self.queue.front() {
            let pending = &front[self.offset..];
            let remaining = deadline.saturating_duration_since(Instant::now());

            // write() is cancel safe: on timeout nothing was written
            let written = match tokio::time::timeout(remaining, stream.write(pending)).await {
                Ok(Ok(0)) => {
                    self.connected = false;
                    return Err(IpcError::ConnectionClosed);
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    self.connected = false;
                    return Err(IpcError::Io(e));
                }
                Err(_) => {
                    tracing::debug!(
                        service = %self.service,
                        unsent = self.queue.len(),
                        "Flush deadline reached"
                    );
                    return Ok(FlushStatus::TimedOut);
                }
            };

            self.offset += written;
            if self.offset == front.len() {
                self.queue.pop_front();
                self.offset = 0;
            }
        }

        Ok(FlushStatus::Flushed)
    }

    /// Wait up to `timeout` for one complete message
    ///
    /// Returns `Ok(None)` on timeout; a partially received frame stays
    /// buffered for the next call.
    ///
    /// # Errors
    ///
    /// Returns `IpcError::ConnectionClosed` on a clean peer close,
    /// `IpcError::Protocol` on truncated or oversize frames, and
    /// `IpcError::SocketClosed` after close. A protocol error closes the
    /// socket.
    pub async fn recv(&mut self, timeout: Duration) -> IpcResult<Option<Message>> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 4096];

        loop {
            let stream = self.stream.as_mut().ok_or(IpcError::SocketClosed)?;

            match self.decoder.decode() {
                Ok(Some(message)) => return Ok(Some(message)),
                Ok(None) => {}
                Err(e) => return Err(self.drop_connection(e)),
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let read = tokio::time::timeout(remaining, stream.read(&mut buf)).await;
            match read {
                Ok(Ok(0)) => {
                    if self.decoder.has_partial() {
                        let e = IpcError::Protocol(format!(
                            "connection closed inside a frame ({} bytes pending)",
                            self.decoder.available()
                        ));
                        return Err(self.drop_connection(e));
                    }
                    self.connected = false;
                    return Err(IpcError::ConnectionClosed);
                }
                Ok(Ok(n)) => self.decoder.push(&buf[..n]),
                Ok(Err(e)) => {
                    self.connected = false;
                    return Err(IpcError::Io(e));
                }
                Err(_) => return Ok(None),
            }
        }
    }

    /// Close after a malformed frame and hand the error back
    fn drop_connection(&mut self, error: IpcError) -> IpcError {
        tracing::warn!(service = %self.service, error = %error, "Closing socket after malformed frame");
        self.close();
        error
    }

    /// Close the connection, discarding anything still queued
    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            let dropped = self.queue.len();
            self.queue.clear();
            self.offset = 0;
            self.decoder.clear();
            self.connected = false;
            tracing::debug!(service = %self.service, dropped, "Async socket closed");
        }
    }
}
