//! Synchronous Socket
//!
//! Blocking, one-message-at-a-time client connection to a service. Usable from
//! any thread without a runtime; inside Tokio, call it from `spawn_blocking`.

use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use nix::sys::socket::{
    connect, setsockopt, socket, sockopt, AddressFamily, SockFlag, SockType, UnixAddr,
};
use nix::sys::time::{TimeVal, TimeValLike};

use super::frame::{self, HEADER_SIZE};
use crate::env::IpcEnv;
use crate::error::{IpcError, IpcResult};
use crate::message::Message;

/// Blocking connection to a named service
#[derive(Debug)]
pub struct IpcSocket {
    service: String,
    /// None once closed
    stream: Option<UnixStream>,
    max_message_size: usize,
}

impl IpcSocket {
    /// Connect to the service `name`
    ///
    /// Makes exactly one attempt. The attempt waits at most `connect_timeout`
    /// for the service to accept; a zero timeout fails immediately if the
    /// service's backlog is full.
    ///
    /// # Errors
    ///
    /// Returns `IpcError::InvalidName` for unusable names and
    /// `IpcError::Connect` if nobody is listening or the attempt times out.
    pub fn open(env: &IpcEnv, name: &str, connect_timeout: Duration) -> IpcResult<Self> {
        let path = env.socket_path(name)?;

        let stream = connect_with_timeout(&path, connect_timeout).map_err(|source| {
            IpcError::Connect {
                service: name.to_string(),
                path: path.clone(),
                source,
            }
        })?;

        tracing::debug!(service = %name, path = %path.display(), "Socket connected");

        Ok(Self {
            service: name.to_string(),
            stream: Some(stream),
            max_message_size: env.max_message_size(),
        })
    }

    /// Name of the service this socket is connected to
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service
    }

    /// Whether the socket is still open
    #[must_use]
    pub fn connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Send one message, blocking until it is fully written
    ///
    /// # Errors
    ///
    /// Returns `IpcError::SocketClosed` after close, `IpcError::Protocol` for
    /// oversize payloads, or `IpcError::Io` if the write fails.
    pub fn write(&mut self, code: u32, data: &[u8]) -> IpcResult<()> {
        let frame = frame::encode(code, data, self.max_message_size)?;
        let stream = self.stream.as_mut().ok_or(IpcError::SocketClosed)?;
        stream.write_all(&frame)?;
        Ok(())
    }

    /// Block until one complete message arrives
    ///
    /// # Errors
    ///
    /// Returns `IpcError::ConnectionClosed` if the peer closed cleanly between
    /// messages, `IpcError::Protocol` if it closed inside a frame or sent an
    /// oversize frame, and `IpcError::SocketClosed` after close. A protocol
    /// error closes the socket.
    pub fn read(&mut self) -> IpcResult<Message> {
        let max_size = self.max_message_size;
        let stream = self.stream.as_mut().ok_or(IpcError::SocketClosed)?;

        let result = read_frame(stream, max_size);
        if let Err(IpcError::Protocol(ref e)) = result {
            tracing::warn!(service = %self.service, error = %e, "Closing socket after malformed frame");
            self.close();
        }
        result
    }

    /// Close the connection; later calls do nothing
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.shutdown(std::net::Shutdown::Both).ok();
            tracing::debug!(service = %self.service, "Socket closed");
        }
    }
}

impl Drop for IpcSocket {
    fn drop(&mut self) {
        self.close();
    }
}

/// Read one frame, rejecting sizes above `max_size`
fn read_frame(stream: &mut UnixStream, max_size: usize) -> IpcResult<Message> {
    let mut header = [0u8; HEADER_SIZE];
    match read_full(stream, &mut header)? {
        0 => return Err(IpcError::ConnectionClosed),
        HEADER_SIZE => {}
        n => {
            return Err(IpcError::Protocol(format!(
                "connection closed inside a frame header ({n} of {HEADER_SIZE} bytes)"
            )))
        }
    }

    let code = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let size = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;

    if size > max_size {
        return Err(IpcError::Protocol(format!(
            "Frame size {size} exceeds maximum {max_size}"
        )));
    }

    let mut data = vec![0u8; size];
    let n = read_full(stream, &mut data)?;
    if n < size {
        return Err(IpcError::Protocol(format!(
            "connection closed inside a frame payload ({n} of {size} bytes)"
        )));
    }

    Ok(Message { code, data })
}

/// Read until `buf` is full or the peer closes, returning the bytes read
fn read_full(stream: &mut UnixStream, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Blocking connect bounded by `timeout`
///
/// Linux applies `SO_SNDTIMEO` to a blocking `connect` on a Unix stream
/// socket, so the wait for backlog space is bounded without a poll loop.
fn connect_with_timeout(path: &Path, timeout: Duration) -> std::io::Result<UnixStream> {
    let addr = UnixAddr::new(path)?;

    let flags = if timeout.is_zero() {
        SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK
    } else {
        SockFlag::SOCK_CLOEXEC
    };
    let fd: OwnedFd = socket(AddressFamily::Unix, SockType::Stream, flags, None)?;

    if !timeout.is_zero() {
        let micros = i64::try_from(timeout.as_micros()).unwrap_or(i64::MAX);
        setsockopt(&fd, sockopt::SendTimeout, &TimeVal::microseconds(micros.max(1)))?;
    }

    connect(fd.as_raw_fd(), &addr)?;

    let stream = UnixStream::from(fd);
    if timeout.is_zero() {
        stream.set_nonblocking(false)?;
    } else {
        stream.set_write_timeout(None)?;
    }
    Ok(stream)
}
