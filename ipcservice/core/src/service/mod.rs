//! IPC Service
//!
//! The listening, multiplexing endpoint of a channel. A service binds the
//! socket derived from its name, accepts peers, and hands out
//! `(Client, Message)` pairs from a single receive call.
//!
//! # Architecture
//!
//! ```text
//!   peer ──► reader task ─┐
//!   peer ──► reader task ─┼──► event channel ──┐
//!   peer ──► reader task ─┘                    │
//!                                              ▼
//!   listener (accept) ───────────────► Service::recv(timeout) ◄── alert()
//!                                              │
//!                     Client::send ──► writer task ──► peer
//! ```
//!
//! Each connection gets one reader task and one writer task. Readers decode
//! frames and forward them, in order, through one channel shared by the
//! whole service, so `recv` waits on exactly four things: that channel, the
//! listener, the wake signal, and the deadline.

mod client;
mod registry;

pub use client::{Client, ClientId, UserData, WeakClient};

use registry::ClientRegistry;

use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;

use crate::env::IpcEnv;
use crate::error::{IpcError, IpcResult};
use crate::message::Message;
use crate::transport::frame::FrameDecoder;
use client::ClientParts;

/// How long a closed client's writer keeps going before the connection is dropped
const CLOSE_GRACE: Duration = Duration::from_millis(100);

/// Outcome of [`Service::recv`]
#[derive(Debug)]
pub enum Received {
    /// A message from a connected client
    Message {
        /// Sender; this handle is an extra reference owned by the caller
        client: Client,
        /// The decoded message
        message: Message,
    },
    /// A client's connection ended; the service no longer tracks it
    Disconnected(Client),
    /// The deadline passed with nothing to report
    Timeout,
    /// [`Service::alert`] woke the wait before anything else happened
    Interrupted,
}

impl Received {
    /// Check whether this is a timeout
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

/// Why a connection's reader stopped
#[derive(Debug)]
enum CloseReason {
    PeerClosed,
    Protocol(String),
    Io(std::io::Error),
}

/// Event forwarded from a reader task
#[derive(Debug)]
enum ClientEvent {
    Message(ClientId, Message),
    Closed(ClientId, CloseReason),
}

/// What woke the multiplexed wait
enum Step {
    Event(Option<ClientEvent>),
    Accepted(std::io::Result<(UnixStream, tokio::net::unix::SocketAddr)>),
    Woken,
    Expired,
}

/// Handle for waking a service's receive loop from elsewhere
///
/// Obtained from [`Service::alerter`]; cheap to clone and `Send`.
#[derive(Clone, Debug)]
pub struct Alerter {
    wake: Arc<Notify>,
}

impl Alerter {
    /// Wake the current `recv`, or the next one if none is waiting
    pub fn alert(&self) {
        self.wake.notify_one();
    }
}

/// A listening IPC service
pub struct Service {
    name: String,
    socket_path: PathBuf,
    env: IpcEnv,
    /// The bound listener (None once closed)
    listener: Option<UnixListener>,
    registry: ClientRegistry,
    events_tx: mpsc::UnboundedSender<ClientEvent>,
    events_rx: mpsc::UnboundedReceiver<ClientEvent>,
    wake: Arc<Notify>,
}

impl Service {
    /// Start a service listening under `name`
    ///
    /// A socket file left behind by a dead process is replaced; one with a
    /// live listener behind it is not.
    ///
    /// # Errors
    ///
    /// Returns `IpcError::InvalidName` for unusable names and
    /// `IpcError::Bind` if the address is in use or cannot be created.
    pub async fn start(env: &IpcEnv, name: &str) -> IpcResult<Self> {
        let socket_path = env.socket_path(name)?;

        let bind_error = |source: std::io::Error| IpcError::Bind {
            service: name.to_string(),
            path: socket_path.clone(),
            source,
        };

        prepare_socket(&socket_path).map_err(bind_error)?;

        let listener = UnixListener::bind(&socket_path).map_err(bind_error)?;

        let perms = std::fs::Permissions::from_mode(env.options().socket_mode);
        if let Err(e) = std::fs::set_permissions(&socket_path, perms) {
            std::fs::remove_file(&socket_path).ok();
            return Err(bind_error(e));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        tracing::info!(service = %name, path = %socket_path.display(), "Service listening");

        Ok(Self {
            name: name.to_string(),
            socket_path,
            env: env.clone(),
            listener: Some(listener),
            registry: ClientRegistry::new(),
            events_tx,
            events_rx,
            wake: Arc::new(Notify::new()),
        })
    }

    /// Service name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the listening socket
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Whether [`close`](Self::close) has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.listener.is_none()
    }

    /// Number of connected clients
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.registry.count()
    }

    /// Look up a client by id
    ///
    /// Always `None` once the service is closed.
    #[must_use]
    pub fn lookup(&self, id: ClientId) -> Option<Client> {
        self.registry.lookup(id)
    }

    /// Wake the current `recv`, or the next one if none is waiting
    pub fn alert(&self) {
        self.wake.notify_one();
    }

    /// Handle that can call [`alert`](Self::alert) from another thread
    #[must_use]
    pub fn alerter(&self) -> Alerter {
        Alerter {
            wake: Arc::clone(&self.wake),
        }
    }

    /// Wait for the next message, disconnect, alert, or deadline
    ///
    /// `None` waits without a deadline. New connections are accepted and
    /// registered along the way without returning.
    ///
    /// # Errors
    ///
    /// Returns `IpcError::ServiceClosed` after [`close`](Self::close) and
    /// `IpcError::Io` if accepting a connection fails.
    pub async fn recv(&mut self, timeout: Option<Duration>) -> IpcResult<Received> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let Some(listener) = self.listener.as_ref() else {
                return Err(IpcError::ServiceClosed);
            };

            // Ready messages win over new connections, both win over alerts
            let step = tokio::select! {
                biased;
                event = self.events_rx.recv() => Step::Event(event),
                accepted = listener.accept() => Step::Accepted(accepted),
                () = self.wake.notified() => Step::Woken,
                () = sleep_until(deadline) => Step::Expired,
            };

            match step {
                Step::Event(Some(event)) => {
                    if let Some(received) = self.dispatch(event) {
                        return Ok(received);
                    }
                }
                Step::Event(None) => return Err(IpcError::ServiceClosed),
                Step::Accepted(Ok((stream, _addr))) => self.register(stream),
                Step::Accepted(Err(e)) => {
                    tracing::warn!(service = %self.name, error = %e, "Accept failed");
                    return Err(IpcError::Io(e));
                }
                Step::Woken => return Ok(Received::Interrupted),
                Step::Expired => return Ok(Received::Timeout),
            }
        }
    }

    /// Turn a reader event into a result for the caller
    fn dispatch(&mut self, event: ClientEvent) -> Option<Received> {
        match event {
            ClientEvent::Message(id, message) => {
                let Some(client) = self.registry.lookup(id) else {
                    tracing::debug!(client_id = %id, "Dropping message from closed client");
                    return None;
                };
                tracing::debug!(
                    client_id = %id,
                    code = message.code,
                    size = message.size(),
                    "Message received"
                );
                Some(Received::Message { client, message })
            }
            ClientEvent::Closed(id, reason) => {
                match &reason {
                    CloseReason::PeerClosed => {
                        tracing::info!(client_id = %id, "Client disconnected");
                    }
                    CloseReason::Protocol(e) => {
                        tracing::warn!(client_id = %id, error = %e, "Dropping client after malformed frame");
                    }
                    CloseReason::Io(e) => {
                        tracing::warn!(client_id = %id, error = %e, "Dropping client after read error");
                    }
                }
                let client = self.registry.unregister(&id)?;
                client.shutdown();
                Some(Received::Disconnected(client))
            }
        }
    }

    /// Set up reader and writer tasks for a new connection and register it
    fn register(&mut self, stream: UnixStream) {
        let max_clients = self.env.options().max_clients;
        if max_clients > 0 && self.registry.count() >= max_clients {
            tracing::warn!(
                service = %self.name,
                max_clients,
                "Refusing connection: client limit reached"
            );
            return;
        }

        let id = ClientId::next();
        let fd = stream.as_raw_fd();
        let max_message_size = self.env.max_message_size();
        let (read_half, write_half) = stream.into_split();

        let connected = Arc::new(AtomicBool::new(true));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();

        tokio::spawn(write_loop(
            id,
            write_half,
            outbound_rx,
            stop_rx,
            Arc::clone(&connected),
        ));
        let reader = tokio::spawn(read_loop(
            id,
            read_half,
            self.events_tx.clone(),
            max_message_size,
        ))
        .abort_handle();

        let client = Client::new(ClientParts {
            id,
            fd,
            connected,
            outbound: outbound_tx,
            writer_stop: stop_tx,
            reader,
            registry: self.registry.downgrade(),
            max_message_size,
        });

        match self.registry.register(client.clone()) {
            Ok(()) => tracing::info!(service = %self.name, client_id = %id, fd, "Client connected"),
            Err(e) => {
                tracing::warn!(client_id = %id, error = %e, "Cannot register client");
                client.shutdown();
            }
        }
    }

    /// Stop accepting, close every connection, and remove the socket file
    ///
    /// Client handles held elsewhere stay valid for release and user data.
    /// Calling this more than once is a no-op.
    pub fn close(&mut self) {
        if self.listener.take().is_none() {
            return;
        }

        let clients = self.registry.close();
        for client in &clients {
            client.shutdown();
        }
        let count = clients.len();
        drop(clients);

        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            tracing::warn!(path = %self.socket_path.display(), error = %e, "Failed to remove socket file");
        }

        tracing::info!(service = %self.name, clients = count, "Service closed");
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.close();
    }
}

/// Remove a stale socket file; refuse if something is still listening on it
fn prepare_socket(path: &Path) -> std::io::Result<()> {
    if std::fs::symlink_metadata(path).is_err() {
        return Ok(());
    }

    if std::os::unix::net::UnixStream::connect(path).is_ok() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            "another service is listening on this address",
        ));
    }

    tracing::warn!(path = %path.display(), "Removing stale socket file");
    std::fs::remove_file(path)
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Read frames from one connection and forward them in order
async fn read_loop(
    id: ClientId,
    mut read_half: OwnedReadHalf,
    events: mpsc::UnboundedSender<ClientEvent>,
    max_message_size: usize,
) {
    let mut decoder = FrameDecoder::with_max_size(max_message_size);
    let mut buf = [0u8; 4096];

    let reason = 'read: loop {
        match read_half.read(&mut buf).await {
            Ok(0) => {
                if decoder.has_partial() {
                    break CloseReason::Protocol(format!(
                        "connection closed inside a frame ({} bytes pending)",
                        decoder.available()
                    ));
                }
                break CloseReason::PeerClosed;
            }
            Ok(n) => {
                decoder.push(&buf[..n]);

                // Decode all available frames
                loop {
                    match decoder.decode() {
                        Ok(Some(message)) => {
                            if events.send(ClientEvent::Message(id, message)).is_err() {
                                // Service is gone
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => break 'read CloseReason::Protocol(e.to_string()),
                    }
                }
            }
            Err(e) => break CloseReason::Io(e),
        }
    };

    events.send(ClientEvent::Closed(id, reason)).ok();
}

/// Write queued frames to one connection until the client is closed
///
/// Once `stop` fires, the writer has [`CLOSE_GRACE`] to finish what is
/// queued. A peer that stops reading cannot hold the connection open past
/// that: the write half is dropped mid-frame if need be.
async fn write_loop(
    id: ClientId,
    mut write_half: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    stop: oneshot::Receiver<()>,
    connected: Arc<AtomicBool>,
) {
    let drain = async {
        while let Some(frame) = outbound.recv().await {
            if let Err(e) = write_half.write_all(&frame).await {
                tracing::warn!(client_id = %id, error = %e, "Write error");
                connected.store(false, Ordering::SeqCst);
                return;
            }
        }
        write_half.shutdown().await.ok();
    };

    let deadline = async move {
        // A dropped sender means the client is gone too
        stop.await.ok();
        tokio::time::sleep(CLOSE_GRACE).await;
    };

    tokio::select! {
        () = drain => {}
        () = deadline => {
            tracing::warn!(client_id = %id, "Peer not reading; dropping unsent frames");
        }
    }
}
