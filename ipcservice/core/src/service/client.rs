//! Client Handles
//!
//! A [`Client`] is the service-side view of one connected peer. Handles are
//! reference counted: every clone shares one count with the registry entry the
//! service keeps while the connection is open.
//!
//! # Lifecycle
//!
//! ```text
//!   accept ──► registered (service holds baseline ref)
//!                 │
//!      ┌──────────┴───────────┐
//!  peer EOF /             Client::close()
//!  bad frame                  │
//!      │                      │
//!      └──► unregistered, disconnected ──► last handle dropped ──► reclaimed
//! ```
//!
//! Dropping handles while the connection is open never reclaims anything:
//! the registry still holds its reference.

use std::any::Any;
use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

use super::registry::{detach, RegistryState};
use crate::error::{IpcError, IpcResult};
use crate::transport::frame;

/// Opaque value attached to a client by the application
pub type UserData = Arc<dyn Any + Send + Sync>;

/// Unique identifier for a client connection
///
/// Identifiers come from a process-wide counter and are never reused, so a
/// stale id can never resolve to a newer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    /// Allocate the next identifier
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    /// Get the raw numeric value
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Parts of an accepted connection handed to [`Client::new`]
pub(crate) struct ClientParts {
    pub id: ClientId,
    pub fd: RawFd,
    pub connected: Arc<AtomicBool>,
    pub outbound: mpsc::UnboundedSender<Vec<u8>>,
    pub writer_stop: oneshot::Sender<()>,
    pub reader: AbortHandle,
    pub registry: Weak<parking_lot::RwLock<RegistryState>>,
    pub max_message_size: usize,
}

/// State shared by every handle of one connection
struct ClientShared {
    id: ClientId,
    fd: RawFd,
    /// Also cleared by the writer task on write failure
    connected: Arc<AtomicBool>,
    /// Frames queued for the writer task; `None` once closed
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    /// Starts the writer's bounded drain; the write half goes when it ends
    writer_stop: Mutex<Option<oneshot::Sender<()>>>,
    reader: Mutex<Option<AbortHandle>>,
    userdata: Mutex<Option<UserData>>,
    registry: Weak<parking_lot::RwLock<RegistryState>>,
    max_message_size: usize,
}

impl ClientShared {
    /// Stop the reader and tell the writer to finish
    ///
    /// Frames already queued get a short grace period; after that the
    /// connection is dropped whether or not the peer has read them.
    fn shutdown(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.outbound.lock().take();
        if let Some(stop) = self.writer_stop.lock().take() {
            stop.send(()).ok();
        }
    }
}

impl Drop for ClientShared {
    fn drop(&mut self) {
        self.shutdown();
        tracing::debug!(client_id = %self.id, "Client reclaimed");
    }
}

/// Reference-counted handle to a connected peer
///
/// Cloning a handle is the same as [`Client::addref`]; dropping it is the
/// same as [`Client::release`].
#[derive(Clone)]
pub struct Client {
    shared: Arc<ClientShared>,
}

impl Client {
    pub(crate) fn new(parts: ClientParts) -> Self {
        Self {
            shared: Arc::new(ClientShared {
                id: parts.id,
                fd: parts.fd,
                connected: parts.connected,
                outbound: Mutex::new(Some(parts.outbound)),
                writer_stop: Mutex::new(Some(parts.writer_stop)),
                reader: Mutex::new(Some(parts.reader)),
                userdata: Mutex::new(None),
                registry: parts.registry,
                max_message_size: parts.max_message_size,
            }),
        }
    }

    /// Stable identifier, usable with [`Service::lookup`](super::Service::lookup)
    #[must_use]
    pub fn id(&self) -> ClientId {
        self.shared.id
    }

    /// OS handle of the connection, while it is open
    #[must_use]
    pub fn fd(&self) -> Option<RawFd> {
        self.is_connected().then_some(self.shared.fd)
    }

    /// Last known liveness of the connection
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Queue a message to the peer
    ///
    /// The frame is written by the connection's writer task in queue order.
    ///
    /// # Errors
    ///
    /// Returns `IpcError::ClientGone` if the connection is closed, or
    /// `IpcError::Protocol` if the payload exceeds the size limit.
    pub fn send(&self, code: u32, data: &[u8]) -> IpcResult<()> {
        if !self.is_connected() {
            return Err(IpcError::ClientGone(self.shared.id.as_u64()));
        }

        let frame = frame::encode(code, data, self.shared.max_message_size)?;

        let outbound = self.shared.outbound.lock();
        match outbound.as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| {
                self.shared.connected.store(false, Ordering::SeqCst);
                IpcError::ClientGone(self.shared.id.as_u64())
            }),
            None => Err(IpcError::ClientGone(self.shared.id.as_u64())),
        }
    }

    /// Take an additional reference
    #[must_use]
    pub fn addref(&self) -> Self {
        self.clone()
    }

    /// Drop this reference
    ///
    /// Resources are reclaimed when the last reference goes and the
    /// connection is already closed.
    pub fn release(self) {
        drop(self);
    }

    /// Forcibly close the connection
    ///
    /// The client is removed from its service and marked disconnected;
    /// outstanding handles stay valid until released. Messages queued with
    /// [`send`](Self::send) before the close are still written if the peer
    /// takes them within a short grace period.
    pub fn close(&self) {
        let was_connected = self.shared.connected.load(Ordering::SeqCst);
        self.shared.shutdown();

        let removed = self
            .shared
            .registry
            .upgrade()
            .and_then(|registry| detach(&registry, &self.shared.id));
        drop(removed);

        if was_connected {
            tracing::info!(client_id = %self.shared.id, "Client closed");
        }
    }

    /// Number of live references, including the service's own while registered
    #[must_use]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.shared)
    }

    /// Create a weak handle that does not keep the client alive
    #[must_use]
    pub fn downgrade(&self) -> WeakClient {
        WeakClient {
            id: self.shared.id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Attach an opaque value, replacing any previous one
    pub fn set_userdata<T: Any + Send + Sync>(&self, value: T) {
        *self.shared.userdata.lock() = Some(Arc::new(value));
    }

    /// Get the attached value if it has type `T`
    #[must_use]
    pub fn userdata<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let value = self.shared.userdata.lock().clone()?;
        value.downcast::<T>().ok()
    }

    /// Remove and return the attached value
    pub fn take_userdata(&self) -> Option<UserData> {
        self.shared.userdata.lock().take()
    }

    /// Tear down the connection without touching the registry
    pub(crate) fn shutdown(&self) {
        self.shared.shutdown();
    }
}

impl PartialEq for Client {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Client {}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.shared.id)
            .field("fd", &self.shared.fd)
            .field("connected", &self.is_connected())
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// Weak reference to a client
///
/// Used to observe whether a client's resources have been reclaimed.
#[derive(Clone, Debug)]
pub struct WeakClient {
    id: ClientId,
    shared: Weak<ClientShared>,
}

impl WeakClient {
    /// Identifier of the client this handle points to
    #[must_use]
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Get a strong handle if the client is still alive
    #[must_use]
    pub fn upgrade(&self) -> Option<Client> {
        self.shared.upgrade().map(|shared| Client { shared })
    }

    /// Check whether the last strong reference is gone
    #[must_use]
    pub fn is_reclaimed(&self) -> bool {
        self.shared.strong_count() == 0
    }
}
