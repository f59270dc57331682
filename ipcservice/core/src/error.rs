//! Error Types
//!
//! A single error enum covers every fallible IPC operation. Deadline expiry is
//! reported as a normal outcome by the service and socket APIs; only
//! [`exchange`](crate::transport::exchange::exchange) turns it into
//! [`IpcError::Timeout`] because a one-shot call has nothing to resume.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the crate
pub type IpcResult<T> = Result<T, IpcError>;

/// Errors that can occur during IPC operations
#[derive(Debug, Error)]
pub enum IpcError {
    /// The IPC environment could not be initialized
    #[error("Cannot use IPC root directory {path:?}: {reason}")]
    Environment {
        /// Root directory that was rejected
        path: PathBuf,
        /// Why it was rejected
        reason: String,
    },

    /// Service or socket name cannot be turned into a channel address
    #[error("Invalid service name {name:?}: {reason}")]
    InvalidName {
        /// The offending name
        name: String,
        /// Why it was rejected
        reason: String,
    },

    /// Cannot reach or establish the channel
    #[error("Cannot connect to service {service:?} at {path:?}: {source}")]
    Connect {
        /// Service name
        service: String,
        /// Derived socket path
        path: PathBuf,
        /// Underlying failure
        #[source]
        source: std::io::Error,
    },

    /// Cannot bind the listening endpoint
    #[error("Cannot start service {service:?} at {path:?}: {source}")]
    Bind {
        /// Service name
        service: String,
        /// Derived socket path
        path: PathBuf,
        /// Underlying failure
        #[source]
        source: std::io::Error,
    },

    /// Malformed frame on the wire
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Transport-level read/write failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer closed the connection cleanly
    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// Operation on a client whose connection is already closed
    #[error("Client {0} is no longer connected")]
    ClientGone(u64),

    /// Operation on a socket that was already closed
    #[error("Socket is closed")]
    SocketClosed,

    /// Operation on a service that was already closed
    #[error("Service is closed")]
    ServiceClosed,

    /// Deadline expired where expiry is a failure
    #[error("Operation timed out")]
    Timeout,

    /// One stage of an exchange failed
    #[error("Exchange with {service:?} failed while {stage}: {source}")]
    Exchange {
        /// Service the exchange targeted
        service: String,
        /// Stage that failed
        stage: ExchangeStage,
        /// Cause of the failure
        #[source]
        source: Box<IpcError>,
    },
}

impl IpcError {
    /// Check whether this error is a deadline expiry, directly or inside an exchange
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout => true,
            Self::Exchange { source, .. } => source.is_timeout(),
            _ => false,
        }
    }
}

/// Stages of a one-shot exchange, reported on failure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExchangeStage {
    /// Connecting to the service
    Open,
    /// Queueing the request
    Send,
    /// Writing the request to the wire
    Flush,
    /// Waiting for the reply
    Recv,
}

impl fmt::Display for ExchangeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "opening"),
            Self::Send => write!(f, "sending"),
            Self::Flush => write!(f, "flushing"),
            Self::Recv => write!(f, "receiving"),
        }
    }
}
