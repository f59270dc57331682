//! IPC Environment
//!
//! Process-wide IPC settings held in an explicit value instead of a global.
//! An [`IpcEnv`] is created once with [`IpcEnv::init`], passed to every
//! service start and socket open, and torn down when the last clone is dropped
//! (or explicitly with [`IpcEnv::shutdown`]).
//!
//! # Addressing
//!
//! A service named `demo` under root `/run/app` with prefix `ipc` listens on
//! `/run/app/ipc_demo.sock`. Two processes that agree on root, prefix and name
//! always find each other without a registry.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::sys::socket::UnixAddr;
use nix::unistd::{access, AccessFlags};

use crate::error::{IpcError, IpcResult};
use crate::transport::frame::MAX_FRAME_SIZE;

/// Default socket file name prefix
pub const DEFAULT_SOCKET_PREFIX: &str = "ipc";

/// Default socket file permissions (owner-only)
pub const DEFAULT_SOCKET_MODE: u32 = 0o600;

/// Tunables carried by the environment
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvOptions {
    /// Prefix prepended to service names when deriving socket file names
    pub socket_prefix: String,
    /// Permissions applied to service socket files
    pub socket_mode: u32,
    /// Largest payload accepted or produced by any socket
    pub max_message_size: usize,
    /// Maximum concurrently connected clients per service (0 = unlimited)
    pub max_clients: usize,
}

impl Default for EnvOptions {
    fn default() -> Self {
        Self {
            socket_prefix: DEFAULT_SOCKET_PREFIX.to_string(),
            socket_mode: DEFAULT_SOCKET_MODE,
            max_message_size: MAX_FRAME_SIZE,
            max_clients: 0,
        }
    }
}

/// Initialized IPC environment
///
/// Cheap to clone; all clones share the same settings.
#[derive(Clone)]
pub struct IpcEnv {
    inner: Arc<EnvInner>,
}

struct EnvInner {
    root: PathBuf,
    options: EnvOptions,
}

impl Drop for EnvInner {
    fn drop(&mut self) {
        tracing::debug!(root = %self.root.display(), "IPC environment released");
    }
}

impl fmt::Debug for IpcEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpcEnv")
            .field("root", &self.inner.root)
            .field("options", &self.inner.options)
            .finish()
    }
}

impl IpcEnv {
    /// Initialize the environment with default options
    ///
    /// # Errors
    ///
    /// Returns `IpcError::Environment` if `root` is not an accessible,
    /// writable directory.
    pub fn init(root: impl Into<PathBuf>) -> IpcResult<Self> {
        Self::with_options(root, EnvOptions::default())
    }

    /// Initialize the environment with explicit options
    ///
    /// # Errors
    ///
    /// Returns `IpcError::Environment` if `root` is not an accessible,
    /// writable directory or the options are unusable.
    pub fn with_options(root: impl Into<PathBuf>, options: EnvOptions) -> IpcResult<Self> {
        let root = root.into();

        let env_error = |reason: String| IpcError::Environment {
            path: root.clone(),
            reason,
        };

        if root.as_os_str().is_empty() {
            return Err(env_error("path is empty".to_string()));
        }
        if options.socket_prefix.contains('/') {
            return Err(env_error(format!(
                "socket prefix {:?} must not contain '/'",
                options.socket_prefix
            )));
        }
        if !root.is_dir() {
            return Err(env_error("not a directory".to_string()));
        }
        access(&root, AccessFlags::R_OK | AccessFlags::W_OK | AccessFlags::X_OK)
            .map_err(|errno| env_error(errno.desc().to_string()))?;

        tracing::debug!(root = %root.display(), prefix = %options.socket_prefix, "IPC environment initialized");

        Ok(Self {
            inner: Arc::new(EnvInner { root, options }),
        })
    }

    /// Root directory under which socket files live
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Environment options
    #[must_use]
    pub fn options(&self) -> &EnvOptions {
        &self.inner.options
    }

    /// Largest payload accepted or produced by sockets in this environment
    #[must_use]
    pub fn max_message_size(&self) -> usize {
        self.inner.options.max_message_size
    }

    /// Derive the socket path for a service name
    ///
    /// # Errors
    ///
    /// Returns `IpcError::InvalidName` if the name is empty, contains a path
    /// separator or NUL, or if the resulting path does not fit in a Unix
    /// socket address.
    pub fn socket_path(&self, name: &str) -> IpcResult<PathBuf> {
        let invalid = |reason: &str| IpcError::InvalidName {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        if name.is_empty() {
            return Err(invalid("name is empty"));
        }
        if name.contains('/') || name.contains('\0') {
            return Err(invalid("name must not contain '/' or NUL"));
        }

        let path = self
            .inner
            .root
            .join(format!("{}_{name}.sock", self.inner.options.socket_prefix));

        UnixAddr::new(&path).map_err(|_| invalid("socket path too long"))?;

        Ok(path)
    }

    /// Tear the environment down
    ///
    /// Equivalent to dropping this handle; services and sockets opened from it
    /// keep their own clone until they close.
    pub fn shutdown(self) {
        tracing::debug!(root = %self.inner.root.display(), "IPC environment shutdown requested");
    }
}
