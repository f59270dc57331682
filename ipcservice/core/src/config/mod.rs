//! TOML Configuration File Support
//!
//! Centralized configuration loading for IPC services, supporting a TOML file
//! at `~/.config/ipcservice/ipcserviced.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (when applicable)
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [ipc]
//! root_dir = "/run/user/1000/ipcservice"
//! socket_prefix = "ipc"
//! socket_mode = 0o600
//! max_message_size = 10485760
//! connect_timeout_ms = 1000
//!
//! [service]
//! name = "ipcserviced"
//! max_clients = 64
//!
//! [log]
//! level = "info"
//! ```

use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::env::{EnvOptions, IpcEnv, DEFAULT_SOCKET_MODE, DEFAULT_SOCKET_PREFIX};
use crate::error::IpcResult;
use crate::transport::frame::MAX_FRAME_SIZE;

/// Default service name for the daemon
pub const DEFAULT_SERVICE_NAME: &str = "ipcserviced";

/// Default config file name
pub const DEFAULT_CONFIG_FILE: &str = "ipcserviced.toml";

/// Default connect timeout in milliseconds
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 1000;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// IPC section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcToml {
    /// Directory holding service sockets
    pub root_dir: Option<PathBuf>,

    /// Prefix for socket file names
    pub socket_prefix: Option<String>,

    /// Permissions of service socket files
    pub socket_mode: Option<u32>,

    /// Maximum message payload in bytes
    pub max_message_size: Option<usize>,

    /// Connection timeout in milliseconds
    pub connect_timeout_ms: Option<u64>,
}

/// Service section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceToml {
    /// Name the daemon's service listens under
    pub name: Option<String>,

    /// Maximum concurrently connected clients (0 = unlimited)
    pub max_clients: Option<usize>,
}

/// Log section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogToml {
    /// Default log level when `RUST_LOG` is not set
    pub level: Option<String>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcServiceToml {
    /// IPC configuration section
    pub ipc: IpcToml,

    /// Service configuration section
    pub service: ServiceToml,

    /// Log configuration section
    pub log: LogToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Resolved configuration
///
/// Use [`load_config`] to load configuration with proper priority handling,
/// then [`IpcConfig::env`] to initialize the IPC environment from it.
#[derive(Clone, Debug)]
pub struct IpcConfig {
    /// Directory holding service sockets
    pub root_dir: PathBuf,

    /// Prefix for socket file names
    pub socket_prefix: String,

    /// Permissions of service socket files
    pub socket_mode: u32,

    /// Maximum message payload in bytes
    pub max_message_size: usize,

    /// Connection timeout for sockets and runtime control
    pub connect_timeout: Duration,

    /// Name the daemon's service listens under
    pub service_name: String,

    /// Maximum concurrently connected clients (0 = unlimited)
    pub max_clients: usize,

    /// Default log level
    pub log_level: String,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            socket_prefix: DEFAULT_SOCKET_PREFIX.to_string(),
            socket_mode: DEFAULT_SOCKET_MODE,
            max_message_size: MAX_FRAME_SIZE,
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            max_clients: 0,
            log_level: "info".to_string(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl IpcConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Environment options described by this configuration
    #[must_use]
    pub fn env_options(&self) -> EnvOptions {
        EnvOptions {
            socket_prefix: self.socket_prefix.clone(),
            socket_mode: self.socket_mode,
            max_message_size: self.max_message_size,
            max_clients: self.max_clients,
        }
    }

    /// Initialize the IPC environment described by this configuration
    ///
    /// # Errors
    ///
    /// Returns `IpcError::Environment` if the root directory is unusable.
    pub fn env(&self) -> IpcResult<IpcEnv> {
        IpcEnv::with_options(&self.root_dir, self.env_options())
    }

    /// Create the root directory (owner-only) if it does not exist yet
    ///
    /// # Errors
    ///
    /// Returns the underlying IO error if the directory cannot be created.
    pub fn ensure_root_dir(&self) -> std::io::Result<()> {
        if self.root_dir.is_dir() {
            return Ok(());
        }
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&self.root_dir)?;
        tracing::debug!(path = %self.root_dir.display(), "Created IPC root directory");
        Ok(())
    }

    /// Check values that parse but cannot work
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.root_dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "ipc.root_dir must not be empty".to_string(),
            ));
        }
        if self.socket_prefix.is_empty() || self.socket_prefix.contains('/') {
            return Err(ConfigError::ValidationError(format!(
                "ipc.socket_prefix {:?} must be non-empty and contain no '/'",
                self.socket_prefix
            )));
        }
        if self.socket_mode > 0o777 {
            return Err(ConfigError::ValidationError(format!(
                "ipc.socket_mode {:o} is not a permission mode",
                self.socket_mode
            )));
        }
        if self.max_message_size == 0 || u32::try_from(self.max_message_size).is_err() {
            return Err(ConfigError::ValidationError(format!(
                "ipc.max_message_size {} must be between 1 and {}",
                self.max_message_size,
                u32::MAX
            )));
        }
        if self.service_name.is_empty()
            || self.service_name.contains('/')
            || self.service_name.contains('\0')
        {
            return Err(ConfigError::ValidationError(format!(
                "service.name {:?} must be non-empty and contain no '/'",
                self.service_name
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/ipcservice/ipcserviced.toml` or
/// `~/.config/ipcservice/ipcserviced.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("ipcservice").join(DEFAULT_CONFIG_FILE))
}

/// Get the default socket root directory
///
/// Uses `XDG_RUNTIME_DIR` if available, otherwise `/tmp/ipcservice-$UID/`
#[must_use]
pub fn default_root_dir() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join("ipcservice")
    } else {
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/ipcservice-{uid}"))
    }
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<IpcConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// A missing file falls back to defaults and environment variables.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<IpcConfig, ConfigError> {
    let mut config = IpcConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            read_into(&mut config, config_path)?;
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config);

    Ok(config)
}

/// Load configuration from a file that must exist
///
/// Used when the file was named explicitly, e.g. with `--config`.
///
/// # Errors
///
/// Returns `ConfigError::ReadError` if the file is missing or unreadable and
/// `ConfigError::ParseError` if it is not valid TOML.
pub fn load_config_file(path: &Path) -> Result<IpcConfig, ConfigError> {
    let mut config = IpcConfig::default();
    read_into(&mut config, path)?;
    apply_env_config(&mut config);
    Ok(config)
}

fn read_into(config: &mut IpcConfig, path: &Path) -> Result<(), ConfigError> {
    let toml_content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.to_path_buf(),
        source: e,
    })?;

    let toml_config: IpcServiceToml = toml::from_str(&toml_content)?;
    apply_toml_config(config, &toml_config);
    config.config_file_path = Some(path.to_path_buf());
    config.source = ConfigSource::File;

    tracing::info!(path = %path.display(), "Loaded configuration from file");
    Ok(())
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut IpcConfig, toml: &IpcServiceToml) {
    // IPC settings
    if let Some(ref root) = toml.ipc.root_dir {
        config.root_dir.clone_from(root);
    }
    if let Some(ref prefix) = toml.ipc.socket_prefix {
        config.socket_prefix.clone_from(prefix);
    }
    if let Some(mode) = toml.ipc.socket_mode {
        config.socket_mode = mode;
    }
    if let Some(size) = toml.ipc.max_message_size {
        config.max_message_size = size;
    }
    if let Some(ms) = toml.ipc.connect_timeout_ms {
        config.connect_timeout = Duration::from_millis(ms);
    }

    // Service settings
    if let Some(ref name) = toml.service.name {
        config.service_name.clone_from(name);
    }
    if let Some(max) = toml.service.max_clients {
        config.max_clients = max;
    }

    if let Some(ref level) = toml.log.level {
        config.log_level.clone_from(level);
    }
}

/// Apply environment variable overrides to the config
fn apply_env_config(config: &mut IpcConfig) {
    if let Ok(root) = std::env::var("IPC_ROOT_DIR") {
        if !root.is_empty() {
            config.root_dir = PathBuf::from(root);
            config.source = ConfigSource::Env;
        }
    }
    if let Ok(prefix) = std::env::var("IPC_SOCKET_PREFIX") {
        config.socket_prefix = prefix;
        config.source = ConfigSource::Env;
    }
    if let Ok(name) = std::env::var("IPC_SERVICE_NAME") {
        config.service_name = name;
        config.source = ConfigSource::Env;
    }
    if let Ok(size) = std::env::var("IPC_MAX_MESSAGE_SIZE") {
        if let Ok(s) = size.parse::<usize>() {
            config.max_message_size = s;
            config.source = ConfigSource::Env;
        }
    }
    if let Ok(timeout) = std::env::var("IPC_CONNECT_TIMEOUT") {
        if let Ok(ms) = timeout.parse::<u64>() {
            config.connect_timeout = Duration::from_millis(ms);
            config.source = ConfigSource::Env;
        }
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides;
/// they win over both the file and the environment.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Root directory override
    pub root_dir: Option<PathBuf>,

    /// Service name override
    pub service_name: Option<String>,

    /// Connect timeout override (milliseconds)
    pub connect_timeout_ms: Option<u64>,

    /// Log level override
    pub log_level: Option<String>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set root directory override
    #[must_use]
    pub fn with_root_dir(mut self, path: PathBuf) -> Self {
        self.root_dir = Some(path);
        self
    }

    /// Set service name override
    #[must_use]
    pub fn with_service_name(mut self, name: String) -> Self {
        self.service_name = Some(name);
        self
    }

    /// Set connect timeout override
    #[must_use]
    pub fn with_connect_timeout_ms(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = Some(ms);
        self
    }

    /// Set log level override
    #[must_use]
    pub fn with_log_level(mut self, level: String) -> Self {
        self.log_level = Some(level);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut IpcConfig) {
        if self.root_dir.is_some()
            || self.service_name.is_some()
            || self.connect_timeout_ms.is_some()
            || self.log_level.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(ref root) = self.root_dir {
            config.root_dir.clone_from(root);
        }
        if let Some(ref name) = self.service_name {
            config.service_name.clone_from(name);
        }
        if let Some(ms) = self.connect_timeout_ms {
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ref level) = self.log_level {
            config.log_level.clone_from(level);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
