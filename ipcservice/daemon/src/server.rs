//! Daemon Server Implementation
//!
//! The service loop behind `ipcserviced`:
//! - Echoes every message back to its sender with the same code
//! - Answers runtime control requests (`-R status|shutdown|ping`)
//! - Stops on SIGTERM/SIGINT or a `shutdown` control request
//!
//! # Runtime Control
//!
//! ```text
//!   ipcserviced -R status
//!          │
//!          │  exchange(code = RUNTIME_CONTROL_CODE, data = "status")
//!          ▼
//!     EchoServer ──► {"ok":true,"message":"status","status":{...}}
//! ```

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use ipcservice_core::{Alerter, Client, IpcError, Message, Received, Service};

/// Message code reserved for runtime control requests
pub const RUNTIME_CONTROL_CODE: u32 = 0xFFFF_0001;

/// How long one receive waits before re-checking the shutdown flag
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Pause after a failed receive, so persistent accept errors (EMFILE) do not spin
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Runtime control errors
#[derive(Debug, Error)]
pub enum ControlError {
    /// The option is not one the daemon understands
    #[error("unknown runtime control option {0:?} (expected status, shutdown or ping)")]
    UnknownOption(String),
}

/// Runtime control request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlCommand {
    /// Report connected clients and messages served
    Status,
    /// Stop the daemon gracefully
    Shutdown,
    /// Liveness check
    Ping,
}

impl FromStr for ControlCommand {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "status" => Ok(Self::Status),
            "shutdown" => Ok(Self::Shutdown),
            "ping" => Ok(Self::Ping),
            other => Err(ControlError::UnknownOption(other.to_string())),
        }
    }
}

/// Snapshot reported by `-R status`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatus {
    /// Service name
    pub service: String,
    /// Daemon process id
    pub pid: u32,
    /// Currently connected clients
    pub clients: usize,
    /// Messages handled since start
    pub messages: u64,
    /// Seconds since start
    pub uptime_secs: u64,
}

/// Reply payload for runtime control requests
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlReply {
    /// Whether the request was understood and carried out
    pub ok: bool,
    /// Human-readable result
    pub message: String,
    /// Present for `status`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ServerStatus>,
}

impl ControlReply {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
            status: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
            status: None,
        }
    }
}

/// Handle used by signal handlers to stop the server
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    alerter: Alerter,
}

impl ShutdownHandle {
    /// Request shutdown and wake the receive loop
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.alerter.alert();
    }
}

/// Echo server around one [`Service`]
pub struct EchoServer {
    service: Service,
    shutdown: Arc<AtomicBool>,
    started: Instant,
    messages: u64,
}

impl EchoServer {
    /// Wrap a started service
    pub fn new(service: Service) -> Self {
        Self {
            service,
            shutdown: Arc::new(AtomicBool::new(false)),
            started: Instant::now(),
            messages: 0,
        }
    }

    /// Handle for stopping the server from another task or thread
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: Arc::clone(&self.shutdown),
            alerter: self.service.alerter(),
        }
    }

    /// Serve until shutdown is requested, then close the service
    pub async fn run(&mut self) -> Result<()> {
        info!(service = %self.service.name(), "Echo server running");

        while !self.shutdown.load(Ordering::SeqCst) {
            match self.service.recv(Some(POLL_INTERVAL)).await {
                Ok(Received::Message { client, message }) => self.handle(&client, &message),
                Ok(Received::Disconnected(client)) => {
                    debug!(client_id = %client.id(), "Client left");
                }
                Ok(Received::Timeout | Received::Interrupted) => {}
                Err(e) => match retry_delay(&e) {
                    Some(delay) => {
                        warn!(error = %e, "Receive failed");
                        tokio::time::sleep(delay).await;
                    }
                    None => break,
                },
            }
        }

        self.service.close();
        info!(messages = self.messages, "Echo server stopped");
        Ok(())
    }

    fn handle(&mut self, client: &Client, message: &Message) {
        self.messages += 1;
        debug!(client_id = %client.id(), %message, "Request");

        let result = if message.code == RUNTIME_CONTROL_CODE {
            let reply = self.control(message);
            match serde_json::to_vec(&reply) {
                Ok(payload) => client.send(RUNTIME_CONTROL_CODE, &payload),
                Err(e) => {
                    warn!(error = %e, "Cannot encode control reply");
                    return;
                }
            }
        } else {
            client.send(message.code, &message.data)
        };

        if let Err(e) = result {
            warn!(client_id = %client.id(), error = %e, "Reply failed");
        }
    }

    fn control(&self, message: &Message) -> ControlReply {
        let option = String::from_utf8_lossy(&message.data);
        let command = match option.parse::<ControlCommand>() {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "Rejected runtime control request");
                return ControlReply::error(e.to_string());
            }
        };

        info!(?command, "Runtime control");

        match command {
            ControlCommand::Ping => ControlReply::ok("pong"),
            ControlCommand::Status => ControlReply {
                status: Some(self.status()),
                ..ControlReply::ok("status")
            },
            ControlCommand::Shutdown => {
                self.shutdown.store(true, Ordering::SeqCst);
                ControlReply::ok("shutting down")
            }
        }
    }

    /// Current status snapshot
    pub fn status(&self) -> ServerStatus {
        ServerStatus {
            service: self.service.name().to_string(),
            pid: std::process::id(),
            clients: self.service.client_count(),
            messages: self.messages,
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}

/// How long to wait before receiving again after `error`; `None` stops the loop
fn retry_delay(error: &IpcError) -> Option<Duration> {
    match error {
        IpcError::ServiceClosed => None,
        _ => Some(ERROR_BACKOFF),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipcservice_core::{exchange, IpcEnv, IpcSocket};
    use tempfile::TempDir;

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn test_parse_control_commands() {
        assert_eq!("status".parse::<ControlCommand>().unwrap(), ControlCommand::Status);
        assert_eq!("shutdown\n".parse::<ControlCommand>().unwrap(), ControlCommand::Shutdown);
        assert_eq!("ping".parse::<ControlCommand>().unwrap(), ControlCommand::Ping);
        assert!(matches!(
            "reload".parse::<ControlCommand>(),
            Err(ControlError::UnknownOption(_))
        ));
    }

    #[test]
    fn test_reply_json_shape() {
        let json = serde_json::to_string(&ControlReply::ok("pong")).unwrap();
        assert_eq!(json, r#"{"ok":true,"message":"pong"}"#);
    }

    #[test]
    fn test_receive_errors_back_off() {
        let accept_failed = IpcError::Io(std::io::Error::other("too many open files"));
        assert_eq!(retry_delay(&accept_failed), Some(ERROR_BACKOFF));
        assert!(ERROR_BACKOFF > Duration::ZERO);
        assert_eq!(retry_delay(&IpcError::ServiceClosed), None);
    }

    async fn control(env: &IpcEnv, option: &str) -> ControlReply {
        let reply = exchange(env, "echo", RUNTIME_CONTROL_CODE, option.as_bytes(), WAIT)
            .await
            .unwrap();
        serde_json::from_slice(&reply).unwrap()
    }

    #[tokio::test]
    async fn test_echo_and_control() {
        let dir = TempDir::new().unwrap();
        let env = IpcEnv::init(dir.path()).unwrap();
        let mut server = EchoServer::new(Service::start(&env, "echo").await.unwrap());
        let running = tokio::spawn(async move { server.run().await });

        let sync_env = env.clone();
        let echoed = tokio::task::spawn_blocking(move || {
            let mut socket = IpcSocket::open(&sync_env, "echo", WAIT).unwrap();
            socket.write(7, b"echo me").unwrap();
            socket.read().unwrap()
        })
        .await
        .unwrap();
        assert_eq!(echoed, Message::new(7, "echo me"));

        assert_eq!(control(&env, "ping").await, ControlReply::ok("pong"));

        let status = control(&env, "status").await.status.unwrap();
        assert_eq!(status.service, "echo");
        assert!(status.messages >= 2);

        let rejected = control(&env, "bogus").await;
        assert!(!rejected.ok);
        assert!(rejected.message.contains("bogus"));

        assert!(control(&env, "shutdown").await.ok);
        tokio::time::timeout(WAIT, running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!dir.path().join("ipc_echo.sock").exists());
    }

    #[tokio::test]
    async fn test_shutdown_handle_stops_idle_server() {
        let dir = TempDir::new().unwrap();
        let env = IpcEnv::init(dir.path()).unwrap();
        let mut server = EchoServer::new(Service::start(&env, "idle").await.unwrap());
        let handle = server.shutdown_handle();

        let running = tokio::spawn(async move { server.run().await });
        handle.shutdown();

        tokio::time::timeout(WAIT, running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
