//! IPC Service Core - Local Message Passing over Unix Domain Sockets
//!
//! This crate lets processes on one host exchange framed messages through
//! named services. A process starts a [`Service`] under a short name; other
//! processes connect to that name with an [`IpcSocket`], an [`AsyncSocket`],
//! or a one-shot [`exchange`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────┐          ┌──────────────────────────────┐
//! │        Client process        │          │       Service process        │
//! │                              │          │                              │
//! │  IpcSocket (blocking)        │          │  Service::recv(timeout)      │
//! │  AsyncSocket (queued)  ──────┼── frame ─┼─► ├─ Message{client, msg}    │
//! │  exchange (one-shot)         │          │   ├─ Disconnected(client)    │
//! │                              │◄─ frame ─┼── Client::send               │
//! └──────────────────────────────┘          └──────────────────────────────┘
//!                  │                                      │
//!                  └──── <root>/<prefix>_<name>.sock ─────┘
//! ```
//!
//! Both sides agree on the address through an [`IpcEnv`]: the same root
//! directory and prefix always derive the same socket path for a name.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::time::Duration;
//! use ipcservice_core::{IpcEnv, Received, Service};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ipcservice_core::IpcError> {
//!     let env = IpcEnv::init("/run/user/1000/ipcservice")?;
//!     let mut service = Service::start(&env, "echo").await?;
//!
//!     loop {
//!         match service.recv(Some(Duration::from_secs(1))).await? {
//!             Received::Message { client, message } => {
//!                 client.send(message.code, &message.data)?;
//!             }
//!             Received::Disconnected(_) | Received::Timeout => {}
//!             Received::Interrupted => break,
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`env`]: Root directory, socket naming, and per-process limits
//! - [`message`]: The `(code, data)` unit carried by every frame
//! - [`service`]: Listening endpoint, client handles, and the client registry
//! - [`transport`]: Frame codec and the client-side sockets
//! - [`config`]: TOML/env/CLI configuration for binaries built on this crate
//! - [`error`]: Error types

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod env;
pub mod error;
pub mod message;
pub mod service;
pub mod transport;

pub use env::{EnvOptions, IpcEnv};
pub use error::{ExchangeStage, IpcError, IpcResult};
pub use message::Message;

// Service exports
pub use service::{Alerter, Client, ClientId, Received, Service, UserData, WeakClient};

// Transport exports
pub use transport::{exchange, AsyncSocket, FlushStatus, FrameDecoder, IpcSocket};

// Config exports
pub use config::{
    default_config_path, default_root_dir, load_config, load_config_file, load_config_from_path,
    ConfigError, ConfigOverrides, ConfigSource, IpcConfig, IpcServiceToml,
};
