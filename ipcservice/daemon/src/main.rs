//! IPC Service Daemon
//!
//! Runs an echo service on the local IPC channel and doubles as its own
//! control client.
//!
//! # Usage
//!
//! ```bash
//! # Run in the foreground with the default config
//! ipcserviced -f
//!
//! # Custom config file
//! ipcserviced -c /etc/ipcservice/ipcserviced.toml
//!
//! # Check the configuration and exit
//! ipcserviced -T
//!
//! # Serve under another name and root (overrides file and environment)
//! ipcserviced -f --root-dir /run/ipc --name echo
//!
//! # Talk to a running daemon
//! ipcserviced -R status
//! ipcserviced -R shutdown
//!
//! # Verbose logging
//! RUST_LOG=debug ipcserviced -f
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown (removes the socket file)

mod cli;
mod server;

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use ipcservice_core::{exchange, load_config, load_config_file, IpcConfig, Service};

use cli::Cli;
use server::{ControlReply, EchoServer, RUNTIME_CONTROL_CODE};

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("ipcserviced: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<ExitCode> {
    let mut config = match cli.config {
        Some(ref path) => load_config_file(path),
        None => load_config(),
    }
    .context("Failed to load configuration")?;
    cli.overrides().apply(&mut config);

    if cli.test_config {
        return test_config(&config);
    }

    config.validate()?;
    init_logging(&config.log_level)?;

    if let Some(ref option) = cli.runtime_control {
        return runtime_control(&config, option);
    }

    config
        .ensure_root_dir()
        .with_context(|| format!("Failed to create root directory {:?}", config.root_dir))?;
    config.root_dir = std::fs::canonicalize(&config.root_dir)
        .with_context(|| format!("Cannot resolve root directory {:?}", config.root_dir))?;

    // Fork before any runtime threads exist
    if !cli.foreground {
        daemonize()?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build async runtime")?;

    runtime.block_on(serve(config))?;
    Ok(ExitCode::SUCCESS)
}

/// Initialize logging with the specified default level
fn init_logging(level: &str) -> Result<()> {
    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => tracing_subscriber::EnvFilter::try_new(format!(
            "ipcserviced={level},ipcservice_core={level}"
        ))?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}

/// `-T`: validate the configuration and report where it came from
fn test_config(config: &IpcConfig) -> Result<ExitCode> {
    config.validate()?;

    if config.root_dir.exists() {
        config
            .env()
            .with_context(|| format!("Root directory {:?} is not usable", config.root_dir))?;
    }

    let file = config
        .config_file_path
        .as_ref()
        .map_or_else(|| "(none)".to_string(), |p| p.display().to_string());
    println!("ipcserviced: configuration file {file} syntax is ok");
    println!(
        "ipcserviced: source {}, root {}, service {}",
        config.source(),
        config.root_dir.display(),
        config.service_name
    );
    Ok(ExitCode::SUCCESS)
}

/// `-R`: send a control option to the running daemon and print its reply
fn runtime_control(config: &IpcConfig, option: &str) -> Result<ExitCode> {
    let env = config.env()?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build async runtime")?;

    let reply = runtime
        .block_on(exchange(
            &env,
            &config.service_name,
            RUNTIME_CONTROL_CODE,
            option.as_bytes(),
            config.connect_timeout,
        ))
        .with_context(|| format!("Cannot reach daemon service {:?}", config.service_name))?;

    let reply: ControlReply =
        serde_json::from_slice(&reply).context("Malformed runtime control reply")?;

    match reply.status {
        Some(ref status) => println!("{}", serde_json::to_string_pretty(status)?),
        None => println!("{}", reply.message),
    }

    if reply.ok {
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!("ipcserviced: {}", reply.message);
        Ok(ExitCode::FAILURE)
    }
}

/// Daemonize the process (fork to background)
fn daemonize() -> Result<()> {
    use nix::unistd::{fork, setsid, ForkResult};

    // First fork
    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => std::process::exit(0),
        Ok(ForkResult::Child) => {}
        Err(e) => anyhow::bail!("First fork failed: {e}"),
    }

    setsid().context("setsid failed")?;

    // Second fork (prevent acquiring controlling terminal)
    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => std::process::exit(0),
        Ok(ForkResult::Child) => {}
        Err(e) => anyhow::bail!("Second fork failed: {e}"),
    }

    std::env::set_current_dir("/").context("chdir to / failed")?;
    Ok(())
}

async fn serve(config: IpcConfig) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        "IPC service daemon starting"
    );

    let env = config.env()?;
    let service = Service::start(&env, &config.service_name)
        .await
        .context("Failed to start service")?;

    let mut server = EchoServer::new(service);
    let handle = server.shutdown_handle();

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
        }
        handle.shutdown();
    });

    let result = server.run().await;
    env.shutdown();

    match result {
        Ok(()) => {
            info!("IPC service daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}
