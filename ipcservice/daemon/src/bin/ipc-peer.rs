//! IPC Peer
//!
//! Counterpart process for exercising a driver over real process boundaries.
//! The peer starts its own service, answers `n`/`"<x>-ping"` with
//! `n + 100`/`"<x>-pong"` for a fixed number of requests, then turns around
//! and calls the driver's service with `101`/`"peer-ping"`, expecting
//! `201`/`"peer-pong"`.
//!
//! Exits with success only if every step completed before the deadline.
//!
//! ```bash
//! ipc-peer --root /tmp/ipc-test --name peer --driver driver
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use ipcservice_core::{IpcEnv, IpcSocket, Message, Received, Service};

/// Code the peer uses when calling the driver
const PEER_CODE: u32 = 101;

/// Delay between attempts to reach the driver
const RETRY_DELAY: Duration = Duration::from_millis(50);

/// IPC peer - answers pings, then pings back
#[derive(Parser, Debug)]
#[command(name = "ipc-peer")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Root directory shared with the driver
    #[arg(long, value_name = "DIR")]
    root: PathBuf,

    /// Name of the peer's own service
    #[arg(long, default_value = "peer")]
    name: String,

    /// Name of the driver's service to call back
    #[arg(long, default_value = "driver")]
    driver: String,

    /// Number of requests to answer before calling the driver
    #[arg(long, default_value_t = 3)]
    requests: usize,

    /// Overall deadline in seconds
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ipc_peer=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(args).await {
        Ok(()) => {
            info!("Peer finished");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Peer failed");
            eprintln!("ipc-peer: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(args.timeout_secs);

    let env = IpcEnv::init(&args.root)
        .with_context(|| format!("Cannot use root directory {:?}", args.root))?;

    let mut service = Service::start(&env, &args.name)
        .await
        .context("Failed to start peer service")?;
    info!(service = %args.name, "Peer service ready");

    answer_requests(&mut service, args.requests, deadline).await?;
    service.close();

    call_driver(env, args.driver, deadline).await
}

/// Reply to `count` ping requests
async fn answer_requests(service: &mut Service, count: usize, deadline: Instant) -> Result<()> {
    let mut answered = 0;

    while answered < count {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match service.recv(Some(remaining)).await? {
            Received::Message { client, message } => {
                debug!(client_id = %client.id(), %message, "Request");
                match pong(&message) {
                    Some(reply) => {
                        client.send(reply.code, &reply.data)?;
                        answered += 1;
                    }
                    None => warn!(%message, "Ignoring request that is not a ping"),
                }
                client.release();
            }
            Received::Disconnected(client) => {
                debug!(client_id = %client.id(), "Driver connection closed");
                client.release();
            }
            Received::Timeout => bail!("timed out after answering {answered} of {count} requests"),
            Received::Interrupted => {}
        }
    }

    info!(answered, "All requests answered");
    Ok(())
}

/// Build the pong for a `"<x>-ping"` request
fn pong(message: &Message) -> Option<Message> {
    let stem = message.text()?.strip_suffix("-ping")?;
    Some(Message::new(
        message.code.wrapping_add(100),
        format!("{stem}-pong"),
    ))
}

/// Call the driver's service and check its answer
async fn call_driver(env: IpcEnv, driver: String, deadline: Instant) -> Result<()> {
    let deadline = deadline.into_std();

    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut socket = loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            match IpcSocket::open(&env, &driver, remaining.min(Duration::from_secs(1))) {
                Ok(socket) => break socket,
                Err(e) if remaining > RETRY_DELAY => {
                    debug!(error = %e, "Driver not reachable yet");
                    std::thread::sleep(RETRY_DELAY);
                }
                Err(e) => return Err(e).context("Driver never became reachable"),
            }
        };

        socket.write(PEER_CODE, b"peer-ping")?;
        let reply = socket.read().context("No reply from driver")?;
        socket.close();

        let expected = Message::new(PEER_CODE + 100, "peer-pong");
        if reply != expected {
            bail!("unexpected reply from driver: {reply}");
        }
        info!(%reply, "Driver answered");
        Ok(())
    })
    .await?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pong_for_ping() {
        let reply = pong(&Message::new(2, "async-ping")).unwrap();
        assert_eq!(reply, Message::new(102, "async-pong"));
    }

    #[test]
    fn test_pong_ignores_other_payloads() {
        assert!(pong(&Message::new(1, "hello")).is_none());
        assert!(pong(&Message::new(1, vec![0xff, 0xfe])).is_none());
    }
}
