//! Cross-process tests against the `ipc-peer` binary
//!
//! The test acts as the driver: it calls the peer with the synchronous socket,
//! the asynchronous socket and exchange, then answers the peer's own call.

use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use tempfile::TempDir;

use ipcservice_core::{exchange, AsyncSocket, FlushStatus, IpcEnv, IpcSocket, Message, Received, Service};

const WAIT: Duration = Duration::from_secs(10);

fn spawn_peer(root: &std::path::Path) -> Child {
    Command::new(env!("CARGO_BIN_EXE_ipc-peer"))
        .arg("--root")
        .arg(root)
        .args(["--name", "peer", "--driver", "driver", "--requests", "3"])
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .spawn()
        .unwrap()
}

/// Keep trying to open the peer's service until it is up
fn open_when_ready(env: &IpcEnv, name: &str) -> IpcSocket {
    let deadline = Instant::now() + WAIT;
    loop {
        match IpcSocket::open(env, name, Duration::from_millis(200)) {
            Ok(socket) => return socket,
            Err(e) => {
                assert!(Instant::now() < deadline, "peer never came up: {e}");
                std::thread::sleep(Duration::from_millis(20));
            }
        }
    }
}

fn wait_for_exit(child: &mut Child) -> std::process::ExitStatus {
    let deadline = Instant::now() + WAIT;
    loop {
        if let Some(status) = child.try_wait().unwrap() {
            return status;
        }
        if Instant::now() > deadline {
            child.kill().ok();
            panic!("peer did not exit");
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_driver_and_peer_round_trips() {
    let dir = TempDir::new().unwrap();
    let env = IpcEnv::init(dir.path()).unwrap();

    let mut driver = Service::start(&env, "driver").await.unwrap();
    let mut peer = spawn_peer(dir.path());

    // Synchronous socket
    let sync_env = env.clone();
    let reply = tokio::task::spawn_blocking(move || {
        let mut socket = open_when_ready(&sync_env, "peer");
        socket.write(1, b"sync-ping").unwrap();
        socket.read().unwrap()
    })
    .await
    .unwrap();
    assert_eq!(reply, Message::new(101, "sync-pong"));

    // Asynchronous socket
    let mut socket = AsyncSocket::open(&env, "peer", WAIT).await.unwrap();
    socket.send(2, b"async-ping").unwrap();
    assert_eq!(socket.flush(WAIT).await.unwrap(), FlushStatus::Flushed);
    assert_eq!(
        socket.recv(WAIT).await.unwrap(),
        Some(Message::new(102, "async-pong"))
    );
    socket.close();

    // Exchange
    let reply = exchange(&env, "peer", 3, b"exchange-ping", WAIT).await.unwrap();
    assert_eq!(reply, b"exchange-pong");

    // The peer now calls us
    let (client, message) = loop {
        match driver.recv(Some(WAIT)).await.unwrap() {
            Received::Message { client, message } => break (client, message),
            Received::Disconnected(client) => client.release(),
            other => panic!("peer never called back: {other:?}"),
        }
    };
    assert_eq!(message, Message::new(101, "peer-ping"));
    client.send(201, b"peer-pong").unwrap();
    client.release();

    let status = tokio::task::spawn_blocking(move || wait_for_exit(&mut peer))
        .await
        .unwrap();
    assert!(status.success(), "peer exited with {status}");

    driver.close();
}

#[test]
fn test_peer_fails_without_root() {
    let dir = TempDir::new().unwrap();
    let status = Command::new(env!("CARGO_BIN_EXE_ipc-peer"))
        .arg("--root")
        .arg(dir.path().join("missing"))
        .stderr(Stdio::null())
        .status()
        .unwrap();
    assert!(!status.success());
}
