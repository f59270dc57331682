//! Integration tests for services and client sockets
//!
//! Each test gets its own temporary root directory, so tests can run in
//! parallel without sharing socket files.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tempfile::TempDir;

use ipcservice_core::{
    exchange, AsyncSocket, Client, FlushStatus, IpcEnv, IpcError, IpcSocket, Message, Received,
    Service,
};

// =============================================================================
// Helpers
// =============================================================================

const WAIT: Duration = Duration::from_secs(5);

fn test_env() -> (TempDir, IpcEnv) {
    let dir = TempDir::new().unwrap();
    let env = IpcEnv::init(dir.path()).unwrap();
    (dir, env)
}

/// Receive the next message, failing on anything else
async fn next_message(service: &mut Service) -> (Client, Message) {
    match service.recv(Some(WAIT)).await.unwrap() {
        Received::Message { client, message } => (client, message),
        Received::Timeout => panic!("no message within {WAIT:?}"),
        other => panic!("unexpected {other:?}"),
    }
}

/// Receive until a disconnect arrives
async fn next_disconnect(service: &mut Service) -> Client {
    match service.recv(Some(WAIT)).await.unwrap() {
        Received::Disconnected(client) => client,
        other => panic!("expected disconnect, got {other:?}"),
    }
}

/// Answer `n`/"<x>-ping" with `n + 100`/"<x>-pong" until `count` replies are sent
async fn serve_pongs(mut service: Service, count: usize) -> Service {
    let mut answered = 0;
    while answered < count {
        match service.recv(Some(WAIT)).await.unwrap() {
            Received::Message { client, message } => {
                let text = String::from_utf8_lossy(&message.data).into_owned();
                let reply = text.replace("-ping", "-pong");
                client.send(message.code + 100, reply.as_bytes()).unwrap();
                client.release();
                answered += 1;
            }
            Received::Disconnected(client) => client.release(),
            Received::Timeout => panic!("no request within {WAIT:?}"),
            Received::Interrupted => {}
        }
    }
    service
}

// =============================================================================
// Request / Response
// =============================================================================

#[tokio::test]
async fn test_sync_socket_echo() {
    let (_dir, env) = test_env();
    let service = Service::start(&env, "sync").await.unwrap();
    let server = tokio::spawn(serve_pongs(service, 1));

    let client_env = env.clone();
    let reply = tokio::task::spawn_blocking(move || {
        let mut socket = IpcSocket::open(&client_env, "sync", Duration::from_secs(1)).unwrap();
        socket.write(1, b"sync-ping").unwrap();
        let reply = socket.read().unwrap();
        socket.close();
        reply
    })
    .await
    .unwrap();

    assert_eq!(reply, Message::new(101, "sync-pong"));
    server.await.unwrap();
}

#[tokio::test]
async fn test_async_socket_send_flush_recv() {
    let (_dir, env) = test_env();
    let service = Service::start(&env, "async").await.unwrap();
    let server = tokio::spawn(serve_pongs(service, 1));

    let mut socket = AsyncSocket::open(&env, "async", Duration::from_secs(1))
        .await
        .unwrap();
    socket.send(2, b"async-ping").unwrap();
    assert!(socket.check_unsent());

    assert_eq!(socket.flush(WAIT).await.unwrap(), FlushStatus::Flushed);
    assert!(!socket.check_unsent());

    let reply = socket.recv(WAIT).await.unwrap();
    assert_eq!(reply, Some(Message::new(102, "async-pong")));
    assert!(socket.connected());

    socket.close();
    server.await.unwrap();
}

#[tokio::test]
async fn test_exchange_one_shot() {
    let (_dir, env) = test_env();
    let service = Service::start(&env, "exchange").await.unwrap();
    let server = tokio::spawn(serve_pongs(service, 1));

    let reply = exchange(&env, "exchange", 3, b"exchange-ping", WAIT)
        .await
        .unwrap();
    assert_eq!(reply, b"exchange-pong");

    server.await.unwrap();
}

#[tokio::test]
async fn test_many_concurrent_clients() {
    let (_dir, env) = test_env();
    let service = Service::start(&env, "busy").await.unwrap();
    let server = tokio::spawn(serve_pongs(service, 16));

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..16u32 {
        let env = env.clone();
        tasks.spawn(async move {
            let payload = format!("c{i}-ping");
            let reply = exchange(&env, "busy", i, payload.as_bytes(), WAIT)
                .await
                .unwrap();
            assert_eq!(reply, format!("c{i}-pong").into_bytes());
        });
    }
    while let Some(result) = tasks.join_next().await {
        result.unwrap();
    }

    server.await.unwrap();
}

// =============================================================================
// Receive Loop
// =============================================================================

#[tokio::test]
async fn test_zero_timeout_receive_is_repeatable() {
    let (_dir, env) = test_env();
    let mut service = Service::start(&env, "idle").await.unwrap();

    for _ in 0..10 {
        let received = service.recv(Some(Duration::ZERO)).await.unwrap();
        assert!(received.is_timeout());
    }
}

#[tokio::test]
async fn test_alert_from_another_thread() {
    let (_dir, env) = test_env();
    let mut service = Service::start(&env, "wake").await.unwrap();

    let alerter = service.alerter();
    let fired = Arc::new(AtomicBool::new(false));
    let fired_clone = Arc::clone(&fired);
    let thread = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        fired_clone.store(true, Ordering::SeqCst);
        alerter.alert();
    });

    let received = service.recv(Some(Duration::from_secs(30))).await.unwrap();
    assert!(matches!(received, Received::Interrupted));
    assert!(fired.load(Ordering::SeqCst));
    thread.join().unwrap();
}

#[tokio::test]
async fn test_disconnect_is_reported_once() {
    let (_dir, env) = test_env();
    let mut service = Service::start(&env, "leaving").await.unwrap();

    let mut socket = AsyncSocket::open(&env, "leaving", WAIT).await.unwrap();
    socket.send(4, b"hello").unwrap();
    socket.flush(WAIT).await.unwrap();

    let (client, _) = next_message(&mut service).await;
    let id = client.id();
    client.release();

    socket.close();
    let gone = next_disconnect(&mut service).await;
    assert_eq!(gone.id(), id);
    assert!(!gone.is_connected());
    assert!(service.lookup(id).is_none());

    let received = service.recv(Some(Duration::from_millis(50))).await.unwrap();
    assert!(received.is_timeout());
}

// =============================================================================
// Reference Counting
// =============================================================================

#[tokio::test]
async fn test_release_reclaims_only_at_zero_after_close() {
    let (_dir, env) = test_env();
    let mut service = Service::start(&env, "refs").await.unwrap();

    let mut socket = AsyncSocket::open(&env, "refs", WAIT).await.unwrap();
    socket.send(5, b"refs").unwrap();
    socket.flush(WAIT).await.unwrap();

    let (client, _) = next_message(&mut service).await;
    let weak = client.downgrade();

    let extra: Vec<Client> = (0..3).map(|_| client.addref()).collect();
    assert_eq!(client.ref_count(), 5);

    // Releasing everything while connected leaves the registry's reference
    for handle in extra {
        handle.release();
    }
    client.release();
    assert!(!weak.is_reclaimed());

    let client = service.lookup(weak.id()).unwrap();
    let held = client.addref();
    client.close();
    assert!(!held.is_connected());
    assert!(service.lookup(weak.id()).is_none());

    // One too few: still alive
    client.release();
    assert!(!weak.is_reclaimed());

    // Exact count: reclaimed
    held.release();
    assert!(weak.is_reclaimed());
}

#[tokio::test]
async fn test_handles_outlive_service_close() {
    let (_dir, env) = test_env();
    let mut service = Service::start(&env, "closing").await.unwrap();

    let mut socket = AsyncSocket::open(&env, "closing", WAIT).await.unwrap();
    socket.send(6, b"x").unwrap();
    socket.flush(WAIT).await.unwrap();

    let (client, _) = next_message(&mut service).await;
    client.set_userdata(42u32);
    let id = client.id();

    service.close();
    service.close();

    assert!(service.lookup(id).is_none());
    assert!(!client.is_connected());
    assert_eq!(client.userdata::<u32>().as_deref(), Some(&42));
    assert!(matches!(client.send(1, b"late"), Err(IpcError::ClientGone(_))));

    let weak = client.downgrade();
    client.release();
    assert!(weak.is_reclaimed());

    // Peer sees the close
    let result = socket.recv(WAIT).await;
    assert!(matches!(result, Err(IpcError::ConnectionClosed)));
}

// =============================================================================
// Isolation and Flow Control
// =============================================================================

#[tokio::test]
async fn test_two_services_share_no_clients() {
    let (_dir, env) = test_env();
    let mut first = Service::start(&env, "first").await.unwrap();
    let mut second = Service::start(&env, "second").await.unwrap();

    let mut a = AsyncSocket::open(&env, "first", WAIT).await.unwrap();
    let mut b = AsyncSocket::open(&env, "second", WAIT).await.unwrap();
    a.send(1, b"to-first").unwrap();
    b.send(2, b"to-second").unwrap();
    a.flush(WAIT).await.unwrap();
    b.flush(WAIT).await.unwrap();

    let (client_a, msg_a) = next_message(&mut first).await;
    let (client_b, msg_b) = next_message(&mut second).await;

    assert_eq!(msg_a.data, b"to-first");
    assert_eq!(msg_b.data, b"to-second");
    assert!(first.lookup(client_b.id()).is_none());
    assert!(second.lookup(client_a.id()).is_none());
    assert_eq!(first.client_count(), 1);
    assert_eq!(second.client_count(), 1);
}

#[tokio::test]
async fn test_zero_deadline_flush_against_stalled_service() {
    let (_dir, env) = test_env();
    let mut service = Service::start(&env, "stalled").await.unwrap();

    let mut socket = AsyncSocket::open(&env, "stalled", WAIT).await.unwrap();
    let big = vec![0xa5; 4 * 1024 * 1024];
    socket.send(8, &big).unwrap();

    // Nobody is receiving on the service side yet
    for _ in 0..3 {
        assert_eq!(
            socket.flush(Duration::ZERO).await.unwrap(),
            FlushStatus::TimedOut
        );
        assert!(socket.check_unsent());
    }

    let flusher = tokio::spawn(async move {
        let status = socket.flush(Duration::from_secs(30)).await.unwrap();
        (socket, status)
    });

    let (_client, message) = next_message(&mut service).await;
    assert_eq!(message.code, 8);
    assert_eq!(message.data.len(), big.len());

    let (socket, status) = flusher.await.unwrap();
    assert_eq!(status, FlushStatus::Flushed);
    assert!(!socket.check_unsent());
}

#[tokio::test]
async fn test_start_on_busy_name_fails_with_bind_error() {
    let (_dir, env) = test_env();
    let _service = Service::start(&env, "taken").await.unwrap();

    let result = Service::start(&env, "taken").await;
    assert!(matches!(result, Err(IpcError::Bind { .. })));
}

#[tokio::test]
async fn test_open_missing_service_fails_with_connect_error() {
    let (_dir, env) = test_env();

    let result = AsyncSocket::open(&env, "missing", Duration::from_millis(100)).await;
    assert!(matches!(result, Err(IpcError::Connect { .. })));

    let sync_env = env.clone();
    let result = tokio::task::spawn_blocking(move || {
        IpcSocket::open(&sync_env, "missing", Duration::from_millis(100)).map(|_| ())
    })
    .await
    .unwrap();
    assert!(matches!(result, Err(IpcError::Connect { .. })));
}
