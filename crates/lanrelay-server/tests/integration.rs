//! End-to-end tests: real listener, real `WebSocket` clients.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use lanrelay_server::{RelayServer, ServerConfig, ServerState};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const TIMEOUT: Duration = Duration::from_secs(5);

fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        shutdown_grace_ms: 2_000,
        ..ServerConfig::default()
    }
}

async fn boot(config: ServerConfig) -> (Arc<RelayServer>, SocketAddr) {
    let server = Arc::new(RelayServer::new(config));
    let (addr, _handle) = server.listen().await.expect("listen");
    (server, addr)
}

async fn connect(addr: SocketAddr, path: &str) -> Client {
    let (ws, _) = connect_async(format!("ws://{addr}{path}"))
        .await
        .expect("connect");
    ws
}

/// Poll until the registry holds exactly `n` sessions.
async fn wait_for_size(server: &RelayServer, n: usize) {
    let deadline = Instant::now() + TIMEOUT;
    while server.registry().size() != n {
        assert!(
            Instant::now() < deadline,
            "registry size stuck at {} (wanted {n})",
            server.registry().size()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Connect `n` clients and wait until all of them are admitted.
async fn connect_many(server: &RelayServer, addr: SocketAddr, n: usize) -> Vec<Client> {
    let before = server.registry().size();
    let clients = futures::future::join_all((0..n).map(|_| connect(addr, "/"))).await;
    wait_for_size(server, before + n).await;
    clients
}

/// Next text frame, skipping control frames.
async fn next_text(ws: &mut Client) -> String {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for text frame")
            .expect("stream ended")
            .expect("read error");
        match msg {
            Message::Text(text) => return text.as_str().to_owned(),
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Assert no text frame arrives within `wait`.
async fn assert_silent(ws: &mut Client, wait: Duration) {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        match tokio::time::timeout_at(deadline, ws.next()).await {
            Err(_) => return,
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => {}
            Ok(other) => panic!("expected silence, got {other:?}"),
        }
    }
}

/// Read until the server's Close frame (or the end of the stream).
async fn expect_close(ws: &mut Client) -> Option<u16> {
    loop {
        let next = timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for close");
        match next {
            Some(Ok(Message::Close(frame))) => return frame.map(|f| u16::from(f.code)),
            Some(Ok(_)) => {}
            Some(Err(_)) | None => return None,
        }
    }
}

// ── Admission ──

#[tokio::test]
async fn concurrent_admissions_are_all_registered() {
    let (server, addr) = boot(test_config()).await;
    let mut clients = connect_many(&server, addr, 50).await;
    assert_eq!(server.registry().size(), 50);

    clients[0].send(Message::text("hello all")).await.unwrap();
    for ws in &mut clients {
        assert_eq!(next_text(ws).await, "hello all");
    }

    server.stop().await;
}

#[tokio::test]
async fn custom_path_accepts_upgrades() {
    let config = ServerConfig {
        path: "/relay".into(),
        ..test_config()
    };
    let (server, addr) = boot(config).await;
    let _ws = connect(addr, "/relay").await;
    wait_for_size(&server, 1).await;

    assert!(connect_async(format!("ws://{addr}/")).await.is_err());
    server.stop().await;
}

// ── Relay ──

#[tokio::test]
async fn text_frame_fans_out_to_every_client_including_sender() {
    let (server, addr) = boot(test_config()).await;
    let mut clients = connect_many(&server, addr, 3).await;

    clients[0].send(Message::text("hello")).await.unwrap();
    for ws in &mut clients {
        assert_eq!(next_text(ws).await, "hello");
    }
    // Exactly one copy each.
    for ws in &mut clients {
        assert_silent(ws, Duration::from_millis(100)).await;
    }

    server.stop().await;
}

#[tokio::test]
async fn payload_is_relayed_verbatim() {
    let (server, addr) = boot(test_config()).await;
    let mut clients = connect_many(&server, addr, 2).await;

    let payload = r#"{"type":"chat","body":"héllo  ✓ ","n":1}"#;
    clients[1].send(Message::text(payload)).await.unwrap();
    assert_eq!(next_text(&mut clients[0]).await, payload);

    clients[1].send(Message::text("")).await.unwrap();
    assert_eq!(next_text(&mut clients[0]).await, "");

    server.stop().await;
}

#[tokio::test]
async fn messages_from_one_sender_arrive_in_order() {
    let (server, addr) = boot(test_config()).await;
    let mut clients = connect_many(&server, addr, 2).await;

    for i in 0..50 {
        clients[0].send(Message::text(format!("m{i}"))).await.unwrap();
    }
    for i in 0..50 {
        assert_eq!(next_text(&mut clients[1]).await, format!("m{i}"));
    }

    server.stop().await;
}

#[tokio::test]
async fn concurrent_senders_deliver_every_message_once_in_sender_order() {
    const PER_SENDER: usize = 100;
    let (server, addr) = boot(test_config()).await;
    let clients = connect_many(&server, addr, 3).await;
    let mut clients = clients.into_iter();
    let (a, b, observer) = (
        clients.next().unwrap(),
        clients.next().unwrap(),
        clients.next().unwrap(),
    );

    let sender = |mut ws: Client, tag: &'static str| {
        tokio::spawn(async move {
            for i in 0..PER_SENDER {
                ws.send(Message::text(format!("{tag}-{i}"))).await.unwrap();
            }
            collect(&mut ws, 2 * PER_SENDER).await
        })
    };
    let a = sender(a, "a");
    let b = sender(b, "b");
    let observer = tokio::spawn(async move {
        let mut ws = observer;
        collect(&mut ws, 2 * PER_SENDER).await
    });

    for handle in [a, b, observer] {
        let seen = handle.await.unwrap();
        for tag in ["a", "b"] {
            let expected: Vec<String> = (0..PER_SENDER).map(|i| format!("{tag}-{i}")).collect();
            assert_eq!(seen[tag], expected, "sender {tag} out of order or incomplete");
        }
    }

    server.stop().await;
}

/// Read `n` text frames and bucket them by sender tag.
async fn collect(ws: &mut Client, n: usize) -> HashMap<&'static str, Vec<String>> {
    let mut seen: HashMap<&'static str, Vec<String>> = HashMap::new();
    for _ in 0..n {
        let text = next_text(ws).await;
        let tag = if text.starts_with("a-") { "a" } else { "b" };
        seen.entry(tag).or_default().push(text);
    }
    seen
}

#[tokio::test]
async fn binary_frames_are_ignored() {
    let (server, addr) = boot(test_config()).await;
    let mut clients = connect_many(&server, addr, 2).await;

    clients[0]
        .send(Message::binary(vec![0_u8, 1, 2, 3]))
        .await
        .unwrap();
    clients[0].send(Message::text("after binary")).await.unwrap();

    // The text frame is the first thing anyone sees.
    assert_eq!(next_text(&mut clients[1]).await, "after binary");
    assert_eq!(next_text(&mut clients[0]).await, "after binary");
    assert_eq!(server.registry().size(), 2);

    server.stop().await;
}

#[tokio::test]
async fn sender_is_excluded_when_echo_disabled() {
    let config = ServerConfig {
        echo_to_sender: false,
        ..test_config()
    };
    let (server, addr) = boot(config).await;
    let mut clients = connect_many(&server, addr, 3).await;

    clients[0].send(Message::text("not for me")).await.unwrap();
    assert_eq!(next_text(&mut clients[1]).await, "not for me");
    assert_eq!(next_text(&mut clients[2]).await, "not for me");
    assert_silent(&mut clients[0], Duration::from_millis(200)).await;

    server.stop().await;
}

// ── Failure isolation ──

#[tokio::test]
async fn abrupt_disconnect_retires_only_that_session() {
    let (server, addr) = boot(test_config()).await;
    let mut clients = connect_many(&server, addr, 3).await;

    // Drop the TCP stream without a Close frame.
    drop(clients.remove(1));
    wait_for_size(&server, 2).await;

    clients[0].send(Message::text("still here")).await.unwrap();
    for ws in &mut clients {
        assert_eq!(next_text(ws).await, "still here");
    }

    server.stop().await;
}

#[tokio::test]
async fn abrupt_disconnect_mid_broadcast_is_isolated() {
    const COUNT: usize = 200;
    let (server, addr) = boot(test_config()).await;
    let clients = connect_many(&server, addr, 3).await;
    let mut clients = clients.into_iter();
    let (a, mut b, mut c) = (
        clients.next().unwrap(),
        clients.next().unwrap(),
        clients.next().unwrap(),
    );

    let (mut a_tx, mut a_rx) = a.split();
    let sender = tokio::spawn(async move {
        for i in 0..COUNT {
            a_tx.send(Message::text(format!("m{i}"))).await.unwrap();
            if i % 20 == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
        a_tx
    });

    // B reads part of the stream, then vanishes without a Close frame.
    for _ in 0..10 {
        let _ = next_text(&mut b).await;
    }
    drop(b);

    for i in 0..COUNT {
        assert_eq!(next_text(&mut c).await, format!("m{i}"));
    }
    let mut a_tx = sender.await.unwrap();
    wait_for_size(&server, 2).await;

    // The sender saw its whole stream too, with no error.
    for i in 0..COUNT {
        let msg = timeout(TIMEOUT, a_rx.next()).await.unwrap().unwrap().unwrap();
        assert_eq!(msg.to_text().unwrap(), format!("m{i}"));
    }
    a_tx.send(Message::text("after")).await.unwrap();
    assert_eq!(next_text(&mut c).await, "after");
    assert_eq!(server.registry().size(), 2);

    server.stop().await;
}

#[tokio::test]
async fn client_close_frame_retires_session() {
    let (server, addr) = boot(test_config()).await;
    let mut clients = connect_many(&server, addr, 2).await;

    clients[0].close(None).await.unwrap();
    wait_for_size(&server, 1).await;

    clients[1].send(Message::text("solo")).await.unwrap();
    assert_eq!(next_text(&mut clients[1]).await, "solo");

    server.stop().await;
}

#[tokio::test]
async fn oversized_message_closes_sender_and_is_not_relayed() {
    let config = ServerConfig {
        max_message_size: Some(16),
        ..test_config()
    };
    let (server, addr) = boot(config).await;
    let mut clients = connect_many(&server, addr, 2).await;

    clients[0].send(Message::text("x".repeat(64))).await.unwrap();
    wait_for_size(&server, 1).await;
    assert_silent(&mut clients[1], Duration::from_millis(100)).await;

    clients[1].send(Message::text("small")).await.unwrap();
    assert_eq!(next_text(&mut clients[1]).await, "small");

    server.stop().await;
}

// ── Keep-alive ──

#[tokio::test]
async fn silent_client_is_retired_after_idle_timeout() {
    let config = ServerConfig {
        ping_interval_ms: 100,
        idle_timeout_ms: 150,
        ..test_config()
    };
    let (server, addr) = boot(config).await;

    // Never polled, so it never answers a Ping.
    let _silent = connect(addr, "/").await;
    wait_for_size(&server, 1).await;

    // A client that keeps reading answers Pings automatically.
    let mut responsive = connect(addr, "/").await;
    wait_for_size(&server, 2).await;
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = responsive.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    });

    wait_for_size(&server, 1).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(server.registry().size(), 1);

    server.stop().await;
    let _ = timeout(TIMEOUT, reader).await;
}

// ── Lifecycle ──

#[tokio::test]
async fn stop_closes_all_sessions_within_grace() {
    let (server, addr) = boot(test_config()).await;
    let mut clients = connect_many(&server, addr, 10).await;

    let started = Instant::now();
    server.stop().await;
    assert!(started.elapsed() < Duration::from_millis(2_500));

    assert_eq!(server.state(), ServerState::Stopped);
    assert!(server.registry().is_empty());
    assert!(server.local_addr().is_none());

    for ws in &mut clients {
        if let Some(code) = expect_close(ws).await {
            assert_eq!(code, 1001);
        }
    }
    assert!(connect_async(format!("ws://{addr}/")).await.is_err());
}

#[tokio::test]
async fn stop_drains_clients_exchanging_messages() {
    let (server, addr) = boot(test_config()).await;
    let clients = connect_many(&server, addr, 10).await;
    let received = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicBool::new(false));

    let tasks: Vec<_> = clients
        .into_iter()
        .enumerate()
        .map(|(n, ws)| {
            let received = Arc::clone(&received);
            let done = Arc::clone(&done);
            tokio::spawn(async move {
                let (mut tx, mut rx) = ws.split();
                let writer = async {
                    let mut i = 0_u64;
                    while !done.load(Ordering::Relaxed) {
                        if tx.send(Message::text(format!("c{n}-{i}"))).await.is_err() {
                            break;
                        }
                        i += 1;
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                };
                let reader = async {
                    while let Some(Ok(msg)) = rx.next().await {
                        match msg {
                            Message::Text(_) => {
                                let _ = received.fetch_add(1, Ordering::Relaxed);
                            }
                            Message::Close(_) => break,
                            _ => {}
                        }
                    }
                    done.store(true, Ordering::Relaxed);
                };
                let ((), ()) = tokio::join!(writer, reader);
            })
        })
        .collect();

    // Let traffic flow before stopping.
    let deadline = Instant::now() + TIMEOUT;
    while received.load(Ordering::Relaxed) < 500 {
        assert!(Instant::now() < deadline, "relay traffic never picked up");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let started = Instant::now();
    server.stop().await;
    assert!(started.elapsed() < Duration::from_millis(2_500));
    assert_eq!(server.state(), ServerState::Stopped);
    assert!(server.registry().is_empty());
    assert!(connect_async(format!("ws://{addr}/")).await.is_err());

    for task in tasks {
        timeout(TIMEOUT, task)
            .await
            .expect("client did not observe shutdown")
            .unwrap();
    }
}

#[tokio::test]
async fn stop_force_closes_connection_that_cannot_drain() {
    const FRAMES: usize = 400;
    let config = ServerConfig {
        shutdown_grace_ms: 200,
        // Far beyond the grace period: teardown alone would wait this long.
        close_timeout_ms: 30_000,
        ..test_config()
    };
    let (server, addr) = boot(config).await;
    let mut ws = connect(addr, "/").await;
    wait_for_size(&server, 1).await;

    // Echoes pile up in the socket because this client never reads, so the
    // session's writer blocks and its teardown cannot finish.
    let frame = "x".repeat(64 * 1024);
    for _ in 0..FRAMES {
        ws.send(Message::text(frame.as_str())).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    let started = Instant::now();
    server.stop().await;
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(server.registry().is_empty());

    // The connection was dropped, not closed: the stream ends early and
    // without a Close frame.
    let mut echoed = 0;
    let mut saw_close = false;
    loop {
        match timeout(TIMEOUT, ws.next()).await.expect("stream never ended") {
            Some(Ok(Message::Text(_))) => echoed += 1,
            Some(Ok(Message::Close(_))) => saw_close = true,
            Some(Ok(_)) => {}
            Some(Err(_)) | None => break,
        }
    }
    assert!(echoed < FRAMES, "all {echoed} echoes delivered");
    assert!(!saw_close);
}

#[tokio::test]
async fn stop_is_idempotent() {
    let (server, addr) = boot(test_config()).await;
    let _clients = connect_many(&server, addr, 2).await;

    server.stop().await;
    server.stop().await;
    assert_eq!(server.state(), ServerState::Stopped);
    assert!(server.registry().is_empty());
}

#[tokio::test]
async fn start_returns_after_stop_from_another_task() {
    let server = Arc::new(RelayServer::new(test_config()));
    let runner = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.start().await })
    };

    let deadline = Instant::now() + TIMEOUT;
    let addr = loop {
        if let Some(addr) = server.local_addr() {
            break addr;
        }
        assert!(Instant::now() < deadline, "server never started");
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    let _ws = connect(addr, "/").await;
    wait_for_size(&server, 1).await;

    server.stop().await;
    let result = timeout(TIMEOUT, runner)
        .await
        .expect("start() did not return")
        .expect("join");
    assert!(result.is_ok());
}

#[tokio::test]
async fn server_relays_again_after_restart() {
    let (server, addr) = boot(test_config()).await;
    let _old = connect_many(&server, addr, 2).await;
    server.stop().await;

    let (addr, _handle) = server.listen().await.expect("restart");
    let mut clients = connect_many(&server, addr, 2).await;
    assert_eq!(server.registry().size(), 2);

    clients[0].send(Message::text("second life")).await.unwrap();
    for ws in &mut clients {
        assert_eq!(next_text(ws).await, "second life");
    }

    server.stop().await;
}
