mod common;

use common::{multipart_body, multipart_content_type, FakeEngine, Harness};
use local_transcribe::error::SupervisorError;
use local_transcribe::{ServerState, ServerSupervisor, StatusEvent, SupervisorSettings};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn settings() -> SupervisorSettings {
    SupervisorSettings {
        port: 0,
        shutdown_timeout: Duration::from_secs(1),
        workers: 1,
    }
}

fn settings_with_grace(grace: Duration) -> SupervisorSettings {
    SupervisorSettings { shutdown_timeout: grace, ..settings() }
}

/// Write a raw request and collect whatever comes back until the server
/// closes the connection. A reset after the response counts as a close.
async fn exchange(addr: std::net::SocketAddr, request: Vec<u8>) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(&request).await.unwrap();

    let mut response = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
            Ok(Ok(n)) => response.extend_from_slice(&buf[..n]),
        }
    }
    String::from_utf8_lossy(&response).into_owned()
}

fn upload_request(audio: &[u8]) -> Vec<u8> {
    let body = multipart_body(&[("audio", audio)]);
    let mut request = format!(
        "POST /transcribe HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
        multipart_content_type(),
        body.len()
    )
    .into_bytes();
    request.extend_from_slice(&body);
    request
}

async fn get(addr: std::net::SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n", path);
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

#[actix_web::test]
async fn test_start_serve_stop() {
    let harness = Harness::new(FakeEngine::default());
    let supervisor = ServerSupervisor::new(harness.state.clone(), settings());
    assert_eq!(supervisor.state(), ServerState::Idle);

    supervisor.start(0).await.unwrap();
    assert_eq!(supervisor.state(), ServerState::Running);
    let addr = supervisor.local_addr().await.unwrap();
    assert!(addr.ip().is_loopback());

    let response = get(addr, "/health").await;
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.contains("\"state\":\"running\""));

    supervisor.stop().await;
    assert_eq!(supervisor.state(), ServerState::Idle);
    assert!(supervisor.local_addr().await.is_none());
}

#[actix_web::test]
async fn test_start_and_stop_are_idempotent() {
    let harness = Harness::new(FakeEngine::default());
    let supervisor = ServerSupervisor::new(harness.state.clone(), settings());

    supervisor.stop().await;
    assert_eq!(supervisor.state(), ServerState::Idle);

    supervisor.start(0).await.unwrap();
    let addr = supervisor.local_addr().await.unwrap();
    supervisor.start(0).await.unwrap();
    assert_eq!(supervisor.local_addr().await, Some(addr));
    assert_eq!(supervisor.state(), ServerState::Running);

    supervisor.stop().await;
    supervisor.stop().await;
    assert_eq!(supervisor.state(), ServerState::Idle);
}

#[actix_web::test]
async fn test_port_in_use_fails_with_bind_error() {
    let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = blocker.local_addr().unwrap().port();

    let harness = Harness::new(FakeEngine::default());
    let supervisor = ServerSupervisor::new(harness.state.clone(), settings());

    let err = supervisor.start(port).await.unwrap_err();
    assert!(matches!(err, SupervisorError::Bind { port: p, .. } if p == port));

    match supervisor.state() {
        ServerState::Failed(reason) => assert!(reason.contains(&port.to_string())),
        other => panic!("expected Failed, got {:?}", other),
    }
    assert!(supervisor.local_addr().await.is_none());

    // Retry succeeds once a free port is used
    supervisor.start(0).await.unwrap();
    assert_eq!(supervisor.state(), ServerState::Running);
    supervisor.stop().await;
}

#[actix_web::test]
async fn test_port_is_locked_while_running() {
    let harness = Harness::new(FakeEngine::default());
    let supervisor = ServerSupervisor::new(harness.state.clone(), settings());

    supervisor.set_port(4000).unwrap();
    assert_eq!(supervisor.port(), 4000);

    supervisor.start(0).await.unwrap();
    assert!(matches!(supervisor.set_port(5000), Err(SupervisorError::PortLocked { .. })));

    supervisor.stop().await;
    supervisor.set_port(5000).unwrap();
    assert_eq!(supervisor.port(), 5000);
}

#[actix_web::test]
async fn test_start_is_deferred_while_downloading() {
    let harness = Harness::new(FakeEngine::with_download_delay(300));
    let supervisor = ServerSupervisor::new(harness.state.clone(), settings());

    harness.state.lifecycle.prepare_in_background();
    for _ in 0..50 {
        if harness.state.lifecycle.is_downloading() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(harness.state.lifecycle.is_downloading());

    supervisor.start(0).await.unwrap();
    assert_eq!(supervisor.state(), ServerState::Idle);

    harness.state.lifecycle.ensure_ready().await.unwrap();
    supervisor.start(0).await.unwrap();
    assert_eq!(supervisor.state(), ServerState::Running);
    supervisor.stop().await;
}

#[actix_web::test]
async fn test_transitions_are_published_in_order() {
    let harness = Harness::new(FakeEngine::default());
    let mut events = harness.state.events.subscribe();
    let supervisor = ServerSupervisor::new(harness.state.clone(), settings());

    supervisor.start(0).await.unwrap();
    supervisor.stop().await;

    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let StatusEvent::Server(state) = event {
            states.push(state);
        }
    }
    assert_eq!(
        states,
        vec![ServerState::Starting, ServerState::Running, ServerState::Stopping, ServerState::Idle]
    );
}

#[actix_web::test]
async fn test_chunked_upload_over_limit_is_413() {
    let harness = Harness::with_limit(FakeEngine::default(), 64);
    let supervisor = ServerSupervisor::new(harness.state.clone(), settings());
    supervisor.start(0).await.unwrap();
    let addr = supervisor.local_addr().await.unwrap();

    // No Content-Length, so only the streaming byte count can catch it
    let body = multipart_body(&[("audio", &[7u8; 4096][..])]);
    let mut request = format!(
        "POST /transcribe HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\nContent-Type: {}\r\nTransfer-Encoding: chunked\r\n\r\n{:x}\r\n",
        multipart_content_type(),
        body.len()
    )
    .into_bytes();
    request.extend_from_slice(&body);
    request.extend_from_slice(b"\r\n0\r\n\r\n");

    let response = exchange(addr, request).await;
    assert!(response.starts_with("HTTP/1.1 413"), "{}", response);
    assert_eq!(harness.staged_files(), 0);
    assert_eq!(harness.engine.loads.load(Ordering::SeqCst), 0);

    supervisor.stop().await;
}

#[actix_web::test]
async fn test_stop_lets_in_flight_request_finish() {
    let harness = Harness::new(FakeEngine::with_download_delay(500));
    let supervisor = ServerSupervisor::new(harness.state.clone(), settings_with_grace(Duration::from_secs(5)));
    supervisor.start(0).await.unwrap();
    let addr = supervisor.local_addr().await.unwrap();

    let client = tokio::spawn(exchange(addr, upload_request(b"slow start")));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.engine.downloads.load(Ordering::SeqCst), 1);

    supervisor.stop().await;
    assert_eq!(supervisor.state(), ServerState::Idle);

    let response = client.await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.contains("slow start"));
    assert_eq!(harness.staged_files(), 0);
}

#[actix_web::test]
async fn test_event_stream_does_not_hold_up_stop() {
    let harness = Harness::new(FakeEngine::default());
    let supervisor = ServerSupervisor::new(harness.state.clone(), settings_with_grace(Duration::from_secs(10)));
    supervisor.start(0).await.unwrap();
    let addr = supervisor.local_addr().await.unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /api/v1/events HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    // Wait for the opening snapshot so the stream is known to be live
    let mut received = Vec::new();
    let mut buf = [0u8; 1024];
    while !String::from_utf8_lossy(&received).contains("event: download") {
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf)).await.unwrap().unwrap();
        assert!(n > 0, "event stream closed early");
        received.extend_from_slice(&buf[..n]);
    }

    let started = Instant::now();
    supervisor.stop().await;
    assert!(started.elapsed() < Duration::from_secs(5), "stop took {:?}", started.elapsed());
    assert_eq!(supervisor.state(), ServerState::Idle);

    let rest = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut received)).await;
    assert!(rest.is_ok(), "event stream stayed open after stop");
}
