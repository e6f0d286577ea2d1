//! Timeouts, malformed input, and connection lifecycle.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use courier_core::Message;
use courier_services::{ChannelInfo, FailurePolicy};
use courierd::{transport, ExchangeError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::*;

/// One request, one reply, then the server closes the connection.
#[tokio::test]
async fn test_server_closes_after_one_reply() {
    let server = TestServer::echo().await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    let request = Message::text("once").with_owner("raw");
    transport::write_message(&mut stream, &request, DEADLINE).await.unwrap();
    let reply = transport::read_message(&mut stream, DEADLINE, 1 << 20).await.unwrap();
    assert_eq!(reply.body_text(), "once");

    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(DEADLINE, stream.read(&mut buf))
        .await
        .expect("server kept the connection open")
        .unwrap();
    assert_eq!(n, 0);

    server.stop().await;
}

/// A peer that accepts and never answers trips the client deadline.
#[tokio::test]
async fn test_silent_server_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let holder = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        drop(stream);
    });

    let settings = base_settings("client-a")
        .port(port)
        .timeout(Duration::from_millis(200));
    let err = client().send_text("anyone?", &settings).await.unwrap_err();
    assert!(matches!(err, ExchangeError::Timeout(_)), "got {err:?}");

    holder.abort();
}

/// Garbage gets no reply, and the server keeps serving.
#[tokio::test]
async fn test_malformed_frame_is_dropped() {
    let recorder = Arc::new(Recorder::default());
    let server = TestServer::start(recorder.clone(), FailurePolicy::Strict).await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
    let mut buf = [0u8; 64];
    let read = tokio::time::timeout(DEADLINE, stream.read(&mut buf))
        .await
        .expect("server kept the connection open");
    // Either a clean close or a reset; never a reply.
    if let Ok(n) = read {
        assert_eq!(n, 0);
    }

    recorder.wait_closed(1).await;
    assert_eq!(recorder.failures.lock().unwrap().len(), 1);
    assert!(recorder.requests().is_empty());

    let reply = client().send_text("still there?", &server.settings("client-b")).await.unwrap();
    assert_eq!(reply.body_text(), "still there?");

    server.stop().await;
}

/// A connection that never sends does not hold up other clients.
#[tokio::test]
async fn test_stalled_connection_does_not_block_others() {
    let server = TestServer::echo().await;
    let _stalled = TcpStream::connect(server.addr).await.unwrap();

    let reply = tokio::time::timeout(
        Duration::from_millis(500),
        client().send_text("next", &server.settings("client-c")),
    )
    .await
    .expect("exchange blocked behind a stalled connection")
    .unwrap();
    assert_eq!(reply.body_text(), "next");

    server.stop().await;
}

/// A handler failure reaches the client as a remote error.
#[tokio::test]
async fn test_handler_error_is_reported() {
    let handler = |_: &ChannelInfo, _req: Message| -> Result<Message> { bail!("disk on fire") };
    let server = TestServer::start(Arc::new(handler), FailurePolicy::Strict).await;

    let err = client().send_text("hi", &server.settings("client-d")).await.unwrap_err();
    match err {
        ExchangeError::Remote(msg) => assert!(msg.contains("disk on fire"), "got {msg}"),
        other => panic!("expected remote error, got {other:?}"),
    }

    server.stop().await;
}

/// Every accepted connection is opened and closed exactly once.
#[tokio::test]
async fn test_lifecycle_callbacks_pair_up() {
    let recorder = Recorder::replying("ok");
    let server = TestServer::start(recorder.clone(), FailurePolicy::Strict).await;
    let client = client();
    let settings = server.settings("client-e");

    client.handshake(&settings).await.unwrap();
    client.send_text("one", &settings).await.unwrap();
    client
        .send(Message::text(String::from_utf8(vec![b'x'; 2500]).unwrap()), &settings)
        .await
        .unwrap();

    // handshake + single shot + three fragments
    recorder.wait_closed(5).await;
    assert_eq!(recorder.opened.load(Ordering::SeqCst), 5);
    assert_eq!(recorder.closed.load(Ordering::SeqCst), 5);
    assert!(recorder.failures.lock().unwrap().is_empty());

    server.stop().await;
}

/// A server that is gone fails the send instead of hanging.
#[tokio::test]
async fn test_stopped_server_refuses() {
    let server = TestServer::echo().await;
    let settings = server.settings("client-f");
    server.stop().await;

    let err = client().send_text("hello?", &settings).await.unwrap_err();
    assert!(
        matches!(err, ExchangeError::Transport(_) | ExchangeError::Timeout(_)),
        "got {err:?}"
    );
}
