//! Key exchange and sealed bodies.

use std::sync::Arc;
use std::time::Duration;

use courier_core::crypto::Keypair;
use courier_core::keystore::Identity;
use courier_core::{Message, MessageType};
use courier_services::{ChunkManager, FailurePolicy};
use courierd::{transport, ClientDispatcher, ExchangeError};
use tokio::net::TcpListener;

use crate::*;

/// The server files the client's key under its id and answers with its own.
#[tokio::test]
async fn test_handshake_exchanges_keys() {
    let server = TestServer::echo().await;
    let identity = Arc::new(Identity::ephemeral("client"));
    let client = ClientDispatcher::new(
        identity.clone(),
        FailurePolicy::Strict,
        Arc::new(ChunkManager::new(Duration::from_secs(60))),
    );
    let settings = server.settings("client-a");

    let server_key = client.handshake(&settings).await.unwrap();
    assert_eq!(server_key.public_key, server.identity.public_key());
    assert_eq!(server_key.signature, server.identity.signature());

    let stored = server.peer_keys.get("client-a").expect("client key not stored");
    assert_eq!(stored.public_key, identity.public_key());
    assert_eq!(stored.signature, identity.signature());
    assert!(client.peer_keys().get(&settings.endpoint()).is_some());

    server.stop().await;
}

/// After a handshake, sealed requests and replies still round-trip.
#[tokio::test]
async fn test_sealed_exchange_round_trips() {
    let server = TestServer::echo().await;
    let client = client();
    let settings = server.settings("client-b");

    client.handshake(&settings).await.unwrap();
    let reply = client.send_text("secret hello", &settings).await.unwrap();
    assert_eq!(reply.body_text(), "secret hello");

    let big = Message::new(MessageType::Text, payload(2500));
    let reply = client.send(big, &settings).await.unwrap();
    assert_eq!(&reply.body[..], &payload(2500)[..]);

    server.stop().await;
}

/// What actually crosses the wire after a handshake: the handshake itself
/// in the clear, then a body sealed to the server's key.
#[tokio::test]
async fn test_post_handshake_body_is_sealed_on_the_wire() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server_kp = Keypair::generate();
    let server_pk = server_kp.public_key_string();

    let fake_server = tokio::spawn(async move {
        // Handshake
        let (mut stream, _) = listener.accept().await.unwrap();
        let hs = transport::read_message(&mut stream, DEADLINE, 1 << 20).await.unwrap();
        assert_eq!(hs.kind, MessageType::HandShake);
        assert!(hs.signature.is_empty());
        assert_eq!(hs.owner_id, "client-c");
        let reply = Message::handshake("fake", &server_pk);
        transport::write_message(&mut stream, &reply, DEADLINE).await.unwrap();
        drop(stream);

        // Next request
        let (mut stream, _) = listener.accept().await.unwrap();
        let req = transport::read_message(&mut stream, DEADLINE, 1 << 20).await.unwrap();
        let reply = Message::text("ok");
        transport::write_message(&mut stream, &reply, DEADLINE).await.unwrap();
        req
    });

    let client = client();
    let settings = base_settings("client-c").port(port);
    client.handshake(&settings).await.unwrap();
    let reply = client.send_text("hello", &settings).await.unwrap();
    assert_eq!(reply.body_text(), "ok");

    let sealed = fake_server.await.unwrap();
    assert_eq!(sealed.signature, server_kp.public_key().signature());
    assert_ne!(&sealed.body[..], b"hello");
    assert_eq!(server_kp.open(&sealed.body).unwrap(), b"hello");
}

/// Without a handshake the body travels in the clear and still decodes.
#[tokio::test]
async fn test_no_handshake_means_plaintext() {
    let recorder = Recorder::replying("ok");
    let server = TestServer::start(recorder.clone(), FailurePolicy::Strict).await;

    client().send_text("plain", &server.settings("client-d")).await.unwrap();
    let requests = recorder.requests();
    assert_eq!(requests[0].body_text(), "plain");
    assert!(requests[0].signature.is_empty());

    server.stop().await;
}

/// A body sealed for some other key is refused by a strict server.
#[tokio::test]
async fn test_strict_server_rejects_foreign_key() {
    let server = TestServer::echo().await;
    let client = client();
    let settings = server.settings("client-e");
    client
        .peer_keys()
        .put(&settings.endpoint(), &Keypair::generate().public_key_string())
        .unwrap();

    let err = client.send_text("hello", &settings).await.unwrap_err();
    assert!(matches!(err, ExchangeError::Remote(_)), "got {err:?}");

    server.stop().await;
}

/// A lenient server passes the undecodable body on instead of failing.
#[tokio::test]
async fn test_lenient_server_passes_body_through() {
    let recorder = Recorder::replying("ok");
    let server = TestServer::start(recorder.clone(), FailurePolicy::Lenient).await;
    let client = client();
    let settings = server.settings("client-f");
    client
        .peer_keys()
        .put(&settings.endpoint(), &Keypair::generate().public_key_string())
        .unwrap();

    let reply = client.send_text("hello", &settings).await.unwrap();
    assert_eq!(reply.body_text(), "ok");

    let requests = recorder.requests();
    assert_eq!(requests.len(), 1);
    assert!(!requests[0].signature.is_empty(), "body should still be sealed");
    assert_ne!(&requests[0].body[..], b"hello");

    server.stop().await;
}
