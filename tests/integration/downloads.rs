//! Server-published downloads pulled range by range.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use courier_core::message::keys;
use courier_core::{Message, MessageType};
use courier_services::{ChannelInfo, FailurePolicy, RequestHandler};
use courierd::ExchangeError;

use crate::*;

/// Publishes a fixed file for every request and counts connections.
struct FilePublisher {
    path: std::path::PathBuf,
    recorder: Arc<Recorder>,
}

impl RequestHandler for FilePublisher {
    fn handle(&self, channel: &ChannelInfo, request: Message) -> Result<Message> {
        self.recorder.requests.lock().unwrap().push(request);
        Ok(channel.chunks.offer_file(&self.path)?)
    }

    fn on_open(&self, channel: &ChannelInfo) {
        self.recorder.on_open(channel);
    }

    fn on_close(&self, channel: &ChannelInfo, failure: Option<&str>) {
        self.recorder.on_close(channel, failure);
    }
}

/// A 2500-byte file comes back as three ranges on three connections.
#[tokio::test]
async fn test_file_offer_is_downloaded_in_ranges() {
    let dir = temp_dir("offer-file");
    let path = dir.join("report.bin");
    std::fs::write(&path, payload(2500)).unwrap();

    let recorder = Arc::new(Recorder::default());
    let handler = Arc::new(FilePublisher {
        path: path.clone(),
        recorder: recorder.clone(),
    });
    let server = TestServer::start(handler, FailurePolicy::Strict).await;
    let client = client();

    let reply = client.send_text("give me the report", &server.settings("client-a")).await.unwrap();
    assert_eq!(reply.kind, MessageType::File);
    assert_eq!(reply.headers.file_name(), Some("report.bin"));
    assert_eq!(reply.body.len(), 2500);
    assert_eq!(&reply.body[..], &payload(2500)[..]);

    recorder.wait_closed(4).await;
    assert_eq!(recorder.requests().len(), 1, "range requests never reach the handler");
    assert_eq!(recorder.opened.load(Ordering::SeqCst), 4);
    assert_eq!(client.chunks().pending_groups(), 0);

    server.stop().await;
    let _ = std::fs::remove_dir_all(&dir);
}

/// The same offer can be pulled twice by one client.
#[tokio::test]
async fn test_repeated_download_of_same_source() {
    let body = Bytes::from(payload(1800));
    let published = body.clone();
    let seen = Arc::new(std::sync::Mutex::new(None::<String>));

    let handler = move |ch: &ChannelInfo, _req: Message| -> Result<Message> {
        let mut uid = seen.lock().unwrap();
        if let Some(uid) = uid.as_ref() {
            let mut offer = Message::new(MessageType::Download, uid.clone());
            offer.headers.put(keys::CHUNK_UID, uid);
            offer.headers.put(keys::FILE_SIZE, published.len());
            return Ok(offer);
        }
        let offer = ch.chunks.offer_bytes(published.clone(), None);
        *uid = offer.headers.chunk_uid().map(str::to_string);
        Ok(offer)
    };
    let server = TestServer::start(Arc::new(handler), FailurePolicy::Strict).await;
    let client = client();
    let settings = server.settings("client-b");

    for _ in 0..2 {
        let reply = client.send_text("again", &settings).await.unwrap();
        assert_eq!(reply.kind, MessageType::Text);
        assert_eq!(reply.body, body);
    }

    server.stop().await;
}

/// A range request for a source the server never published is refused.
#[tokio::test]
async fn test_unknown_download_is_a_remote_error() {
    let handler = |_: &ChannelInfo, _req: Message| -> Result<Message> {
        let mut offer = Message::new(MessageType::Download, "nope");
        offer.headers.put(keys::CHUNK_UID, "nope");
        offer.headers.put(keys::FILE_SIZE, 10);
        Ok(offer)
    };
    let server = TestServer::start(Arc::new(handler), FailurePolicy::Strict).await;

    let err = client().send_text("hi", &server.settings("client-c")).await.unwrap_err();
    match err {
        ExchangeError::Remote(msg) => assert!(msg.contains("nope"), "got {msg}"),
        other => panic!("expected remote error, got {other:?}"),
    }

    server.stop().await;
}

/// An uploaded file is composed as a File and echoed back through a download.
#[tokio::test]
async fn test_file_upload_round_trip() {
    let dir = temp_dir("upload");
    let path = dir.join("notes.txt");
    std::fs::write(&path, payload(1500)).unwrap();

    let recorder = Recorder::replying("stored");
    let server = TestServer::start(recorder.clone(), FailurePolicy::Strict).await;
    let reply = client().send_file(&path, &server.settings("client-d")).await.unwrap();
    assert_eq!(reply.body_text(), "stored");

    let requests = recorder.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].kind, MessageType::File);
    assert_eq!(requests[0].headers.file_name(), Some("notes.txt"));
    assert_eq!(&requests[0].body[..], &payload(1500)[..]);

    server.stop().await;
    let _ = std::fs::remove_dir_all(&dir);
}

/// A missing file offer surfaces the handler's failure to the client.
#[tokio::test]
async fn test_missing_file_offer_fails_remotely() {
    let handler = |ch: &ChannelInfo, _req: Message| -> Result<Message> {
        ch.chunks
            .offer_file(std::path::Path::new("/definitely/not/here.bin"))
            .map_err(|e| anyhow!(e))
    };
    let server = TestServer::start(Arc::new(handler), FailurePolicy::Strict).await;

    let err = client().send_text("hi", &server.settings("client-e")).await.unwrap_err();
    assert!(matches!(err, ExchangeError::Remote(_)), "got {err:?}");

    server.stop().await;
}

/// An offer larger than the client's limit is refused before any range
/// request goes out.
#[tokio::test]
async fn test_oversized_offer_is_refused() {
    let handler = |_: &ChannelInfo, _req: Message| -> Result<Message> {
        let mut offer = Message::new(MessageType::Download, "huge");
        offer.headers.put(keys::CHUNK_UID, "huge");
        offer.headers.put(keys::FILE_SIZE, u64::MAX / 2);
        Ok(offer)
    };
    let server = TestServer::start(Arc::new(handler), FailurePolicy::Strict).await;
    let client = client();

    let err = client.send_text("hi", &server.settings("client-f")).await.unwrap_err();
    assert!(matches!(err, ExchangeError::BadOffer(_)), "got {err:?}");
    assert_eq!(client.chunks().pending_groups(), 0);
    server.stop().await;

    // The limit is per settings, not hard-wired.
    let publisher = |ch: &ChannelInfo, _req: Message| -> Result<Message> {
        Ok(ch.chunks.offer_bytes(Bytes::from(payload(500)), None))
    };
    let server = TestServer::start(Arc::new(publisher), FailurePolicy::Strict).await;
    let settings = server.settings("client-f").max_download_bytes(100);
    let err = client.send_text("hi", &settings).await.unwrap_err();
    assert!(matches!(err, ExchangeError::BadOffer(_)), "got {err:?}");

    let reply = client.send_text("hi", &server.settings("client-f")).await.unwrap();
    assert_eq!(reply.body.len(), 500);
    server.stop().await;
}

/// Caller-defined headers on a large response survive the download.
#[tokio::test]
async fn test_large_response_keeps_custom_headers() {
    let handler = |_: &ChannelInfo, _req: Message| -> Result<Message> {
        Ok(Message::new(MessageType::Text, payload(2500)).with_header("status", "accepted"))
    };
    let server = TestServer::start(Arc::new(handler), FailurePolicy::Strict).await;

    let reply = client().send_text("submit", &server.settings("client-g")).await.unwrap();
    assert_eq!(reply.body.len(), 2500);
    assert_eq!(reply.headers.get("status"), Some("accepted"));

    server.stop().await;
}
