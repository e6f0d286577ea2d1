//! Courier integration test harness.
//!
//! Every test starts its own server on an OS-assigned loopback port and
//! talks to it with a real `ClientDispatcher`, so tests run in parallel
//! without sharing any state.
//!
//!   cargo test --test integration

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use courier_core::config::{CourierConfig, SocketSettings};
use courier_core::keystore::Identity;
use courier_core::Message;
use courier_services::{
    ChannelInfo, ChunkManager, EchoHandler, FailurePolicy, PeerKeyCache, RequestHandler,
};
use courierd::{ClientDispatcher, ServerHandler};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

mod downloads;
mod failures;
mod handshake;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const DEADLINE: Duration = Duration::from_secs(2);

static COUNTER: AtomicU32 = AtomicU32::new(0);

/// A running server bound to 127.0.0.1 on a free port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub peer_keys: PeerKeyCache,
    pub chunks: Arc<ChunkManager>,
    pub identity: Arc<Identity>,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<Result<()>>,
}

impl TestServer {
    pub async fn start(handler: Arc<dyn RequestHandler>, policy: FailurePolicy) -> Self {
        let identity = Arc::new(Identity::ephemeral("server"));
        let chunks = Arc::new(ChunkManager::new(Duration::from_secs(60)));
        let settings = base_settings("server").port(0);

        let server = ServerHandler::bind(&settings, identity.clone(), policy, chunks.clone())
            .await
            .expect("bind failed")
            .with_handler(handler);
        let addr = server.local_addr().expect("no local addr");
        let peer_keys = server.peer_keys();

        let (shutdown, rx) = broadcast::channel(1);
        let task = tokio::spawn(server.run(rx));

        Self {
            addr,
            peer_keys,
            chunks,
            identity,
            shutdown,
            task,
        }
    }

    pub async fn echo() -> Self {
        Self::start(Arc::new(EchoHandler), FailurePolicy::Strict).await
    }

    /// Connection settings for a client called `uid`.
    pub fn settings(&self, uid: &str) -> SocketSettings {
        base_settings(uid).port(self.addr.port())
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        self.task.await.expect("server task panicked").expect("server failed");
    }
}

pub fn base_settings(uid: &str) -> SocketSettings {
    CourierConfig::default()
        .socket_settings(uid)
        .host("127.0.0.1")
        .timeout(DEADLINE)
        .chunk_size(1000)
}

pub fn client() -> ClientDispatcher {
    client_with(FailurePolicy::Strict)
}

pub fn client_with(policy: FailurePolicy) -> ClientDispatcher {
    ClientDispatcher::new(
        Arc::new(Identity::ephemeral("client")),
        policy,
        Arc::new(ChunkManager::new(Duration::from_secs(60))),
    )
}

pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub fn temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "courier-it-{tag}-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

/// Records what the server hands to the application and counts
/// connection lifecycle callbacks.
#[derive(Default)]
pub struct Recorder {
    pub requests: Mutex<Vec<Message>>,
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub failures: Mutex<Vec<String>>,
    pub reply: Mutex<Option<String>>,
}

impl Recorder {
    pub fn replying(text: &str) -> Arc<Self> {
        let recorder = Self::default();
        *recorder.reply.lock().unwrap() = Some(text.to_string());
        Arc::new(recorder)
    }

    pub fn requests(&self) -> Vec<Message> {
        self.requests.lock().unwrap().clone()
    }

    /// on_close runs after the response is written; give it a moment.
    pub async fn wait_closed(&self, expected: usize) {
        for _ in 0..100 {
            if self.closed.load(Ordering::SeqCst) >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl RequestHandler for Recorder {
    fn handle(&self, channel: &ChannelInfo, request: Message) -> Result<Message> {
        self.requests.lock().unwrap().push(request.clone());
        match self.reply.lock().unwrap().clone() {
            Some(text) => Ok(Message::text(text)),
            None => EchoHandler.handle(channel, request),
        }
    }

    fn on_open(&self, _channel: &ChannelInfo) {
        self.opened.fetch_add(1, Ordering::SeqCst);
    }

    fn on_close(&self, _channel: &ChannelInfo, failure: Option<&str>) {
        if let Some(f) = failure {
            self.failures.lock().unwrap().push(f.to_string());
        }
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}
