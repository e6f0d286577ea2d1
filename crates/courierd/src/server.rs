//! Server side of an exchange.
//!
//! The accept loop spawns a task per connection and goes straight back to
//! accepting, so a slow request never delays the next connection. Each
//! task runs one cycle:
//!
//!   read request → respond → write response → close
//!
//! A request that cannot be read is logged and the connection is closed
//! without a reply. Every other failure is answered with an empty response
//! carrying the `error` header. The connection is closed in every case.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use courier_core::config::SocketSettings;
use courier_core::keystore::Identity;
use courier_core::message::keys;
use courier_core::{Message, MessageType};
use courier_services::{
    ChannelInfo, ChunkManager, EchoHandler, FailurePolicy, MessageCipher, PeerKeyCache,
    RequestHandler,
};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use crate::transport;

/// Everything a connection task needs. Shared read-only between tasks;
/// the peer key cache and chunk manager handle their own locking.
struct ServerState {
    uid: String,
    cipher: MessageCipher,
    peer_keys: PeerKeyCache,
    chunks: Arc<ChunkManager>,
    handler: Arc<dyn RequestHandler>,
    timeout: Duration,
    chunk_size: usize,
    max_frame_bytes: usize,
}

pub struct ServerHandler {
    listener: TcpListener,
    state: ServerState,
}

impl ServerHandler {
    /// Bind to `settings.host:settings.port`. Requests are echoed until a
    /// handler is installed with `with_handler`.
    pub async fn bind(
        settings: &SocketSettings,
        identity: Arc<Identity>,
        policy: FailurePolicy,
        chunks: Arc<ChunkManager>,
    ) -> Result<Self> {
        let addr = tokio::net::lookup_host(settings.endpoint())
            .await
            .with_context(|| format!("failed to resolve {}", settings.endpoint()))?
            .next()
            .ok_or_else(|| anyhow!("{} resolved to no addresses", settings.endpoint()))?;
        let listener = transport::listen(addr).with_context(|| format!("failed to bind {addr}"))?;

        Ok(Self {
            listener,
            state: ServerState {
                uid: settings.uid.clone(),
                cipher: MessageCipher::new(identity, policy),
                peer_keys: PeerKeyCache::new(),
                chunks,
                handler: Arc::new(EchoHandler),
                timeout: settings.timeout,
                chunk_size: settings.chunk_size,
                max_frame_bytes: settings.max_frame_bytes,
            },
        })
    }

    pub fn with_handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.state.handler = handler;
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Client keys learned from handshakes, filed under client id.
    pub fn peer_keys(&self) -> PeerKeyCache {
        self.state.peer_keys.clone()
    }

    /// Accept connections until shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let local = self.listener.local_addr().context("listener has no local address")?;
        let state = Arc::new(self.state);
        tracing::info!(addr = %local, uid = %state.uid, "server listening");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("server shutting down");
                    return Ok(());
                }

                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(a) => a,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let state = state.clone();
                    tokio::spawn(async move {
                        state.handle_connection(stream, peer).await;
                    });
                }
            }
        }
    }
}

impl ServerState {
    async fn handle_connection(&self, mut stream: TcpStream, peer: SocketAddr) {
        let mut channel = ChannelInfo {
            peer,
            server_uid: self.uid.clone(),
            owner_id: String::new(),
            chunks: self.chunks.clone(),
        };
        self.handler.on_open(&channel);

        let failure = match self.serve(&mut stream, &mut channel).await {
            Ok(()) => None,
            Err(e) => {
                tracing::warn!(peer = %peer, owner = %channel.owner_id, error = %format!("{e:#}"), "exchange failed");
                Some(format!("{e:#}"))
            }
        };

        let _ = stream.shutdown().await;
        drop(stream);
        self.handler.on_close(&channel, failure.as_deref());
        tracing::trace!(peer = %peer, "connection closed");
    }

    async fn serve(&self, stream: &mut TcpStream, channel: &mut ChannelInfo) -> Result<()> {
        let request = transport::read_message(stream, self.timeout, self.max_frame_bytes)
            .await
            .context("failed to read request")?;
        channel.owner_id = request.owner_id.clone();
        tracing::debug!(
            peer = %channel.peer,
            owner = %request.owner_id,
            kind = ?request.kind,
            bytes = request.body.len(),
            "request received"
        );

        let (response, failure) = match self.respond(channel, request) {
            Ok(response) => match self.seal(channel, response) {
                Ok(sealed) => (sealed, None),
                Err(e) => (error_reply(&self.uid, &e), Some(e)),
            },
            Err(e) => (error_reply(&self.uid, &e), Some(e)),
        };

        transport::write_message(stream, &response, self.timeout)
            .await
            .context("failed to write response")?;

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn respond(&self, channel: &ChannelInfo, request: Message) -> Result<Message> {
        if request.is_handshake() {
            let key = self.peer_keys.learn(&request).context("handshake rejected")?;
            tracing::info!(client = %request.owner_id, signature = %key.signature, "client key registered");
            return Ok(Message::handshake(
                self.uid.clone(),
                &self.cipher.identity().public_key_string(),
            ));
        }

        let request = self.cipher.decode(request).context("failed to open request body")?;

        if request.is_download() {
            return self.serve_range(&request);
        }

        if request.is_chunk() {
            if !self.chunks.add(&request) {
                let mut ack = Message::new(MessageType::Chunk, Bytes::new());
                ack.headers = request.headers.clone();
                return Ok(ack);
            }
            let uid = request
                .headers
                .chunk_uid()
                .ok_or_else(|| anyhow!("fragment without chunk uid"))?;
            let full = self.chunks.compose(uid)?;
            return self.dispatch(channel, full);
        }

        self.dispatch(channel, request)
    }

    /// Hand a complete request to the application. Large answers are
    /// turned into a download offer the client pulls range by range.
    fn dispatch(&self, channel: &ChannelInfo, request: Message) -> Result<Message> {
        let response = self
            .handler
            .handle(channel, request)
            .context("request handler failed")?;

        if response.body.len() > self.chunk_size && !response.is_download() && !response.is_handshake() {
            let mut offer = self
                .chunks
                .offer_bytes(response.body.clone(), response.headers.file_name());
            offer.headers.extend_custom(&response.headers);
            tracing::debug!(
                bytes = response.body.len(),
                uid = offer.headers.chunk_uid().unwrap_or_default(),
                "response offered for download"
            );
            return Ok(offer);
        }
        Ok(response)
    }

    /// Answer one Download range request from a registered source.
    fn serve_range(&self, request: &Message) -> Result<Message> {
        let uid = match request.headers.chunk_uid() {
            Some(uid) => uid.to_string(),
            None => request.body_text(),
        };
        let offset = request.headers.chunk_offset().unwrap_or(0);
        let Some(length) = request.headers.chunk_length() else {
            bail!("range request for {uid} without chunk length");
        };

        let Some(bytes) = self.chunks.get_range(&uid, offset, length)? else {
            bail!("no download source {uid}");
        };
        tracing::debug!(uid = %uid, offset, length, "range served");

        let mut reply = Message::new(MessageType::Chunk, bytes);
        reply.headers = request.headers.clone();
        Ok(reply)
    }

    /// Seal the response for the requesting client, if its key is known.
    fn seal(&self, channel: &ChannelInfo, mut response: Message) -> Result<Message> {
        response.owner_id = self.uid.clone();
        let peer = self.peer_keys.get(&channel.owner_id);
        self.cipher
            .encode(response, peer.as_ref())
            .context("failed to seal response")
    }
}

fn error_reply(uid: &str, error: &anyhow::Error) -> Message {
    Message::new(MessageType::Text, Bytes::new())
        .with_owner(uid)
        .with_header(keys::ERROR, format!("{error:#}"))
}
