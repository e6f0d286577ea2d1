//! Client side of an exchange.
//!
//! Every wire exchange gets its own connection: connect, seal, write, read
//! one reply within the deadline, open, close. A logical send may span
//! several exchanges:
//!
//!   - bodies above the chunk size, and files, go out as fragments, one
//!     exchange per fragment, in index order
//!   - a Download reply is pulled range by range until the chunk manager
//!     reports the group complete
//!
//! Nothing is retried here. The first failed exchange fails the send.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use courier_core::chunking;
use courier_core::config::{ReplyPolicy, SocketSettings};
use courier_core::keystore::Identity;
use courier_core::message::keys;
use courier_core::{Message, MessageType};
use courier_services::{
    ChunkError, ChunkManager, CipherError, FailurePolicy, MessageCipher, PeerKey, PeerKeyCache,
    PeerKeyError,
};
use thiserror::Error;

use crate::transport::{self, TransportError};

pub struct ClientDispatcher {
    cipher: MessageCipher,
    chunks: Arc<ChunkManager>,
    peer_keys: PeerKeyCache,
    reply_policy: ReplyPolicy,
}

impl ClientDispatcher {
    pub fn new(identity: Arc<Identity>, policy: FailurePolicy, chunks: Arc<ChunkManager>) -> Self {
        Self {
            cipher: MessageCipher::new(identity, policy),
            chunks,
            peer_keys: PeerKeyCache::new(),
            reply_policy: ReplyPolicy::default(),
        }
    }

    pub fn with_reply_policy(mut self, reply_policy: ReplyPolicy) -> Self {
        self.reply_policy = reply_policy;
        self
    }

    /// Server keys learned so far, filed under `host:port`.
    pub fn peer_keys(&self) -> &PeerKeyCache {
        &self.peer_keys
    }

    pub fn chunks(&self) -> &Arc<ChunkManager> {
        &self.chunks
    }

    /// Trade public keys with the server. Later sends to the same endpoint
    /// are sealed with the key the server returns.
    pub async fn handshake(&self, settings: &SocketSettings) -> Result<PeerKey, ExchangeError> {
        let hello = Message::handshake(
            settings.uid.clone(),
            &self.cipher.identity().public_key_string(),
        );
        let reply = self.exchange(settings, hello).await?;
        if reply.kind != MessageType::HandShake {
            return Err(ExchangeError::UnexpectedReply(reply.kind));
        }

        let key = std::str::from_utf8(&reply.body).map_err(|_| PeerKeyError::NotText)?;
        let entry = self.peer_keys.put(&settings.endpoint(), key)?;
        tracing::info!(
            endpoint = %settings.endpoint(),
            server = %reply.owner_id,
            signature = %entry.signature,
            "handshake complete"
        );
        Ok(entry)
    }

    pub async fn send_text(&self, text: &str, settings: &SocketSettings) -> Result<Message, ExchangeError> {
        self.send(Message::text(text), settings).await
    }

    /// Upload a file. Files always travel as fragments, even small ones.
    pub async fn send_file(&self, path: &Path, settings: &SocketSettings) -> Result<Message, ExchangeError> {
        let contents = tokio::fs::read(path)
            .await
            .map_err(|e| ExchangeError::File(path.to_path_buf(), e))?;
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("upload");
        self.send(Message::file(name, contents), settings).await
    }

    /// Send one logical message and return the effective reply.
    pub async fn send(&self, mut msg: Message, settings: &SocketSettings) -> Result<Message, ExchangeError> {
        if msg.owner_id.is_empty() {
            msg.owner_id = settings.uid.clone();
        }
        if !msg.headers.contains(keys::CHARSET) {
            msg.headers.put(keys::CHARSET, &settings.charset);
        }

        if msg.is_handshake() {
            return self.exchange(settings, msg).await;
        }

        let reply = if msg.body.len() > settings.chunk_size || msg.is_file() {
            self.send_fragments(msg, settings).await?
        } else {
            self.exchange(settings, msg).await?
        };

        if reply.is_download() {
            return self.download(&reply, settings).await;
        }
        Ok(reply)
    }

    async fn send_fragments(&self, msg: Message, settings: &SocketSettings) -> Result<Message, ExchangeError> {
        let uid = msg.headers.chunk_uid().unwrap_or_default().to_string();
        let mut effective: Option<Message> = None;

        for fragment in ChunkManager::split(&msg, settings.chunk_size) {
            let index = fragment.headers.chunk_index();
            let count = fragment.headers.chunk_count();
            let reply = self.exchange(settings, fragment).await?;
            tracing::debug!(uid = %uid, index, count, reply = ?reply.kind, "fragment sent");
            effective = Some(choose_reply(self.reply_policy, effective, reply));
        }

        effective.ok_or(ExchangeError::NoReply)
    }

    /// Pull every range of a Download offer and return the composed message.
    /// Offers above `max_download_bytes` are refused before any range is
    /// requested. Caller-defined headers of the offer carry over.
    async fn download(&self, offer: &Message, settings: &SocketSettings) -> Result<Message, ExchangeError> {
        let uid = offer
            .headers
            .chunk_uid()
            .ok_or_else(|| ExchangeError::BadOffer("no chunk uid".into()))?
            .to_string();
        let size = offer
            .headers
            .file_size()
            .ok_or_else(|| ExchangeError::BadOffer("no file size".into()))?;

        if size > settings.max_download_bytes {
            return Err(ExchangeError::BadOffer(format!(
                "{size} bytes exceeds the {} byte download limit",
                settings.max_download_bytes
            )));
        }

        self.chunks.discard(&uid);
        let chunk_size = settings.chunk_size as u64;
        let count = chunking::chunk_count(size, chunk_size);
        tracing::debug!(uid = %uid, size, count, "download started");

        for span in chunking::spans(size, chunk_size) {
            let mut request = Message::new(MessageType::Download, uid.clone()).with_owner(settings.uid.clone());
            if let Some(name) = offer.headers.file_name() {
                request.headers.put(keys::FILE_NAME, name);
            }
            request.headers.put(keys::FILE_SIZE, size);
            request.headers.put(keys::CHUNK_UID, &uid);
            request.headers.put(keys::CHUNK_INDEX, span.index);
            request.headers.put(keys::CHUNK_COUNT, count);
            request.headers.put(keys::CHUNK_LENGTH, span.length);
            request.headers.put(keys::CHUNK_OFFSET, span.offset);

            let reply = self.exchange(settings, request).await?;
            if reply.body.len() as u64 != span.length {
                tracing::warn!(
                    uid = %uid,
                    index = span.index,
                    expected = span.length,
                    got = reply.body.len(),
                    "download range length mismatch"
                );
            }
            if self.chunks.add(&reply) {
                let mut composed = self.chunks.compose(&uid)?;
                composed.headers.extend_custom(&offer.headers);
                tracing::info!(uid = %uid, bytes = composed.body.len(), "download complete");
                return Ok(composed);
            }
        }

        Err(ExchangeError::IncompleteDownload { uid, count })
    }

    /// One connection, one request, one reply.
    async fn exchange(&self, settings: &SocketSettings, msg: Message) -> Result<Message, ExchangeError> {
        let peer = self.peer_keys.get(&settings.endpoint());
        let outbound = self.cipher.encode(msg, peer.as_ref())?;

        let mut stream = transport::connect(settings).await?;
        transport::write_message(&mut stream, &outbound, settings.timeout).await?;
        let reply = transport::read_message(&mut stream, settings.timeout, settings.max_frame_bytes).await?;
        drop(stream);

        let reply = self.cipher.decode(reply)?;
        if let Some(error) = reply.headers.error() {
            return Err(ExchangeError::Remote(error.to_string()));
        }
        Ok(reply)
    }
}

/// Pick the reply that represents a multi-fragment send so far.
fn choose_reply(policy: ReplyPolicy, current: Option<Message>, reply: Message) -> Message {
    match (policy, current) {
        (_, None) => reply,
        (ReplyPolicy::First, Some(first)) => first,
        (ReplyPolicy::LastMeaningful, Some(current)) => {
            if reply.kind == MessageType::Chunk {
                current
            } else {
                reply
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("exchange timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport: {0}")]
    Transport(TransportError),
    #[error("crypto: {0}")]
    Cipher(#[from] CipherError),
    #[error("remote error: {0}")]
    Remote(String),
    #[error("unexpected {0:?} reply")]
    UnexpectedReply(MessageType),
    #[error("server key rejected: {0}")]
    PeerKey(#[from] PeerKeyError),
    #[error("malformed download offer: {0}")]
    BadOffer(String),
    #[error("download {uid} incomplete after {count} ranges")]
    IncompleteDownload { uid: String, count: u64 },
    #[error("chunk: {0}")]
    Chunk(#[from] ChunkError),
    #[error("failed to read {0}: {1}")]
    File(PathBuf, std::io::Error),
    #[error("no reply received")]
    NoReply,
}

impl From<TransportError> for ExchangeError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout(d) => Self::Timeout(d),
            other => Self::Transport(other),
        }
    }
}
