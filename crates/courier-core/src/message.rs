//! Message model: the envelope every Courier exchange carries.
//!
//! A message is a type tag, the sender's owner id, an optional signature of
//! the key its body was sealed with, a string header map, and a raw body.
//! Bodies are plaintext until `MessageCipher` seals them for a known peer.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::crypto;

/// Reserved header keys. Every other key is caller-defined.
pub mod keys {
    pub const CHARSET: &str = "charset";
    pub const FILE_NAME: &str = "fileName";
    pub const FILE_SIZE: &str = "fileSize";
    pub const CHUNK_UID: &str = "chunkUid";
    pub const CHUNK_INDEX: &str = "chunkIndex";
    pub const CHUNK_COUNT: &str = "chunkCount";
    pub const CHUNK_OFFSET: &str = "chunkOffset";
    pub const CHUNK_LENGTH: &str = "chunkLength";
    /// Set by the remote side when it could not serve the request.
    pub const ERROR: &str = "error";

    pub const RESERVED: [&str; 9] = [
        CHARSET,
        FILE_NAME,
        FILE_SIZE,
        CHUNK_UID,
        CHUNK_INDEX,
        CHUNK_COUNT,
        CHUNK_OFFSET,
        CHUNK_LENGTH,
        ERROR,
    ];

    pub fn is_reserved(key: &str) -> bool {
        RESERVED.contains(&key)
    }
}

pub const DEFAULT_CHARSET: &str = "UTF-8";

// ── Message type ──────────────────────────────────────────────────────────────

/// Message type discriminator. The byte values are part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    Undefined = 0,
    Text = 1,
    File = 2,
    Chunk = 3,
    Download = 4,
    HandShake = 5,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Undefined),
            1 => Some(Self::Text),
            2 => Some(Self::File),
            3 => Some(Self::Chunk),
            4 => Some(Self::Download),
            5 => Some(Self::HandShake),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

// ── Headers ───────────────────────────────────────────────────────────────────

/// String-keyed header map, kept in key order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    /// An empty map with no defaults applied.
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Headers every freshly built message starts with: UTF-8 charset,
    /// a single-fragment chunk position, and a random chunk uid.
    pub fn with_defaults() -> Self {
        let mut headers = Self::new();
        headers.put(keys::CHARSET, DEFAULT_CHARSET);
        headers.put(keys::CHUNK_INDEX, 1);
        headers.put(keys::CHUNK_COUNT, 1);
        headers.put(keys::CHUNK_UID, crypto::random_token());
        headers
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl ToString) {
        self.0.insert(key.into(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Copy every entry of `other` over this map.
    pub fn extend(&mut self, other: &Headers) {
        for (k, v) in other.iter() {
            self.0.insert(k.to_string(), v.to_string());
        }
    }

    /// Copy only the caller-defined entries of `other`. Protocol keys
    /// already in this map are left alone.
    pub fn extend_custom(&mut self, other: &Headers) {
        for (k, v) in other.iter().filter(|(k, _)| !keys::is_reserved(k)) {
            self.0.insert(k.to_string(), v.to_string());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    pub fn charset(&self) -> &str {
        self.get(keys::CHARSET).unwrap_or(DEFAULT_CHARSET)
    }

    pub fn file_name(&self) -> Option<&str> {
        self.get(keys::FILE_NAME).filter(|s| !s.is_empty())
    }

    pub fn file_size(&self) -> Option<u64> {
        self.get_u64(keys::FILE_SIZE)
    }

    pub fn chunk_uid(&self) -> Option<&str> {
        self.get(keys::CHUNK_UID).filter(|s| !s.is_empty())
    }

    /// 1-based fragment index. Missing or unparsable means 1.
    pub fn chunk_index(&self) -> u64 {
        self.get_u64(keys::CHUNK_INDEX).unwrap_or(1)
    }

    /// Declared fragment count. Missing or unparsable means 1.
    pub fn chunk_count(&self) -> u64 {
        self.get_u64(keys::CHUNK_COUNT).unwrap_or(1)
    }

    pub fn chunk_offset(&self) -> Option<u64> {
        self.get_u64(keys::CHUNK_OFFSET)
    }

    pub fn chunk_length(&self) -> Option<u64> {
        self.get_u64(keys::CHUNK_LENGTH)
    }

    pub fn error(&self) -> Option<&str> {
        self.get(keys::ERROR).filter(|s| !s.is_empty())
    }
}

// ── Message ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageType,
    /// Sending endpoint. Filled from the connection settings when empty.
    pub owner_id: String,
    /// Signature of the key the body was sealed with. Empty = plaintext.
    pub signature: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl Message {
    pub fn new(kind: MessageType, body: impl Into<Bytes>) -> Self {
        Self {
            kind,
            owner_id: String::new(),
            signature: String::new(),
            headers: Headers::with_defaults(),
            body: body.into(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(MessageType::Text, text.into())
    }

    /// A file-backed message; carries `fileName` and `fileSize`.
    pub fn file(file_name: &str, contents: impl Into<Bytes>) -> Self {
        let mut msg = Self::new(MessageType::File, contents);
        msg.headers.put(keys::FILE_NAME, file_name);
        msg.headers.put(keys::FILE_SIZE, msg.body.len());
        msg
    }

    /// A handshake carries the sender's public key string as its body.
    pub fn handshake(owner_id: impl Into<String>, public_key: &str) -> Self {
        Self::new(MessageType::HandShake, public_key.to_string()).with_owner(owner_id)
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = owner_id.into();
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.headers.put(key, value);
        self
    }

    pub fn is_handshake(&self) -> bool {
        self.kind == MessageType::HandShake
    }

    /// Either Chunk-typed or one fragment of a multi-fragment group.
    pub fn is_chunk(&self) -> bool {
        self.kind == MessageType::Chunk || self.headers.chunk_count() > 1
    }

    pub fn is_download(&self) -> bool {
        self.kind == MessageType::Download
    }

    pub fn is_file(&self) -> bool {
        self.kind == MessageType::File || self.headers.file_name().is_some()
    }

    pub fn is_encrypted(&self) -> bool {
        !self.signature.is_empty()
    }

    /// Body as text. Invalid UTF-8 is replaced, never rejected.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}
