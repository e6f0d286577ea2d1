//! Peer key cache: which public key to seal bodies with, per remote party.
//!
//! A server learns one key per client id from that client's handshake; a
//! client files its server's key under the server's `host:port`. Entries
//! live until the process exits or they are removed explicitly.

use std::sync::Arc;
use std::time::Instant;

use courier_core::crypto::{CryptoError, PublicKey};
use courier_core::{Message, MessageType};
use dashmap::DashMap;
use thiserror::Error;

/// A remote party's public key and the signature derived from it.
#[derive(Debug, Clone)]
pub struct PeerKey {
    pub public_key: PublicKey,
    /// hex(BLAKE3(public key)), attached to every body sealed with this key.
    pub signature: String,
    pub learned_at: Instant,
}

impl PeerKey {
    pub fn new(public_key: PublicKey) -> Self {
        Self {
            signature: public_key.signature(),
            public_key,
            learned_at: Instant::now(),
        }
    }

    pub fn from_key_string(key: &str) -> Result<Self, PeerKeyError> {
        Ok(Self::new(PublicKey::from_hex(key).map_err(PeerKeyError::BadKey)?))
    }
}

/// Shared between every connection task. Cloning shares the same table.
#[derive(Clone, Default)]
pub struct PeerKeyCache {
    keys: Arc<DashMap<String, PeerKey>>,
}

impl PeerKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the key a handshake presents, under the handshake's owner id.
    /// Anything that is not a HandShake is refused.
    pub fn learn(&self, handshake: &Message) -> Result<PeerKey, PeerKeyError> {
        if handshake.kind != MessageType::HandShake {
            return Err(PeerKeyError::NotHandshake(handshake.kind));
        }
        if handshake.owner_id.is_empty() {
            return Err(PeerKeyError::MissingOwner);
        }
        let key = std::str::from_utf8(&handshake.body).map_err(|_| PeerKeyError::NotText)?;
        self.put(&handshake.owner_id, key)
    }

    /// Store `key` for `client_id`, replacing any earlier key.
    pub fn put(&self, client_id: &str, key: &str) -> Result<PeerKey, PeerKeyError> {
        let entry = PeerKey::from_key_string(key)?;
        if let Some(previous) = self.keys.insert(client_id.to_string(), entry.clone()) {
            if previous.public_key != entry.public_key {
                tracing::info!(client = client_id, "peer key replaced");
            }
        } else {
            tracing::debug!(client = client_id, "peer key learned");
        }
        Ok(entry)
    }

    pub fn get(&self, client_id: &str) -> Option<PeerKey> {
        self.keys.get(client_id).map(|e| e.value().clone())
    }

    pub fn remove(&self, client_id: &str) -> Option<PeerKey> {
        self.keys.remove(client_id).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum PeerKeyError {
    #[error("expected a HandShake message, got {0:?}")]
    NotHandshake(MessageType),
    #[error("handshake carries no owner id")]
    MissingOwner,
    #[error("handshake body is not a key string")]
    NotText,
    #[error("invalid public key: {0}")]
    BadKey(CryptoError),
}
