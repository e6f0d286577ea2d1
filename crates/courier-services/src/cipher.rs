//! Message body encryption.
//!
//! Outbound bodies are sealed to the recipient's public key once that key is
//! known; until then, and always for handshakes, bodies go out as
//! plaintext with an empty signature. Inbound bodies carrying a signature
//! are opened with the local identity's private key.
//!
//! What happens on a crypto failure depends on the `FailurePolicy`:
//! `Strict` returns the error, `Lenient` logs it and hands back the message
//! in whatever state it was in.

use std::sync::Arc;

use bytes::Bytes;
use courier_core::crypto::{self, CryptoError};
use courier_core::keystore::Identity;
use courier_core::Message;
use thiserror::Error;

use crate::peer_keys::PeerKey;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    #[default]
    Strict,
    Lenient,
}

impl FailurePolicy {
    pub fn from_strict(strict: bool) -> Self {
        if strict {
            Self::Strict
        } else {
            Self::Lenient
        }
    }
}

#[derive(Clone)]
pub struct MessageCipher {
    identity: Arc<Identity>,
    policy: FailurePolicy,
}

impl MessageCipher {
    pub fn new(identity: Arc<Identity>, policy: FailurePolicy) -> Self {
        Self { identity, policy }
    }

    pub fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Signature peers must attach for this endpoint to open their bodies.
    pub fn signature(&self) -> &str {
        self.identity.signature()
    }

    /// Seal `msg`'s body for `peer`. Handshakes, messages without a known
    /// peer key, and already sealed messages pass through untouched.
    pub fn encode(&self, mut msg: Message, peer: Option<&PeerKey>) -> Result<Message, CipherError> {
        let Some(peer) = peer else {
            return Ok(msg);
        };
        if msg.is_handshake() || msg.is_encrypted() {
            return Ok(msg);
        }

        match crypto::seal(&peer.public_key, &msg.body) {
            Ok(sealed) => {
                tracing::trace!(
                    plain = msg.body.len(),
                    sealed = sealed.len(),
                    "body sealed"
                );
                msg.body = Bytes::from(sealed);
                msg.signature = peer.signature.clone();
                Ok(msg)
            }
            Err(e) => self.fail(CipherError::Seal(e), msg),
        }
    }

    /// Open `msg`'s body if it was sealed. A signature naming some other
    /// key is a failure, as is a body that does not authenticate.
    pub fn decode(&self, mut msg: Message) -> Result<Message, CipherError> {
        if msg.is_handshake() || !msg.is_encrypted() {
            return Ok(msg);
        }
        if msg.signature != self.identity.signature() {
            let err = CipherError::SignatureMismatch {
                expected: self.identity.signature().to_string(),
                got: msg.signature.clone(),
            };
            return self.fail(err, msg);
        }

        match self.identity.keypair().open(&msg.body) {
            Ok(plain) => {
                msg.body = Bytes::from(plain);
                msg.signature.clear();
                Ok(msg)
            }
            Err(e) => self.fail(CipherError::Open(e), msg),
        }
    }

    fn fail(&self, err: CipherError, msg: Message) -> Result<Message, CipherError> {
        match self.policy {
            FailurePolicy::Strict => Err(err),
            FailurePolicy::Lenient => {
                tracing::warn!(owner = %msg.owner_id, error = %err, "crypto failure, passing body through");
                Ok(msg)
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("failed to seal body: {0}")]
    Seal(CryptoError),
    #[error("failed to open body: {0}")]
    Open(CryptoError),
    #[error("body sealed for another key (expected signature {expected}, got {got})")]
    SignatureMismatch { expected: String, got: String },
}
