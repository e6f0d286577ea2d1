//! Cryptographic primitives for Courier.
//!
//! Provides three things:
//!   1. BLAKE3 hashing: key signatures and random tokens
//!   2. X25519 identity keypairs, exchanged as hex strings during handshake
//!   3. Sealed bodies: per-message encryption to a recipient's public key
//!
//! A sealed body is an ECIES construction: a fresh ephemeral X25519 key is
//! agreed with the recipient's static key, BLAKE3 derives the AEAD key, and
//! ChaCha20-Poly1305 encrypts the body.
//!
//!   sealed = eph_pk (32) || nonce (12) || ciphertext || tag (16)
//!
//! All key material derives ZeroizeOnDrop and is wiped from memory when dropped.
//! There is no unsafe code in this module.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey as DalekPublic, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// KDF context for the sealed-body AEAD key. Never change after release.
const SEAL_KEY_CONTEXT: &str = "courier v1 sealed-body key";

pub const PUBLIC_KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;

/// Smallest possible sealed body: an empty plaintext.
pub const SEAL_OVERHEAD: usize = PUBLIC_KEY_SIZE + NONCE_SIZE + TAG_SIZE;

// ── BLAKE3 ────────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Signature of a public key: hex(BLAKE3(public key bytes)).
///
/// Travels next to every encrypted body so the receiver can tell which of
/// its keys the sender used.
pub fn key_signature(public: &PublicKey) -> String {
    hex::encode(hash(&public.0))
}

/// A random 128-bit token, hex encoded. Used for chunk uids.
pub fn random_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

// ── Keys ──────────────────────────────────────────────────────────────────────

/// A peer's X25519 public key, as learned from a handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(pub [u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    /// Parse the transportable string form (64 hex characters).
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s.trim()).map_err(|_| CryptoError::BadPublicKey)?;
        let bytes: [u8; PUBLIC_KEY_SIZE] =
            bytes.try_into().map_err(|_| CryptoError::BadPublicKey)?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn signature(&self) -> String {
        key_signature(self)
    }
}

/// An endpoint's long-term X25519 keypair.
///
/// The private key never leaves this struct except through `private_bytes`,
/// which the keystore uses to persist it.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Keypair {
    /// Private key. Zeroized on drop, never exposed directly.
    private: Zeroizing<[u8; 32]>,
    /// Public key, sent in every handshake.
    pub public: [u8; 32],
}

impl Keypair {
    /// Generate a new random X25519 keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::thread_rng());
        let public = DalekPublic::from(&secret);
        Self {
            private: Zeroizing::new(secret.to_bytes()),
            public: *public.as_bytes(),
        }
    }

    /// Reconstruct a keypair from stored private key bytes.
    /// The public key is derived deterministically from the private key.
    pub fn from_private(private_bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private_bytes);
        let public = DalekPublic::from(&secret);
        Self {
            private: Zeroizing::new(private_bytes),
            public: *public.as_bytes(),
        }
    }

    /// Serialize the private key for persistent storage.
    pub fn private_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(*self.private)
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.public)
    }

    /// The transportable public key string carried in HandShake bodies.
    pub fn public_key_string(&self) -> String {
        hex::encode(self.public)
    }

    /// Decrypt a body sealed to this keypair's public key.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < SEAL_OVERHEAD {
            return Err(CryptoError::TooShort(sealed.len()));
        }

        let mut eph_pk = [0u8; PUBLIC_KEY_SIZE];
        eph_pk.copy_from_slice(&sealed[..PUBLIC_KEY_SIZE]);
        let nonce = &sealed[PUBLIC_KEY_SIZE..PUBLIC_KEY_SIZE + NONCE_SIZE];
        let ciphertext = &sealed[PUBLIC_KEY_SIZE + NONCE_SIZE..];

        let secret = StaticSecret::from(*self.private);
        let shared = secret.diffie_hellman(&DalekPublic::from(eph_pk));
        let key = derive_seal_key(shared.as_bytes(), &eph_pk, &self.public);

        ChaCha20Poly1305::new(Key::from_slice(&key[..]))
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: &eph_pk,
                },
            )
            .map_err(|_| CryptoError::Aead)
    }
}

// ── Sealed bodies ─────────────────────────────────────────────────────────────

/// Encrypt `plaintext` so that only the holder of `recipient`'s private key
/// can read it.
pub fn seal(recipient: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let eph_secret = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
    let eph_pk = *DalekPublic::from(&eph_secret).as_bytes();
    let shared = eph_secret.diffie_hellman(&DalekPublic::from(recipient.0));
    let key = derive_seal_key(shared.as_bytes(), &eph_pk, &recipient.0);

    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);

    let ciphertext = ChaCha20Poly1305::new(Key::from_slice(&key[..]))
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &eph_pk,
            },
        )
        .map_err(|_| CryptoError::Aead)?;

    let mut out = Vec::with_capacity(SEAL_OVERHEAD + plaintext.len());
    out.extend_from_slice(&eph_pk);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn derive_seal_key(shared: &[u8; 32], eph_pk: &[u8; 32], recipient: &[u8; 32]) -> Zeroizing<[u8; 32]> {
    let mut material = Zeroizing::new([0u8; 96]);
    material[..32].copy_from_slice(shared);
    material[32..64].copy_from_slice(eph_pk);
    material[64..].copy_from_slice(recipient);
    Zeroizing::new(blake3::derive_key(SEAL_KEY_CONTEXT, &material[..]))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("public key must be 64 hex characters")]
    BadPublicKey,

    #[error("sealed body too short ({0} bytes, need at least {SEAL_OVERHEAD})")]
    TooShort(usize),

    #[error("AEAD failure: wrong key or corrupted ciphertext")]
    Aead,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
