//! Named, persistent endpoint identities.
//!
//! Each identity owns one X25519 keypair stored at
//! `<root>/<name>/private.key` as hex. The keypair is generated the first
//! time the identity is asked for and reused on every later load, so a
//! restarted endpoint keeps its public key. Several names can live under
//! the same root in one process.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use zeroize::Zeroizing;

use crate::crypto::{Keypair, PublicKey};

const PRIVATE_KEY_FILE: &str = "private.key";

// ── KeyStore ──────────────────────────────────────────────────────────────────

/// Root directory of named identities, with a per-process cache so each
/// name is loaded from disk once.
pub struct KeyStore {
    root: PathBuf,
    loaded: Mutex<HashMap<String, Arc<Identity>>>,
}

impl KeyStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            loaded: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Load the identity called `name`, generating it on first use.
    pub fn identity(&self, name: &str) -> Result<Arc<Identity>, KeyStoreError> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(KeyStoreError::BadName(name.to_string()));
        }

        let mut loaded = self
            .loaded
            .lock()
            .map_err(|_| KeyStoreError::Poisoned)?;
        if let Some(identity) = loaded.get(name) {
            return Ok(identity.clone());
        }

        let identity = Arc::new(Identity::load_or_generate(&self.root.join(name), name)?);
        loaded.insert(name.to_string(), identity.clone());
        Ok(identity)
    }
}

// ── Identity ──────────────────────────────────────────────────────────────────

/// One endpoint's keypair plus the values derived from it.
pub struct Identity {
    name: String,
    keypair: Keypair,
    signature: String,
}

impl Identity {
    /// Read `<dir>/private.key`, or create it with a fresh keypair.
    pub fn load_or_generate(dir: &Path, name: &str) -> Result<Self, KeyStoreError> {
        let path = dir.join(PRIVATE_KEY_FILE);

        let keypair = if path.exists() {
            let text = Zeroizing::new(
                std::fs::read_to_string(&path)
                    .map_err(|e| KeyStoreError::ReadFailed(path.clone(), e))?,
            );
            let bytes = Zeroizing::new(
                hex::decode(text.trim()).map_err(|_| KeyStoreError::Corrupt(path.clone()))?,
            );
            let private: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| KeyStoreError::Corrupt(path.clone()))?;
            tracing::debug!(identity = name, path = %path.display(), "identity loaded");
            Keypair::from_private(private)
        } else {
            let keypair = Keypair::generate();
            std::fs::create_dir_all(dir)
                .map_err(|e| KeyStoreError::WriteFailed(path.clone(), e))?;
            write_private(&path, &keypair)?;
            tracing::info!(
                identity = name,
                public_key = %keypair.public_key_string(),
                "identity generated"
            );
            keypair
        };

        Ok(Self {
            name: name.to_string(),
            signature: keypair.public_key().signature(),
            keypair,
        })
    }

    /// An identity that is never written to disk. Used by tests and
    /// short-lived tools.
    pub fn ephemeral(name: &str) -> Self {
        let keypair = Keypair::generate();
        Self {
            name: name.to_string(),
            signature: keypair.public_key().signature(),
            keypair,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    pub fn public_key_string(&self) -> String {
        self.keypair.public_key_string()
    }

    /// Hex of the private key. Only the keystore and diagnostics need this.
    pub fn private_key_string(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(*self.keypair.private_bytes()))
    }

    /// Signature peers attach when they seal bodies to this identity.
    pub fn signature(&self) -> &str {
        &self.signature
    }
}

fn write_private(path: &Path, keypair: &Keypair) -> Result<(), KeyStoreError> {
    use std::io::Write;

    let text = Zeroizing::new(hex::encode(*keypair.private_bytes()));
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .map_err(|e| KeyStoreError::WriteFailed(path.to_path_buf(), e))?;
    file.write_all(text.as_bytes())
        .map_err(|e| KeyStoreError::WriteFailed(path.to_path_buf(), e))?;
    Ok(())
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("invalid identity name {0:?}")]
    BadName(String),
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("corrupt private key at {0}")]
    Corrupt(PathBuf),
    #[error("keystore lock poisoned")]
    Poisoned,
}
