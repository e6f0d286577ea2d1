//! Configuration system for Courier.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $COURIER_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/courier/config.toml
//!   3. ~/.config/courier/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::message::DEFAULT_CHARSET;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub chunks: ChunksConfig,
    pub codec: CodecConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Directory holding one sub-directory per named identity.
    pub keystore_root: PathBuf,
    /// Identity this endpoint runs as.
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub host: String,
    /// 0 = OS-assigned (server only).
    pub port: u16,
    /// Deadline for each connect, read and write.
    pub timeout_ms: u64,
    /// Bodies larger than this travel as fragments.
    pub chunk_size: usize,
    /// Largest frame a reader will accept.
    pub max_frame_bytes: usize,
    /// Largest download offer a client will pull.
    pub max_download_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunksConfig {
    /// Incomplete groups and cached byte sources older than this are evicted.
    pub group_ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// true: crypto failures fail the exchange. false: log and pass through.
    pub strict: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub reply_policy: ReplyPolicy,
}

/// Which reply represents a multi-fragment send.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyPolicy {
    /// The latest non-Chunk reply wins; a Chunk ack counts only when
    /// nothing else has been recorded yet.
    #[default]
    LastMeaningful,
    /// The first reply received is kept.
    First,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            keystore_root: config_dir().join("keystore"),
            name: "courier".to_string(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            timeout_ms: 10_000,
            chunk_size: 1000,
            max_frame_bytes: 16 * 1024 * 1024,
            max_download_bytes: 1024 * 1024 * 1024,
        }
    }
}

impl Default for ChunksConfig {
    fn default() -> Self {
        Self {
            group_ttl_secs: 300,
            sweep_interval_secs: 30,
        }
    }
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self { strict: true }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("courier")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl CourierConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            CourierConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("COURIER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&CourierConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply COURIER_* overrides. `lookup` is the environment in production.
    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("COURIER_NETWORK__HOST") {
            self.network.host = v;
        }
        if let Some(p) = lookup("COURIER_NETWORK__PORT").and_then(|v| v.parse().ok()) {
            self.network.port = p;
        }
        if let Some(t) = lookup("COURIER_NETWORK__TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.network.timeout_ms = t;
        }
        if let Some(c) = lookup("COURIER_NETWORK__CHUNK_SIZE").and_then(|v| v.parse().ok()) {
            self.network.chunk_size = c;
        }
        if let Some(m) = lookup("COURIER_NETWORK__MAX_DOWNLOAD_BYTES").and_then(|v| v.parse().ok()) {
            self.network.max_download_bytes = m;
        }
        if let Some(v) = lookup("COURIER_IDENTITY__NAME") {
            self.identity.name = v;
        }
        if let Some(v) = lookup("COURIER_CODEC__STRICT") {
            self.codec.strict = v == "true" || v == "1";
        }
    }

    /// Connection settings for an endpoint identified by `uid`.
    pub fn socket_settings(&self, uid: impl Into<String>) -> SocketSettings {
        SocketSettings {
            uid: uid.into(),
            host: self.network.host.clone(),
            port: self.network.port,
            timeout: Duration::from_millis(self.network.timeout_ms),
            charset: DEFAULT_CHARSET.to_string(),
            chunk_size: self.network.chunk_size.max(1),
            max_frame_bytes: self.network.max_frame_bytes,
            max_download_bytes: self.network.max_download_bytes,
        }
    }
}

// ── SocketSettings ────────────────────────────────────────────────────────────

/// Immutable connection context handed to every client and server call.
/// Setters consume and return a new value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketSettings {
    /// Owner id stamped on outgoing messages.
    pub uid: String,
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
    pub charset: String,
    pub chunk_size: usize,
    pub max_frame_bytes: usize,
    pub max_download_bytes: u64,
}

impl SocketSettings {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn charset(mut self, charset: impl Into<String>) -> Self {
        self.charset = charset.into();
        self
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn max_download_bytes(mut self, limit: u64) -> Self {
        self.max_download_bytes = limit;
        self
    }

    /// `host:port`, also the key a client files its server's key under.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for SocketSettings {
    fn default() -> Self {
        CourierConfig::default().socket_settings(crate::crypto::random_token())
    }
}
