//! Chunk manager: fragmentation, reassembly, and download byte sources.
//!
//! Outbound: `split` cuts a message into Chunk-typed fragments that share a
//! chunk uid and carry their index, count, offset, and length.
//!
//! Inbound: `add` files each fragment into the group for its uid and
//! reports `true` exactly once, on the call that completes the group.
//! `compose` then concatenates the fragments in index order and drops the
//! group. A composed uid leaves a tombstone for one TTL so late duplicates
//! are refused.
//!
//! Downloads: `offer_bytes` / `offer_file` register a byte source under a
//! fresh uid. Range requests are only ever served from registered sources.
//!
//! Groups, sources, and tombstones all expire after `ttl`; `sweep_loop`
//! runs the eviction on an interval.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use courier_core::chunking;
use courier_core::crypto;
use courier_core::message::keys;
use courier_core::{Headers, Message, MessageType};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use memmap2::Mmap;
use thiserror::Error;
use tokio::sync::broadcast;

// ── Groups ────────────────────────────────────────────────────────────────────

struct Fragment {
    offset: Option<u64>,
    body: Bytes,
}

/// Fragments received so far for one chunk uid.
struct ChunkGroup {
    expected: u64,
    fragments: BTreeMap<u64, Fragment>,
    /// Headers of the first fragment seen; carried onto the composed message.
    headers: Headers,
    owner_id: String,
    created_at: Instant,
    complete: bool,
}

impl ChunkGroup {
    fn new(first: &Message, expected: u64) -> Self {
        Self {
            expected,
            fragments: BTreeMap::new(),
            headers: first.headers.clone(),
            owner_id: first.owner_id.clone(),
            created_at: Instant::now(),
            complete: false,
        }
    }
}

// ── Byte sources ──────────────────────────────────────────────────────────────

enum SourceData {
    Bytes(Bytes),
    File(PathBuf),
}

struct ByteSource {
    data: SourceData,
    size: u64,
    created_at: Instant,
}

// ── ChunkManager ──────────────────────────────────────────────────────────────

/// Owned by one endpoint and shared by all of its connection tasks.
/// Every per-uid mutation runs under that uid's map entry lock.
pub struct ChunkManager {
    groups: DashMap<String, ChunkGroup>,
    composed: DashMap<String, Instant>,
    sources: DashMap<String, ByteSource>,
    ttl: Duration,
}

impl ChunkManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            groups: DashMap::new(),
            composed: DashMap::new(),
            sources: DashMap::new(),
            ttl,
        }
    }

    /// Cut `msg` into fragments of at most `chunk_size` body bytes.
    ///
    /// Fragments come out lazily in index order. Each is Chunk-typed and
    /// keeps the original headers, so `compose` on the far side can tell a
    /// file from text. An empty body yields one empty fragment.
    pub fn split(msg: &Message, chunk_size: usize) -> impl Iterator<Item = Message> {
        let template = msg.clone();
        let uid = template
            .headers
            .chunk_uid()
            .map(str::to_string)
            .unwrap_or_else(crypto::random_token);
        let total = template.body.len() as u64;
        let count = chunking::chunk_count(total, chunk_size as u64);

        chunking::spans(total, chunk_size as u64).map(move |span| {
            let start = span.offset as usize;
            let end = start + span.length as usize;
            let mut fragment = Message {
                kind: MessageType::Chunk,
                owner_id: template.owner_id.clone(),
                signature: String::new(),
                headers: template.headers.clone(),
                body: template.body.slice(start..end),
            };
            fragment.headers.put(keys::CHUNK_UID, &uid);
            fragment.headers.put(keys::CHUNK_INDEX, span.index);
            fragment.headers.put(keys::CHUNK_COUNT, count);
            fragment.headers.put(keys::CHUNK_OFFSET, span.offset);
            fragment.headers.put(keys::CHUNK_LENGTH, span.length);
            fragment
        })
    }

    /// File a received fragment. Returns true iff this call completed its
    /// group. Duplicates, fragments of finished groups, and fragments with
    /// an impossible position all return false.
    pub fn add(&self, msg: &Message) -> bool {
        let Some(uid) = msg.headers.chunk_uid() else {
            tracing::warn!(owner = %msg.owner_id, "fragment without chunk uid dropped");
            return false;
        };
        let index = msg.headers.chunk_index();
        let count = msg.headers.chunk_count();
        if count == 0 || index == 0 || index > count {
            tracing::warn!(uid, index, count, "fragment position out of range");
            return false;
        }
        if self.composed.contains_key(uid) {
            tracing::debug!(uid, index, "fragment for composed group ignored");
            return false;
        }

        // The tombstone is checked again under the entry lock: `compose`
        // writes it while holding the same lock.
        let mut group = match self.groups.entry(uid.to_string()) {
            Entry::Occupied(entry) => entry.into_ref(),
            Entry::Vacant(entry) => {
                if self.composed.contains_key(uid) {
                    tracing::debug!(uid, index, "fragment for composed group ignored");
                    return false;
                }
                entry.insert(ChunkGroup::new(msg, count))
            }
        };

        if group.complete {
            return false;
        }
        if group.expected != count {
            tracing::warn!(uid, expected = group.expected, count, "fragment count disagrees with group");
            return false;
        }
        if group.fragments.contains_key(&index) {
            tracing::trace!(uid, index, "duplicate fragment");
            return false;
        }

        group.fragments.insert(
            index,
            Fragment {
                offset: msg.headers.chunk_offset(),
                body: msg.body.clone(),
            },
        );
        tracing::debug!(uid, index, received = group.fragments.len(), count, "fragment added");

        if group.fragments.len() as u64 == group.expected {
            group.complete = true;
            tracing::info!(uid, count, "chunk group complete");
            return true;
        }
        false
    }

    pub fn is_complete(&self, uid: &str) -> bool {
        self.groups.get(uid).map(|g| g.complete).unwrap_or(false)
    }

    /// Reassemble a complete group into one message and drop the group.
    pub fn compose(&self, uid: &str) -> Result<Message, ChunkError> {
        let taken = self.groups.remove_if(uid, |_, g| {
            if g.complete {
                self.composed.insert(uid.to_string(), Instant::now());
            }
            g.complete
        });
        let Some((_, group)) = taken else {
            return Err(if self.groups.contains_key(uid) {
                ChunkError::NotReady(uid.to_string())
            } else {
                ChunkError::Unknown(uid.to_string())
            });
        };

        let total: usize = group.fragments.values().map(|f| f.body.len()).sum();
        let mut body = BytesMut::with_capacity(total);
        let mut expected_offset = 0u64;
        for (index, fragment) in &group.fragments {
            if let Some(offset) = fragment.offset {
                if offset != expected_offset {
                    tracing::warn!(uid, index, offset, expected_offset, "fragment offset gap");
                }
            }
            expected_offset += fragment.body.len() as u64;
            body.extend_from_slice(&fragment.body);
        }

        let mut headers = group.headers;
        headers.put(keys::CHUNK_INDEX, 1);
        headers.put(keys::CHUNK_COUNT, 1);
        headers.remove(keys::CHUNK_OFFSET);
        headers.remove(keys::CHUNK_LENGTH);

        let kind = if headers.file_name().is_some() {
            MessageType::File
        } else {
            MessageType::Text
        };
        tracing::debug!(uid, bytes = total, ?kind, "chunk group composed");

        Ok(Message {
            kind,
            owner_id: group.owner_id,
            signature: String::new(),
            headers,
            body: body.freeze(),
        })
    }

    /// Forget everything about `uid`: its group and its tombstone.
    /// A client calls this before pulling a download it may have pulled before.
    pub fn discard(&self, uid: &str) {
        self.groups.remove(uid);
        self.composed.remove(uid);
    }

    /// Groups still waiting for fragments.
    pub fn pending_groups(&self) -> usize {
        self.groups.len()
    }

    // ── Download sources ─────────────────────────────────────────────────────

    /// Register in-memory bytes for download and return the offer to send.
    pub fn offer_bytes(&self, body: Bytes, file_name: Option<&str>) -> Message {
        let size = body.len() as u64;
        self.register(SourceData::Bytes(body), size, file_name)
    }

    /// Register a file for download and return the offer to send.
    pub fn offer_file(&self, path: &Path) -> Result<Message, ChunkError> {
        let meta = fs::metadata(path).map_err(|e| ChunkError::Io(path.to_path_buf(), e))?;
        if !meta.is_file() {
            return Err(ChunkError::NotAFile(path.to_path_buf()));
        }
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("download");
        Ok(self.register(SourceData::File(path.to_path_buf()), meta.len(), Some(name)))
    }

    fn register(&self, data: SourceData, size: u64, file_name: Option<&str>) -> Message {
        let uid = crypto::random_token();
        self.sources.insert(
            uid.clone(),
            ByteSource {
                data,
                size,
                created_at: Instant::now(),
            },
        );
        tracing::debug!(uid = %uid, size, "download source registered");

        let mut offer = Message::new(MessageType::Download, uid.clone());
        offer.headers.put(keys::CHUNK_UID, uid);
        offer.headers.put(keys::FILE_SIZE, size);
        if let Some(name) = file_name {
            offer.headers.put(keys::FILE_NAME, name);
        }
        offer
    }

    /// The whole registered source, or None on a miss.
    pub fn get_bytes(&self, key: &str) -> Result<Option<Bytes>, ChunkError> {
        let size = match self.sources.get(key) {
            Some(source) => source.size,
            None => return Ok(None),
        };
        self.get_range(key, 0, size)
    }

    /// `length` bytes of a registered source starting at `offset`.
    /// None on a miss; a range past the end is an error.
    pub fn get_range(&self, uid: &str, offset: u64, length: u64) -> Result<Option<Bytes>, ChunkError> {
        let Some(source) = self.sources.get(uid) else {
            return Ok(None);
        };
        let end = offset.checked_add(length).filter(|end| *end <= source.size).ok_or(
            ChunkError::OutOfRange {
                offset,
                length,
                size: source.size,
            },
        )?;
        let (start, end) = (offset as usize, end as usize);

        match &source.data {
            SourceData::Bytes(bytes) => Ok(Some(bytes.slice(start..end))),
            SourceData::File(path) => {
                if start == end {
                    return Ok(Some(Bytes::new()));
                }
                let file = fs::File::open(path).map_err(|e| ChunkError::Io(path.clone(), e))?;
                // Safety: file is opened read-only and we don't mutate the mmap
                let mmap = unsafe { Mmap::map(&file).map_err(|e| ChunkError::Io(path.clone(), e))? };
                if end > mmap.len() {
                    return Err(ChunkError::OutOfRange {
                        offset,
                        length,
                        size: mmap.len() as u64,
                    });
                }
                Ok(Some(Bytes::copy_from_slice(&mmap[start..end])))
            }
        }
    }

    // ── Eviction ─────────────────────────────────────────────────────────────

    /// Drop groups, sources, and tombstones older than the TTL.
    /// Returns how many groups and sources were evicted.
    pub fn sweep(&self) -> usize {
        let ttl = self.ttl;
        let mut evicted = 0;

        self.groups.retain(|uid, group| {
            let keep = group.created_at.elapsed() < ttl;
            if !keep {
                tracing::warn!(
                    uid = %uid,
                    received = group.fragments.len(),
                    expected = group.expected,
                    "evicting stale chunk group"
                );
                evicted += 1;
            }
            keep
        });
        self.sources.retain(|uid, source| {
            let keep = source.created_at.elapsed() < ttl;
            if !keep {
                tracing::debug!(uid = %uid, "evicting download source");
                evicted += 1;
            }
            keep
        });
        self.composed.retain(|_, at| at.elapsed() < ttl);

        evicted
    }

    /// Run `sweep` every `interval` until shutdown.
    pub async fn sweep_loop(self: Arc<Self>, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("chunk sweeper shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    let evicted = self.sweep();
                    if evicted > 0 {
                        tracing::info!(evicted, "chunk sweep");
                    }
                }
            }
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("chunk group {0} is not complete")]
    NotReady(String),
    #[error("no chunk group {0}")]
    Unknown(String),
    #[error("range {offset}+{length} outside source of {size} bytes")]
    OutOfRange { offset: u64, length: u64, size: u64 },
    #[error("{0} is not a regular file")]
    NotAFile(PathBuf),
    #[error("failed to read {0}: {1}")]
    Io(PathBuf, std::io::Error),
}
