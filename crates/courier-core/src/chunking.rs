//! Split arithmetic shared by uploads and downloads.
//!
//! Both sides must agree on how a payload of `total` bytes is cut into
//! fragments of at most `chunk_size` bytes, so this lives in core.

/// Position of one fragment within its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    /// 1-based.
    pub index: u64,
    pub offset: u64,
    pub length: u64,
}

/// Number of fragments for a payload. Never zero: an empty payload still
/// travels as one empty fragment.
pub fn chunk_count(total: u64, chunk_size: u64) -> u64 {
    let chunk_size = chunk_size.max(1);
    total.div_ceil(chunk_size).max(1)
}

/// Every fragment span of a payload, in index order. Spans are produced
/// on demand, so a huge `total` costs nothing until iterated.
pub fn spans(total: u64, chunk_size: u64) -> impl Iterator<Item = ChunkSpan> {
    let size = chunk_size.max(1);
    (0..chunk_count(total, size))
        .map(move |i| {
            let offset = i * size;
            ChunkSpan {
                index: i + 1,
                offset,
                length: size.min(total.saturating_sub(offset)),
            }
        })
}
