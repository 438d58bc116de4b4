//! Boundary-aware text chunker with overlap.
//!
//! Splits document text into overlapping windows of at most `target_size`
//! bytes. Each window ends at the highest-priority boundary found in its
//! second half:
//!
//! 1. paragraph break (`\n\n`)
//! 2. line break (`\n`)
//! 3. sentence end (`. `, `! `, `? `)
//! 4. space
//! 5. hard cut, snapped back to a UTF-8 char boundary
//!
//! The next window starts `overlap` bytes before the previous end (again
//! snapped to a char boundary and moved to the next word start when one
//! exists), and always strictly after the previous start, so the loop
//! terminates for any input.
//!
//! Output is a pure function of `(text, config)`. Chunk ids are UUIDv5
//! values over `(source_id, ordinal, chunk hash)`, so an edit that shifts
//! later chunks changes their ids instead of aliasing stale ones.
//!
//! # Example
//!
//! ```rust
//! use context_index::chunk::{chunk_text, ChunkConfig};
//!
//! let config = ChunkConfig::new(1200, 150).unwrap();
//! let chunks = chunk_text("Hello world.\n\nSecond paragraph.", &config);
//! assert_eq!(chunks.len(), 1);
//! ```

use uuid::Uuid;

use crate::error::{IndexError, Result};
use crate::models::{hash_text, keys, Chunk, MetadataValue, SourceDocument};

/// Namespace for chunk id derivation.
const CHUNK_NAMESPACE: Uuid = Uuid::from_u128(0x6c0e_9a57_31d4_4f0b_9d8e_2b1a_c4f3_7e21);

/// Boundaries in priority order, with the offset past the match at which
/// the chunk ends.
const BOUNDARIES: [(&str, usize); 6] = [
    ("\n\n", 2),
    ("\n", 1),
    (". ", 1),
    ("! ", 1),
    ("? ", 1),
    (" ", 1),
];

/// Validated chunking parameters, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkConfig {
    target_size: usize,
    overlap: usize,
}

impl ChunkConfig {
    /// Requires `0 < target_size` and `overlap < target_size`.
    pub fn new(target_size: usize, overlap: usize) -> Result<Self> {
        if target_size == 0 || overlap >= target_size {
            return Err(IndexError::InvalidChunkConfig {
                target_size,
                overlap,
            });
        }
        Ok(Self {
            target_size,
            overlap,
        })
    }

    pub fn target_size(&self) -> usize {
        self.target_size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            target_size: 1200,
            overlap: 150,
        }
    }
}

/// Split text into ordered chunk texts.
///
/// Whitespace-only input yields no chunks. Every returned chunk is
/// trimmed and non-empty.
pub fn chunk_text(text: &str, config: &ChunkConfig) -> Vec<String> {
    let len = text.len();
    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < len {
        let mut hard_end = snap_to_char_boundary(text, (start + config.target_size).min(len));
        if hard_end <= start {
            hard_end = next_char_boundary(text, start);
        }

        let end = if hard_end == len {
            len
        } else {
            find_break(text, start, hard_end)
        };

        let piece = text[start..end].trim();
        if !piece.is_empty() {
            chunks.push(piece.to_string());
        }

        if end >= len {
            break;
        }

        let next = snap_to_char_boundary(text, end.saturating_sub(config.overlap));
        let next = align_to_word_start(text, next, end);
        start = if next <= start { end } else { next };
    }

    chunks
}

/// Chunk a document and attach ids and inherited metadata.
pub fn chunk_document(doc: &SourceDocument, config: &ChunkConfig) -> Vec<Chunk> {
    let texts = chunk_text(&doc.content, config);
    let total = texts.len();

    texts
        .into_iter()
        .enumerate()
        .map(|(ordinal, text)| {
            let hash = hash_text(&text);
            let mut metadata = doc.metadata.clone();
            metadata.insert(keys::SOURCE_ID.into(), doc.source_id.clone().into());
            metadata.insert(
                keys::PATH.into(),
                MetadataValue::Str(doc.path.to_string_lossy().into_owned()),
            );
            metadata.insert(keys::ORDINAL.into(), MetadataValue::Int(ordinal as i64));
            metadata.insert(keys::TOTAL_CHUNKS.into(), MetadataValue::Int(total as i64));
            metadata.insert(keys::CHUNK_HASH.into(), hash.clone().into());
            metadata.insert(keys::CONTENT_HASH.into(), doc.content_hash.clone().into());

            Chunk {
                chunk_id: chunk_id(&doc.source_id, ordinal, &hash),
                source_id: doc.source_id.clone(),
                ordinal,
                total_chunks: total,
                text,
                hash,
                metadata,
                vector: None,
            }
        })
        .collect()
}

/// Deterministic chunk id.
pub fn chunk_id(source_id: &str, ordinal: usize, chunk_hash: &str) -> String {
    let name = format!("{}\u{1f}{}\u{1f}{}", source_id, ordinal, chunk_hash);
    Uuid::new_v5(&CHUNK_NAMESPACE, name.as_bytes()).to_string()
}

/// Pick the end of the window `[start, hard_end)`.
fn find_break(text: &str, start: usize, hard_end: usize) -> usize {
    let min_end = snap_to_char_boundary(text, start + (hard_end - start) / 2);
    let window = &text[min_end..hard_end];

    for (sep, advance) in BOUNDARIES {
        if let Some(pos) = window.rfind(sep) {
            let end = min_end + pos + advance;
            if end > start {
                return end;
            }
        }
    }
    hard_end
}

/// Move an overlap start forward past the first whitespace in
/// `[from, end)` unless it already sits at a word start.
fn align_to_word_start(text: &str, from: usize, end: usize) -> usize {
    if from == 0 || text[..from].ends_with(char::is_whitespace) {
        return from;
    }
    text[from..end]
        .char_indices()
        .find(|(_, c)| c.is_whitespace())
        .map(|(i, c)| from + i + c.len_utf8())
        .unwrap_or(from)
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Byte index just past the char starting at `index`.
fn next_char_boundary(s: &str, index: usize) -> usize {
    s[index..]
        .char_indices()
        .nth(1)
        .map(|(i, _)| index + i)
        .unwrap_or(s.len())
}
