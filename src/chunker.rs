//! Overlapping sliding-window text chunker.
//!
//! Splits extracted document text into [`Chunk`]s of `target_size`
//! characters, each overlapping its predecessor by `overlap` characters.
//! Windows are snapped to UTF-8 character boundaries; offsets are byte
//! offsets into the input so citations can be mapped back to source spans.
//!
//! Each chunk receives a deterministic id derived from its document id and
//! sequence index via SHA-256. Determinism is load-bearing: re-ingesting
//! the same document yields the same ids, so chunks overwrite rather than
//! duplicate.
//!
//! # Guarantees
//!
//! - No chunk is ever empty; empty input yields zero chunks.
//! - The union of `[char_start, char_end)` ranges covers the entire input.
//! - Consecutive chunks overlap by exactly `overlap` characters, except the
//!   final chunk, which is pinned to the end of the input.
//! - Identical input and parameters always yield identical output.

use sha2::{Digest, Sha256};

use crate::models::Chunk;

/// Split `text` into overlapping chunks. `target_size` and `overlap` are
/// character counts with `overlap < target_size` (validated at config load).
pub fn chunk_text(document_id: &str, text: &str, target_size: usize, overlap: usize) -> Vec<Chunk> {
    debug_assert!(target_size > 0 && overlap < target_size);

    if text.is_empty() {
        return Vec::new();
    }

    // Byte offset of every character boundary, plus the end of input.
    let mut boundaries: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    boundaries.push(text.len());
    let total_chars = boundaries.len() - 1;

    let step = target_size - overlap;
    let mut chunks = Vec::new();
    let mut start_char = 0usize;
    let mut sequence_index = 0usize;

    loop {
        let end_char = (start_char + target_size).min(total_chars);
        let char_start = boundaries[start_char];
        let char_end = boundaries[end_char];

        chunks.push(Chunk {
            chunk_id: chunk_id(document_id, sequence_index),
            document_id: document_id.to_string(),
            sequence_index,
            text: text[char_start..char_end].to_string(),
            char_start,
            char_end,
        });

        if end_char == total_chars {
            break;
        }
        start_char += step;
        sequence_index += 1;
    }

    chunks
}

/// Deterministic chunk id: SHA-256 over the document id and sequence index.
fn chunk_id(document_id: &str, sequence_index: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(sequence_index.to_le_bytes());
    format!("{:x}", hasher.finalize())
}
