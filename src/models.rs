//! Core data models used throughout the answer engine.
//!
//! These types represent the chunks, sessions, and turns that flow through
//! the ingestion and question-answering pipeline. Chunks and their
//! embeddings are immutable once ingested; turns are append-only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A contiguous passage of document text — the retrieval unit.
///
/// `char_start`/`char_end` are byte offsets into the original extracted
/// text, so a citation can be mapped back to the exact source span.
/// Consecutive chunks of a document overlap by the configured window but
/// never share a `sequence_index`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub document_id: String,
    pub sequence_index: usize,
    pub text: String,
    pub char_start: usize,
    pub char_end: usize,
}

/// A persistent chat session tying a user to a collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub session_id: String,
    pub user_id: String,
    pub collection_id: String,
    pub created_at: DateTime<Utc>,
}

/// One question/answer exchange within a session. Append-only: once
/// written, never mutated or reordered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub session_id: String,
    pub sequence_index: i64,
    pub question: String,
    pub answer: String,
    /// Chunk ids the answer is grounded on, in rank order. Empty when the
    /// answer could not be grounded in the document.
    pub citations: Vec<String>,
    pub created_at: DateTime<Utc>,
}
