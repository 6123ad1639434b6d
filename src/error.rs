//! Typed error taxonomy for the answer engine.
//!
//! Transient collaborator failures (`EmbeddingUnavailable`,
//! `GenerationUnavailable`) are retried with bounded backoff inside the
//! owning component before they surface here. `StaleVersion` is the
//! optimistic-concurrency conflict from the sync manager; callers re-restore
//! and retry the write. "No document yet" and "nothing relevant found" are
//! **not** errors — they are ordinary outcomes ([`AskOutcome`] and an
//! ungrounded turn respectively).
//!
//! [`AskOutcome`]: crate::engine::AskOutcome

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Chunking or embedding failed after retries; the caller must re-upload.
    #[error("ingestion failed: {0}")]
    IngestionFailed(String),

    /// The embedding service stayed unavailable through the retry budget.
    #[error("embedding service unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// The generation service stayed unavailable through the retry budget.
    #[error("generation service unavailable: {0}")]
    GenerationUnavailable(String),

    /// A concurrent writer persisted the collection first. Re-restore and
    /// retry the write; never overwrite silently.
    #[error("stale version for collection '{collection_id}': durable version {stored} >= offered {offered}")]
    StaleVersion {
        collection_id: String,
        stored: u64,
        offered: u64,
    },

    /// An embedding's model version or dimension does not match the
    /// collection's declared version. The collection must be re-embedded in
    /// full, never mixed.
    #[error("embedding model mismatch: index has {expected}, got {actual}")]
    ModelVersionMismatch { expected: String, actual: String },

    /// The uploaded bytes are not valid extracted text.
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    /// Blob-storage failure (snapshot read/write/delete).
    #[error("storage error: {0}")]
    Storage(String),

    /// Session-store failure.
    #[error("session store error: {0}")]
    Session(#[from] sqlx::Error),
}
