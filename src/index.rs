//! In-process nearest-neighbor index over chunk embeddings.
//!
//! One [`VectorIndex`] holds all chunks of one collection. Search is
//! brute-force cosine similarity over all stored vectors, descending score,
//! with ties broken by ascending `sequence_index` (then chunk id) so results
//! are fully deterministic. The index is the snapshot payload: it serializes
//! as-is through the sync manager.
//!
//! The index never mixes embedding models: every `add` is checked against
//! the collection's declared `model_version` and dimensionality.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::EngineError;
use crate::models::Chunk;

/// A chunk embedding tagged with the model that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub chunk_id: String,
    pub vector: Vec<f32>,
    pub model_version: String,
}

/// A single search hit: chunk id plus cosine similarity in `[-1.0, 1.0]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub chunk_id: String,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    vector: Vec<f32>,
    chunk: Chunk,
}

/// Vector index for one collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorIndex {
    model_version: String,
    dims: usize,
    entries: HashMap<String, IndexEntry>,
}

impl VectorIndex {
    pub fn new(model_version: impl Into<String>, dims: usize) -> Self {
        Self {
            model_version: model_version.into(),
            dims,
            entries: HashMap::new(),
        }
    }

    pub fn model_version(&self) -> &str {
        &self.model_version
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or overwrite by chunk id.
    ///
    /// Rejects embeddings whose model version or dimensionality differs from
    /// the collection's declared version — a version change forces full
    /// re-embedding, never partial mixing.
    pub fn add(&mut self, chunk: Chunk, embedding: Embedding) -> Result<(), EngineError> {
        if embedding.model_version != self.model_version {
            return Err(EngineError::ModelVersionMismatch {
                expected: self.model_version.clone(),
                actual: embedding.model_version,
            });
        }
        if embedding.vector.len() != self.dims {
            return Err(EngineError::ModelVersionMismatch {
                expected: format!("{} ({} dims)", self.model_version, self.dims),
                actual: format!(
                    "{} ({} dims)",
                    embedding.model_version,
                    embedding.vector.len()
                ),
            });
        }

        self.entries.insert(
            chunk.chunk_id.clone(),
            IndexEntry {
                vector: embedding.vector,
                chunk,
            },
        );
        Ok(())
    }

    /// Top-`k` chunks by cosine similarity, descending; ties broken by
    /// ascending `sequence_index`, then chunk id.
    pub fn search(&self, query_vector: &[f32], k: usize) -> Vec<SearchHit> {
        let mut scored: Vec<(&IndexEntry, f32)> = self
            .entries
            .values()
            .map(|entry| (entry, cosine_similarity(query_vector, &entry.vector)))
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.chunk.sequence_index.cmp(&b.0.chunk.sequence_index))
                .then(a.0.chunk.chunk_id.cmp(&b.0.chunk.chunk_id))
        });

        scored
            .into_iter()
            .take(k)
            .map(|(entry, score)| SearchHit {
                chunk_id: entry.chunk.chunk_id.clone(),
                score,
            })
            .collect()
    }

    pub fn get(&self, chunk_id: &str) -> Option<&Chunk> {
        self.entries.get(chunk_id).map(|e| &e.chunk)
    }

    /// Purge all chunks of a document; used when a document is replaced.
    pub fn remove_document(&mut self, document_id: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.chunk.document_id != document_id);
        before - self.entries.len()
    }
}

/// Cosine similarity between two vectors.
///
/// Returns `0.0` for empty vectors, mismatched lengths, or zero magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_chunk(id: &str, doc: &str, seq: usize) -> Chunk {
        Chunk {
            chunk_id: id.to_string(),
            document_id: doc.to_string(),
            sequence_index: seq,
            text: format!("chunk {}", seq),
            char_start: seq * 10,
            char_end: seq * 10 + 10,
        }
    }

    fn make_embedding(id: &str, vector: Vec<f32>) -> Embedding {
        Embedding {
            chunk_id: id.to_string(),
            vector,
            model_version: "test-model".to_string(),
        }
    }

    fn populated() -> VectorIndex {
        let mut index = VectorIndex::new("test-model", 3);
        index
            .add(
                make_chunk("c0", "d1", 0),
                make_embedding("c0", vec![1.0, 0.0, 0.0]),
            )
            .unwrap();
        index
            .add(
                make_chunk("c1", "d1", 1),
                make_embedding("c1", vec![0.0, 1.0, 0.0]),
            )
            .unwrap();
        index
            .add(
                make_chunk("c2", "d2", 0),
                make_embedding("c2", vec![0.7, 0.7, 0.0]),
            )
            .unwrap();
        index
    }

    #[test]
    fn test_exact_match_ranks_first() {
        let index = populated();
        let hits = index.search(&[0.0, 1.0, 0.0], 1);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "c1");
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_descending_scores() {
        let index = populated();
        let hits = index.search(&[1.0, 0.0, 0.0], 3);
        assert_eq!(hits[0].chunk_id, "c0");
        for pair in hits.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[test]
    fn test_ties_broken_by_sequence_index() {
        let mut index = VectorIndex::new("test-model", 2);
        // Identical vectors, different sequence positions.
        index
            .add(make_chunk("late", "d1", 7), make_embedding("late", vec![1.0, 0.0]))
            .unwrap();
        index
            .add(make_chunk("early", "d1", 2), make_embedding("early", vec![1.0, 0.0]))
            .unwrap();

        let hits = index.search(&[1.0, 0.0], 2);
        assert_eq!(hits[0].chunk_id, "early");
        assert_eq!(hits[1].chunk_id, "late");
    }

    #[test]
    fn test_add_overwrites_by_chunk_id() {
        let mut index = populated();
        index
            .add(
                make_chunk("c0", "d1", 0),
                make_embedding("c0", vec![0.0, 0.0, 1.0]),
            )
            .unwrap();
        assert_eq!(index.len(), 3);
        let hits = index.search(&[0.0, 0.0, 1.0], 1);
        assert_eq!(hits[0].chunk_id, "c0");
    }

    #[test]
    fn test_remove_document() {
        let mut index = populated();
        assert_eq!(index.remove_document("d1"), 2);
        assert_eq!(index.len(), 1);
        assert!(index.get("c0").is_none());
        assert!(index.get("c2").is_some());
    }

    #[test]
    fn test_model_version_mismatch_rejected() {
        let mut index = populated();
        let stale = Embedding {
            chunk_id: "c9".to_string(),
            vector: vec![1.0, 0.0, 0.0],
            model_version: "other-model".to_string(),
        };
        let err = index.add(make_chunk("c9", "d1", 9), stale).unwrap_err();
        assert!(matches!(err, EngineError::ModelVersionMismatch { .. }));
    }

    #[test]
    fn test_dims_mismatch_rejected() {
        let mut index = populated();
        let short = make_embedding("c9", vec![1.0, 0.0]);
        let err = index.add(make_chunk("c9", "d1", 9), short).unwrap_err();
        assert!(matches!(err, EngineError::ModelVersionMismatch { .. }));
    }

    #[test]
    fn test_snapshot_roundtrip_preserves_search() {
        let index = populated();
        let bytes = serde_json::to_vec(&index).unwrap();
        let restored: VectorIndex = serde_json::from_slice(&bytes).unwrap();

        let query = [0.6, 0.8, 0.0];
        let before: Vec<String> = index.search(&query, 3).into_iter().map(|h| h.chunk_id).collect();
        let after: Vec<String> = restored
            .search(&query, 3)
            .into_iter()
            .map(|h| h.chunk_id)
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_cosine_zero_magnitude() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }
}
