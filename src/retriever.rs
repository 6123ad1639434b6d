//! Query-time retrieval: embed the question, search the collection's
//! vector index, keep everything above the score threshold.
//!
//! Indexes live in a per-instance cache that is nothing more than an
//! ephemeral mirror of the durable snapshot — on a cache miss the retriever
//! lazily restores through the [`SyncManager`]. A collection that has never
//! been ingested is reported as [`None`] (the "no document" state), which
//! is distinct from a present-but-unhelpful index returning an empty list.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::embedding::EmbeddingClient;
use crate::error::EngineError;
use crate::index::VectorIndex;
use crate::models::Chunk;
use crate::sync::SyncManager;

/// A retrieved chunk with its similarity score.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub chunk: Chunk,
    pub score: f32,
}

#[derive(Clone)]
struct CachedCollection {
    index: Arc<VectorIndex>,
    version: u64,
}

/// Per-instance cache of restored collection indexes.
///
/// Purely an optimization: any entry can be dropped at any time and
/// rebuilt from the durable snapshot. Shared between the retriever (reads)
/// and the orchestrator (updates after ingest, eviction on delete).
pub struct CollectionCache {
    inner: RwLock<HashMap<String, CachedCollection>>,
}

impl CollectionCache {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, collection_id: &str) -> Option<(Arc<VectorIndex>, u64)> {
        let cache = self.inner.read().await;
        cache
            .get(collection_id)
            .map(|c| (c.index.clone(), c.version))
    }

    pub async fn put(&self, collection_id: &str, index: Arc<VectorIndex>, version: u64) {
        let mut cache = self.inner.write().await;
        cache.insert(collection_id.to_string(), CachedCollection { index, version });
    }

    pub async fn evict(&self, collection_id: &str) {
        let mut cache = self.inner.write().await;
        cache.remove(collection_id);
    }
}

impl Default for CollectionCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Top-k semantic retrieval over one collection.
pub struct Retriever {
    cache: Arc<CollectionCache>,
    sync: Arc<SyncManager>,
    embedder: Arc<dyn EmbeddingClient>,
}

impl Retriever {
    pub fn new(
        cache: Arc<CollectionCache>,
        sync: Arc<SyncManager>,
        embedder: Arc<dyn EmbeddingClient>,
    ) -> Self {
        Self {
            cache,
            sync,
            embedder,
        }
    }

    /// Return the collection's index, restoring it on a cache miss.
    /// `None` means the collection has never been ingested anywhere.
    pub async fn obtain_index(
        &self,
        collection_id: &str,
    ) -> Result<Option<Arc<VectorIndex>>, EngineError> {
        if let Some((index, _)) = self.cache.get(collection_id).await {
            return Ok(Some(index));
        }

        match self.sync.restore(collection_id).await? {
            Some(restored) => {
                let index = Arc::new(restored.index);
                self.cache
                    .put(collection_id, index.clone(), restored.version)
                    .await;
                Ok(Some(index))
            }
            None => Ok(None),
        }
    }

    /// Rank the collection's chunks against `query_text`.
    ///
    /// Returns `None` when no collection exists (never ingested), otherwise
    /// the top-`k` chunks scoring at or above `score_threshold` — possibly
    /// empty, which the synthesizer treats as "insufficient context".
    pub async fn retrieve(
        &self,
        collection_id: &str,
        query_text: &str,
        k: usize,
        score_threshold: f32,
    ) -> Result<Option<Vec<RetrievedChunk>>, EngineError> {
        let Some(index) = self.obtain_index(collection_id).await? else {
            return Ok(None);
        };

        if query_text.trim().is_empty() || index.is_empty() {
            return Ok(Some(Vec::new()));
        }

        let query_vector = self
            .embedder
            .embed(&[query_text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                EngineError::EmbeddingUnavailable("empty embedding response".to_string())
            })?;

        let hits = index.search(&query_vector, k);
        debug!(
            collection_id,
            candidates = hits.len(),
            "vector search complete"
        );

        let results: Vec<RetrievedChunk> = hits
            .into_iter()
            .filter(|hit| hit.score >= score_threshold)
            .filter_map(|hit| {
                index.get(&hit.chunk_id).map(|chunk| RetrievedChunk {
                    chunk: chunk.clone(),
                    score: hit.score,
                })
            })
            .collect();

        Ok(Some(results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::index::Embedding;
    use async_trait::async_trait;

    /// Embeds each text onto a fixed axis so tests control similarity.
    struct AxisEmbedder;

    #[async_trait]
    impl EmbeddingClient for AxisEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EngineError> {
            Ok(texts
                .iter()
                .map(|t| {
                    if t.contains("alpha") {
                        vec![1.0, 0.0]
                    } else {
                        vec![0.0, 1.0]
                    }
                })
                .collect())
        }

        fn model_version(&self) -> &str {
            "test-model"
        }

        fn dims(&self) -> usize {
            2
        }
    }

    fn make_chunk(id: &str, seq: usize, text: &str) -> Chunk {
        Chunk {
            chunk_id: id.to_string(),
            document_id: "d1".to_string(),
            sequence_index: seq,
            text: text.to_string(),
            char_start: 0,
            char_end: text.len(),
        }
    }

    async fn make_retriever_with_index() -> (Retriever, Arc<SyncManager>) {
        let sync = Arc::new(SyncManager::new(Arc::new(MemoryBlobStore::new())));

        let mut index = VectorIndex::new("test-model", 2);
        index
            .add(
                make_chunk("c0", 0, "alpha passage"),
                Embedding {
                    chunk_id: "c0".to_string(),
                    vector: vec![1.0, 0.0],
                    model_version: "test-model".to_string(),
                },
            )
            .unwrap();
        index
            .add(
                make_chunk("c1", 1, "beta passage"),
                Embedding {
                    chunk_id: "c1".to_string(),
                    vector: vec![0.0, 1.0],
                    model_version: "test-model".to_string(),
                },
            )
            .unwrap();
        sync.persist("col", &index, 1).await.unwrap();

        let retriever = Retriever::new(
            Arc::new(CollectionCache::new()),
            sync.clone(),
            Arc::new(AxisEmbedder),
        );
        (retriever, sync)
    }

    #[tokio::test]
    async fn test_missing_collection_is_none() {
        let sync = Arc::new(SyncManager::new(Arc::new(MemoryBlobStore::new())));
        let retriever = Retriever::new(
            Arc::new(CollectionCache::new()),
            sync,
            Arc::new(AxisEmbedder),
        );

        let result = retriever.retrieve("never-ingested", "alpha", 5, 0.0).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_lazy_restore_then_rank() {
        let (retriever, _sync) = make_retriever_with_index().await;

        let results = retriever
            .retrieve("col", "alpha question", 5, 0.5)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk.chunk_id, "c0");
        assert!(results[0].score > 0.9);
    }

    #[tokio::test]
    async fn test_threshold_drops_weak_matches() {
        let (retriever, _sync) = make_retriever_with_index().await;

        // Threshold above every score: empty result, not an error.
        let results = retriever
            .retrieve("col", "alpha question", 5, 1.1)
            .await
            .unwrap()
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_cache_survives_snapshot_deletion() {
        let (retriever, sync) = make_retriever_with_index().await;

        // Warm the cache, then delete the durable snapshot.
        retriever.retrieve("col", "alpha", 5, 0.0).await.unwrap();
        sync.delete("col").await.unwrap();

        // The per-instance mirror still answers until evicted.
        let results = retriever.retrieve("col", "alpha", 5, 0.0).await.unwrap();
        assert!(results.is_some());
    }
}
