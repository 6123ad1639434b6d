//! Snapshot synchronization between in-memory vector indexes and durable
//! blob storage.
//!
//! Compute instances are stateless: an in-memory [`VectorIndex`] is an
//! ephemeral per-instance cache, and the durable snapshot is the source of
//! truth. The [`SyncManager`] restores snapshots on cold start and persists
//! them with an optimistic version check — a write lands only if its
//! `version` is strictly greater than the durably stored one, enforced
//! atomically by the blob store's generation precondition. Two instances
//! racing to persist therefore produce one winner and one
//! [`EngineError::StaleVersion`]; the loser re-restores and retries instead
//! of silently dropping the winner's chunks.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::blob::{BlobError, BlobStore, Precondition};
use crate::error::EngineError;
use crate::index::VectorIndex;

/// Durable snapshot payload: the full index plus its version counter.
#[derive(Debug, Serialize, Deserialize)]
struct CollectionSnapshot {
    collection_id: String,
    version: u64,
    index: VectorIndex,
}

/// A snapshot restored from durable storage.
#[derive(Debug)]
pub struct RestoredCollection {
    pub index: VectorIndex,
    pub version: u64,
}

/// Mirrors vector indexes to and from durable blob storage.
pub struct SyncManager {
    store: Arc<dyn BlobStore>,
}

impl SyncManager {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }

    /// Fetch the latest durable snapshot, or `None` when the collection has
    /// never been persisted. Safe to call concurrently from any number of
    /// instances.
    pub async fn restore(
        &self,
        collection_id: &str,
    ) -> Result<Option<RestoredCollection>, EngineError> {
        let blob = self
            .store
            .get(collection_id)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;

        let Some(blob) = blob else {
            return Ok(None);
        };

        let snapshot: CollectionSnapshot = serde_json::from_slice(&blob.bytes)
            .map_err(|e| EngineError::Storage(format!("corrupt snapshot: {}", e)))?;

        debug!(
            collection_id,
            version = snapshot.version,
            chunks = snapshot.index.len(),
            "restored collection snapshot"
        );

        Ok(Some(RestoredCollection {
            index: snapshot.index,
            version: snapshot.version,
        }))
    }

    /// Upload a snapshot tagged with `version`.
    ///
    /// Succeeds only if `version` is strictly greater than the durably
    /// stored version; otherwise fails with [`EngineError::StaleVersion`]
    /// and the caller must re-restore, re-apply its changes, and retry.
    /// The version check and the write are one atomic step: the put carries
    /// the generation of the blob the check was made against.
    pub async fn persist(
        &self,
        collection_id: &str,
        index: &VectorIndex,
        version: u64,
    ) -> Result<(), EngineError> {
        let current = self
            .store
            .get(collection_id)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;

        let precondition = match &current {
            None => Precondition::IfAbsent,
            Some(blob) => {
                let stored: CollectionSnapshot = serde_json::from_slice(&blob.bytes)
                    .map_err(|e| EngineError::Storage(format!("corrupt snapshot: {}", e)))?;
                if stored.version >= version {
                    return Err(EngineError::StaleVersion {
                        collection_id: collection_id.to_string(),
                        stored: stored.version,
                        offered: version,
                    });
                }
                Precondition::IfGeneration(blob.generation.clone())
            }
        };

        let snapshot = CollectionSnapshot {
            collection_id: collection_id.to_string(),
            version,
            index: index.clone(),
        };
        let bytes = serde_json::to_vec(&snapshot)
            .map_err(|e| EngineError::Storage(format!("snapshot encoding failed: {}", e)))?;

        match self.store.put(collection_id, bytes, precondition).await {
            Ok(_) => {
                debug!(collection_id, version, "persisted collection snapshot");
                Ok(())
            }
            Err(BlobError::PreconditionFailed(_)) => {
                // A concurrent writer landed between our read and write.
                let stored = match self.restore(collection_id).await {
                    Ok(Some(restored)) => restored.version,
                    _ => version,
                };
                Err(EngineError::StaleVersion {
                    collection_id: collection_id.to_string(),
                    stored,
                    offered: version,
                })
            }
            Err(e) => Err(EngineError::Storage(e.to_string())),
        }
    }

    /// Remove the durable snapshot — the only path by which a collection's
    /// persisted state disappears.
    pub async fn delete(&self, collection_id: &str) -> Result<(), EngineError> {
        self.store
            .delete(collection_id)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::index::Embedding;
    use crate::models::Chunk;

    fn make_index(chunk_count: usize) -> VectorIndex {
        let mut index = VectorIndex::new("test-model", 2);
        for i in 0..chunk_count {
            let chunk = Chunk {
                chunk_id: format!("c{}", i),
                document_id: "d1".to_string(),
                sequence_index: i,
                text: format!("chunk {}", i),
                char_start: i * 10,
                char_end: i * 10 + 10,
            };
            let embedding = Embedding {
                chunk_id: chunk.chunk_id.clone(),
                vector: vec![i as f32, 1.0],
                model_version: "test-model".to_string(),
            };
            index.add(chunk, embedding).unwrap();
        }
        index
    }

    fn make_sync() -> SyncManager {
        SyncManager::new(Arc::new(MemoryBlobStore::new()))
    }

    #[tokio::test]
    async fn test_restore_missing_collection() {
        let sync = make_sync();
        assert!(sync.restore("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_persist_restore_roundtrip() {
        let sync = make_sync();
        let index = make_index(3);
        sync.persist("col", &index, 1).await.unwrap();

        let restored = sync.restore("col").await.unwrap().unwrap();
        assert_eq!(restored.version, 1);
        assert_eq!(restored.index.len(), 3);

        // Search results are identical before and after the roundtrip.
        let query = [2.0, 1.0];
        let before: Vec<_> = index.search(&query, 3);
        let after: Vec<_> = restored.index.search(&query, 3);
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_persist_requires_strictly_greater_version() {
        let sync = make_sync();
        let index = make_index(1);
        sync.persist("col", &index, 1).await.unwrap();

        // Same version: stale.
        let err = sync.persist("col", &index, 1).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::StaleVersion {
                stored: 1,
                offered: 1,
                ..
            }
        ));

        // Lower version: stale.
        let err = sync.persist("col", &index, 0).await.unwrap_err();
        assert!(matches!(err, EngineError::StaleVersion { .. }));

        // Strictly greater: lands.
        sync.persist("col", &index, 2).await.unwrap();
        assert_eq!(sync.restore("col").await.unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_concurrent_persist_single_winner() {
        let store = Arc::new(MemoryBlobStore::new());
        let sync_a = SyncManager::new(store.clone());
        let sync_b = SyncManager::new(store);

        let base = make_index(1);
        sync_a.persist("col", &base, 1).await.unwrap();

        // Both writers read version 1 and race to write version 2.
        let index_a = make_index(2);
        let index_b = make_index(3);
        let (ra, rb) = tokio::join!(
            sync_a.persist("col", &index_a, 2),
            sync_b.persist("col", &index_b, 2),
        );

        let winners = [ra.is_ok(), rb.is_ok()].iter().filter(|w| **w).count();
        assert_eq!(winners, 1, "exactly one concurrent persist must win");

        // The surviving snapshot is exactly one writer's index, no mix.
        let restored = sync_a.restore("col").await.unwrap().unwrap();
        assert_eq!(restored.version, 2);
        assert!(restored.index.len() == 2 || restored.index.len() == 3);
    }

    #[tokio::test]
    async fn test_delete_removes_snapshot() {
        let sync = make_sync();
        sync.persist("col", &make_index(1), 1).await.unwrap();
        sync.delete("col").await.unwrap();
        assert!(sync.restore("col").await.unwrap().is_none());

        // After deletion, version numbering restarts from scratch.
        sync.persist("col", &make_index(1), 1).await.unwrap();
    }
}
