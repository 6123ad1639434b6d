//! Orchestration of the ingest and ask pipelines.
//!
//! The [`Engine`] is the only component that knows all the others. Each
//! request is an independent unit of work: nothing outside a persisted
//! collection snapshot or a session row survives an instance restart, and
//! the per-instance collection cache is just a warm mirror of the durable
//! state.
//!
//! Ingest is read-modify-write against the durable snapshot: restore,
//! replace the document's chunks, persist with the next version. A
//! concurrent ingest on another instance shows up as a stale-version
//! conflict, answered by re-restoring and re-applying — on any failure the
//! collection stays at its last successfully persisted version, never a
//! partial state.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::chunker::chunk_text;
use crate::config::Config;
use crate::embedding::EmbeddingClient;
use crate::error::EngineError;
use crate::index::{Embedding, VectorIndex};
use crate::models::{ChatSession, Turn};
use crate::retriever::{CollectionCache, Retriever};
use crate::session::SessionStore;
use crate::sync::SyncManager;
use crate::synthesizer::{GenerationClient, Synthesizer};

/// Bounded retries for stale-version conflicts during ingest.
const MAX_PERSIST_ATTEMPTS: u32 = 3;

/// Result of asking a question.
#[derive(Debug)]
pub enum AskOutcome {
    Answered(Turn),
    /// The collection has never been ingested — a valid empty state, not
    /// an error.
    NoDocumentContext,
}

pub struct Engine {
    config: Config,
    embedder: Arc<dyn EmbeddingClient>,
    sync: Arc<SyncManager>,
    cache: Arc<CollectionCache>,
    retriever: Retriever,
    synthesizer: Synthesizer,
    sessions: SessionStore,
}

impl Engine {
    pub fn new(
        config: Config,
        embedder: Arc<dyn EmbeddingClient>,
        generator: Arc<dyn GenerationClient>,
        blob_store: Arc<dyn crate::blob::BlobStore>,
        pool: sqlx::SqlitePool,
    ) -> Self {
        let sync = Arc::new(SyncManager::new(blob_store));
        let cache = Arc::new(CollectionCache::new());
        let retriever = Retriever::new(cache.clone(), sync.clone(), embedder.clone());
        let synthesizer = Synthesizer::new(generator, config.generation.context_budget);
        let sessions = SessionStore::new(pool);

        Self {
            config,
            embedder,
            sync,
            cache,
            retriever,
            synthesizer,
            sessions,
        }
    }

    /// Wire the engine from configuration: HTTP clients, the configured
    /// blob-store backend, and the session database (migrations included).
    pub async fn from_config(config: Config) -> anyhow::Result<Self> {
        let embedder = Arc::new(crate::embedding::HttpEmbeddingClient::new(&config.embedding)?);
        let generator = Arc::new(crate::synthesizer::HttpGenerationClient::new(
            &config.generation,
        )?);
        let blob_store = crate::blob::create_blob_store(&config.storage)?;
        let pool = crate::db::connect(&config.db.path).await?;
        crate::migrate::run_migrations(&pool).await?;
        Ok(Self::new(config, embedder, generator, blob_store, pool))
    }

    /// Ingest an uploaded document: chunk, embed, merge into the
    /// collection's index, persist with an incremented version.
    ///
    /// The collection id equals the document id; re-ingesting the same
    /// document replaces its chunks (deterministic chunk ids overwrite,
    /// never append).
    pub async fn ingest(&self, document_id: &str, bytes: &[u8]) -> Result<String, EngineError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| EngineError::InvalidDocument("document is not valid UTF-8 text".to_string()))?;

        let chunks = chunk_text(
            document_id,
            text,
            self.config.chunking.target_size,
            self.config.chunking.overlap,
        );
        if chunks.is_empty() {
            return Err(EngineError::InvalidDocument(
                "document contains no text".to_string(),
            ));
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = match self.embedder.embed(&texts).await {
            Ok(vectors) => vectors,
            Err(EngineError::EmbeddingUnavailable(msg)) => {
                return Err(EngineError::IngestionFailed(format!(
                    "embedding unavailable after retries: {}",
                    msg
                )));
            }
            Err(e) => return Err(e),
        };

        let collection_id = document_id.to_string();
        let model_version = self.embedder.model_version();

        let mut last_err = None;
        for attempt in 0..MAX_PERSIST_ATTEMPTS {
            let (mut index, base_version) = match self.sync.restore(&collection_id).await? {
                Some(restored) if restored.index.model_version() == model_version => {
                    (restored.index, restored.version)
                }
                Some(restored) => {
                    // Embedding model changed: the whole collection is
                    // rebuilt with the new model, never mixed.
                    info!(
                        %collection_id,
                        old = restored.index.model_version(),
                        new = model_version,
                        "embedding model changed, rebuilding collection"
                    );
                    (
                        VectorIndex::new(model_version, self.embedder.dims()),
                        restored.version,
                    )
                }
                None => (
                    VectorIndex::new(model_version, self.embedder.dims()),
                    0,
                ),
            };

            index.remove_document(document_id);
            for (chunk, vector) in chunks.iter().zip(vectors.iter()) {
                index.add(
                    chunk.clone(),
                    Embedding {
                        chunk_id: chunk.chunk_id.clone(),
                        vector: vector.clone(),
                        model_version: model_version.to_string(),
                    },
                )?;
            }

            let next_version = base_version + 1;
            match self.sync.persist(&collection_id, &index, next_version).await {
                Ok(()) => {
                    self.cache
                        .put(&collection_id, Arc::new(index), next_version)
                        .await;
                    info!(
                        %collection_id,
                        version = next_version,
                        chunks = chunks.len(),
                        "document ingested"
                    );
                    return Ok(collection_id);
                }
                Err(e @ EngineError::StaleVersion { .. }) => {
                    warn!(%collection_id, attempt, "persist conflict, retrying");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            EngineError::IngestionFailed("persist retries exhausted".to_string())
        }))
    }

    /// Answer a question against a collection, recording the turn in the
    /// user's session.
    pub async fn ask(
        &self,
        collection_id: &str,
        session_id: &str,
        user_id: &str,
        question: &str,
        language_hint: Option<&str>,
    ) -> Result<AskOutcome, EngineError> {
        let retrieved = match self
            .retriever
            .retrieve(
                collection_id,
                question,
                self.config.retrieval.top_k,
                self.config.retrieval.score_threshold,
            )
            .await?
        {
            Some(retrieved) => retrieved,
            None => {
                debug!(collection_id, "ask before any ingest");
                return Ok(AskOutcome::NoDocumentContext);
            }
        };

        let synthesis = self
            .synthesizer
            .synthesize(question, &retrieved, language_hint)
            .await?;

        self.sessions
            .ensure_session(session_id, user_id, collection_id)
            .await?;
        let turn = self
            .sessions
            .append_turn(session_id, question, &synthesis.answer, &synthesis.citations)
            .await?;

        Ok(AskOutcome::Answered(turn))
    }

    pub async fn list_sessions(&self, user_id: &str) -> Result<Vec<ChatSession>, EngineError> {
        self.sessions.list_sessions(user_id).await
    }

    pub async fn list_turns(&self, session_id: &str) -> Result<Vec<Turn>, EngineError> {
        self.sessions.list_turns(session_id).await
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<(), EngineError> {
        self.sessions.delete_session(session_id).await
    }

    /// Destroy a collection: remove the durable snapshot and evict the
    /// cached index.
    pub async fn delete_collection(&self, collection_id: &str) -> Result<(), EngineError> {
        self.sync.delete(collection_id).await?;
        self.cache.evict(collection_id).await;
        info!(collection_id, "collection deleted");
        Ok(())
    }
}
