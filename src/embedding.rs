//! Embedding service contract and HTTP client.
//!
//! The engine never computes embeddings itself; it calls an external
//! OpenAI-compatible embedding service through the narrow
//! [`EmbeddingClient`] contract. Tests substitute a deterministic mock.
//!
//! # Retry Strategy
//!
//! Transient errors are retried with exponential backoff:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)
//!
//! Exhausted retries surface [`EngineError::EmbeddingUnavailable`].

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use crate::config::EmbeddingConfig;
use crate::error::EngineError;

/// Optional bearer token for the embedding service.
pub const EMBEDDING_API_KEY_VAR: &str = "ASKDOC_EMBEDDING_API_KEY";

/// Contract to the external embedding service.
///
/// `embed` returns one vector per input text, in input order. All vectors
/// produced by one client share `model_version` and `dims`; a model change
/// forces full re-embedding of a collection, never partial mixing.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EngineError>;

    /// Identifier recorded on every collection built with this client.
    fn model_version(&self) -> &str;

    fn dims(&self) -> usize;
}

/// HTTP client for an OpenAI-compatible `POST {url}/v1/embeddings` endpoint.
///
/// Batches inputs to bound request count and retries transient failures
/// with bounded exponential backoff.
pub struct HttpEmbeddingClient {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
    batch_size: usize,
    max_retries: u32,
    api_key: Option<String>,
}

impl HttpEmbeddingClient {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| EngineError::EmbeddingUnavailable(e.to_string()))?;

        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            dims: config.dims,
            batch_size: config.batch_size,
            max_retries: config.max_retries,
            api_key: std::env::var(EMBEDDING_API_KEY_VAR).ok(),
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EngineError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let mut request = self
                .client
                .post(format!("{}/v1/embeddings", self.url))
                .header("Content-Type", "application/json")
                .json(&body);
            if let Some(key) = &self.api_key {
                request = request.header("Authorization", format!("Bearer {}", key));
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| EngineError::EmbeddingUnavailable(e.to_string()))?;
                        return parse_embeddings_response(&json, texts.len());
                    }

                    // Rate limited or server error — retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        debug!(attempt, %status, "embedding request retried");
                        last_err = Some(format!("embedding API error {}: {}", status, body_text));
                        continue;
                    }

                    // Client error (not 429) — don't retry
                    let body_text = response.text().await.unwrap_or_default();
                    return Err(EngineError::EmbeddingUnavailable(format!(
                        "embedding API error {}: {}",
                        status, body_text
                    )));
                }
                Err(e) => {
                    last_err = Some(e.to_string());
                    continue;
                }
            }
        }

        Err(EngineError::EmbeddingUnavailable(
            last_err.unwrap_or_else(|| "embedding failed after retries".to_string()),
        ))
    }
}

#[async_trait]
impl EmbeddingClient for HttpEmbeddingClient {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EngineError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            vectors.extend(self.embed_batch(batch).await?);
        }
        Ok(vectors)
    }

    fn model_version(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }
}

/// Parse the `data[].embedding` arrays from an embeddings response, in
/// input order.
fn parse_embeddings_response(
    json: &serde_json::Value,
    expected: usize,
) -> Result<Vec<Vec<f32>>, EngineError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| {
            EngineError::EmbeddingUnavailable("invalid response: missing data array".to_string())
        })?;

    if data.len() != expected {
        return Err(EngineError::EmbeddingUnavailable(format!(
            "invalid response: expected {} embeddings, got {}",
            expected,
            data.len()
        )));
    }

    let mut embeddings = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| {
                EngineError::EmbeddingUnavailable(
                    "invalid response: missing embedding".to_string(),
                )
            })?;

        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        embeddings.push(vec);
    }

    Ok(embeddings)
}
