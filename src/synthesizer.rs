//! Citation-aware answer synthesis over retrieved chunks.
//!
//! The synthesizer assembles a bounded context window from the retrieved
//! passages (highest score first), instructs an external generation service
//! to answer only from that context, and resolves the service's bracketed
//! passage markers back to chunk ids. "Not answerable from the document" is
//! a first-class outcome (`grounded = false`, no citations), never an
//! exception — callers can distinguish it from transport failures, which
//! surface as [`EngineError::GenerationUnavailable`].
//!
//! The HTTP client follows the same retry discipline as the embedding
//! client: bounded exponential backoff on 429/5xx/network errors, immediate
//! failure on other 4xx, every request bounded by a timeout.

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use crate::config::GenerationConfig;
use crate::error::EngineError;
use crate::retriever::RetrievedChunk;

/// Optional bearer token for the generation service.
pub const GENERATION_API_KEY_VAR: &str = "ASKDOC_GENERATION_API_KEY";

/// Sentinel the generation service emits when the passages do not contain
/// the answer.
const NO_ANSWER_SENTINEL: &str = "NO_ANSWER";

/// Fixed fallback shown to the user for ungrounded turns.
const NOT_FOUND_ANSWER: &str = "Not found in the document.";

/// Request to the external generation service: an instruction, the numbered
/// context passages, and the user's question.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub instruction: String,
    pub context: String,
    pub question: String,
}

/// Response from the generation service. `used_passages` carries 1-based
/// passage numbers when the service reports them; otherwise the synthesizer
/// falls back to parsing bracketed markers out of the answer text.
#[derive(Debug, Clone)]
pub struct GenerationResponse {
    pub text: String,
    pub used_passages: Option<Vec<usize>>,
}

/// Contract to the external generation service.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse, EngineError>;
}

/// A synthesized answer with its source citations.
#[derive(Debug, Clone)]
pub struct Synthesis {
    pub answer: String,
    /// Chunk ids backing the answer, in rank order, deduplicated.
    pub citations: Vec<String>,
    /// `false` when the answer is the fixed "not found" fallback.
    pub grounded: bool,
}

impl Synthesis {
    fn not_found() -> Self {
        Self {
            answer: NOT_FOUND_ANSWER.to_string(),
            citations: Vec::new(),
            grounded: false,
        }
    }
}

/// Assembles prompts, invokes the generation service, extracts citations.
pub struct Synthesizer {
    client: std::sync::Arc<dyn GenerationClient>,
    context_budget: usize,
}

impl Synthesizer {
    pub fn new(client: std::sync::Arc<dyn GenerationClient>, context_budget: usize) -> Self {
        Self {
            client,
            context_budget,
        }
    }

    /// Answer `question` from `retrieved`. An empty `retrieved` slice is
    /// "insufficient context" and short-circuits to the not-found outcome
    /// without calling the generation service.
    pub async fn synthesize(
        &self,
        question: &str,
        retrieved: &[RetrievedChunk],
        language_hint: Option<&str>,
    ) -> Result<Synthesis, EngineError> {
        if retrieved.is_empty() {
            return Ok(Synthesis::not_found());
        }

        let (context, passage_chunk_ids) = build_context(retrieved, self.context_budget);

        let request = GenerationRequest {
            instruction: build_instruction(language_hint),
            context,
            question: question.to_string(),
        };

        let response = self.client.generate(&request).await?;
        let text = response.text.trim().to_string();

        if text.is_empty() || text.starts_with(NO_ANSWER_SENTINEL) {
            return Ok(Synthesis::not_found());
        }

        let numbers = match response.used_passages {
            Some(numbers) => numbers,
            None => parse_passage_markers(&text),
        };

        let mut citations = Vec::new();
        for n in numbers {
            // Markers are 1-based; ignore anything outside the window.
            if n >= 1 && n <= passage_chunk_ids.len() {
                let chunk_id = &passage_chunk_ids[n - 1];
                if !citations.contains(chunk_id) {
                    citations.push(chunk_id.clone());
                }
            }
        }

        debug!(citations = citations.len(), "synthesis complete");

        Ok(Synthesis {
            answer: text,
            citations,
            grounded: true,
        })
    }
}

fn build_instruction(language_hint: Option<&str>) -> String {
    let language_clause = match language_hint {
        Some(language) => format!("Answer in {}.", language),
        None => "Answer in the same language as the question.".to_string(),
    };
    format!(
        "You answer questions using only the numbered context passages provided. \
         Do not use any outside knowledge. \
         Mark every passage you used with its bracketed number, e.g. [2]. \
         If the passages do not contain the answer, reply with exactly {}. \
         {}",
        NO_ANSWER_SENTINEL, language_clause
    )
}

/// Format passages highest-score-first as `[n] text`, truncated to the
/// character budget. The first passage is always included (clipped to the
/// budget if needed, on a char boundary). Returns the context string and
/// the chunk id behind each 1-based passage number.
fn build_context(retrieved: &[RetrievedChunk], budget: usize) -> (String, Vec<String>) {
    let mut context = String::new();
    let mut chunk_ids = Vec::new();

    for (i, item) in retrieved.iter().enumerate() {
        let passage = format!("[{}] {}\n\n", i + 1, item.chunk.text);

        if context.is_empty() && passage.len() > budget {
            let mut cut = budget.min(passage.len());
            while cut > 0 && !passage.is_char_boundary(cut) {
                cut -= 1;
            }
            context.push_str(&passage[..cut]);
            chunk_ids.push(item.chunk.chunk_id.clone());
            break;
        }

        if context.len() + passage.len() > budget {
            break;
        }

        context.push_str(&passage);
        chunk_ids.push(item.chunk.chunk_id.clone());
    }

    (context.trim_end().to_string(), chunk_ids)
}

/// Extract 1-based `[n]` markers from answer text, in order of appearance.
fn parse_passage_markers(text: &str) -> Vec<usize> {
    let mut numbers = Vec::new();
    let bytes = text.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'[' {
            let start = i + 1;
            let mut end = start;
            while end < bytes.len() && bytes[end].is_ascii_digit() {
                end += 1;
            }
            if end > start && end < bytes.len() && bytes[end] == b']' {
                if let Ok(n) = text[start..end].parse::<usize>() {
                    numbers.push(n);
                }
                i = end + 1;
                continue;
            }
        }
        i += 1;
    }

    numbers
}

// ============ HTTP Generation Client ============

/// HTTP client for an OpenAI-compatible `POST {url}/v1/chat/completions`
/// endpoint.
pub struct HttpGenerationClient {
    client: reqwest::Client,
    url: String,
    model: String,
    temperature: f32,
    max_retries: u32,
    api_key: Option<String>,
}

impl HttpGenerationClient {
    pub fn new(config: &GenerationConfig) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| EngineError::GenerationUnavailable(e.to_string()))?;

        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_retries: config.max_retries,
            api_key: std::env::var(GENERATION_API_KEY_VAR).ok(),
        })
    }
}

#[async_trait]
impl GenerationClient for HttpGenerationClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse, EngineError> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": [
                { "role": "system", "content": request.instruction },
                {
                    "role": "user",
                    "content": format!("Context:\n{}\n\nQuestion: {}", request.context, request.question),
                },
            ],
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let mut builder = self
                .client
                .post(format!("{}/v1/chat/completions", self.url))
                .header("Content-Type", "application/json")
                .json(&body);
            if let Some(key) = &self.api_key {
                builder = builder.header("Authorization", format!("Bearer {}", key));
            }

            match builder.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| EngineError::GenerationUnavailable(e.to_string()))?;
                        return parse_completion_response(&json);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        debug!(attempt, %status, "generation request retried");
                        last_err = Some(format!("generation API error {}: {}", status, body_text));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    return Err(EngineError::GenerationUnavailable(format!(
                        "generation API error {}: {}",
                        status, body_text
                    )));
                }
                Err(e) => {
                    last_err = Some(e.to_string());
                    continue;
                }
            }
        }

        Err(EngineError::GenerationUnavailable(
            last_err.unwrap_or_else(|| "generation failed after retries".to_string()),
        ))
    }
}

fn parse_completion_response(json: &serde_json::Value) -> Result<GenerationResponse, EngineError> {
    let text = json
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|t| t.as_str())
        .ok_or_else(|| {
            EngineError::GenerationUnavailable("invalid response: missing message content".to_string())
        })?;

    Ok(GenerationResponse {
        text: text.to_string(),
        used_passages: None,
    })
}
