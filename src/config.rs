use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    pub embedding: EmbeddingConfig,
    pub generation: GenerationConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Target chunk length in characters.
    #[serde(default = "default_target_size")]
    pub target_size: usize,
    /// Overlap window between consecutive chunks, in characters.
    #[serde(default = "default_overlap")]
    pub overlap: usize,
}

fn default_target_size() -> usize {
    1000
}
fn default_overlap() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Maximum chunks returned per query.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Cosine-similarity floor; results below it are dropped.
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f32,
}

fn default_top_k() -> usize {
    5
}
fn default_score_threshold() -> f32 {
    0.25
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// Base URL of the embedding service (OpenAI-compatible API).
    pub url: String,
    pub model: String,
    pub dims: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// Base URL of the generation service (OpenAI-compatible API).
    pub url: String,
    pub model: String,
    /// Character budget for the assembled context window.
    #[serde(default = "default_context_budget")]
    pub context_budget: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_gen_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_context_budget() -> usize {
    12_000
}
fn default_temperature() -> f32 {
    0.1
}
fn default_gen_timeout_secs() -> u64 {
    60
}

/// Durable snapshot storage for collection indexes.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// `"fs"`, `"memory"`, or `"s3"`.
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Snapshot directory for the `fs` backend.
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
    /// Bucket name for the `s3` backend.
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    /// Key prefix inside the bucket (e.g. `"collections/"`).
    #[serde(default)]
    pub prefix: String,
    /// Custom endpoint for S3-compatible services (MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            root: default_storage_root(),
            bucket: None,
            region: default_region(),
            prefix: String::new(),
            endpoint_url: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_backend() -> String {
    "fs".to_string()
}
fn default_storage_root() -> PathBuf {
    PathBuf::from("./data/snapshots")
}
fn default_region() -> String {
    "us-east-1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.target_size == 0 {
        anyhow::bail!("chunking.target_size must be > 0");
    }
    if config.chunking.overlap >= config.chunking.target_size {
        anyhow::bail!("chunking.overlap must be < chunking.target_size");
    }

    if config.retrieval.top_k < 1 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if !(-1.0..=1.0).contains(&config.retrieval.score_threshold) {
        anyhow::bail!("retrieval.score_threshold must be in [-1.0, 1.0]");
    }

    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    if config.embedding.url.is_empty() || config.generation.url.is_empty() {
        anyhow::bail!("embedding.url and generation.url must be set");
    }

    if config.generation.context_budget == 0 {
        anyhow::bail!("generation.context_budget must be > 0");
    }

    match config.storage.backend.as_str() {
        "fs" | "memory" => {}
        "s3" => {
            if config.storage.bucket.is_none() {
                anyhow::bail!("storage.bucket must be set when backend is 's3'");
            }
        }
        other => anyhow::bail!(
            "Unknown storage backend: '{}'. Must be fs, memory, or s3.",
            other
        ),
    }

    Ok(())
}
