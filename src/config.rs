//! TOML configuration with environment overrides.
//!
//! Every knob has a default, so an empty config file (or no file at all)
//! yields a working offline setup: deterministic embeddings, a template
//! generation provider, and the standard chunking/retrieval parameters.
//! `RAGKIT_*` environment variables override the file for the values that
//! differ per deployment (endpoints and secrets).

use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::Path;

use crate::error::{codes, Error, Result};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant. Answer using the provided context. If the context is insufficient, say you don't know.";
pub const DEFAULT_REFUSAL_MESSAGE: &str =
    "I don't have enough information to answer that based on the provided knowledge.";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub rag: RagConfig,
    #[serde(default)]
    pub qdrant: QdrantConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_offline_provider")]
    pub provider: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub model: String,
    #[serde(default = "default_embedding_dim")]
    pub dim: usize,
    #[serde(default = "default_embedding_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_offline_provider(),
            endpoint: String::new(),
            api_key: String::new(),
            model: String::new(),
            dim: default_embedding_dim(),
            timeout_ms: default_embedding_timeout_ms(),
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_offline_provider")]
    pub provider: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub model: String,
    #[serde(default = "default_llm_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_refusal_message")]
    pub refusal_message: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_offline_provider(),
            endpoint: String::new(),
            api_key: String::new(),
            model: String::new(),
            timeout_ms: default_llm_timeout_ms(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            system_prompt: default_system_prompt(),
            refusal_message: default_refusal_message(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            overlap: default_overlap(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RagConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f32,
    #[serde(default = "default_rag_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_retrieve_timeout_ms")]
    pub retrieve_timeout_ms: u64,
    #[serde(default = "default_retrieve_concurrency")]
    pub retrieve_concurrency: usize,
    #[serde(default = "default_rerank_weight")]
    pub rerank_weight: f32,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            score_threshold: default_score_threshold(),
            timeout_ms: default_rag_timeout_ms(),
            retrieve_timeout_ms: default_retrieve_timeout_ms(),
            retrieve_concurrency: default_retrieve_concurrency(),
            rerank_weight: default_rerank_weight(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QdrantConfig {
    #[serde(default = "default_qdrant_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_collection")]
    pub collection: String,
}

impl Default for QdrantConfig {
    fn default() -> Self {
        Self {
            endpoint: default_qdrant_endpoint(),
            api_key: String::new(),
            collection: default_collection(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// When true, the CLI enqueues ingestion jobs instead of running inline.
    #[serde(default)]
    pub async_enabled: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            async_enabled: false,
            max_retries: default_max_retries(),
        }
    }
}

fn default_offline_provider() -> String {
    "offline".to_string()
}
fn default_embedding_dim() -> usize {
    384
}
fn default_embedding_timeout_ms() -> u64 {
    10_000
}
fn default_batch_size() -> usize {
    64
}
fn default_llm_timeout_ms() -> u64 {
    15_000
}
fn default_temperature() -> f32 {
    0.2
}
fn default_max_tokens() -> u32 {
    512
}
fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}
fn default_refusal_message() -> String {
    DEFAULT_REFUSAL_MESSAGE.to_string()
}
fn default_chunk_size() -> usize {
    400
}
fn default_overlap() -> usize {
    50
}
fn default_top_k() -> usize {
    5
}
fn default_score_threshold() -> f32 {
    0.2
}
fn default_rag_timeout_ms() -> u64 {
    20_000
}
fn default_retrieve_timeout_ms() -> u64 {
    8_000
}
fn default_retrieve_concurrency() -> usize {
    8
}
fn default_rerank_weight() -> f32 {
    0.3
}
fn default_qdrant_endpoint() -> String {
    "http://127.0.0.1:6333".to_string()
}
fn default_collection() -> String {
    "ragkit_chunks".to_string()
}
fn default_max_retries() -> u32 {
    3
}

impl Config {
    /// Hash over the parameters that shape the index. Two configs with the
    /// same fingerprint produce compatible collections; a changed
    /// fingerprint means existing points must be re-ingested.
    pub fn index_fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.chunking.chunk_size.to_le_bytes());
        hasher.update(self.chunking.overlap.to_le_bytes());
        hasher.update(self.embedding.provider.as_bytes());
        hasher.update([0]);
        hasher.update(self.embedding.model.as_bytes());
        hasher.update([0]);
        hasher.update(self.embedding.dim.to_le_bytes());
        hasher.update(self.embedding.endpoint.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Load a config file, apply `RAGKIT_*` environment overrides, validate.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::config(
            codes::CONFIG_INVALID,
            format!("failed to read {}: {}", path.display(), e),
        )
    })?;
    let mut config: Config = toml::from_str(&content).map_err(|e| {
        Error::config(
            codes::CONFIG_INVALID,
            format!("failed to parse {}: {}", path.display(), e),
        )
    })?;
    apply_env_overrides(&mut config);
    validate(&config)?;
    Ok(config)
}

/// Defaults plus environment overrides; used when no config file is given.
pub fn default_config() -> Result<Config> {
    let mut config = Config::default();
    apply_env_overrides(&mut config);
    validate(&config)?;
    Ok(config)
}

fn apply_env_overrides(config: &mut Config) {
    let overrides: [(&str, &mut String); 8] = [
        ("RAGKIT_EMBEDDING_PROVIDER", &mut config.embedding.provider),
        ("RAGKIT_EMBEDDING_ENDPOINT", &mut config.embedding.endpoint),
        ("RAGKIT_EMBEDDING_API_KEY", &mut config.embedding.api_key),
        ("RAGKIT_GENERATION_PROVIDER", &mut config.generation.provider),
        ("RAGKIT_GENERATION_ENDPOINT", &mut config.generation.endpoint),
        ("RAGKIT_GENERATION_API_KEY", &mut config.generation.api_key),
        ("RAGKIT_QDRANT_ENDPOINT", &mut config.qdrant.endpoint),
        ("RAGKIT_COLLECTION", &mut config.qdrant.collection),
    ];
    for (key, slot) in overrides {
        if let Ok(value) = std::env::var(key) {
            if !value.is_empty() {
                *slot = value;
            }
        }
    }
}

fn validate(config: &Config) -> Result<()> {
    if config.embedding.dim == 0 {
        return Err(Error::config(
            codes::CONFIG_INVALID,
            "embedding.dim must be > 0",
        ));
    }
    if config.embedding.batch_size == 0 {
        return Err(Error::config(
            codes::CONFIG_INVALID,
            "embedding.batch_size must be > 0",
        ));
    }
    if config.chunking.chunk_size == 0 {
        return Err(Error::config(
            codes::CONFIG_INVALID,
            "chunking.chunk_size must be > 0",
        ));
    }
    if config.rag.top_k == 0 {
        return Err(Error::config(codes::CONFIG_INVALID, "rag.top_k must be > 0"));
    }
    if !(0.0..=1.0).contains(&config.rag.score_threshold) {
        return Err(Error::config(
            codes::CONFIG_INVALID,
            "rag.score_threshold must be in [0.0, 1.0]",
        ));
    }
    if config.qdrant.collection.is_empty() {
        return Err(Error::config(
            codes::CONFIG_INVALID,
            "qdrant.collection must not be empty",
        ));
    }
    Ok(())
}
