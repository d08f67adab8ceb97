//! Embedding provider registry and implementations.
//!
//! Providers register a factory under a lowercase name; [`new_provider`]
//! looks the name up and falls back to the deterministic offline provider
//! when no endpoint is configured or the name is unknown, so ingestion and
//! answering work in development without external services.
//!
//! The offline provider derives a pseudo-random unit-range vector from the
//! SHA-256 of the input text, which keeps embeddings stable across runs.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::config::EmbeddingConfig;
use crate::error::{codes, Error, Result};

pub const OFFLINE_PROVIDER: &str = "offline";

/// Capability interface for embedding backends.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &str;
    /// Vector dimensionality every returned embedding has.
    fn dim(&self) -> usize;
    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

type Factory = fn(&EmbeddingConfig) -> Result<Box<dyn EmbeddingProvider>>;

fn registry() -> &'static HashMap<&'static str, Factory> {
    static REGISTRY: OnceLock<HashMap<&'static str, Factory>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut map: HashMap<&'static str, Factory> = HashMap::new();
        map.insert("openai", |cfg| Ok(Box::new(OpenAiEmbeddings::new(cfg)?)));
        map.insert(OFFLINE_PROVIDER, |cfg| {
            Ok(Box::new(OfflineEmbeddings { dim: cfg.dim }))
        });
        map
    })
}

/// Instantiate the configured provider, falling back to the offline one
/// when no endpoint is set or the name is not registered.
pub fn new_provider(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingProvider>> {
    let name = config.provider.trim().to_ascii_lowercase();
    if config.endpoint.trim().is_empty() && name != OFFLINE_PROVIDER {
        warn!(provider = %name, "no embedding endpoint configured, using offline provider");
        return Ok(Box::new(OfflineEmbeddings { dim: config.dim }));
    }
    match registry().get(name.as_str()) {
        Some(factory) => factory(config),
        None => {
            warn!(provider = %name, "unknown embedding provider, using offline provider");
            Ok(Box::new(OfflineEmbeddings { dim: config.dim }))
        }
    }
}

/// Embed texts in batches of `batch_size`, preserving input order.
///
/// A batch whose returned vector count differs from its input count is a
/// hard error; nothing downstream may be written in that case.
pub async fn embed_batched(
    provider: &dyn EmbeddingProvider,
    texts: &[String],
    batch_size: usize,
) -> Result<Vec<Vec<f32>>> {
    let batch_size = batch_size.max(1);
    let mut vectors = Vec::with_capacity(texts.len());
    for batch in texts.chunks(batch_size) {
        let got = provider.embed(batch).await?;
        if got.len() != batch.len() {
            return Err(Error::upstream(
                codes::EMBEDDING_COUNT_MISMATCH,
                format!("provider returned {} vectors for {} inputs", got.len(), batch.len()),
            ));
        }
        vectors.extend(got);
    }
    Ok(vectors)
}

// ---- OpenAI-compatible provider ----

/// Thin client for an OpenAI-compatible `/embeddings` endpoint.
pub struct OpenAiEmbeddings {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    dim: usize,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    embedding: Vec<f32>,
}

impl OpenAiEmbeddings {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        if config.endpoint.trim().is_empty() {
            return Err(Error::config(
                codes::CONFIG_INVALID,
                "embedding.endpoint is required for the openai provider",
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| Error::upstream(codes::EMBEDDING_UPSTREAM, e.to_string()))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            dim: config.dim,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddings {
    fn name(&self) -> &str {
        "openai"
    }

    fn dim(&self) -> usize {
        self.dim
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let mut req = self
            .client
            .post(format!("{}/embeddings", self.endpoint))
            .json(&body);
        if !self.api_key.is_empty() {
            req = req.bearer_auth(&self.api_key);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| Error::upstream(codes::EMBEDDING_UPSTREAM, e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::upstream(
                codes::EMBEDDING_UPSTREAM,
                format!("embeddings endpoint returned {status}: {text}"),
            ));
        }
        let parsed: EmbeddingsResponse = resp
            .json()
            .await
            .map_err(|e| Error::upstream(codes::EMBEDDING_UPSTREAM, e.to_string()))?;
        if parsed.data.is_empty() {
            return Err(Error::upstream(
                codes::EMBEDDING_UPSTREAM,
                "embeddings endpoint returned no data",
            ));
        }
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

// ---- Offline provider ----

/// Deterministic embeddings for development and tests: each text maps to a
/// fixed pseudo-random vector seeded by its SHA-256.
pub struct OfflineEmbeddings {
    pub dim: usize,
}

impl OfflineEmbeddings {
    fn embed_one(&self, text: &str) -> Vec<f32> {
        let digest = Sha256::digest(text.as_bytes());
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&digest);
        let mut rng = StdRng::from_seed(seed);
        (0..self.dim).map(|_| rng.gen_range(-1.0..1.0)).collect()
    }
}

#[async_trait]
impl EmbeddingProvider for OfflineEmbeddings {
    fn name(&self) -> &str {
        OFFLINE_PROVIDER
    }

    fn dim(&self) -> usize {
        self.dim
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}
