//! Generation provider registry and implementations.
//!
//! Mirrors the embedding registry: factories keyed by lowercase name, with
//! an offline template provider as the fallback when no endpoint is
//! configured or the name is unknown. The offline provider reports itself
//! as such so the query pipeline can skip the cross-encoder re-rank, which
//! is pointless against a canned model.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::GenerationConfig;
use crate::error::{codes, Error, Result};
use crate::models::Usage;

pub const OFFLINE_PROVIDER: &str = "offline";

/// Sampling settings for one generation call.
#[derive(Debug, Clone, Copy)]
pub struct GenerateOptions {
    pub temperature: f32,
    pub max_tokens: u32,
}

/// One completed generation: the reply text plus token accounting.
#[derive(Debug, Clone, Default)]
pub struct Generation {
    pub text: String,
    pub usage: Usage,
}

/// Capability interface for text generation backends.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;
    /// True for the canned fallback; gates the cross-encoder re-rank.
    fn offline(&self) -> bool {
        false
    }
    async fn generate(
        &self,
        system: &str,
        user: &str,
        opts: GenerateOptions,
    ) -> Result<Generation>;
}

type Factory = fn(&GenerationConfig) -> Result<Box<dyn LlmProvider>>;

fn registry() -> &'static HashMap<&'static str, Factory> {
    static REGISTRY: OnceLock<HashMap<&'static str, Factory>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut map: HashMap<&'static str, Factory> = HashMap::new();
        map.insert("openai", |cfg| {
            Ok(Box::new(ChatCompletions::new(cfg, "openai", "gpt-4o-mini")?))
        });
        map.insert("deepseek", |cfg| {
            Ok(Box::new(ChatCompletions::new(cfg, "deepseek", "deepseek-chat")?))
        });
        map.insert(OFFLINE_PROVIDER, |_| Ok(Box::new(TemplateLlm)));
        map
    })
}

/// Instantiate the configured provider, falling back to the offline
/// template provider when no endpoint is set or the name is unknown.
pub fn new_provider(config: &GenerationConfig) -> Result<Box<dyn LlmProvider>> {
    let name = config.provider.trim().to_ascii_lowercase();
    if config.endpoint.trim().is_empty() && name != OFFLINE_PROVIDER {
        warn!(provider = %name, "no generation endpoint configured, using offline provider");
        return Ok(Box::new(TemplateLlm));
    }
    match registry().get(name.as_str()) {
        Some(factory) => factory(config),
        None => {
            warn!(provider = %name, "unknown generation provider, using offline provider");
            Ok(Box::new(TemplateLlm))
        }
    }
}

// ---- OpenAI-compatible chat completions ----

/// Thin client for an OpenAI-compatible `/chat/completions` endpoint.
/// DeepSeek speaks the same protocol; only the name and default model
/// differ.
pub struct ChatCompletions {
    client: reqwest::Client,
    name: &'static str,
    endpoint: String,
    api_key: String,
    model: String,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[derive(Deserialize, Default)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

impl ChatCompletions {
    pub fn new(
        config: &GenerationConfig,
        name: &'static str,
        default_model: &str,
    ) -> Result<Self> {
        if config.endpoint.trim().is_empty() {
            return Err(Error::config(
                codes::CONFIG_INVALID,
                format!("generation.endpoint is required for the {name} provider"),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| Error::upstream(codes::GENERATION_UPSTREAM, e.to_string()))?;
        let model = if config.model.trim().is_empty() {
            default_model.to_string()
        } else {
            config.model.clone()
        };
        Ok(Self {
            client,
            name,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model,
        })
    }
}

#[async_trait]
impl LlmProvider for ChatCompletions {
    fn name(&self) -> &str {
        self.name
    }

    async fn generate(
        &self,
        system: &str,
        user: &str,
        opts: GenerateOptions,
    ) -> Result<Generation> {
        let messages = vec![
            ChatMessage { role: "system", content: system },
            ChatMessage { role: "user", content: user },
        ];
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": opts.temperature,
            "max_tokens": opts.max_tokens,
        });
        let mut req = self
            .client
            .post(format!("{}/chat/completions", self.endpoint))
            .json(&body);
        if !self.api_key.is_empty() {
            req = req.bearer_auth(&self.api_key);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| Error::upstream(codes::GENERATION_UPSTREAM, e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::upstream(
                codes::GENERATION_UPSTREAM,
                format!("chat endpoint returned {status}: {text}"),
            ));
        }
        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| Error::upstream(codes::GENERATION_UPSTREAM, e.to_string()))?;
        let choice = parsed.choices.into_iter().next().ok_or_else(|| {
            Error::upstream(codes::GENERATION_UPSTREAM, "chat endpoint returned no choices")
        })?;
        let usage = parsed.usage.unwrap_or_default();
        Ok(Generation {
            text: choice.message.content,
            usage: Usage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            },
        })
    }
}

// ---- Offline template provider ----

/// Canned replies for development and tests. Echoes the tail of the user
/// prompt so callers can see what reached the model.
pub struct TemplateLlm;

#[async_trait]
impl LlmProvider for TemplateLlm {
    fn name(&self) -> &str {
        OFFLINE_PROVIDER
    }

    fn offline(&self) -> bool {
        true
    }

    async fn generate(
        &self,
        _system: &str,
        user: &str,
        _opts: GenerateOptions,
    ) -> Result<Generation> {
        let question = user
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("")
            .trim();
        Ok(Generation {
            text: format!("(offline) Based on the provided context: {question}"),
            usage: Usage::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> GenerateOptions {
        GenerateOptions {
            temperature: 0.2,
            max_tokens: 64,
        }
    }

    #[tokio::test]
    async fn test_template_echoes_question() {
        let reply = TemplateLlm
            .generate("system", "context block\n\nQuestion: what is this?", opts())
            .await
            .unwrap();
        assert!(reply.text.contains("what is this?"));
        assert!(TemplateLlm.offline());
    }

    #[test]
    fn test_fallback_when_endpoint_missing() {
        let config = GenerationConfig {
            provider: "deepseek".to_string(),
            ..GenerationConfig::default()
        };
        let provider = new_provider(&config).unwrap();
        assert!(provider.offline());
    }

    #[test]
    fn test_registered_providers_require_endpoint() {
        let config = GenerationConfig {
            provider: "openai".to_string(),
            endpoint: "http://localhost:9".to_string(),
            ..GenerationConfig::default()
        };
        let provider = new_provider(&config).unwrap();
        assert_eq!(provider.name(), "openai");
        assert!(!provider.offline());
    }
}
