//! Concrete generation providers and the factory that builds the chain.
//!
//! | Kind | Default models | Token limit | Key variable |
//! |------|----------------|-------------|--------------|
//! | `groq` | `gemma2-9b-it`, `meta-llama/llama-4-scout-17b-16e-instruct`, `llama-3.3-70b-versatile` | 8000 | `GROQ_API_KEY` |
//! | `openai` | `gpt-4o-mini` | 128000 | `OPENAI_API_KEY` |
//! | `gemini` | `gemini-1.5-flash` | 1000000 | `GEMINI_API_KEY` |
//! | `cohere` | `command` | 4000 | `COHERE_API_KEY` |
//! | `ollama` | `llama3` | 8192 | none |
//!
//! Groq and OpenAI share the chat-completions wire format. Providers whose
//! key variable is unset are skipped by the chain.

use anyhow::{bail, Result};
use async_trait::async_trait;
use letterbox_core::generation::{GenerationChain, GenerationProvider, GenerationRequest};
use letterbox_core::RagError;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::config::{GenerationConfig, GenerationProviderConfig};
use crate::http;

/// Accepted values of `generation.providers[].kind`.
pub const GENERATION_KINDS: &[&str] = &["groq", "openai", "gemini", "cohere", "ollama"];

/// Wire protocol of a remote completion service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationApi {
    Groq,
    OpenAI,
    Gemini,
    Cohere,
    Ollama,
}

impl GenerationApi {
    pub fn from_kind(kind: &str) -> Option<Self> {
        match kind {
            "groq" => Some(Self::Groq),
            "openai" => Some(Self::OpenAI),
            "gemini" => Some(Self::Gemini),
            "cohere" => Some(Self::Cohere),
            "ollama" => Some(Self::Ollama),
            _ => None,
        }
    }

    fn kind(self) -> &'static str {
        match self {
            Self::Groq => "groq",
            Self::OpenAI => "openai",
            Self::Gemini => "gemini",
            Self::Cohere => "cohere",
            Self::Ollama => "ollama",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Groq => "Groq",
            Self::OpenAI => "OpenAI",
            Self::Gemini => "Gemini",
            Self::Cohere => "Cohere",
            Self::Ollama => "Ollama",
        }
    }

    fn default_models(self) -> &'static [&'static str] {
        match self {
            Self::Groq => &[
                "gemma2-9b-it",
                "meta-llama/llama-4-scout-17b-16e-instruct",
                "llama-3.3-70b-versatile",
            ],
            Self::OpenAI => &["gpt-4o-mini"],
            Self::Gemini => &["gemini-1.5-flash"],
            Self::Cohere => &["command"],
            Self::Ollama => &["llama3"],
        }
    }

    fn default_token_limit(self) -> usize {
        match self {
            Self::Groq => 8000,
            Self::OpenAI => 128_000,
            Self::Gemini => 1_000_000,
            Self::Cohere => 4000,
            Self::Ollama => 8192,
        }
    }

    fn default_key_env(self) -> Option<&'static str> {
        match self {
            Self::Groq => Some("GROQ_API_KEY"),
            Self::OpenAI => Some("OPENAI_API_KEY"),
            Self::Gemini => Some("GEMINI_API_KEY"),
            Self::Cohere => Some("COHERE_API_KEY"),
            Self::Ollama => None,
        }
    }

    fn default_url(self) -> &'static str {
        match self {
            Self::Groq => "https://api.groq.com/openai/v1/chat/completions",
            Self::OpenAI => "https://api.openai.com/v1/chat/completions",
            Self::Gemini => "https://generativelanguage.googleapis.com/v1beta",
            Self::Cohere => "https://api.cohere.ai/v1/chat",
            Self::Ollama => "http://localhost:11434",
        }
    }
}

/// Token ceiling of a provider entry after applying per-kind defaults.
/// Unknown kinds resolve to zero so validation rejects them.
pub fn resolved_token_limit(entry: &GenerationProviderConfig) -> usize {
    entry.token_limit.unwrap_or_else(|| {
        GenerationApi::from_kind(&entry.kind)
            .map(GenerationApi::default_token_limit)
            .unwrap_or(0)
    })
}

/// A completion provider reached over HTTP.
pub struct RemoteGenerator {
    api: GenerationApi,
    models: Vec<String>,
    token_limit: usize,
    api_key: Option<String>,
    needs_key: bool,
    url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl RemoteGenerator {
    pub fn new(
        api: GenerationApi,
        entry: &GenerationProviderConfig,
        common: &GenerationConfig,
    ) -> Result<Self> {
        let key_env = entry
            .api_key_env
            .clone()
            .or_else(|| api.default_key_env().map(str::to_string));
        let api_key = key_env.as_deref().and_then(http::api_key);
        if let (Some(var), None) = (&key_env, &api_key) {
            tracing::info!(provider = api.kind(), var = %var, "API key not set, provider disabled");
        }

        let models = match &entry.models {
            Some(models) if !models.is_empty() => models.clone(),
            _ => api.default_models().iter().map(|m| m.to_string()).collect(),
        };

        Ok(Self {
            api,
            models,
            token_limit: resolved_token_limit(entry),
            api_key,
            needs_key: key_env.is_some(),
            url: entry
                .url
                .clone()
                .unwrap_or_else(|| api.default_url().to_string()),
            max_retries: common.max_retries,
            client: http::client(common.timeout_secs)?,
        })
    }

    fn key(&self) -> Result<&str> {
        match &self.api_key {
            Some(k) => Ok(k),
            None => Err(RagError::ProviderUnavailable {
                provider: self.api.kind().to_string(),
                reason: "API key not set".to_string(),
            }
            .into()),
        }
    }
}

#[async_trait]
impl GenerationProvider for RemoteGenerator {
    fn name(&self) -> &str {
        self.api.kind()
    }

    fn models(&self) -> &[String] {
        &self.models
    }

    fn token_limit(&self) -> usize {
        self.token_limit
    }

    fn is_available(&self) -> bool {
        !self.needs_key || self.api_key.is_some()
    }

    async fn generate(&self, model: &str, request: &GenerationRequest) -> Result<String> {
        let label = self.api.label();
        match self.api {
            GenerationApi::Groq | GenerationApi::OpenAI => {
                let key = self.key()?;
                let body = chat_completion_body(model, request);
                let json = http::send_json(label, self.max_retries, || {
                    self.client.post(&self.url).bearer_auth(key).json(&body)
                })
                .await?;
                parse_chat_completion(&json, label)
            }
            GenerationApi::Gemini => {
                let key = self.key()?;
                let endpoint = format!(
                    "{}/models/{}:generateContent",
                    self.url.trim_end_matches('/'),
                    model
                );
                let body = gemini_body(request);
                let json = http::send_json(label, self.max_retries, || {
                    self.client
                        .post(&endpoint)
                        .query(&[("key", key)])
                        .json(&body)
                })
                .await?;
                parse_gemini_response(&json)
            }
            GenerationApi::Cohere => {
                let key = self.key()?;
                let body = cohere_body(model, request);
                let json = http::send_json(label, self.max_retries, || {
                    self.client.post(&self.url).bearer_auth(key).json(&body)
                })
                .await?;
                parse_text_field(&json, "text", label)
            }
            GenerationApi::Ollama => {
                let endpoint = format!("{}/api/generate", self.url.trim_end_matches('/'));
                let body = ollama_body(model, request);
                let json = http::send_json(label, self.max_retries, || {
                    self.client.post(&endpoint).json(&body)
                })
                .await?;
                parse_text_field(&json, "response", label)
            }
        }
    }

    async fn health_check(&self) -> Result<()> {
        if self.api != GenerationApi::Ollama {
            return Ok(());
        }
        let endpoint = format!("{}/api/tags", self.url.trim_end_matches('/'));
        let response = self.client.get(&endpoint).send().await?;
        if !response.status().is_success() {
            bail!("Ollama returned {}", response.status());
        }
        Ok(())
    }
}

fn chat_completion_body(model: &str, request: &GenerationRequest) -> Value {
    json!({
        "model": model,
        "messages": [{ "role": "user", "content": request.prompt }],
        "max_tokens": request.max_tokens,
        "temperature": request.temperature,
    })
}

fn gemini_body(request: &GenerationRequest) -> Value {
    json!({
        "contents": [{ "parts": [{ "text": request.prompt }] }],
        "generationConfig": {
            "maxOutputTokens": request.max_tokens,
            "temperature": request.temperature,
        },
    })
}

fn cohere_body(model: &str, request: &GenerationRequest) -> Value {
    json!({
        "model": model,
        "message": request.prompt,
        "max_tokens": request.max_tokens,
        "temperature": request.temperature,
    })
}

fn ollama_body(model: &str, request: &GenerationRequest) -> Value {
    json!({
        "model": model,
        "prompt": request.prompt,
        "stream": false,
        "options": {
            "num_predict": request.max_tokens,
            "temperature": request.temperature,
        },
    })
}

/// `{"choices": [{"message": {"content": "..."}}]}`
fn parse_chat_completion(json: &Value, label: &str) -> Result<String> {
    json.pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("Invalid {} response: missing choices[0].message.content", label))
}

/// `{"candidates": [{"content": {"parts": [{"text": "..."}, ...]}}]}`
fn parse_gemini_response(json: &Value) -> Result<String> {
    let parts = json
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow::anyhow!("Invalid Gemini response: missing candidates[0].content.parts"))?;
    Ok(parts
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join(""))
}

fn parse_text_field(json: &Value, field: &str, label: &str) -> Result<String> {
    json.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("Invalid {} response: missing {}", label, field))
}

/// Create one provider from its config entry.
pub fn create_provider(
    entry: &GenerationProviderConfig,
    common: &GenerationConfig,
) -> Result<Arc<dyn GenerationProvider>> {
    match GenerationApi::from_kind(&entry.kind) {
        Some(api) => Ok(Arc::new(RemoteGenerator::new(api, entry, common)?)),
        None => bail!("Unknown generation provider: {}", entry.kind),
    }
}

/// Build the priority-ordered chain from `[generation]`.
pub fn create_chain(config: &GenerationConfig) -> Result<GenerationChain> {
    let providers = config
        .providers
        .iter()
        .map(|entry| create_provider(entry, config))
        .collect::<Result<Vec<_>>>()?;
    Ok(GenerationChain::new(providers))
}
