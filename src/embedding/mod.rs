//! Concrete embedding providers and the factory that builds the chain.
//!
//! Remote providers share one implementation, [`RemoteEmbedder`], tagged
//! with the [`EmbeddingApi`] it speaks. The local provider runs fastembed
//! in-process and is behind the `local-embeddings-fastembed` feature.
//!
//! # Defaults per kind
//!
//! | Kind | Model | Dims | Batch | Key variable |
//! |------|-------|------|-------|--------------|
//! | `cohere` | `embed-english-v3.0` | 1024 | 96 | `COHERE_API_KEY` |
//! | `gemini` | `embedding-001` | 768 | 100 (one request per text) | `GEMINI_API_KEY` |
//! | `openai` | `text-embedding-3-small` | 1536 | 100 | `OPENAI_API_KEY` |
//! | `ollama` | `nomic-embed-text` | 768 | 64 | none |
//! | `local` | `all-minilm-l6-v2` | 384 | 64 | none |
//!
//! A provider whose key variable is unset reports `is_available() == false`
//! and is skipped by the chain without counting as a failure.
//!
//! Retries follow [`crate::http::send_json`].

#[cfg(feature = "local-embeddings-fastembed")]
mod local;

use anyhow::{bail, Result};
use async_trait::async_trait;
use letterbox_core::embedding::{EmbeddingChain, EmbeddingProvider};
use letterbox_core::RagError;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::config::{EmbeddingConfig, EmbeddingProviderConfig};
use crate::http;

/// Accepted values of `embedding.providers[].kind`.
pub const EMBEDDING_KINDS: &[&str] = &["cohere", "gemini", "openai", "ollama", "local"];

/// Wire protocol of a remote embedding service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingApi {
    Cohere,
    Gemini,
    OpenAI,
    Ollama,
}

impl EmbeddingApi {
    fn from_kind(kind: &str) -> Option<Self> {
        match kind {
            "cohere" => Some(Self::Cohere),
            "gemini" => Some(Self::Gemini),
            "openai" => Some(Self::OpenAI),
            "ollama" => Some(Self::Ollama),
            _ => None,
        }
    }

    fn kind(self) -> &'static str {
        match self {
            Self::Cohere => "cohere",
            Self::Gemini => "gemini",
            Self::OpenAI => "openai",
            Self::Ollama => "ollama",
        }
    }

    fn default_model(self) -> &'static str {
        match self {
            Self::Cohere => "embed-english-v3.0",
            Self::Gemini => "embedding-001",
            Self::OpenAI => "text-embedding-3-small",
            Self::Ollama => "nomic-embed-text",
        }
    }

    fn default_dims(self) -> usize {
        match self {
            Self::Cohere => 1024,
            Self::Gemini => 768,
            Self::OpenAI => 1536,
            Self::Ollama => 768,
        }
    }

    fn default_batch(self) -> usize {
        match self {
            Self::Cohere => 96,
            Self::Gemini | Self::OpenAI => 100,
            Self::Ollama => 64,
        }
    }

    fn default_key_env(self) -> Option<&'static str> {
        match self {
            Self::Cohere => Some("COHERE_API_KEY"),
            Self::Gemini => Some("GEMINI_API_KEY"),
            Self::OpenAI => Some("OPENAI_API_KEY"),
            Self::Ollama => None,
        }
    }

    fn default_url(self) -> &'static str {
        match self {
            Self::Cohere => "https://api.cohere.ai/v1/embed",
            Self::Gemini => "https://generativelanguage.googleapis.com/v1beta",
            Self::OpenAI => "https://api.openai.com/v1/embeddings",
            Self::Ollama => "http://localhost:11434",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Cohere => "Cohere",
            Self::Gemini => "Gemini",
            Self::OpenAI => "OpenAI",
            Self::Ollama => "Ollama",
        }
    }
}

/// An embedding provider reached over HTTP.
pub struct RemoteEmbedder {
    api: EmbeddingApi,
    model: String,
    dims: usize,
    batch_size: usize,
    api_key: Option<String>,
    needs_key: bool,
    url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl RemoteEmbedder {
    pub fn new(
        api: EmbeddingApi,
        entry: &EmbeddingProviderConfig,
        common: &EmbeddingConfig,
    ) -> Result<Self> {
        let key_env = entry
            .api_key_env
            .clone()
            .or_else(|| api.default_key_env().map(str::to_string));
        let api_key = key_env.as_deref().and_then(http::api_key);
        if let (Some(var), None) = (&key_env, &api_key) {
            tracing::info!(provider = api.kind(), var = %var, "API key not set, provider disabled");
        }

        Ok(Self {
            api,
            model: entry
                .model
                .clone()
                .unwrap_or_else(|| api.default_model().to_string()),
            dims: entry.dims.unwrap_or_else(|| api.default_dims()),
            batch_size: entry.batch_size.unwrap_or_else(|| api.default_batch()),
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

    async fn request(&self, texts: &[String], query: bool) -> Result<Vec<Vec<f32>>> {
        match self.api {
            EmbeddingApi::Cohere => {
                let key = self.key()?;
                let body = cohere_body(&self.model, texts, query);
                let json = http::send_json(self.api.label(), self.max_retries, || {
                    self.client
                        .post(&self.url)
                        .bearer_auth(key)
                        .json(&body)
                })
                .await?;
                parse_cohere_response(&json)
            }
            EmbeddingApi::Gemini => {
                let key = self.key()?;
                let endpoint = format!(
                    "{}/models/{}:embedContent",
                    self.url.trim_end_matches('/'),
                    self.model
                );
                let mut out = Vec::with_capacity(texts.len());
                for text in texts {
                    let body = gemini_body(&self.model, text, query);
                    let json = http::send_json(self.api.label(), self.max_retries, || {
                        self.client
                            .post(&endpoint)
                            .query(&[("key", key)])
                            .json(&body)
                    })
                    .await?;
                    out.push(parse_gemini_response(&json)?);
                }
                Ok(out)
            }
            EmbeddingApi::OpenAI => {
                let key = self.key()?;
                let body = json!({ "model": self.model, "input": texts });
                let json = http::send_json(self.api.label(), self.max_retries, || {
                    self.client
                        .post(&self.url)
                        .bearer_auth(key)
                        .json(&body)
                })
                .await?;
                parse_openai_response(&json)
            }
            EmbeddingApi::Ollama => {
                let endpoint = format!("{}/api/embed", self.url.trim_end_matches('/'));
                let body = json!({ "model": self.model, "input": texts });
                let json = http::send_json(self.api.label(), self.max_retries, || {
                    self.client.post(&endpoint).json(&body)
                })
                .await?;
                parse_ollama_response(&json)
            }
        }
    }
}

#[async_trait]
impl EmbeddingProvider for RemoteEmbedder {
    fn name(&self) -> &str {
        self.api.kind()
    }
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn max_batch(&self) -> usize {
        self.batch_size
    }
    fn is_available(&self) -> bool {
        !self.needs_key || self.api_key.is_some()
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.request(texts, false).await
    }
    async fn embed_queries(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.request(texts, true).await
    }
}

fn cohere_body(model: &str, texts: &[String], query: bool) -> Value {
    json!({
        "model": model,
        "texts": texts,
        "input_type": if query { "search_query" } else { "search_document" },
        "truncate": "END",
    })
}

fn gemini_body(model: &str, text: &str, query: bool) -> Value {
    json!({
        "model": format!("models/{}", model),
        "content": { "parts": [{ "text": text }] },
        "taskType": if query { "RETRIEVAL_QUERY" } else { "RETRIEVAL_DOCUMENT" },
    })
}

fn float_array(value: &Value, what: &str) -> Result<Vec<f32>> {
    let items = value
        .as_array()
        .ok_or_else(|| anyhow::anyhow!("Invalid {} response: embedding is not an array", what))?;
    items
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| anyhow::anyhow!("Invalid {} response: non-numeric component", what))
        })
        .collect()
}

/// `{"embeddings": [[...], ...]}`
fn parse_cohere_response(json: &Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid Cohere response: missing embeddings array"))?;
    embeddings.iter().map(|e| float_array(e, "Cohere")).collect()
}

/// `{"embedding": {"values": [...]}}`
fn parse_gemini_response(json: &Value) -> Result<Vec<f32>> {
    let values = json
        .get("embedding")
        .and_then(|e| e.get("values"))
        .ok_or_else(|| anyhow::anyhow!("Invalid Gemini response: missing embedding.values"))?;
    float_array(values, "Gemini")
}

/// `{"data": [{"index": 0, "embedding": [...]}, ...]}`, reordered by index.
fn parse_openai_response(json: &Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(Value::as_u64)
            .map(|i| i as usize)
            .unwrap_or(position);
        let embedding = item
            .get("embedding")
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing embedding"))?;
        indexed.push((index, float_array(embedding, "OpenAI")?));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

/// `{"embeddings": [[...], ...]}`
fn parse_ollama_response(json: &Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing embeddings array"))?;
    embeddings.iter().map(|e| float_array(e, "Ollama")).collect()
}

/// Create one provider from its config entry.
///
/// # Errors
///
/// Unknown kinds, and `local` when the crate was built without
/// `--features local-embeddings-fastembed`.
pub fn create_provider(
    entry: &EmbeddingProviderConfig,
    common: &EmbeddingConfig,
) -> Result<Arc<dyn EmbeddingProvider>> {
    if let Some(api) = EmbeddingApi::from_kind(&entry.kind) {
        return Ok(Arc::new(RemoteEmbedder::new(api, entry, common)?));
    }
    match entry.kind.as_str() {
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Arc::new(local::LocalEmbedder::new(entry)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings-fastembed"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Build the priority-ordered chain from `[embedding]`.
pub fn create_chain(config: &EmbeddingConfig) -> Result<EmbeddingChain> {
    let providers = config
        .providers
        .iter()
        .map(|entry| create_provider(entry, config))
        .collect::<Result<Vec<_>>>()?;
    Ok(EmbeddingChain::new(
        providers,
        config.dimension,
        config.cache_size,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn common() -> EmbeddingConfig {
        EmbeddingConfig::default()
    }

    #[test]
    fn test_defaults_per_kind() {
        let entry = EmbeddingProviderConfig {
            api_key_env: Some("LETTERBOX_TEST_UNSET_COHERE".into()),
            ..EmbeddingProviderConfig::of_kind("cohere")
        };
        let p = create_provider(&entry, &common()).unwrap();
        assert_eq!(p.name(), "cohere");
        assert_eq!(p.model_name(), "embed-english-v3.0");
        assert_eq!(p.dims(), 1024);
        assert_eq!(p.max_batch(), 96);
        assert!(!p.is_available());
    }

    #[test]
    fn test_keyless_ollama_is_available() {
        let entry = EmbeddingProviderConfig {
            dims: Some(1024),
            ..EmbeddingProviderConfig::of_kind("ollama")
        };
        let p = create_provider(&entry, &common()).unwrap();
        assert!(p.is_available());
        assert_eq!(p.dims(), 1024);
        assert_eq!(p.model_name(), "nomic-embed-text");
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert!(create_provider(&EmbeddingProviderConfig::of_kind("magic"), &common()).is_err());
    }

    #[tokio::test]
    async fn test_missing_key_is_provider_unavailable() {
        let entry = EmbeddingProviderConfig {
            api_key_env: Some("LETTERBOX_TEST_UNSET_OPENAI".into()),
            ..EmbeddingProviderConfig::of_kind("openai")
        };
        let p = create_provider(&entry, &common()).unwrap();
        let err = p.embed(&["hi".to_string()]).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RagError>(),
            Some(RagError::ProviderUnavailable { .. })
        ));
    }

    #[test]
    fn test_request_bodies_mark_queries() {
        let body = cohere_body("embed-english-v3.0", &["a".to_string()], true);
        assert_eq!(body["input_type"], "search_query");
        let body = cohere_body("embed-english-v3.0", &["a".to_string()], false);
        assert_eq!(body["input_type"], "search_document");

        let body = gemini_body("embedding-001", "a", false);
        assert_eq!(body["model"], "models/embedding-001");
        assert_eq!(body["taskType"], "RETRIEVAL_DOCUMENT");
    }

    #[test]
    fn test_parse_responses() {
        let cohere = json!({ "embeddings": [[0.1, 0.2], [0.3, 0.4]] });
        assert_eq!(parse_cohere_response(&cohere).unwrap().len(), 2);

        let gemini = json!({ "embedding": { "values": [0.5, 0.25] } });
        assert_eq!(parse_gemini_response(&gemini).unwrap(), vec![0.5, 0.25]);

        let openai = json!({ "data": [
            { "index": 1, "embedding": [2.0] },
            { "index": 0, "embedding": [1.0] }
        ]});
        assert_eq!(parse_openai_response(&openai).unwrap(), vec![vec![1.0], vec![2.0]]);

        let ollama = json!({ "embeddings": [[1.0, "x"]] });
        assert!(parse_ollama_response(&ollama).is_err());
        assert!(parse_cohere_response(&json!({ "message": "invalid api token" })).is_err());
    }

    #[test]
    fn test_chain_keeps_config_order() {
        let config = EmbeddingConfig {
            providers: vec![
                EmbeddingProviderConfig::of_kind("ollama"),
                EmbeddingProviderConfig::of_kind("openai"),
            ],
            ..EmbeddingConfig::default()
        };
        let chain = create_chain(&config).unwrap();
        assert_eq!(chain.provider_names(), vec!["ollama", "openai"]);
        assert_eq!(chain.active_dims(), 768);
    }
}
