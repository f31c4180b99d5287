//! TOML configuration for Letterbox.
//!
//! Every section and field has a default, so an empty file is a valid
//! configuration. [`load_config`] parses and validates; validation errors
//! are configuration mistakes and abort startup.
//!
//! ```toml
//! [data]
//! emails_dir = "./data/parsed_emails"
//! index_dir = "./data/vector_store"
//!
//! [chunking]
//! chunk_size = 1000
//! overlap = 100
//!
//! [[embedding.providers]]
//! kind = "cohere"
//!
//! [[generation.providers]]
//! kind = "groq"
//! models = ["gemma2-9b-it", "llama-3.3-70b-versatile"]
//! ```
//!
//! Provider entries are tried in array order. Fields left out of a provider
//! entry (model, dims, token limit, key variable, endpoint) take the
//! per-kind defaults listed in [`crate::embedding`] and
//! [`crate::generation`].

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::embedding::EMBEDDING_KINDS;
use crate::generation::GENERATION_KINDS;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DataConfig {
    /// Root of the parsed-email JSON files.
    #[serde(default = "default_emails_dir")]
    pub emails_dir: PathBuf,
    /// Directory holding `index.bin` and `documents.json`.
    #[serde(default = "default_index_dir")]
    pub index_dir: PathBuf,
    #[serde(default = "default_personas_path")]
    pub personas_path: PathBuf,
    /// Optional prompt-template overrides.
    #[serde(default)]
    pub prompts_path: Option<PathBuf>,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            emails_dir: default_emails_dir(),
            index_dir: default_index_dir(),
            personas_path: default_personas_path(),
            prompts_path: None,
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
        }
    }
}

fn default_emails_dir() -> PathBuf {
    PathBuf::from("./data/parsed_emails")
}
fn default_index_dir() -> PathBuf {
    PathBuf::from("./data/vector_store")
}
fn default_personas_path() -> PathBuf {
    PathBuf::from("./data/personas.json")
}
fn default_include_globs() -> Vec<String> {
    vec!["**/*.json".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Window size in characters.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Characters shared by consecutive chunks. Must be below `chunk_size`.
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

fn default_chunk_size() -> usize {
    1000
}
fn default_overlap() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// A persisted index younger than this is reused by `init`.
    #[serde(default = "default_freshness_hours")]
    pub freshness_hours: u64,
    /// Corpus size above which the clustered index is built.
    #[serde(default = "default_clustered_threshold")]
    pub clustered_threshold: usize,
    /// Clusters probed per query in the clustered index.
    #[serde(default = "default_nprobe")]
    pub nprobe: usize,
    #[serde(default = "default_search_cache_size")]
    pub search_cache_size: usize,
    /// Label applied when a query does not name one.
    #[serde(default)]
    pub default_label: Option<String>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            freshness_hours: default_freshness_hours(),
            clustered_threshold: default_clustered_threshold(),
            nprobe: default_nprobe(),
            search_cache_size: default_search_cache_size(),
            default_label: None,
        }
    }
}

fn default_top_k() -> usize {
    3
}
fn default_freshness_hours() -> u64 {
    24
}
fn default_clustered_threshold() -> usize {
    1000
}
fn default_nprobe() -> usize {
    16
}
fn default_search_cache_size() -> usize {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// Length of the zero vectors returned when every provider fails.
    #[serde(default = "default_dimension")]
    pub dimension: usize,
    #[serde(default = "default_embedding_cache")]
    pub cache_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embedding_providers")]
    pub providers: Vec<EmbeddingProviderConfig>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            dimension: default_dimension(),
            cache_size: default_embedding_cache(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            providers: default_embedding_providers(),
        }
    }
}

/// One entry of `[[embedding.providers]]`.
#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingProviderConfig {
    /// `cohere`, `gemini`, `openai`, `ollama` or `local`.
    pub kind: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    /// Environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Endpoint override.
    #[serde(default)]
    pub url: Option<String>,
}

impl EmbeddingProviderConfig {
    pub fn of_kind(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            model: None,
            dims: None,
            batch_size: None,
            api_key_env: None,
            url: None,
        }
    }
}

fn default_dimension() -> usize {
    1024
}
fn default_embedding_cache() -> usize {
    1000
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    2
}
fn default_embedding_providers() -> Vec<EmbeddingProviderConfig> {
    vec![
        EmbeddingProviderConfig::of_kind("cohere"),
        EmbeddingProviderConfig::of_kind("gemini"),
    ]
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_generation_providers")]
    pub providers: Vec<GenerationProviderConfig>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            providers: default_generation_providers(),
        }
    }
}

/// One entry of `[[generation.providers]]`.
#[derive(Debug, Deserialize, Clone)]
pub struct GenerationProviderConfig {
    /// `groq`, `openai`, `gemini`, `cohere` or `ollama`.
    pub kind: String,
    /// Candidate models in preference order.
    #[serde(default)]
    pub models: Option<Vec<String>>,
    /// Prompt plus completion ceiling in tokens.
    #[serde(default)]
    pub token_limit: Option<usize>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

impl GenerationProviderConfig {
    pub fn of_kind(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            models: None,
            token_limit: None,
            api_key_env: None,
            url: None,
        }
    }
}

fn default_max_tokens() -> u32 {
    800
}
fn default_temperature() -> f32 {
    0.7
}
fn default_generation_providers() -> Vec<GenerationProviderConfig> {
    vec![
        GenerationProviderConfig::of_kind("groq"),
        GenerationProviderConfig::of_kind("gemini"),
        GenerationProviderConfig::of_kind("cohere"),
    ]
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Full query envelopes kept by the pipeline.
    #[serde(default = "default_query_results")]
    pub query_results: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            query_results: default_query_results(),
        }
    }
}

fn default_query_results() -> usize {
    100
}

/// Read, parse and validate a configuration file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Chunking
    if config.chunking.chunk_size == 0 {
        bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.overlap >= config.chunking.chunk_size {
        bail!(
            "chunking.overlap ({}) must be smaller than chunking.chunk_size ({})",
            config.chunking.overlap,
            config.chunking.chunk_size
        );
    }

    // Retrieval
    if config.retrieval.top_k == 0 {
        bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.nprobe == 0 {
        bail!("retrieval.nprobe must be >= 1");
    }

    // Embedding
    if config.embedding.dimension == 0 {
        bail!("embedding.dimension must be > 0");
    }
    for p in &config.embedding.providers {
        if !EMBEDDING_KINDS.contains(&p.kind.as_str()) {
            bail!(
                "Unknown embedding provider: '{}'. Must be one of: {}",
                p.kind,
                EMBEDDING_KINDS.join(", ")
            );
        }
        if p.dims == Some(0) {
            bail!("embedding provider '{}': dims must be > 0", p.kind);
        }
        if p.batch_size == Some(0) {
            bail!("embedding provider '{}': batch_size must be > 0", p.kind);
        }
    }

    // Generation
    if !(0.0..=2.0).contains(&config.generation.temperature) {
        bail!("generation.temperature must be in [0.0, 2.0]");
    }
    for p in &config.generation.providers {
        if !GENERATION_KINDS.contains(&p.kind.as_str()) {
            bail!(
                "Unknown generation provider: '{}'. Must be one of: {}",
                p.kind,
                GENERATION_KINDS.join(", ")
            );
        }
        if matches!(&p.models, Some(models) if models.is_empty()) {
            bail!("generation provider '{}': models must not be empty", p.kind);
        }
        let limit = crate::generation::resolved_token_limit(p);
        if limit <= config.generation.max_tokens as usize {
            bail!(
                "generation provider '{}': token_limit ({}) must exceed generation.max_tokens ({})",
                p.kind,
                limit,
                config.generation.max_tokens
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.chunking.chunk_size, 1000);
        assert_eq!(config.chunking.overlap, 100);
        assert_eq!(config.retrieval.top_k, 3);
        assert_eq!(config.generation.max_tokens, 800);
        assert_eq!(config.embedding.providers[0].kind, "cohere");
        let kinds: Vec<_> = config
            .generation
            .providers
            .iter()
            .map(|p| p.kind.as_str())
            .collect();
        assert_eq!(kinds, ["groq", "gemini", "cohere"]);
        assert_eq!(config.cache.query_results, 100);
    }

    #[test]
    fn test_overlap_must_be_below_chunk_size() {
        let err = parse_config("[chunking]\nchunk_size = 100\noverlap = 100\n").unwrap_err();
        assert!(err.to_string().contains("overlap"));
        assert!(parse_config("[chunking]\nchunk_size = 0\n").is_err());
    }

    #[test]
    fn test_rejects_bad_providers() {
        let unknown = "[[embedding.providers]]\nkind = \"magic\"\n";
        assert!(parse_config(unknown).is_err());

        let empty_models = "[[generation.providers]]\nkind = \"groq\"\nmodels = []\n";
        assert!(parse_config(empty_models).is_err());

        let tight = "[generation]\nmax_tokens = 800\n[[generation.providers]]\nkind = \"cohere\"\ntoken_limit = 800\n";
        assert!(parse_config(tight).is_err());

        assert!(parse_config("[retrieval]\ntop_k = 0\n").is_err());
        assert!(parse_config("[embedding]\ndimension = 0\n").is_err());
    }

    #[test]
    fn test_provider_overrides_parse() {
        let config = parse_config(
            r#"
            [retrieval]
            default_label = "substack.com"

            [[embedding.providers]]
            kind = "ollama"
            model = "nomic-embed-text"
            dims = 768
            url = "http://gpu-box:11434"

            [[generation.providers]]
            kind = "openai"
            models = ["gpt-4o-mini"]
            token_limit = 128000
            api_key_env = "WORK_OPENAI_KEY"
            "#,
        )
        .unwrap();
        assert_eq!(config.retrieval.default_label.as_deref(), Some("substack.com"));
        assert_eq!(config.embedding.providers.len(), 1);
        assert_eq!(config.embedding.providers[0].dims, Some(768));
        assert_eq!(
            config.generation.providers[0].api_key_env.as_deref(),
            Some("WORK_OPENAI_KEY")
        );
    }

    #[test]
    fn test_load_config_reports_missing_file() {
        let err = load_config(Path::new("/nonexistent/letterbox.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_example_config_is_valid() {
        let config = parse_config(include_str!("../config/letterbox.example.toml")).unwrap();
        assert_eq!(config.embedding.providers.len(), 2);
        assert_eq!(config.generation.providers[0].token_limit, Some(8000));
        assert_eq!(config.data.include_globs.len(), 2);
    }
}
