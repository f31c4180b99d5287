//! Error type shared by the core crate.
//!
//! Provider and network failures never surface through these variants to a
//! query caller: the provider chains convert them into fallthrough. What is
//! left is either a programming mistake (template/composer mismatch, bad
//! configuration) or an I/O problem with persisted artifacts.

use thiserror::Error;

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, RagError>;

#[derive(Debug, Error)]
pub enum RagError {
    #[error("provider '{provider}' unavailable: {reason}")]
    ProviderUnavailable { provider: String, reason: String },

    #[error("index corruption: {0}")]
    IndexCorruption(String),

    #[error("template '{template}' is missing required variables: {missing:?}")]
    PromptVariableMissing {
        template: String,
        missing: Vec<String>,
    },

    #[error("template '{template}' does not match its expected variables: {detail}")]
    TemplateMismatch { template: String, detail: String },

    #[error("unknown prompt template: {0}")]
    UnknownTemplate(String),

    #[error("empty input: {0}")]
    EmptyInput(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("an index build is already in progress")]
    BuildInProgress,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
