//! Prompt-template overrides.
//!
//! `data.prompts_path` may point at a TOML file replacing the text of
//! built-in templates:
//!
//! ```toml
//! [templates.rag_query]
//! template = """
//! Answer from these emails only, citing [Source N].
//!
//! {context_text}
//!
//! Question: {question}
//! """
//! version = "1.1"
//! ```
//!
//! An override may restate `variables`, but only as the built-in set.
//! Unknown template names and undeclared placeholders are load errors.

use anyhow::{Context, Result};
use letterbox_core::prompt::{PromptComposer, PromptOverride, PromptRegistry};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Default, Deserialize)]
struct PromptsFile {
    #[serde(default)]
    templates: BTreeMap<String, PromptOverride>,
}

/// Built-in templates with the overrides from `text` applied.
pub fn parse_overrides(text: &str) -> Result<PromptRegistry> {
    let file: PromptsFile = toml::from_str(text).context("Failed to parse prompts file")?;
    let mut registry = PromptRegistry::builtin();
    for (name, patch) in file.templates {
        registry
            .apply_override(&name, patch)
            .with_context(|| format!("Invalid override for prompt template '{}'", name))?;
        tracing::debug!(template = %name, "applied prompt override");
    }
    Ok(registry)
}

/// Registry for the configured overrides file, or the built-ins alone.
pub fn load_registry(path: Option<&Path>) -> Result<PromptRegistry> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read prompts file: {}", path.display()))?;
            parse_overrides(&text)
        }
        None => Ok(PromptRegistry::builtin()),
    }
}

pub fn load_composer(path: Option<&Path>) -> Result<PromptComposer> {
    Ok(PromptComposer::new(load_registry(path)?)?)
}
