//! `lbx` subcommand implementations.
//!
//! Each `run_*` function builds what it needs from the config, does its
//! work and prints human-readable output to stdout. `--json` variants print
//! the serialized structure instead.

use anyhow::{bail, Result};
use letterbox_core::models::{ScoredDocument, SearchFilters};
use letterbox_core::prompt::PromptRegistry;

use crate::config::Config;
use crate::pipeline::{Pipeline, QueryRequest};
use crate::prompts;

const EXCERPT_CHARS: usize = 200;

pub async fn run_init(config: &Config, force: bool) -> Result<()> {
    let pipeline = Pipeline::from_config(config)?;
    let report = pipeline.initialize(force).await?;

    println!("Letterbox initialized.");
    println!();
    println!("  Emails:      {}", report.documents);
    println!("  Chunks:      {}", report.chunks);
    println!("  Personas:    {} new emails recorded", report.personas_updated);
    println!(
        "  Search:      {}",
        if report.vector_index {
            "vector index"
        } else {
            "text search only (no embeddings)"
        }
    );
    Ok(())
}

pub async fn run_refresh(config: &Config) -> Result<()> {
    let pipeline = Pipeline::from_config(config)?;
    let report = pipeline.refresh_index(true).await?;
    println!(
        "Index rebuilt: {} emails, {} chunks{}.",
        report.documents,
        report.chunks,
        if report.vector_index { "" } else { " (text search only)" }
    );
    Ok(())
}

pub async fn run_query(config: &Config, request: QueryRequest, json: bool) -> Result<()> {
    let pipeline = Pipeline::from_config(config)?;
    pipeline.open().await?;
    let response = pipeline.query(&request).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    println!("{}", response.answer);
    println!();
    if let Some(traits) = &response.persona_traits {
        println!("Voice: {}", traits.replace('\n', " ").trim());
    }
    if !response.context.is_empty() {
        println!("Sources:");
        for (i, hit) in response.context.iter().enumerate() {
            println!("  [Source {}] {}", i + 1, source_line(hit));
        }
    }
    println!(
        "({} / {}, {:.2}s{})",
        response.provider.as_deref().unwrap_or("-"),
        response.model.as_deref().unwrap_or("-"),
        response.processing_time,
        if response.cached { ", cached" } else { "" }
    );
    if let Some(error) = &response.error {
        bail!("{}", error);
    }
    Ok(())
}

pub async fn run_search(
    config: &Config,
    query: &str,
    filters: SearchFilters,
    k: Option<usize>,
) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }
    let pipeline = Pipeline::from_config(config)?;
    pipeline.open().await?;
    let results = pipeline.search_only(query, &filters, k).await;

    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, hit) in results.iter().enumerate() {
        let doc = &hit.document;
        println!("{}. [{:.2}] {}", i + 1, hit.score, source_line(hit));
        if let Some(date) = doc.date() {
            println!("    date: {}", date.format("%Y-%m-%d"));
        }
        if let Some(label) = doc.label() {
            println!("    label: {}", label);
        }
        println!("    excerpt: \"{}\"", excerpt(&doc.content, EXCERPT_CHARS));
        if let Some(id) = doc.source_id() {
            println!("    id: {}", id);
        }
        println!();
    }
    Ok(())
}

pub async fn run_stats(config: &Config, json: bool) -> Result<()> {
    let pipeline = Pipeline::from_config(config)?;
    pipeline.open().await?;
    let stats = pipeline.stats().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    let index = &stats.index;
    println!("Letterbox Pipeline Stats");
    println!("==========================");
    println!();
    println!("  State:       {:?}", stats.state);
    println!("  Index dir:   {}", config.data.index_dir.display());
    println!(
        "  Index:       {} ({} vectors, {} documents{})",
        match index.kind {
            Some(kind) => format!("{:?}", kind).to_lowercase(),
            None => "none".to_string(),
        },
        index.population,
        index.documents,
        if index.corrupted { ", CORRUPTED" } else { "" }
    );
    if let Some(dim) = index.dimension {
        println!("  Dimension:   {}", dim);
    }
    if let Some(provider) = &index.provider {
        println!("  Embedded by: {}", provider);
    }
    if let Some(built) = index.built_at {
        println!("  Built:       {}", format_age(chrono::Utc::now() - built));
    }
    println!("  Personas:    {}", stats.personas);
    println!();
    println!("  Settings:");
    println!(
        "    chunk_size {} / overlap {} / top_k {}",
        stats.settings.chunk_size, stats.settings.chunk_overlap, stats.settings.top_k
    );
    println!(
        "    embedding:  {}",
        stats.settings.embedding_providers.join(" → ")
    );
    println!(
        "    generation: {}",
        stats.settings.generation_providers.join(" → ")
    );
    Ok(())
}

pub async fn run_providers(config: &Config) -> Result<()> {
    let pipeline = Pipeline::from_config(config)?;
    let report = pipeline.test_connections().await;

    println!("{:<12} {:<10} {:<10} STATUS", "PROVIDER", "KIND", "AVAILABLE");
    for (kind, list) in [("embedding", &report.embedding), ("generation", &report.generation)] {
        for health in list {
            let status = match (&health.error, health.healthy) {
                (Some(e), _) => e.clone(),
                (None, true) => "OK".to_string(),
                (None, false) => "unhealthy".to_string(),
            };
            println!(
                "{:<12} {:<10} {:<10} {}",
                health.name,
                kind,
                if health.available { "yes" } else { "no" },
                status
            );
        }
    }
    Ok(())
}

pub fn run_prompts(config: &Config) -> Result<()> {
    let registry: PromptRegistry = prompts::load_registry(config.data.prompts_path.as_deref())?;
    for info in registry.list() {
        println!("{} (v{}): {}", info.name, info.version, info.title);
        println!("    {}", info.description);
        println!("    variables: {}", info.variables.join(", "));
    }
    Ok(())
}

pub async fn run_analyze(config: &Config, email_id: &str, json: bool) -> Result<()> {
    let pipeline = Pipeline::from_config(config)?;
    let Some(analysis) = pipeline.analyze(email_id).await? else {
        bail!("Email not found: {}", email_id);
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&analysis)?);
        return Ok(());
    }

    println!(
        "{} / {}",
        analysis.sender.as_deref().unwrap_or("Unknown sender"),
        analysis.subject.as_deref().unwrap_or("No subject")
    );
    println!();
    println!("Summary:   {}", analysis.summary);
    println!("Topics:    {}", analysis.topics.join(", "));
    println!(
        "Sentiment: {:?} ({})",
        analysis.sentiment.sentiment,
        analysis.sentiment.explanation.replace('\n', " ")
    );
    Ok(())
}

fn source_line(hit: &ScoredDocument) -> String {
    format!(
        "{} / {}",
        hit.document.sender().unwrap_or("Unknown sender"),
        hit.document.subject().unwrap_or("No subject")
    )
}

/// First `max` characters on one line, with `...` when cut.
fn excerpt(text: &str, max: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max {
        return flat;
    }
    let cut: String = flat.chars().take(max).collect();
    format!("{}...", cut.trim_end())
}

fn format_age(delta: chrono::Duration) -> String {
    let secs = delta.num_seconds();
    if secs < 60 {
        "just now".to_string()
    } else if secs < 3600 {
        let mins = secs / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if secs < 86400 {
        let hours = secs / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else {
        let days = secs / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_excerpt_flattens_and_cuts() {
        assert_eq!(excerpt("one\n two   three", 50), "one two three");
        assert_eq!(excerpt("abcdef ghij", 6), "abcdef...");
        assert_eq!(excerpt("héllo wörld", 5), "héllo...");
    }

    #[test]
    fn test_format_age() {
        assert_eq!(format_age(Duration::seconds(5)), "just now");
        assert_eq!(format_age(Duration::minutes(1)), "1 min ago");
        assert_eq!(format_age(Duration::hours(3)), "3 hours ago");
        assert_eq!(format_age(Duration::days(2)), "2 days ago");
    }
}
