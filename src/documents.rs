//! Filesystem document store.
//!
//! Walks `data.emails_dir` and turns parsed-email files into
//! [`Document`]s. Two layouts are understood:
//!
//! - **`.json`**: one email record, or an array of them:
//!
//!   ```json
//!   {
//!     "id": "8f2c...",
//!     "subject": "AI weekly",
//!     "sender": "Nate <nate@example.com>",
//!     "date": "2025-03-01T08:30:00Z",
//!     "label": "news",
//!     "has_attachments": false,
//!     "attachment_count": 0,
//!     "content": "..."
//!   }
//!   ```
//!
//!   `email_id` is accepted for `id`, `from` for `sender`, and `body` or
//!   `text` for `content`. Records without content are skipped.
//!
//! - **`.txt`**: the raw body, named `<id>_<subject>.txt`. Sender and label
//!   are `Unknown`.
//!
//! Files are visited in path order so loads are deterministic. Unreadable
//! or malformed files are logged and skipped.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use globset::{Glob, GlobSet, GlobSetBuilder};
use letterbox_core::models::{Document, SearchFilters};
use letterbox_core::store::DocumentStore;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::DataConfig;

const UNKNOWN: &str = "Unknown";

/// A parsed-email record as written by the ingestion side.
#[derive(Debug, Deserialize)]
struct EmailRecord {
    #[serde(default, alias = "email_id")]
    id: Option<String>,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default, alias = "from")]
    sender: Option<String>,
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    has_attachments: bool,
    #[serde(default)]
    attachment_count: u64,
    #[serde(default, alias = "body", alias = "text")]
    content: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EmailFile {
    Many(Vec<EmailRecord>),
    One(Box<EmailRecord>),
}

pub struct FsDocumentStore {
    root: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
}

impl FsDocumentStore {
    pub fn new(config: &DataConfig) -> Result<Self> {
        Ok(Self {
            root: config.emails_dir.clone(),
            include: build_globset(&config.include_globs)?,
            exclude: build_globset(&config.exclude_globs)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Every document under the root, unfiltered. A missing root is an
    /// empty corpus.
    pub fn scan(&self) -> Result<Vec<Document>> {
        if !self.root.exists() {
            tracing::warn!(root = %self.root.display(), "emails directory does not exist");
            return Ok(Vec::new());
        }

        let mut paths = Vec::new();
        for entry in WalkDir::new(&self.root) {
            let entry = entry.with_context(|| format!("Failed to walk {}", self.root.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(&self.root).unwrap_or(path);
            let rel_str = relative.to_string_lossy();
            if self.exclude.is_match(rel_str.as_ref()) || !self.include.is_match(rel_str.as_ref()) {
                continue;
            }
            paths.push(path.to_path_buf());
        }
        paths.sort();

        let mut docs = Vec::new();
        for path in &paths {
            match read_file(path) {
                Ok(mut found) => docs.append(&mut found),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable email file")
                }
            }
        }
        tracing::debug!(files = paths.len(), documents = docs.len(), "scanned emails directory");
        Ok(docs)
    }
}

#[async_trait]
impl DocumentStore for FsDocumentStore {
    async fn load(&self, filters: &SearchFilters) -> Result<Vec<Document>> {
        let now = Utc::now();
        Ok(self
            .scan()?
            .into_iter()
            .filter(|d| filters.matches(d, now))
            .collect())
    }

    async fn get(&self, source_id: &str) -> Result<Option<Document>> {
        Ok(self
            .scan()?
            .into_iter()
            .find(|d| d.source_id() == Some(source_id)))
    }
}

fn read_file(path: &Path) -> Result<Vec<Document>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let source_file = path.display().to_string();

    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => {
            let parsed: EmailFile = serde_json::from_str(&text)
                .with_context(|| format!("Invalid email JSON in {}", path.display()))?;
            let records = match parsed {
                EmailFile::Many(records) => records,
                EmailFile::One(record) => vec![*record],
            };
            let fallback_id = file_stem(path);
            Ok(records
                .into_iter()
                .enumerate()
                .filter_map(|(i, record)| {
                    let id = record.id.clone().unwrap_or_else(|| {
                        if i == 0 {
                            fallback_id.clone()
                        } else {
                            format!("{}-{}", fallback_id, i)
                        }
                    });
                    record_to_document(record, id, &source_file)
                })
                .collect())
        }
        _ => {
            if text.trim().is_empty() {
                return Ok(Vec::new());
            }
            let stem = file_stem(path);
            let (id, subject) = match stem.split_once('_') {
                Some((id, subject)) => (id.to_string(), subject.to_string()),
                None => (stem.clone(), stem.clone()),
            };
            Ok(vec![Document::new(text)
                .with_meta("email_id", id)
                .with_meta("subject", subject)
                .with_meta("sender", UNKNOWN)
                .with_meta("date", "")
                .with_meta("label", UNKNOWN)
                .with_meta("has_attachments", false)
                .with_meta("attachment_count", 0u64)
                .with_meta("source_file", source_file)])
        }
    }
}

fn record_to_document(record: EmailRecord, id: String, source_file: &str) -> Option<Document> {
    let content = record.content.filter(|c| !c.trim().is_empty())?;
    Some(
        Document::new(content)
            .with_meta("email_id", id)
            .with_meta("subject", record.subject.unwrap_or_default())
            .with_meta("sender", record.sender.unwrap_or_else(|| UNKNOWN.to_string()))
            .with_meta("date", record.date.unwrap_or_default())
            .with_meta("label", record.label.unwrap_or_else(|| UNKNOWN.to_string()))
            .with_meta("has_attachments", record.has_attachments)
            .with_meta("attachment_count", record.attachment_count)
            .with_meta("source_file", source_file),
    )
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn store_for(dir: &TempDir, include: &[&str]) -> FsDocumentStore {
        let config = DataConfig {
            emails_dir: dir.path().to_path_buf(),
            include_globs: include.iter().map(|s| s.to_string()).collect(),
            exclude_globs: vec!["drafts/**".to_string()],
            ..DataConfig::default()
        };
        FsDocumentStore::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_loads_single_and_array_records() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("a.json"),
            r#"{"email_id": "e1", "subject": "AI weekly", "from": "Nate <nate@example.com>",
                "label": "news", "date": "2025-03-01", "body": "Models got faster."}"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("b.json"),
            r#"[{"id": "e2", "label": "sports", "content": "The match ended 2-1."},
                {"id": "e3", "content": "   "}]"#,
        )
        .unwrap();

        let store = store_for(&dir, &["**/*.json"]);
        let docs = store.load(&SearchFilters::default()).await.unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].source_id(), Some("e1"));
        assert_eq!(docs[0].sender(), Some("Nate <nate@example.com>"));
        assert_eq!(docs[0].content, "Models got faster.");
        assert_eq!(docs[1].sender(), Some("Unknown"));

        let news = SearchFilters {
            label: Some("news".into()),
            ..Default::default()
        };
        assert_eq!(store.load(&news).await.unwrap().len(), 1);
        assert!(store.get("e2").await.unwrap().is_some());
        assert!(store.get("e3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_text_files_and_globs() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("abc123_Quarterly numbers.txt"), "Revenue is up.").unwrap();
        fs::create_dir(dir.path().join("drafts")).unwrap();
        fs::write(dir.path().join("drafts/x_Draft.txt"), "unsent").unwrap();
        fs::write(dir.path().join("broken.json"), "{ not json").unwrap();

        let store = store_for(&dir, &["**/*.txt", "**/*.json"]);
        let docs = store.scan().unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].source_id(), Some("abc123"));
        assert_eq!(docs[0].subject(), Some("Quarterly numbers"));
        assert_eq!(docs[0].label(), Some("Unknown"));
    }

    #[tokio::test]
    async fn test_missing_root_is_empty_corpus() {
        let dir = TempDir::new().unwrap();
        let config = DataConfig {
            emails_dir: dir.path().join("nope"),
            ..DataConfig::default()
        };
        let store = FsDocumentStore::new(&config).unwrap();
        assert!(store.load(&SearchFilters::default()).await.unwrap().is_empty());
    }
}
