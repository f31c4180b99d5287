//! JSON-file persona store.
//!
//! The whole [`PersonaBook`] lives in memory and is written back to
//! `data.personas_path` on [`flush`](PersonaStore::flush). Single upserts
//! and label changes write through immediately; batch ingestion through
//! [`upsert_email`](PersonaStore::upsert_email) only marks the book dirty
//! so the pipeline can flush once at the end.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use letterbox_core::models::Persona;
use letterbox_core::persona::PersonaBook;
use letterbox_core::store::PersonaStore;
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};

pub struct JsonPersonaStore {
    path: PathBuf,
    book: RwLock<PersonaBook>,
    dirty: Mutex<bool>,
}

impl JsonPersonaStore {
    /// Open the store at `path`. A missing file is an empty book.
    pub fn open(path: &Path) -> Result<Self> {
        let book = if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read personas file: {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("Failed to parse personas file: {}", path.display()))?
        } else {
            PersonaBook::new()
        };
        tracing::debug!(path = %path.display(), personas = book.len(), "opened persona store");
        Ok(Self {
            path: path.to_path_buf(),
            book: RwLock::new(book),
            dirty: Mutex::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self) -> Result<()> {
        let json = serde_json::to_vec_pretty(&*self.book.read())?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        *self.dirty.lock() = false;
        Ok(())
    }
}

#[async_trait]
impl PersonaStore for JsonPersonaStore {
    async fn get(&self, sender: &str) -> Result<Option<Persona>> {
        Ok(self.book.read().get(sender).cloned())
    }

    async fn upsert(&self, sender: &str, subject: &str, content: &str) -> Result<Persona> {
        let persona = self
            .book
            .write()
            .observe(sender, subject, content, Utc::now());
        self.save()?;
        Ok(persona)
    }

    async fn upsert_email(
        &self,
        email_id: &str,
        sender: &str,
        subject: &str,
        content: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<Option<Persona>> {
        let persona = self
            .book
            .write()
            .observe_email(email_id, sender, subject, content, seen_at);
        if persona.is_some() {
            *self.dirty.lock() = true;
        }
        Ok(persona)
    }

    async fn add_label(&self, sender: &str, label: &str) -> Result<bool> {
        let changed = self.book.write().add_label(sender, label);
        if changed {
            self.save()?;
        }
        Ok(changed)
    }

    async fn find_by_first_name(&self, name: &str) -> Result<Option<Persona>> {
        Ok(self.book.read().find_by_first_name(name).cloned())
    }

    async fn list(&self) -> Result<Vec<Persona>> {
        Ok(self.book.read().list())
    }

    async fn flush(&self) -> Result<()> {
        if *self.dirty.lock() {
            self.save()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_flush_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state/personas.json");
        let sender = "Nate Jones <nate@example.com>";

        let store = JsonPersonaStore::open(&path).unwrap();
        store
            .upsert_email("e1", sender, "AI weekly", "new llm release", Utc::now())
            .await
            .unwrap();
        assert!(!path.exists());
        store.flush().await.unwrap();
        assert!(path.exists());

        let reopened = JsonPersonaStore::open(&path).unwrap();
        let p = reopened.find_by_first_name("nate").await.unwrap().unwrap();
        assert_eq!(p.email_count, 1);
        assert!(p.topics.contains("AI"));
        assert!(reopened
            .upsert_email("e1", sender, "AI weekly", "", Utc::now())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_upsert_and_label_write_through() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("personas.json");
        let store = JsonPersonaStore::open(&path).unwrap();

        store.upsert("ana@example.com", "Hi", "hello").await.unwrap();
        assert!(store.add_label("ana@example.com", "health").await.unwrap());
        assert!(!store.add_label("bob@example.com", "news").await.unwrap());

        let reopened = JsonPersonaStore::open(&path).unwrap();
        let p = reopened.get("ana@example.com").await.unwrap().unwrap();
        assert!(p.labels.contains("health"));
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("personas.json");
        std::fs::write(&path, "[1, 2").unwrap();
        assert!(JsonPersonaStore::open(&path).is_err());
    }
}
