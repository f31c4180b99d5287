//! In-memory [`DocumentStore`] and [`PersonaStore`] implementations.
//!
//! Both keep their data behind a `parking_lot::RwLock`. Useful for tests
//! and for embedding the pipeline without a filesystem.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::models::{Document, Persona, SearchFilters};
use crate::persona::PersonaBook;

use super::{DocumentStore, PersonaStore};

/// Documents held in a `Vec`, filtered on load.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    docs: RwLock<Vec<Document>>,
}

impl InMemoryDocumentStore {
    pub fn new(docs: Vec<Document>) -> Self {
        Self {
            docs: RwLock::new(docs),
        }
    }

    /// Replace the whole document set.
    pub fn replace(&self, docs: Vec<Document>) {
        *self.docs.write() = docs;
    }

    pub fn push(&self, doc: Document) {
        self.docs.write().push(doc);
    }

    pub fn len(&self) -> usize {
        self.docs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.read().is_empty()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn load(&self, filters: &SearchFilters) -> Result<Vec<Document>> {
        let now = Utc::now();
        Ok(self
            .docs
            .read()
            .iter()
            .filter(|d| filters.matches(d, now))
            .cloned()
            .collect())
    }

    async fn get(&self, source_id: &str) -> Result<Option<Document>> {
        Ok(self
            .docs
            .read()
            .iter()
            .find(|d| d.source_id() == Some(source_id))
            .cloned())
    }
}

/// Persona profiles held in memory.
#[derive(Default)]
pub struct InMemoryPersonaStore {
    book: RwLock<PersonaBook>,
}

impl InMemoryPersonaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_book(book: PersonaBook) -> Self {
        Self {
            book: RwLock::new(book),
        }
    }
}

#[async_trait]
impl PersonaStore for InMemoryPersonaStore {
    async fn get(&self, sender: &str) -> Result<Option<Persona>> {
        Ok(self.book.read().get(sender).cloned())
    }

    async fn upsert(&self, sender: &str, subject: &str, content: &str) -> Result<Persona> {
        Ok(self.book.write().observe(sender, subject, content, Utc::now()))
    }

    async fn upsert_email(
        &self,
        email_id: &str,
        sender: &str,
        subject: &str,
        content: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<Option<Persona>> {
        Ok(self
            .book
            .write()
            .observe_email(email_id, sender, subject, content, seen_at))
    }

    async fn add_label(&self, sender: &str, label: &str) -> Result<bool> {
        Ok(self.book.write().add_label(sender, label))
    }

    async fn find_by_first_name(&self, name: &str) -> Result<Option<Persona>> {
        Ok(self.book.read().find_by_first_name(name).cloned())
    }

    async fn list(&self) -> Result<Vec<Persona>> {
        Ok(self.book.read().list())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, label: &str, sender: &str) -> Document {
        Document::new(format!("body of {}", id))
            .with_meta("email_id", id)
            .with_meta("label", label)
            .with_meta("sender", sender)
    }

    #[tokio::test]
    async fn test_document_store_filters() {
        let store = InMemoryDocumentStore::new(vec![
            doc("a", "news", "nate@example.com"),
            doc("b", "sports", "ana@example.com"),
            doc("c", "news", "ana@example.com"),
        ]);
        assert_eq!(store.load(&SearchFilters::default()).await.unwrap().len(), 3);

        let filters = SearchFilters {
            label: Some("news".into()),
            sender: Some("ana".into()),
            ..Default::default()
        };
        let docs = store.load(&filters).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].source_id(), Some("c"));

        assert!(store.get("b").await.unwrap().is_some());
        assert!(store.get("z").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_persona_store_upsert_cycle() {
        let store = InMemoryPersonaStore::new();
        let sender = "Ana Ruiz <ana@example.com>";
        assert!(store.get(sender).await.unwrap().is_none());

        store.upsert(sender, "Fitness plan", "weekly wellness notes").await.unwrap();
        let p = store.upsert(sender, "Re: plan", "more").await.unwrap();
        assert_eq!(p.email_count, 2);
        assert!(p.topics.contains("Health"));

        assert!(store.add_label(sender, "health").await.unwrap());
        let found = store.find_by_first_name("Ana").await.unwrap().unwrap();
        assert!(found.labels.contains("health"));
        assert_eq!(store.list().await.unwrap().len(), 1);

        let now = Utc::now();
        assert!(store.upsert_email("e9", sender, "x", "y", now).await.unwrap().is_some());
        assert!(store.upsert_email("e9", sender, "x", "y", now).await.unwrap().is_none());
        assert_eq!(store.get(sender).await.unwrap().unwrap().email_count, 3);
    }
}
