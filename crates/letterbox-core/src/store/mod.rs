//! Collaborator storage interfaces.
//!
//! The core never reads mail files or profile databases directly. It
//! consumes two traits, with in-memory implementations in [`memory`] for
//! tests and embedding:
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`DocumentStore`] | Source of truth for raw email documents |
//! | [`PersonaStore`] | Sender profiles, maintained as emails are observed |
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{Document, Persona, SearchFilters};

/// Source of raw documents.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Every document matching `filters` (all documents for empty filters),
    /// in a stable order.
    async fn load(&self, filters: &SearchFilters) -> Result<Vec<Document>>;

    /// A single document by its source id.
    async fn get(&self, source_id: &str) -> Result<Option<Document>>;
}

/// Sender profile storage.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`get`](PersonaStore::get) | Profile for a raw sender string |
/// | [`upsert`](PersonaStore::upsert) | Record one email from a sender |
/// | [`upsert_email`](PersonaStore::upsert_email) | Same, at most once per email id |
/// | [`add_label`](PersonaStore::add_label) | Merge a label into a profile |
/// | [`find_by_first_name`](PersonaStore::find_by_first_name) | Resolve an addressed name |
/// | [`list`](PersonaStore::list) | Every profile |
#[async_trait]
pub trait PersonaStore: Send + Sync {
    async fn get(&self, sender: &str) -> Result<Option<Persona>>;

    async fn upsert(&self, sender: &str, subject: &str, content: &str) -> Result<Persona>;

    /// Record email `email_id` seen at `seen_at`. Returns `None` if this
    /// email id was already recorded.
    async fn upsert_email(
        &self,
        email_id: &str,
        sender: &str,
        subject: &str,
        content: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<Option<Persona>>;

    /// Returns false when the sender has no profile.
    async fn add_label(&self, sender: &str, label: &str) -> Result<bool>;

    async fn find_by_first_name(&self, name: &str) -> Result<Option<Persona>>;

    async fn list(&self) -> Result<Vec<Persona>>;

    /// Persist pending changes. Stores that write through do nothing.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}
