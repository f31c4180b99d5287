//! The pipeline orchestrator.
//!
//! Owns every component and wires them into the three operations callers
//! use: [`Pipeline::initialize`], [`Pipeline::query`] and
//! [`Pipeline::refresh_index`].
//!
//! # States
//!
//! ```text
//! Uninitialized ──initialize──▶ Initializing ──▶ Ready ──refresh──▶ Refreshing ──▶ Ready
//!       ▲                            │ error                             │ error
//!       └────────────────────────────┘                       Ready ◀─────┘
//! ```
//!
//! Queries are answered in `Ready` and `Refreshing` (against the index that
//! was active when the refresh started). In any other state they get the
//! not-initialized envelope. A second ingest while one is running fails
//! with [`RagError::BuildInProgress`].
//!
//! # Query flow
//!
//! 1. Persona detection splits `"Hey Nate, ..."` into a name and the rest.
//! 2. The vector index (or its text-search fallback) retrieves `top_k`
//!    documents under the label/age/sender filters.
//! 3. An addressed persona gets a first-person answer in their voice;
//!    otherwise the grounded prompt is built, with the sender's profile
//!    when the request names a sender.
//! 4. The generation chain answers, or the deterministic fallback listing
//!    is used.
//!
//! Provider-generated answers are cached per
//! `(question, label, max_age_days, sender)`. Fallback and error envelopes
//! are not cached, so a recovered provider is used on the next call.

use anyhow::Result;
use chrono::{DateTime, Utc};
use letterbox_core::analysis::{self, SentimentReport};
use letterbox_core::cache::BoundedCache;
use letterbox_core::chunk::{chunk_documents, content_hash};
use letterbox_core::embedding::{EmbeddingChain, EmbeddingStats};
use letterbox_core::generation::{GenerationChain, GenerationRequest, GenerationStats};
use letterbox_core::index::{IndexSettings, IndexStats, VectorIndex};
use letterbox_core::models::{Document, Persona, ProviderHealth, ScoredDocument, SearchFilters};
use letterbox_core::persona;
use letterbox_core::prompt::{PromptComposer, TRAIT_SAMPLE_LIMIT};
use letterbox_core::store::{DocumentStore, PersonaStore};
use letterbox_core::RagError;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::documents::FsDocumentStore;
use crate::personas::JsonPersonaStore;
use crate::{embedding, generation, prompts};

pub const NOT_INITIALIZED_ANSWER: &str = "RAG pipeline not initialized. Please try again.";
pub const NOT_INITIALIZED_ERROR: &str = "Pipeline not initialized";
pub const EMPTY_QUESTION_ANSWER: &str = "There is nothing to answer: the question is empty.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Uninitialized,
    Initializing,
    Ready,
    Refreshing,
}

impl PipelineState {
    fn accepts_queries(self) -> bool {
        matches!(self, Self::Ready | Self::Refreshing)
    }
}

/// Values the pipeline reads from configuration.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub chunk_size: usize,
    pub overlap: usize,
    pub top_k: usize,
    /// Applied when a query names no label.
    pub default_label: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub query_cache_size: usize,
    pub index: IndexSettings,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            chunk_size: config.chunking.chunk_size,
            overlap: config.chunking.overlap,
            top_k: config.retrieval.top_k,
            default_label: config.retrieval.default_label.clone(),
            max_tokens: config.generation.max_tokens,
            temperature: config.generation.temperature,
            query_cache_size: config.cache.query_results,
            index: IndexSettings {
                dir: Some(config.data.index_dir.clone()),
                freshness_hours: config.retrieval.freshness_hours,
                clustered_threshold: config.retrieval.clustered_threshold,
                nprobe: config.retrieval.nprobe,
                cache_size: config.retrieval.search_cache_size,
            },
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        let mut settings = Self::from_config(&Config::default());
        settings.index.dir = None;
        settings
    }
}

/// The collaborators and provider chains a pipeline is assembled from.
pub struct Components {
    pub documents: Arc<dyn DocumentStore>,
    pub personas: Arc<dyn PersonaStore>,
    pub embedder: Arc<EmbeddingChain>,
    pub generator: GenerationChain,
    pub composer: PromptComposer,
}

/// One question, with optional retrieval filters.
#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub question: String,
    pub label: Option<String>,
    pub max_age_days: Option<u32>,
    pub sender: Option<String>,
}

impl QueryRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            ..Self::default()
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn with_max_age_days(mut self, days: u32) -> Self {
        self.max_age_days = Some(days);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct QueryKey {
    question: String,
    label: Option<String>,
    max_age_days: Option<u32>,
    sender: Option<String>,
}

/// The addressed persona: the stored profile, or just the name when the
/// store has none.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PersonaInfo {
    Profile(Persona),
    Name { first_name: String },
}

/// What every query returns, including failed ones.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub answer: String,
    pub context: Vec<ScoredDocument>,
    /// Seconds spent on this call.
    pub processing_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persona: Option<PersonaInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persona_traits: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub cached: bool,
}

impl QueryResponse {
    fn message(answer: impl Into<String>, error: Option<String>, started: Instant) -> Self {
        Self {
            answer: answer.into(),
            context: Vec::new(),
            processing_time: started.elapsed().as_secs_f64(),
            persona: None,
            persona_traits: None,
            error,
            provider: None,
            model: None,
            cached: false,
        }
    }

    fn is_fallback(&self) -> bool {
        self.provider.as_deref() == Some(letterbox_core::generation::FALLBACK_PROVIDER)
    }
}

/// Outcome of an initialize or refresh.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub documents: usize,
    pub chunks: usize,
    /// Emails newly recorded in sender profiles.
    pub personas_updated: usize,
    /// Whether semantic search is available afterwards.
    pub vector_index: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineCounters {
    pub documents_loaded: u64,
    pub chunks_indexed: u64,
    pub queries_processed: u64,
    pub query_cache_hits: u64,
    pub query_errors: u64,
    pub fallback_answers: u64,
    pub persona_answers: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SettingsSnapshot {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub top_k: usize,
    pub default_label: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub freshness_hours: u64,
    pub clustered_threshold: usize,
    pub embedding_providers: Vec<String>,
    pub generation_providers: Vec<String>,
}

/// Serializable snapshot for `lbx stats`.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub state: PipelineState,
    pub last_index_update: Option<DateTime<Utc>>,
    pub counters: PipelineCounters,
    pub query_cache_entries: usize,
    pub personas: usize,
    pub embedding: EmbeddingStats,
    pub generation: GenerationStats,
    pub index: IndexStats,
    pub settings: SettingsSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionReport {
    pub embedding: Vec<ProviderHealth>,
    pub generation: Vec<ProviderHealth>,
}

/// Summary, topics and sentiment of one email.
#[derive(Debug, Clone, Serialize)]
pub struct EmailAnalysis {
    pub email_id: String,
    pub subject: Option<String>,
    pub sender: Option<String>,
    pub summary: String,
    pub topics: Vec<String>,
    pub sentiment: SentimentReport,
}

pub struct Pipeline {
    settings: PipelineSettings,
    documents: Arc<dyn DocumentStore>,
    personas: Arc<dyn PersonaStore>,
    embedder: Arc<EmbeddingChain>,
    index: VectorIndex,
    generator: GenerationChain,
    composer: PromptComposer,
    state: RwLock<PipelineState>,
    last_index_update: Mutex<Option<DateTime<Utc>>>,
    query_cache: BoundedCache<QueryKey, QueryResponse>,
    counters: Mutex<PipelineCounters>,
}

impl Pipeline {
    pub fn new(settings: PipelineSettings, components: Components) -> Self {
        let index = VectorIndex::new(Arc::clone(&components.embedder), settings.index.clone());
        let query_cache = BoundedCache::new(settings.query_cache_size);
        Self {
            settings,
            documents: components.documents,
            personas: components.personas,
            embedder: components.embedder,
            index,
            generator: components.generator,
            composer: components.composer,
            state: RwLock::new(PipelineState::Uninitialized),
            last_index_update: Mutex::new(None),
            query_cache,
            counters: Mutex::new(PipelineCounters::default()),
        }
    }

    /// Assemble the pipeline described by `config`: filesystem documents,
    /// JSON personas, configured provider chains and prompt overrides.
    pub fn from_config(config: &Config) -> Result<Self> {
        let components = Components {
            documents: Arc::new(FsDocumentStore::new(&config.data)?),
            personas: Arc::new(JsonPersonaStore::open(&config.data.personas_path)?),
            embedder: Arc::new(embedding::create_chain(&config.embedding)?),
            generator: generation::create_chain(&config.generation)?,
            composer: prompts::load_composer(config.data.prompts_path.as_deref())?,
        };
        Ok(Self::new(PipelineSettings::from_config(config), components))
    }

    pub fn state(&self) -> PipelineState {
        *self.state.read()
    }

    pub fn composer(&self) -> &PromptComposer {
        &self.composer
    }

    /// Load documents, update sender profiles and build or reuse the index.
    ///
    /// An empty corpus is not an error: the pipeline becomes ready and
    /// answers from text search (which finds nothing) and the fallback.
    pub async fn initialize(&self, force_rebuild: bool) -> Result<IngestReport> {
        self.run_ingest(PipelineState::Initializing, force_rebuild).await
    }

    /// Become ready from the persisted index alone, whatever its age,
    /// without scanning the document store. Falls back to
    /// [`initialize`](Self::initialize) when nothing usable is persisted.
    pub async fn open(&self) -> Result<()> {
        if self.state() == PipelineState::Uninitialized && self.index.load() {
            let mut state = self.state.write();
            if *state == PipelineState::Uninitialized {
                *state = PipelineState::Ready;
                *self.last_index_update.lock() = self.index.stats().built_at;
                tracing::debug!(documents = self.index.len(), "opened persisted index");
                return Ok(());
            }
        }
        if self.state() == PipelineState::Uninitialized {
            self.initialize(false).await?;
        }
        Ok(())
    }

    /// Reload the document store and rebuild the index. Queries keep using
    /// the previous index until the new one is swapped in.
    pub async fn refresh_index(&self, force_rebuild: bool) -> Result<IngestReport> {
        let next = if self.state() == PipelineState::Uninitialized {
            PipelineState::Initializing
        } else {
            PipelineState::Refreshing
        };
        self.run_ingest(next, force_rebuild).await
    }

    async fn run_ingest(&self, next: PipelineState, force_rebuild: bool) -> Result<IngestReport> {
        let previous = {
            let mut state = self.state.write();
            match *state {
                PipelineState::Initializing | PipelineState::Refreshing => {
                    return Err(RagError::BuildInProgress.into())
                }
                prev => {
                    *state = next;
                    prev
                }
            }
        };
        tracing::info!(state = ?next, force_rebuild, "ingest started");

        match self.ingest(force_rebuild).await {
            Ok(report) => {
                *self.state.write() = PipelineState::Ready;
                *self.last_index_update.lock() = Some(Utc::now());
                self.query_cache.clear();
                tracing::info!(
                    documents = report.documents,
                    chunks = report.chunks,
                    vector_index = report.vector_index,
                    "pipeline ready"
                );
                Ok(report)
            }
            Err(e) => {
                *self.state.write() = previous;
                tracing::warn!(error = %e, "ingest failed");
                Err(e)
            }
        }
    }

    async fn ingest(&self, force_rebuild: bool) -> Result<IngestReport> {
        let documents = self.documents.load(&SearchFilters::default()).await?;
        let personas_updated = self.observe_senders(&documents).await;
        let chunks = chunk_documents(&documents, self.settings.chunk_size, self.settings.overlap)?;

        let report = IngestReport {
            documents: documents.len(),
            chunks: chunks.len(),
            personas_updated,
            vector_index: false,
        };
        {
            let mut counters = self.counters.lock();
            counters.documents_loaded += report.documents as u64;
            counters.chunks_indexed += report.chunks as u64;
        }

        let vector_index = self.index.build(chunks, force_rebuild).await?;
        Ok(IngestReport {
            vector_index,
            ..report
        })
    }

    /// Record every email in its sender's profile. Store failures are
    /// logged and do not stop ingestion.
    async fn observe_senders(&self, documents: &[Document]) -> usize {
        let now = Utc::now();
        let mut updated = 0;
        for doc in documents {
            let Some(sender) = doc.sender() else { continue };
            let email_id = doc
                .source_id()
                .map(str::to_string)
                .unwrap_or_else(|| content_hash(&doc.content));
            let seen_at = doc.date().unwrap_or(now);
            match self
                .personas
                .upsert_email(&email_id, sender, doc.subject().unwrap_or_default(), &doc.content, seen_at)
                .await
            {
                Ok(Some(_)) => updated += 1,
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(sender = %sender, error = %e, "failed to update persona");
                    continue;
                }
            }
            if let Some(label) = doc.label() {
                if let Err(e) = self.personas.add_label(sender, label).await {
                    tracing::warn!(sender = %sender, error = %e, "failed to label persona");
                }
            }
        }
        if let Err(e) = self.personas.flush().await {
            tracing::warn!(error = %e, "failed to persist personas");
        }
        updated
    }

    /// Answer a question. Never fails: errors come back inside the
    /// envelope.
    pub async fn query(&self, request: &QueryRequest) -> QueryResponse {
        let started = Instant::now();

        if !self.state().accepts_queries() {
            return QueryResponse::message(
                NOT_INITIALIZED_ANSWER,
                Some(NOT_INITIALIZED_ERROR.to_string()),
                started,
            );
        }

        let question = request.question.trim();
        if question.is_empty() {
            return QueryResponse::message(EMPTY_QUESTION_ANSWER, None, started);
        }

        let key = QueryKey {
            question: question.to_string(),
            label: request
                .label
                .clone()
                .or_else(|| self.settings.default_label.clone()),
            max_age_days: request.max_age_days,
            sender: request.sender.clone(),
        };

        if let Some(mut hit) = self.query_cache.get(&key) {
            self.counters.lock().query_cache_hits += 1;
            hit.cached = true;
            hit.processing_time = started.elapsed().as_secs_f64();
            return hit;
        }
        self.counters.lock().queries_processed += 1;

        match self.answer(&key).await {
            Ok(mut response) => {
                response.processing_time = started.elapsed().as_secs_f64();
                if response.is_fallback() {
                    self.counters.lock().fallback_answers += 1;
                } else {
                    self.query_cache.insert(key, response.clone());
                }
                response
            }
            Err(e) => {
                tracing::warn!(error = %e, "query failed");
                self.counters.lock().query_errors += 1;
                QueryResponse::message(
                    format!("Error processing query: {}", e),
                    Some(e.to_string()),
                    started,
                )
            }
        }
    }

    async fn answer(&self, key: &QueryKey) -> Result<QueryResponse> {
        let (persona_name, question) = persona::detect(&key.question);
        let filters = SearchFilters {
            label: key.label.clone(),
            max_age_days: key.max_age_days,
            sender: key.sender.clone(),
        };
        let context = self
            .index
            .search(&question, self.settings.top_k, &filters)
            .await;
        let docs: Vec<Document> = context.iter().map(|s| s.document.clone()).collect();
        tracing::debug!(
            persona = ?persona_name,
            retrieved = docs.len(),
            "context retrieved"
        );

        if let Some(name) = persona_name {
            return self.answer_as_persona(&name, &question, context, &docs).await;
        }

        let persona_context = match &key.sender {
            Some(sender) => match self.personas.get(sender).await {
                Ok(Some(p)) => Some(self.composer.persona_context(&p)?),
                Ok(None) => None,
                Err(e) => {
                    tracing::warn!(sender = %sender, error = %e, "persona lookup failed");
                    None
                }
            },
            None => None,
        };

        let prompt = self
            .composer
            .build(&question, &docs, persona_context.as_deref())?;
        let fallback = self.composer.fallback_answer(&question, &docs)?;
        let generation = self
            .generator
            .generate(
                &GenerationRequest::new(prompt, self.settings.max_tokens, self.settings.temperature),
                fallback,
            )
            .await;

        Ok(QueryResponse {
            answer: generation.text,
            context,
            processing_time: 0.0,
            persona: None,
            persona_traits: None,
            error: None,
            provider: Some(generation.provider),
            model: Some(generation.model),
            cached: false,
        })
    }

    async fn answer_as_persona(
        &self,
        name: &str,
        question: &str,
        context: Vec<ScoredDocument>,
        docs: &[Document],
    ) -> Result<QueryResponse> {
        let profile = match self.personas.find_by_first_name(name).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(persona = %name, error = %e, "persona lookup failed");
                None
            }
        };

        let own = profile
            .as_ref()
            .map(|p| self.index.documents_from(&p.sender, TRAIT_SAMPLE_LIMIT))
            .unwrap_or_default();
        let samples = if own.is_empty() { docs } else { &own[..] };

        let traits = persona::derive_traits(&self.generator, &self.composer, name, samples).await?;
        let generation = persona::generate_first_person(
            &self.generator,
            &self.composer,
            name,
            &traits,
            question,
            docs,
            self.settings.max_tokens,
            self.settings.temperature,
        )
        .await?;
        self.counters.lock().persona_answers += 1;

        Ok(QueryResponse {
            answer: generation.text,
            context,
            processing_time: 0.0,
            persona: Some(match profile {
                Some(p) => PersonaInfo::Profile(p),
                None => PersonaInfo::Name {
                    first_name: name.to_string(),
                },
            }),
            persona_traits: Some(traits),
            error: None,
            provider: Some(generation.provider),
            model: Some(generation.model),
            cached: false,
        })
    }

    /// Retrieved context only, no generation. `k` defaults to `top_k`.
    pub async fn search_only(
        &self,
        query: &str,
        filters: &SearchFilters,
        k: Option<usize>,
    ) -> Vec<ScoredDocument> {
        let k = k.unwrap_or(self.settings.top_k);
        self.index.search(query.trim(), k, filters).await
    }

    /// Summary, topics and sentiment of one stored email.
    pub async fn analyze(&self, email_id: &str) -> Result<Option<EmailAnalysis>> {
        let Some(doc) = self.documents.get(email_id).await? else {
            return Ok(None);
        };
        let (summary, topics, sentiment) = tokio::join!(
            analysis::summarize_email(&self.generator, &self.composer, &doc),
            analysis::extract_topics(&self.generator, &self.composer, &doc),
            analysis::analyze_sentiment(&self.generator, &self.composer, &doc),
        );
        Ok(Some(EmailAnalysis {
            email_id: email_id.to_string(),
            subject: doc.subject().map(str::to_string),
            sender: doc.sender().map(str::to_string),
            summary: summary?,
            topics: topics?,
            sentiment: sentiment?,
        }))
    }

    pub async fn stats(&self) -> PipelineStats {
        let personas = match self.personas.list().await {
            Ok(list) => list.len(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to list personas");
                0
            }
        };
        PipelineStats {
            state: self.state(),
            last_index_update: *self.last_index_update.lock(),
            counters: self.counters.lock().clone(),
            query_cache_entries: self.query_cache.len(),
            personas,
            embedding: self.embedder.stats(),
            generation: self.generator.stats(),
            index: self.index.stats(),
            settings: SettingsSnapshot {
                chunk_size: self.settings.chunk_size,
                chunk_overlap: self.settings.overlap,
                top_k: self.settings.top_k,
                default_label: self.settings.default_label.clone(),
                max_tokens: self.settings.max_tokens,
                temperature: self.settings.temperature,
                freshness_hours: self.settings.index.freshness_hours,
                clustered_threshold: self.settings.index.clustered_threshold,
                embedding_providers: self.embedder.provider_names(),
                generation_providers: self.generator.provider_names(),
            },
        }
    }

    /// Per-provider health of both chains. Leaves caches and counters alone.
    pub async fn test_connections(&self) -> ConnectionReport {
        ConnectionReport {
            embedding: self.embedder.health(),
            generation: self.generator.test_connection().await,
        }
    }

    /// Empty the query-result, search and embedding caches.
    pub fn clear_caches(&self) {
        self.query_cache.clear();
        self.index.clear_cache();
        self.embedder.clear_cache();
        tracing::debug!("caches cleared");
    }
}
