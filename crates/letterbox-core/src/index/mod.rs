//! Vector index over document embeddings.
//!
//! The index owns the ordered document list, the parallel vectors and the
//! search structure. Callers only see [`VectorIndex::search`]; whether the
//! structure is exact or clustered is decided at build time.
//!
//! # Construction policy
//!
//! | Documents | Structure |
//! |-----------|-----------|
//! | `<= clustered_threshold` | exact inner product over every vector |
//! | `> clustered_threshold` | k-means clusters (`min(4096, n / 10)` lists), probing the `nprobe` best lists |
//!
//! # Concurrency
//!
//! The active index is an immutable snapshot behind `RwLock<Arc<_>>`.
//! Searches clone the `Arc` and release the lock immediately. `build` and
//! `load` construct a new snapshot off to the side and swap it in, and a
//! single-flight flag rejects a second concurrent build with
//! [`RagError::BuildInProgress`]. A query therefore sees either the old
//! index or the new one, never a half-built one.
//!
//! # Degradation
//!
//! With no vectors (nothing built, all embedding providers down at build
//! time), a failed query embedding, or a query embedded by a provider other
//! than the one that built the index, `search` transparently runs the
//! keyword fallback in [`crate::search`] over the same documents.
//! Persistence corruption is logged and surfaced in [`IndexStats`], never
//! raised to a searcher.

pub(crate) mod kmeans;
mod persist;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::cache::BoundedCache;
use crate::embedding::{dot, is_zero_vector, EmbeddingChain};
use crate::error::{RagError, Result};
use crate::models::{Document, ScoredDocument, SearchFilters};
use crate::search;

pub use persist::{DOCUMENTS_FILE, INDEX_FILE};

/// Candidates fetched per requested result, leaving room for filtering.
pub const OVERFETCH_FACTOR: usize = 3;

#[derive(Debug, Clone)]
pub struct IndexSettings {
    /// Directory holding the persisted artifacts. `None` keeps the index
    /// in memory only.
    pub dir: Option<PathBuf>,
    /// A persisted index younger than this is reused by `build`.
    pub freshness_hours: u64,
    /// Largest corpus indexed exactly.
    pub clustered_threshold: usize,
    /// Lists probed per clustered search.
    pub nprobe: usize,
    /// Capacity of the `(query, k, filters)` result cache.
    pub cache_size: usize,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            dir: None,
            freshness_hours: 24,
            clustered_threshold: 1000,
            nprobe: 16,
            cache_size: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    Exact,
    Clustered,
}

/// The search structure: row vectors plus optional clusters.
#[derive(Debug)]
pub(crate) struct Ann {
    pub dim: usize,
    pub vectors: Vec<Vec<f32>>,
    pub clusters: Option<Clusters>,
}

#[derive(Debug)]
pub(crate) struct Clusters {
    pub centroids: Vec<Vec<f32>>,
    pub lists: Vec<Vec<u32>>,
    pub nprobe: usize,
}

impl Ann {
    fn build(vectors: Vec<Vec<f32>>, dim: usize, settings: &IndexSettings) -> Self {
        let clusters = if vectors.len() > settings.clustered_threshold {
            let nlist = kmeans::cluster_count(vectors.len());
            let trained = kmeans::train(&vectors, nlist, dim);
            Some(Clusters {
                centroids: trained.centroids,
                lists: trained.lists,
                nprobe: settings.nprobe.clamp(1, nlist),
            })
        } else {
            None
        };
        Self {
            dim,
            vectors,
            clusters,
        }
    }

    fn kind(&self) -> IndexKind {
        if self.clusters.is_some() {
            IndexKind::Clustered
        } else {
            IndexKind::Exact
        }
    }

    /// Top `n` `(position, inner product)` pairs, best first. Ties keep
    /// position order.
    fn search(&self, query: &[f32], n: usize) -> Vec<(usize, f32)> {
        let mut scored: Vec<(usize, f32)> = match &self.clusters {
            None => self
                .vectors
                .iter()
                .enumerate()
                .map(|(i, v)| (i, dot(v, query)))
                .collect(),
            Some(clusters) => {
                let mut ranked: Vec<(usize, f32)> = clusters
                    .centroids
                    .iter()
                    .enumerate()
                    .map(|(i, c)| (i, dot(c, query)))
                    .collect();
                sort_desc(&mut ranked);
                ranked
                    .iter()
                    .take(clusters.nprobe)
                    .flat_map(|(list, _)| clusters.lists[*list].iter())
                    .map(|&i| (i as usize, dot(&self.vectors[i as usize], query)))
                    .collect()
            }
        };
        sort_desc(&mut scored);
        scored.truncate(n);
        scored
    }
}

fn sort_desc(items: &mut [(usize, f32)]) {
    items.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
}

/// One immutable generation of the index.
pub(crate) struct Snapshot {
    generation: u64,
    documents: Vec<Document>,
    ann: Option<Ann>,
    built_at: Option<DateTime<Utc>>,
    provider: Option<String>,
    corrupted: bool,
}

impl Snapshot {
    fn empty() -> Self {
        Self {
            generation: 0,
            documents: Vec::new(),
            ann: None,
            built_at: None,
            provider: None,
            corrupted: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SearchKey {
    query: String,
    k: usize,
    filters: SearchFilters,
}

#[derive(Debug, Default)]
struct Counters {
    searches: u64,
    vector_searches: u64,
    fallback_searches: u64,
    cache_hits: u64,
    builds: u64,
    loads: u64,
    corruption_events: u64,
}

/// Serializable view of the index for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub kind: Option<IndexKind>,
    pub dimension: Option<usize>,
    /// Vectors in the search structure.
    pub population: usize,
    /// Entries in the parallel document list.
    pub documents: usize,
    pub clusters: Option<usize>,
    pub built_at: Option<DateTime<Utc>>,
    pub provider: Option<String>,
    pub corrupted: bool,
    pub needs_rebuild: bool,
    pub cache_entries: usize,
    pub searches: u64,
    pub vector_searches: u64,
    pub fallback_searches: u64,
    pub cache_hits: u64,
    pub builds: u64,
    pub loads: u64,
    pub corruption_events: u64,
}

/// Clears the single-flight flag on drop.
struct BuildGuard<'a>(&'a AtomicBool);

impl<'a> BuildGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for BuildGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct VectorIndex {
    embedder: Arc<EmbeddingChain>,
    settings: IndexSettings,
    active: RwLock<Arc<Snapshot>>,
    generation: AtomicU64,
    building: AtomicBool,
    needs_rebuild: AtomicBool,
    cache: BoundedCache<SearchKey, (u64, Vec<ScoredDocument>)>,
    counters: Mutex<Counters>,
}

impl VectorIndex {
    pub fn new(embedder: Arc<EmbeddingChain>, settings: IndexSettings) -> Self {
        let cache = BoundedCache::new(settings.cache_size);
        Self {
            embedder,
            settings,
            active: RwLock::new(Arc::new(Snapshot::empty())),
            generation: AtomicU64::new(0),
            building: AtomicBool::new(false),
            needs_rebuild: AtomicBool::new(false),
            cache,
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn settings(&self) -> &IndexSettings {
        &self.settings
    }

    fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&*self.active.read())
    }

    fn swap(&self, mut snapshot: Snapshot) {
        snapshot.generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        *self.active.write() = Arc::new(snapshot);
        self.cache.clear();
    }

    /// Number of documents searchable (by vector or text).
    pub fn len(&self) -> usize {
        self.snapshot().documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether semantic search is possible.
    pub fn has_vectors(&self) -> bool {
        self.snapshot().ann.is_some()
    }

    /// Build the index from `documents`.
    ///
    /// Reuses a persisted index instead when one exists, loads cleanly, is
    /// younger than the freshness threshold, matches the active embedding
    /// dimension, and neither `force_rebuild` nor a prior corruption asks
    /// for a rebuild.
    ///
    /// Returns `Ok(true)` when a vector index is active afterwards and
    /// `Ok(false)` when only text search is possible (no documents, or no
    /// embedding provider succeeded).
    ///
    /// # Errors
    ///
    /// [`RagError::BuildInProgress`] if another build holds the index.
    pub async fn build(&self, documents: Vec<Document>, force_rebuild: bool) -> Result<bool> {
        let _guard = BuildGuard::acquire(&self.building).ok_or(RagError::BuildInProgress)?;

        if !force_rebuild && !self.needs_rebuild.load(Ordering::Acquire) && self.reuse_persisted() {
            return Ok(true);
        }

        if documents.is_empty() {
            tracing::info!("no documents to index, text search only");
            self.swap(Snapshot::empty());
            return Ok(false);
        }

        let texts: Vec<String> = documents.iter().map(|d| d.content.clone()).collect();
        let embedded = self.embedder.embed_with_provider(&texts).await;
        let Some(provider) = embedded.provider else {
            tracing::warn!(
                documents = documents.len(),
                "embeddings unavailable, serving text search until the next rebuild"
            );
            self.needs_rebuild.store(true, Ordering::Release);
            self.swap(Snapshot {
                documents,
                ..Snapshot::empty()
            });
            return Ok(false);
        };

        let dim = embedded.vectors.first().map(Vec::len).unwrap_or(0);
        let ann = Ann::build(embedded.vectors, dim, &self.settings);
        tracing::info!(
            kind = ?ann.kind(),
            documents = documents.len(),
            dimension = dim,
            provider = %provider,
            "vector index built"
        );

        let built_at = Utc::now();
        if let Some(dir) = &self.settings.dir {
            let meta = persist::DocumentsFile {
                version: 1,
                built_at,
                provider: Some(provider.clone()),
                dimension: dim,
                documents: documents.clone(),
            };
            if let Err(e) = persist::write(dir, &ann, &meta) {
                tracing::warn!(dir = %dir.display(), error = %e, "failed to persist vector index");
            }
        }

        self.swap(Snapshot {
            generation: 0,
            documents,
            ann: Some(ann),
            built_at: Some(built_at),
            provider: Some(provider),
            corrupted: false,
        });
        self.needs_rebuild.store(false, Ordering::Release);
        self.counters.lock().builds += 1;
        Ok(true)
    }

    /// Swap in the persisted index if it is fresh and compatible.
    fn reuse_persisted(&self) -> bool {
        let Some(snapshot) = self.read_persisted() else {
            return false;
        };
        if snapshot.corrupted {
            return false;
        }
        let fresh = snapshot
            .built_at
            .map(|t| Utc::now() - t < Duration::hours(self.settings.freshness_hours as i64))
            .unwrap_or(false);
        if !fresh {
            tracing::info!("persisted index is stale, rebuilding");
            return false;
        }
        let persisted_dim = snapshot.ann.as_ref().map(|a| a.dim);
        let active_dim = self.embedder.active_dims();
        if persisted_dim != Some(active_dim) {
            tracing::info!(
                persisted = ?persisted_dim,
                active = active_dim,
                "embedding dimension changed, rebuilding"
            );
            return false;
        }
        tracing::info!(documents = snapshot.documents.len(), "reusing persisted vector index");
        self.swap(snapshot);
        self.counters.lock().loads += 1;
        true
    }

    /// Read the persisted pair, recording any corruption.
    fn read_persisted(&self) -> Option<Snapshot> {
        let dir = self.settings.dir.as_ref()?;
        match persist::read(dir) {
            Ok(None) => None,
            Ok(Some((ann, meta))) => {
                let corrupted = ann.vectors.len() != meta.documents.len();
                if corrupted {
                    tracing::warn!(
                        population = ann.vectors.len(),
                        documents = meta.documents.len(),
                        "index population does not match document list, serving it until rebuilt"
                    );
                    self.record_corruption();
                }
                Some(Snapshot {
                    generation: 0,
                    documents: meta.documents,
                    ann: Some(ann),
                    built_at: Some(meta.built_at),
                    provider: meta.provider,
                    corrupted,
                })
            }
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "persisted index unreadable, treating as absent");
                self.record_corruption();
                None
            }
        }
    }

    fn record_corruption(&self) {
        self.counters.lock().corruption_events += 1;
        self.needs_rebuild.store(true, Ordering::Release);
    }

    /// Load the persisted index, regardless of age.
    ///
    /// Returns `false` when no usable pair exists. A count mismatch still
    /// loads (and returns `true`) but marks the index corrupted and forces
    /// the next `build` to rebuild.
    pub fn load(&self) -> bool {
        let Some(_guard) = BuildGuard::acquire(&self.building) else {
            tracing::warn!("index build in progress, skipping load");
            return false;
        };
        match self.read_persisted() {
            Some(snapshot) => {
                self.swap(snapshot);
                self.counters.lock().loads += 1;
                true
            }
            None => false,
        }
    }

    /// Persist the active index.
    ///
    /// # Errors
    ///
    /// [`RagError::InvalidConfig`] without an index directory,
    /// [`RagError::EmptyInput`] when there are no vectors to save, or any
    /// I/O failure.
    pub fn save(&self) -> Result<()> {
        let dir = self
            .settings
            .dir
            .as_ref()
            .ok_or_else(|| RagError::InvalidConfig("no index directory configured".into()))?;
        let snapshot = self.snapshot();
        let ann = snapshot
            .ann
            .as_ref()
            .ok_or(RagError::EmptyInput("no vector index to save"))?;
        let meta = persist::DocumentsFile {
            version: 1,
            built_at: snapshot.built_at.unwrap_or_else(Utc::now),
            provider: snapshot.provider.clone(),
            dimension: ann.dim,
            documents: snapshot.documents.clone(),
        };
        persist::write(dir, ann, &meta)
    }

    /// Search for the `k` best documents matching `filters`.
    ///
    /// Vector scores are raw inner products. Falls back to keyword search
    /// when semantic search is not possible.
    pub async fn search(&self, query: &str, k: usize, filters: &SearchFilters) -> Vec<ScoredDocument> {
        if query.trim().is_empty() || k == 0 {
            return Vec::new();
        }

        let snapshot = self.snapshot();
        let key = SearchKey {
            query: query.to_string(),
            k,
            filters: filters.clone(),
        };
        if let Some((generation, hit)) = self.cache.get(&key) {
            if generation == snapshot.generation {
                let mut counters = self.counters.lock();
                counters.searches += 1;
                counters.cache_hits += 1;
                return hit;
            }
        }
        self.counters.lock().searches += 1;

        let now = Utc::now();
        if let Some(ann) = &snapshot.ann {
            let embedded = self.embedder.embed_one(query).await;
            // Vectors from another provider live in another space even when
            // the dimensions agree.
            let same_space = match (embedded.provider.as_deref(), snapshot.provider.as_deref()) {
                (Some(used), Some(built)) => used == built,
                (Some(_), None) => true,
                (None, _) => false,
            };
            let q = embedded.vectors.into_iter().next().unwrap_or_default();
            if same_space && q.len() == ann.dim && !is_zero_vector(&q) {
                let results: Vec<ScoredDocument> = ann
                    .search(&q, k.saturating_mul(OVERFETCH_FACTOR))
                    .into_iter()
                    .filter_map(|(pos, score)| snapshot.documents.get(pos).map(|d| (d, score)))
                    .filter(|(doc, _)| filters.matches(doc, now))
                    .take(k)
                    .map(|(doc, score)| ScoredDocument {
                        document: doc.clone(),
                        score,
                    })
                    .collect();
                self.counters.lock().vector_searches += 1;
                self.cache.insert(key, (snapshot.generation, results.clone()));
                return results;
            }
            tracing::debug!(
                query_provider = ?embedded.provider,
                index_provider = ?snapshot.provider,
                query_dims = q.len(),
                index_dims = ann.dim,
                "query embedding unusable, using text search"
            );
        }

        self.counters.lock().fallback_searches += 1;
        search::text_search(&snapshot.documents, query, k, filters, now)
    }

    /// Up to `limit` indexed documents whose sender contains `sender`
    /// (case-insensitive), in index order.
    pub fn documents_from(&self, sender: &str, limit: usize) -> Vec<Document> {
        let wanted = sender.to_lowercase();
        self.snapshot()
            .documents
            .iter()
            .filter(|d| {
                d.sender()
                    .map(|s| s.to_lowercase().contains(&wanted))
                    .unwrap_or(false)
            })
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn stats(&self) -> IndexStats {
        let snapshot = self.snapshot();
        let counters = self.counters.lock();
        IndexStats {
            kind: snapshot.ann.as_ref().map(Ann::kind),
            dimension: snapshot.ann.as_ref().map(|a| a.dim),
            population: snapshot.ann.as_ref().map(|a| a.vectors.len()).unwrap_or(0),
            documents: snapshot.documents.len(),
            clusters: snapshot
                .ann
                .as_ref()
                .and_then(|a| a.clusters.as_ref())
                .map(|c| c.centroids.len()),
            built_at: snapshot.built_at,
            provider: snapshot.provider.clone(),
            corrupted: snapshot.corrupted,
            needs_rebuild: self.needs_rebuild.load(Ordering::Acquire),
            cache_entries: self.cache.len(),
            searches: counters.searches,
            vector_searches: counters.vector_searches,
            fallback_searches: counters.fallback_searches,
            cache_hits: counters.cache_hits,
            builds: counters.builds,
            loads: counters.loads,
            corruption_events: counters.corruption_events,
        }
    }
}
