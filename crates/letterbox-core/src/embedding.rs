//! Embedding provider trait, the priority-ordered provider chain, and
//! vector utilities.
//!
//! Concrete providers (Cohere, Gemini, OpenAI, Ollama, local fastembed)
//! live in the `letterbox` app crate. The chain only sees the
//! [`EmbeddingProvider`] trait.
//!
//! # Fallthrough
//!
//! ```text
//! embed(texts) ─▶ provider 1 ──ok──▶ vectors (whole batch from one provider)
//!                     │ err / unavailable / malformed
//!                     ▼
//!                 provider 2 ──ok──▶ vectors
//!                     │ ...
//!                     ▼
//!                 zero vectors of the configured dimension
//! ```
//!
//! An all-zero vector means "no semantic signal". Callers must never treat
//! it as a real embedding; see [`is_zero_vector`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;

use crate::cache::BoundedCache;
use crate::models::ProviderHealth;

/// A text embedding backend.
///
/// Implementations report availability up front (API key present, model
/// loaded) and may fail at call time; the chain handles both.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Short provider identifier (e.g. `"cohere"`), used in stats.
    fn name(&self) -> &str;
    /// Model identifier (e.g. `"embed-english-v3.0"`).
    fn model_name(&self) -> &str;
    /// Length of every vector this provider returns.
    fn dims(&self) -> usize;
    /// Largest number of texts accepted in one call.
    fn max_batch(&self) -> usize {
        100
    }
    fn is_available(&self) -> bool {
        true
    }
    /// Embed one batch of documents, no larger than
    /// [`max_batch`](Self::max_batch).
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;
    /// Embed search queries. Providers with asymmetric query/document
    /// encodings override this.
    async fn embed_queries(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        self.embed(texts).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Purpose {
    Documents,
    Query,
}

/// Per-chain counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EmbeddingStats {
    /// Calls to `embed`/`embed_one`, including cache hits.
    pub total_requests: u64,
    pub texts_embedded: u64,
    pub cache_hits: u64,
    /// Calls where every provider failed and zero vectors were returned.
    pub zero_fallbacks: u64,
    /// Calls served, keyed by provider name.
    pub served_by: BTreeMap<String, u64>,
    /// Failed attempts, keyed by provider name.
    pub failures: BTreeMap<String, u64>,
}

/// Output of a chain call: the vectors and the provider that produced
/// them, or `None` when the zero-vector fallback was used.
#[derive(Debug, Clone)]
pub struct Embedded {
    pub vectors: Vec<Vec<f32>>,
    pub provider: Option<String>,
}

impl Embedded {
    pub fn is_fallback(&self) -> bool {
        self.provider.is_none()
    }
}

/// Priority-ordered embedding providers with a bounded query cache.
pub struct EmbeddingChain {
    providers: Vec<Arc<dyn EmbeddingProvider>>,
    dimension: usize,
    /// Query text to `(provider, vector)`.
    cache: BoundedCache<String, (String, Vec<f32>)>,
    stats: Mutex<EmbeddingStats>,
}

impl EmbeddingChain {
    /// `dimension` is the length of the zero vectors returned when every
    /// provider fails.
    pub fn new(
        providers: Vec<Arc<dyn EmbeddingProvider>>,
        dimension: usize,
        cache_size: usize,
    ) -> Self {
        Self {
            providers,
            dimension,
            cache: BoundedCache::new(cache_size),
            stats: Mutex::new(EmbeddingStats::default()),
        }
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    /// Dimension of the first available provider, else the configured
    /// fallback dimension. This is the dimension a fresh index would have.
    pub fn active_dims(&self) -> usize {
        self.providers
            .iter()
            .find(|p| p.is_available())
            .map(|p| p.dims())
            .unwrap_or(self.dimension)
    }

    /// Embed a batch, returning vectors only.
    pub async fn embed(&self, texts: &[String]) -> Vec<Vec<f32>> {
        self.embed_with_provider(texts).await.vectors
    }

    /// Embed a batch with a single provider, falling through in priority
    /// order. Never fails: the last resort is a batch of zero vectors.
    pub async fn embed_with_provider(&self, texts: &[String]) -> Embedded {
        self.embed_for(texts, Purpose::Documents).await
    }

    async fn embed_for(&self, texts: &[String], purpose: Purpose) -> Embedded {
        {
            let mut stats = self.stats.lock();
            stats.total_requests += 1;
        }
        if texts.is_empty() {
            return Embedded {
                vectors: Vec::new(),
                provider: None,
            };
        }

        for provider in &self.providers {
            if !provider.is_available() {
                tracing::debug!(provider = provider.name(), "embedding provider unavailable, skipping");
                continue;
            }
            match self.embed_all(provider.as_ref(), texts, purpose).await {
                Ok(vectors) => {
                    let mut stats = self.stats.lock();
                    stats.texts_embedded += texts.len() as u64;
                    *stats.served_by.entry(provider.name().to_string()).or_default() += 1;
                    return Embedded {
                        vectors,
                        provider: Some(provider.name().to_string()),
                    };
                }
                Err(e) => {
                    tracing::warn!(provider = provider.name(), error = %e, "embedding provider failed, falling through");
                    *self
                        .stats
                        .lock()
                        .failures
                        .entry(provider.name().to_string())
                        .or_default() += 1;
                }
            }
        }

        tracing::warn!(
            count = texts.len(),
            dimension = self.dimension,
            "all embedding providers failed, returning zero vectors"
        );
        self.stats.lock().zero_fallbacks += 1;
        Embedded {
            vectors: vec![vec![0.0; self.dimension]; texts.len()],
            provider: None,
        }
    }

    /// Embed a single query text, consulting the cache first.
    ///
    /// A cached vector is served only while the provider that produced it
    /// is still the first available one, so a vector from a fallthrough
    /// provider is replaced once the preferred provider answers again.
    /// Zero-vector fallbacks are never cached.
    pub async fn embed_one(&self, text: &str) -> Embedded {
        let preferred = self
            .providers
            .iter()
            .find(|p| p.is_available())
            .map(|p| p.name());
        if let Some((provider, vector)) = self.cache.get(&text.to_string()) {
            if preferred == Some(provider.as_str()) {
                let mut stats = self.stats.lock();
                stats.total_requests += 1;
                stats.cache_hits += 1;
                return Embedded {
                    vectors: vec![vector],
                    provider: Some(provider),
                };
            }
        }
        let embedded = self.embed_for(&[text.to_string()], Purpose::Query).await;
        if let (Some(provider), Some(vector)) = (&embedded.provider, embedded.vectors.first()) {
            self.cache
                .insert(text.to_string(), (provider.clone(), vector.clone()));
        }
        embedded
    }

    /// Run every re-batched slice through one provider, validating shape.
    async fn embed_all(
        &self,
        provider: &dyn EmbeddingProvider,
        texts: &[String],
        purpose: Purpose,
    ) -> anyhow::Result<Vec<Vec<f32>>> {
        let batch = provider.max_batch().max(1);
        let dims = provider.dims();
        let mut out = Vec::with_capacity(texts.len());

        for slice in texts.chunks(batch) {
            let vectors = match purpose {
                Purpose::Documents => provider.embed(slice).await?,
                Purpose::Query => provider.embed_queries(slice).await?,
            };
            if vectors.len() != slice.len() {
                anyhow::bail!(
                    "expected {} embeddings, got {}",
                    slice.len(),
                    vectors.len()
                );
            }
            if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
                anyhow::bail!(
                    "malformed embedding: expected {} dimensions, got {}",
                    dims,
                    bad.len()
                );
            }
            out.extend(vectors);
        }
        Ok(out)
    }

    pub fn stats(&self) -> EmbeddingStats {
        self.stats.lock().clone()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Availability of every provider. Does not touch stats or the cache.
    pub fn health(&self) -> Vec<ProviderHealth> {
        self.providers
            .iter()
            .map(|p| {
                let available = p.is_available();
                ProviderHealth {
                    name: p.name().to_string(),
                    available,
                    healthy: available,
                    error: None,
                }
            })
            .collect()
    }
}

/// True for an empty vector or one whose components are all zero.
pub fn is_zero_vector(v: &[f32]) -> bool {
    v.iter().all(|x| *x == 0.0)
}

/// Inner product of two equal-length vectors; `0.0` on length mismatch.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Encode a float vector as little-endian f32 bytes.
///
/// # Example
///
/// ```rust
/// use letterbox_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode little-endian f32 bytes. Reverses [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Fixed {
        name: &'static str,
        dims: usize,
        available: bool,
        fail: bool,
        max_batch: usize,
        calls: AtomicUsize,
        wrong_dims: bool,
        down: AtomicBool,
    }

    impl Fixed {
        fn new(name: &'static str, dims: usize) -> Self {
            Self {
                name,
                dims,
                available: true,
                fail: false,
                max_batch: 100,
                calls: AtomicUsize::new(0),
                wrong_dims: false,
                down: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for Fixed {
        fn name(&self) -> &str {
            self.name
        }
        fn model_name(&self) -> &str {
            "fixed"
        }
        fn dims(&self) -> usize {
            self.dims
        }
        fn max_batch(&self) -> usize {
            self.max_batch
        }
        fn is_available(&self) -> bool {
            self.available && !self.down.load(Ordering::SeqCst)
        }
        async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("boom");
            }
            assert!(texts.len() <= self.max_batch);
            let len = if self.wrong_dims { self.dims + 1 } else { self.dims };
            let scale = if self.name == "a" { 1.0 } else { -1.0 };
            Ok(texts
                .iter()
                .map(|t| vec![scale * t.len() as f32; len])
                .collect())
        }
    }

    fn texts(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("text {}", i)).collect()
    }

    #[tokio::test]
    async fn test_first_available_provider_serves_batch() {
        let a = Arc::new(Fixed { fail: true, ..Fixed::new("a", 4) });
        let b = Arc::new(Fixed::new("b", 4));
        let c = Arc::new(Fixed::new("c", 4));
        let chain = EmbeddingChain::new(vec![a, b.clone(), c.clone()], 8, 10);

        let out = chain.embed_with_provider(&texts(3)).await;
        assert_eq!(out.provider.as_deref(), Some("b"));
        assert_eq!(out.vectors.len(), 3);
        assert!(out.vectors.iter().all(|v| v.len() == 4));

        let stats = chain.stats();
        assert_eq!(stats.served_by.get("b"), Some(&1));
        assert_eq!(stats.served_by.get("a"), None);
        assert_eq!(stats.failures.get("a"), Some(&1));
        assert_eq!(c.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unavailable_provider_is_skipped_without_failure() {
        let a = Arc::new(Fixed { available: false, ..Fixed::new("a", 4) });
        let b = Arc::new(Fixed::new("b", 6));
        let chain = EmbeddingChain::new(vec![a.clone(), b], 8, 10);
        assert_eq!(chain.active_dims(), 6);
        let out = chain.embed_one("hello").await;
        assert_eq!(out.provider.as_deref(), Some("b"));
        assert_eq!(out.vectors[0].len(), 6);
        assert_eq!(a.calls.load(Ordering::SeqCst), 0);
        assert!(chain.stats().failures.is_empty());
    }

    #[tokio::test]
    async fn test_all_fail_returns_zero_vectors() {
        let a = Arc::new(Fixed { fail: true, ..Fixed::new("a", 4) });
        let chain = EmbeddingChain::new(vec![a], 8, 10);
        let out = chain.embed_with_provider(&texts(2)).await;
        assert!(out.is_fallback());
        assert_eq!(out.vectors.len(), 2);
        assert!(out.vectors.iter().all(|v| v.len() == 8 && is_zero_vector(v)));
        assert_eq!(chain.stats().zero_fallbacks, 1);

        // Failures are not cached.
        assert!(chain.embed_one("q").await.is_fallback());
        let _ = chain.embed_one("q").await;
        assert_eq!(chain.stats().cache_hits, 0);
        assert_eq!(chain.cache_len(), 0);
    }

    #[tokio::test]
    async fn test_malformed_dimensions_fall_through() {
        let a = Arc::new(Fixed { wrong_dims: true, ..Fixed::new("a", 4) });
        let b = Arc::new(Fixed::new("b", 4));
        let chain = EmbeddingChain::new(vec![a, b], 4, 10);
        let out = chain.embed_with_provider(&texts(2)).await;
        assert_eq!(out.provider.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_rebatches_to_provider_limit() {
        let a = Arc::new(Fixed { max_batch: 3, ..Fixed::new("a", 2) });
        let chain = EmbeddingChain::new(vec![a.clone()], 2, 10);
        let out = chain.embed(&texts(10)).await;
        assert_eq!(out.len(), 10);
        assert_eq!(a.calls.load(Ordering::SeqCst), 4);
        assert_eq!(chain.stats().served_by.get("a"), Some(&1));
    }

    #[tokio::test]
    async fn test_embed_one_uses_cache() {
        let a = Arc::new(Fixed::new("a", 3));
        let chain = EmbeddingChain::new(vec![a.clone()], 3, 10);
        let first = chain.embed_one("query").await;
        let second = chain.embed_one("query").await;
        assert_eq!(first.vectors, second.vectors);
        assert_eq!(second.provider.as_deref(), Some("a"));
        let stats = chain.stats();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.total_requests, 2);
        assert_eq!(a.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cached_query_vector_is_replaced_when_primary_recovers() {
        let a = Arc::new(Fixed::new("a", 3));
        let b = Arc::new(Fixed::new("b", 3));
        let chain = EmbeddingChain::new(vec![a.clone(), b.clone()], 3, 10);

        a.down.store(true, Ordering::SeqCst);
        let during = chain.embed_one("query").await;
        assert_eq!(during.provider.as_deref(), Some("b"));
        assert_eq!(chain.cache_len(), 1);

        a.down.store(false, Ordering::SeqCst);
        let after = chain.embed_one("query").await;
        assert_eq!(after.provider.as_deref(), Some("a"));
        assert_ne!(after.vectors, during.vectors);
        assert_eq!(a.calls.load(Ordering::SeqCst), 1);
        assert_eq!(chain.stats().cache_hits, 0);
        assert_eq!(chain.cache_len(), 1);

        // The refreshed entry now belongs to the primary.
        let again = chain.embed_one("query").await;
        assert_eq!(again.provider.as_deref(), Some("a"));
        assert_eq!(chain.stats().cache_hits, 1);
        assert_eq!(b.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_health_reports_availability() {
        let a = Arc::new(Fixed { available: false, ..Fixed::new("a", 3) });
        let b = Arc::new(Fixed::new("b", 3));
        let chain = EmbeddingChain::new(vec![a, b], 3, 10);
        let health = chain.health();
        assert!(!health[0].available);
        assert!(health[1].available);
        assert_eq!(chain.stats().total_requests, 0);
    }

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn test_dot_and_zero_vector() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 2.0];
        assert_eq!(dot(&b, &b), 4.0);
        assert_eq!(dot(&a, &[1.0]), 0.0);
        assert!(is_zero_vector(&[0.0, 0.0]));
        assert!(!is_zero_vector(&a));
    }
}
