//! Generation provider trait and the priority-ordered provider chain.
//!
//! Each provider has a token ceiling and one or more candidate models. The
//! chain tries providers in order and, within a provider, models in order:
//!
//! ```text
//! generate(request) ─▶ provider 1: fit prompt to budget ─▶ model a ─▶ model b
//!                          │ all models failed / unavailable
//!                          ▼
//!                      provider 2: ...
//!                          │
//!                          ▼
//!                      caller-supplied fallback text (provider "fallback")
//! ```
//!
//! The budget for a provider is `token_limit - max_tokens`. Prompts over
//! budget lose trailing whole words until the estimate fits; a provider
//! whose budget is zero is skipped. Token counts are estimated as one token
//! per four characters.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;

use crate::models::ProviderHealth;

/// Provider id reported when every provider failed.
pub const FALLBACK_PROVIDER: &str = "fallback";
/// Model id reported with [`FALLBACK_PROVIDER`].
pub const FALLBACK_MODEL: &str = "none";

/// One completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, max_tokens: u32, temperature: f32) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens,
            temperature,
        }
    }
}

/// A text generation backend.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    fn name(&self) -> &str;
    /// Candidate models in preference order. Never empty.
    fn models(&self) -> &[String];
    /// Context ceiling in tokens, prompt plus completion.
    fn token_limit(&self) -> usize;
    fn is_available(&self) -> bool {
        true
    }
    /// Complete `request.prompt` with `model`.
    async fn generate(&self, model: &str, request: &GenerationRequest) -> anyhow::Result<String>;
    /// Lightweight reachability probe for diagnostics.
    async fn health_check(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Result of a chain call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Generation {
    pub text: String,
    pub provider: String,
    pub model: String,
}

impl Generation {
    pub fn is_fallback(&self) -> bool {
        self.provider == FALLBACK_PROVIDER
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GenerationStats {
    pub total_requests: u64,
    /// Requests answered with the caller's fallback text.
    pub fallback_answers: u64,
    /// Prompts shortened to fit a provider's budget.
    pub truncations: u64,
    pub served_by: BTreeMap<String, u64>,
    /// Failed model attempts, keyed by provider name.
    pub failures: BTreeMap<String, u64>,
}

/// Rough token estimate: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Shorten `prompt` by trailing whole words until its estimate fits
/// `budget`. `None` when nothing fits.
pub fn truncate_to_budget(prompt: &str, budget: usize) -> Option<Cow<'_, str>> {
    if estimate_tokens(prompt) <= budget {
        return Some(Cow::Borrowed(prompt));
    }
    if budget == 0 {
        return None;
    }

    // Jump close to the target, then back off to a word boundary.
    let mut text = prompt;
    if let Some((cut, next)) = prompt.char_indices().nth(budget * 4) {
        text = &prompt[..cut];
        if !next.is_whitespace() && !text.ends_with(char::is_whitespace) {
            text = drop_last_word(text)?;
        }
    }

    loop {
        text = text.trim_end();
        if text.is_empty() {
            return None;
        }
        if estimate_tokens(text) <= budget {
            return Some(Cow::Owned(text.to_string()));
        }
        text = drop_last_word(text)?;
    }
}

fn drop_last_word(text: &str) -> Option<&str> {
    text.trim_end()
        .rfind(char::is_whitespace)
        .map(|i| &text[..i])
}

/// Priority-ordered generation providers.
pub struct GenerationChain {
    providers: Vec<Arc<dyn GenerationProvider>>,
    stats: Mutex<GenerationStats>,
}

impl GenerationChain {
    pub fn new(providers: Vec<Arc<dyn GenerationProvider>>) -> Self {
        Self {
            providers,
            stats: Mutex::new(GenerationStats::default()),
        }
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    /// First non-empty completion from any provider, or `None`.
    pub async fn try_generate(&self, request: &GenerationRequest) -> Option<Generation> {
        self.stats.lock().total_requests += 1;

        for provider in &self.providers {
            if !provider.is_available() {
                tracing::debug!(provider = provider.name(), "generation provider unavailable, skipping");
                continue;
            }

            let budget = provider
                .token_limit()
                .saturating_sub(request.max_tokens as usize);
            let prompt = match truncate_to_budget(&request.prompt, budget) {
                Some(p) => p,
                None => {
                    tracing::warn!(
                        provider = provider.name(),
                        token_limit = provider.token_limit(),
                        max_tokens = request.max_tokens,
                        "prompt cannot fit provider budget, skipping"
                    );
                    continue;
                }
            };
            let fitted = match prompt {
                Cow::Borrowed(_) => None,
                Cow::Owned(shorter) => {
                    tracing::debug!(
                        provider = provider.name(),
                        budget,
                        estimated = estimate_tokens(&shorter),
                        "prompt truncated to fit provider"
                    );
                    self.stats.lock().truncations += 1;
                    Some(GenerationRequest {
                        prompt: shorter,
                        ..request.clone()
                    })
                }
            };
            let attempt = fitted.as_ref().unwrap_or(request);

            for model in provider.models() {
                match provider.generate(model, attempt).await {
                    Ok(text) if !text.trim().is_empty() => {
                        *self
                            .stats
                            .lock()
                            .served_by
                            .entry(provider.name().to_string())
                            .or_default() += 1;
                        return Some(Generation {
                            text: text.trim().to_string(),
                            provider: provider.name().to_string(),
                            model: model.clone(),
                        });
                    }
                    Ok(_) => {
                        tracing::warn!(provider = provider.name(), model = %model, "empty completion, trying next");
                        self.record_failure(provider.name());
                    }
                    Err(e) => {
                        tracing::warn!(provider = provider.name(), model = %model, error = %e, "generation failed, trying next");
                        self.record_failure(provider.name());
                    }
                }
            }
        }
        None
    }

    /// Like [`try_generate`](Self::try_generate), but never fails: when
    /// every provider fails the result carries `fallback` as its text.
    pub async fn generate(&self, request: &GenerationRequest, fallback: String) -> Generation {
        match self.try_generate(request).await {
            Some(generation) => generation,
            None => {
                tracing::warn!("all generation providers failed, using fallback answer");
                self.stats.lock().fallback_answers += 1;
                Generation {
                    text: fallback,
                    provider: FALLBACK_PROVIDER.to_string(),
                    model: FALLBACK_MODEL.to_string(),
                }
            }
        }
    }

    fn record_failure(&self, provider: &str) {
        *self
            .stats
            .lock()
            .failures
            .entry(provider.to_string())
            .or_default() += 1;
    }

    pub fn stats(&self) -> GenerationStats {
        self.stats.lock().clone()
    }

    /// Probe every provider. Does not touch stats.
    pub async fn test_connection(&self) -> Vec<ProviderHealth> {
        let mut out = Vec::with_capacity(self.providers.len());
        for provider in &self.providers {
            let available = provider.is_available();
            let (healthy, error) = if !available {
                (false, Some("not configured".to_string()))
            } else {
                match provider.health_check().await {
                    Ok(()) => (true, None),
                    Err(e) => (false, Some(e.to_string())),
                }
            };
            out.push(ProviderHealth {
                name: provider.name().to_string(),
                available,
                healthy,
                error,
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        name: &'static str,
        models: Vec<String>,
        limit: usize,
        available: bool,
        /// Models that fail.
        failing: Vec<&'static str>,
        calls: AtomicUsize,
        last_prompt: Mutex<Option<String>>,
    }

    impl Scripted {
        fn new(name: &'static str, models: &[&str]) -> Self {
            Self {
                name,
                models: models.iter().map(|m| m.to_string()).collect(),
                limit: 10_000,
                available: true,
                failing: Vec::new(),
                calls: AtomicUsize::new(0),
                last_prompt: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl GenerationProvider for Scripted {
        fn name(&self) -> &str {
            self.name
        }
        fn models(&self) -> &[String] {
            &self.models
        }
        fn token_limit(&self) -> usize {
            self.limit
        }
        fn is_available(&self) -> bool {
            self.available
        }
        async fn generate(&self, model: &str, request: &GenerationRequest) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_prompt.lock() = Some(request.prompt.clone());
            if self.failing.contains(&model) {
                anyhow::bail!("{} rate limited", model);
            }
            Ok(format!("{} says hi", model))
        }
        async fn health_check(&self) -> anyhow::Result<()> {
            if self.failing.is_empty() {
                Ok(())
            } else {
                anyhow::bail!("degraded")
            }
        }
    }

    fn request(prompt: &str) -> GenerationRequest {
        GenerationRequest::new(prompt, 100, 0.7)
    }

    #[tokio::test]
    async fn test_models_tried_in_order_before_next_provider() {
        let groq = Arc::new(Scripted {
            failing: vec!["small"],
            ..Scripted::new("groq", &["small", "large"])
        });
        let gemini = Arc::new(Scripted::new("gemini", &["flash"]));
        let chain = GenerationChain::new(vec![groq.clone(), gemini.clone()]);

        let out = chain.generate(&request("hello"), "fallback".into()).await;
        assert_eq!(out.provider, "groq");
        assert_eq!(out.model, "large");
        assert_eq!(out.text, "large says hi");
        assert_eq!(gemini.calls.load(Ordering::SeqCst), 0);
        assert_eq!(chain.stats().failures.get("groq"), Some(&1));
    }

    #[tokio::test]
    async fn test_disabled_first_provider_uses_second() {
        let a = Arc::new(Scripted { available: false, ..Scripted::new("a", &["m"]) });
        let b = Arc::new(Scripted::new("b", &["m"]));
        let c = Arc::new(Scripted::new("c", &["m"]));
        let chain = GenerationChain::new(vec![a.clone(), b, c]);
        let out = chain.generate(&request("q"), String::new()).await;
        assert_eq!(out.provider, "b");
        let stats = chain.stats();
        assert_eq!(stats.served_by.get("b"), Some(&1));
        assert!(stats.served_by.get("a").is_none());
        assert_eq!(a.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_all_failing_returns_fallback() {
        let a = Arc::new(Scripted {
            failing: vec!["m"],
            ..Scripted::new("a", &["m"])
        });
        let chain = GenerationChain::new(vec![a]);
        let out = chain
            .generate(&request("q"), "Related emails: none".into())
            .await;
        assert!(out.is_fallback());
        assert_eq!(out.text, "Related emails: none");
        assert_eq!(out.model, FALLBACK_MODEL);
        assert_eq!(chain.stats().fallback_answers, 1);

        let empty = GenerationChain::new(Vec::new());
        assert!(empty.try_generate(&request("q")).await.is_none());
    }

    #[tokio::test]
    async fn test_over_limit_prompt_is_truncated() {
        let small = Arc::new(Scripted {
            limit: 110,
            ..Scripted::new("small", &["m"])
        });
        let chain = GenerationChain::new(vec![small.clone()]);
        let prompt = "word ".repeat(200);
        let out = chain.generate(&request(&prompt), String::new()).await;
        assert_eq!(out.provider, "small");

        let sent = small.last_prompt.lock().clone().unwrap();
        assert!(estimate_tokens(&sent) <= 10);
        assert!(sent.split_whitespace().all(|w| w == "word"));
        assert_eq!(chain.stats().truncations, 1);
    }

    #[tokio::test]
    async fn test_zero_budget_provider_is_skipped() {
        let tiny = Arc::new(Scripted {
            limit: 100,
            ..Scripted::new("tiny", &["m"])
        });
        let big = Arc::new(Scripted::new("big", &["m"]));
        let chain = GenerationChain::new(vec![tiny.clone(), big]);
        let out = chain.generate(&request("hello there"), String::new()).await;
        assert_eq!(out.provider, "big");
        assert_eq!(tiny.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_truncate_removes_whole_words() {
        let text = "alpha beta gamma delta epsilon";
        assert_eq!(truncate_to_budget(text, 100).unwrap(), text);
        let cut = truncate_to_budget(text, 4).unwrap();
        assert_eq!(cut, "alpha beta gamma");
        assert!(truncate_to_budget(text, 0).is_none());
        assert!(truncate_to_budget("supercalifragilistic", 1).is_none());
    }

    #[tokio::test]
    async fn test_connection_does_not_touch_stats() {
        let ok = Arc::new(Scripted::new("ok", &["m"]));
        let bad = Arc::new(Scripted {
            failing: vec!["m"],
            ..Scripted::new("bad", &["m"])
        });
        let off = Arc::new(Scripted { available: false, ..Scripted::new("off", &["m"]) });
        let chain = GenerationChain::new(vec![ok, bad, off]);
        let health = chain.test_connection().await;
        assert!(health[0].healthy);
        assert!(!health[1].healthy && health[1].available);
        assert_eq!(health[1].error.as_deref(), Some("degraded"));
        assert!(!health[2].available);
        assert_eq!(chain.stats().total_requests, 0);
    }
}
