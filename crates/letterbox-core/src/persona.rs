//! Persona detection, sender profiles and persona-voiced generation.
//!
//! A question can address a sender by first name:
//!
//! | Question | Persona | Remaining question |
//! |----------|---------|--------------------|
//! | `Hey Nate, tell me about AI` | `Nate` | `tell me about AI` |
//! | `Hey, Nate tell me about AI` | `Nate` | `tell me about AI` |
//! | `Tell me about AI` | none | unchanged |
//!
//! Profiles ([`Persona`]) are maintained by a [`PersonaBook`], which the
//! persona store implementations wrap. Ids are `"{first_name}_{hash}"`
//! with the hash taken from the raw sender string, so two senders with the
//! same display string share a profile.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::generation::{Generation, GenerationChain, GenerationRequest};
use crate::models::{Document, Persona};
use crate::prompt::PromptComposer;

/// Returned by [`derive_traits`] when there is nothing to go on.
pub const NEUTRAL_TRAITS: &str = "No specific style.";

/// First name used for senders with no recognisable name.
pub const UNKNOWN_NAME: &str = "Unknown";

const TRAIT_MAX_TOKENS: u32 = 100;
const TRAIT_TEMPERATURE: f32 = 0.2;

static ADDRESSED: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^(?:(?:Hey|Hello|Hi|Greetings?)\s+)?([A-Z][a-z]+)[,:\-\s]+(.+)$").ok()
});

static LEADING_NAME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^([A-Z][a-z]+)\s+(.+)$").ok());

const GENERIC_WORDS: &[&str] = &[
    "what", "when", "where", "who", "why", "how", "tell", "show", "give", "find", "search",
    "look", "check", "get", "make", "do", "can", "will", "should", "could", "would", "may",
    "might", "must", "shall", "hey", "hello", "hi", "greeting", "greetings",
];

/// Address-book tokens that are never first names.
const ROLE_WORDS: &[&str] = &[
    "newsletter",
    "noreply",
    "no-reply",
    "donotreply",
    "do-not-reply",
    "support",
    "info",
    "admin",
    "contact",
    "hello",
    "team",
];

const TOPIC_KEYWORDS: &[(&str, &[&str])] = &[
    (
        "AI",
        &["ai", "artificial intelligence", "machine learning", "ml", "gpt", "llm", "neural"],
    ),
    (
        "Tech",
        &["technology", "software", "programming", "coding", "development", "startup"],
    ),
    (
        "Business",
        &["business", "entrepreneur", "startup", "company", "market", "investment"],
    ),
    (
        "Finance",
        &["finance", "financial", "money", "investment", "trading", "crypto"],
    ),
    ("Health", &["health", "medical", "wellness", "fitness", "nutrition"]),
    ("News", &["news", "update", "announcement", "breaking", "latest"]),
    ("Education", &["education", "learning", "course", "training", "tutorial"]),
    ("Marketing", &["marketing", "advertising", "promotion", "campaign", "growth"]),
];

fn is_generic(word: &str) -> bool {
    GENERIC_WORDS.contains(&word.to_lowercase().as_str())
}

/// Split an addressed question into the persona name and the rest.
///
/// Returns `(None, question)` unchanged when no name is addressed.
pub fn detect(question: &str) -> (Option<String>, String) {
    let trimmed = question.trim();
    let (Some(addressed), Some(leading)) = (ADDRESSED.as_ref(), LEADING_NAME.as_ref()) else {
        return (None, question.to_string());
    };
    let Some(caps) = addressed.captures(trimmed) else {
        return (None, question.to_string());
    };

    let first = &caps[1];
    let body = caps[2].trim();
    if !is_generic(first) {
        return (Some(first.to_string()), body.to_string());
    }

    // "Hey, Nate tell me ..." puts the name after the greeting.
    if let Some(second) = leading.captures(body) {
        if !is_generic(&second[1]) {
            return (Some(second[1].to_string()), second[2].trim().to_string());
        }
    }
    (None, question.to_string())
}

fn is_name(word: &str) -> bool {
    (2..=20).contains(&word.len())
        && word.chars().all(|c| c.is_ascii_alphabetic())
        && !ROLE_WORDS.contains(&word.to_lowercase().as_str())
}

fn capitalize(word: &str) -> String {
    let lower = word.to_lowercase();
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Split `"Display Name <addr@host>"` into its parts.
fn split_sender(sender: &str) -> (Option<&str>, Option<&str>) {
    let sender = sender.trim();
    match (sender.find('<'), sender.rfind('>')) {
        (Some(open), Some(close)) if open < close => {
            let display = sender[..open].trim().trim_matches('"').trim();
            let addr = sender[open + 1..close].trim();
            (
                Some(display).filter(|d| !d.is_empty()),
                Some(addr).filter(|a| !a.is_empty()),
            )
        }
        _ if sender.contains('@') && !sender.contains(char::is_whitespace) => (None, Some(sender)),
        _ => (Some(sender).filter(|s| !s.is_empty()), None),
    }
}

/// Best-effort first name from a sender string.
///
/// Prefers the first name-like word of the display name, then the local
/// part of the address with role prefixes (`noreply`, `support`, …)
/// stripped.
pub fn extract_first_name(sender: &str) -> Option<String> {
    let (display, addr) = split_sender(sender);

    if let Some(display) = display {
        let from_display = display
            .split(|c: char| c.is_whitespace() || ",|-_.".contains(c))
            .find(|w| is_name(w));
        if let Some(name) = from_display {
            return Some(capitalize(name));
        }
    }

    let local = addr?.split('@').next()?.to_lowercase();
    let mut local = local.as_str();
    for prefix in ROLE_WORDS {
        if let Some(rest) = local.strip_prefix(prefix) {
            local = rest;
        }
    }
    local
        .split(['.', '_', '-', '+'])
        .find(|part| is_name(part))
        .map(capitalize)
}

/// Deterministic persona id for a sender.
pub fn persona_id(sender: &str) -> String {
    let first = extract_first_name(sender).unwrap_or_else(|| UNKNOWN_NAME.to_string());
    let digest = Sha256::digest(sender.trim().as_bytes());
    let hash: String = digest.iter().take(4).map(|b| format!("{:02x}", b)).collect();
    format!("{}_{}", first.to_lowercase(), hash)
}

/// Keyword topics mentioned in `text`.
pub fn detect_topics(text: &str) -> BTreeSet<String> {
    let lower = text.to_lowercase();
    let words: BTreeSet<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    TOPIC_KEYWORDS
        .iter()
        .filter(|(_, keywords)| {
            keywords.iter().any(|k| {
                if k.contains(' ') {
                    lower.contains(k)
                } else {
                    words.contains(k)
                }
            })
        })
        .map(|(topic, _)| topic.to_string())
        .collect()
}

/// Persona records keyed by id, with the update rules the stores share.
///
/// The book also remembers which email ids it has seen, so re-scanning a
/// corpus does not count the same email twice.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersonaBook {
    personas: BTreeMap<String, Persona>,
    #[serde(default)]
    observed_emails: BTreeSet<String>,
}

impl PersonaBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, sender: &str) -> Option<&Persona> {
        self.personas.get(&persona_id(sender))
    }

    /// Record one email from `sender`: create the profile or bump its
    /// count and `last_seen`, then merge topics found in the text.
    pub fn observe(
        &mut self,
        sender: &str,
        subject: &str,
        content: &str,
        seen_at: DateTime<Utc>,
    ) -> Persona {
        let id = persona_id(sender);
        let persona = self.personas.entry(id.clone()).or_insert_with(|| Persona {
            id,
            sender: sender.trim().to_string(),
            first_name: extract_first_name(sender).unwrap_or_else(|| UNKNOWN_NAME.to_string()),
            email_count: 0,
            first_seen: seen_at,
            last_seen: seen_at,
            topics: BTreeSet::new(),
            labels: BTreeSet::new(),
        });
        persona.email_count += 1;
        if seen_at > persona.last_seen {
            persona.last_seen = seen_at;
        }
        if seen_at < persona.first_seen {
            persona.first_seen = seen_at;
        }
        persona
            .topics
            .extend(detect_topics(&format!("{} {}", subject, content)));
        persona.clone()
    }

    /// [`observe`](Self::observe) once per `email_id`. `None` when the
    /// email was already recorded.
    pub fn observe_email(
        &mut self,
        email_id: &str,
        sender: &str,
        subject: &str,
        content: &str,
        seen_at: DateTime<Utc>,
    ) -> Option<Persona> {
        if !self.observed_emails.insert(email_id.to_string()) {
            return None;
        }
        Some(self.observe(sender, subject, content, seen_at))
    }

    /// Add `label` to an existing profile. False if the sender is unknown.
    pub fn add_label(&mut self, sender: &str, label: &str) -> bool {
        match self.personas.get_mut(&persona_id(sender)) {
            Some(p) => {
                p.labels.insert(label.to_string());
                true
            }
            None => false,
        }
    }

    /// Most active persona with this first name (case-insensitive).
    pub fn find_by_first_name(&self, name: &str) -> Option<&Persona> {
        self.personas
            .values()
            .filter(|p| p.first_name.eq_ignore_ascii_case(name))
            .max_by(|a, b| {
                a.email_count
                    .cmp(&b.email_count)
                    .then_with(|| b.id.cmp(&a.id))
            })
    }

    pub fn list(&self) -> Vec<Persona> {
        self.personas.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.personas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.personas.is_empty()
    }
}

/// Short style description of `persona_name` from their own emails.
///
/// Uses at most three samples. Returns [`NEUTRAL_TRAITS`] when there are no
/// samples or no provider produced text.
pub async fn derive_traits(
    chain: &GenerationChain,
    composer: &PromptComposer,
    persona_name: &str,
    samples: &[Document],
) -> Result<String> {
    if samples.iter().all(|d| d.content.trim().is_empty()) {
        return Ok(NEUTRAL_TRAITS.to_string());
    }
    let prompt = composer.persona_traits(persona_name, samples)?;
    let request = GenerationRequest::new(prompt, TRAIT_MAX_TOKENS, TRAIT_TEMPERATURE);
    Ok(chain
        .try_generate(&request)
        .await
        .map(|g| g.text)
        .unwrap_or_else(|| NEUTRAL_TRAITS.to_string()))
}

/// Answer `question` in the voice of `persona_name`, grounded in `docs`.
#[allow(clippy::too_many_arguments)]
pub async fn generate_first_person(
    chain: &GenerationChain,
    composer: &PromptComposer,
    persona_name: &str,
    traits: &str,
    question: &str,
    docs: &[Document],
    max_tokens: u32,
    temperature: f32,
) -> Result<Generation> {
    let prompt = composer.first_person(persona_name, traits, question, docs)?;
    let request = GenerationRequest::new(prompt, max_tokens, temperature);
    let fallback = format!("I'm {}, but I can't answer right now.", persona_name);
    Ok(chain.generate(&request, fallback).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::GenerationProvider;
    use crate::prompt::PromptRegistry;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::Arc;

    #[test]
    fn test_detect_examples() {
        assert_eq!(
            detect("Hey Nate, tell me about AI"),
            (Some("Nate".to_string()), "tell me about AI".to_string())
        );
        assert_eq!(detect("What is AI?"), (None, "What is AI?".to_string()));
        assert_eq!(detect("Tell me about AI"), (None, "Tell me about AI".to_string()));
        assert_eq!(
            detect("Hey, Nate tell me about AI"),
            (Some("Nate".to_string()), "tell me about AI".to_string())
        );
        assert_eq!(
            detect("Ana: what's new?"),
            (Some("Ana".to_string()), "what's new?".to_string())
        );
        assert_eq!(detect("Hello there"), (None, "Hello there".to_string()));
        assert_eq!(detect("ai news"), (None, "ai news".to_string()));
    }

    #[test]
    fn test_extract_first_name() {
        assert_eq!(
            extract_first_name("Nate Jones <nate@example.com>").as_deref(),
            Some("Nate")
        );
        assert_eq!(
            extract_first_name("\"Team\" <maria.lopez@example.com>").as_deref(),
            Some("Maria")
        );
        assert_eq!(extract_first_name("maria.lopez@example.com").as_deref(), Some("Maria"));
        assert_eq!(extract_first_name("noreply-sam@example.com").as_deref(), Some("Sam"));
        assert_eq!(extract_first_name("support@example.com"), None);
        assert_eq!(extract_first_name("x1@example.com"), None);
    }

    #[test]
    fn test_persona_id_is_deterministic() {
        let a = persona_id("Nate Jones <nate@example.com>");
        assert_eq!(a, persona_id("Nate Jones <nate@example.com>"));
        assert!(a.starts_with("nate_"));
        assert_eq!(a.len(), "nate_".len() + 8);
        assert_ne!(a, persona_id("Nate Smith <nate@other.com>"));
        assert!(persona_id("support@example.com").starts_with("unknown_"));
    }

    #[test]
    fn test_detect_topics_words_and_phrases() {
        let topics = detect_topics("Breaking: new Machine Learning course for startups");
        assert!(topics.contains("AI"));
        assert!(topics.contains("News"));
        assert!(topics.contains("Education"));
        assert!(!topics.contains("Tech"));
        // "ml" must not match inside "html"
        assert!(detect_topics("fix the html template").is_empty());
    }

    #[test]
    fn test_book_observe_and_labels() {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();
        let sender = "Nate Jones <nate@example.com>";
        let mut book = PersonaBook::new();

        let p = book.observe(sender, "GPT launch", "all about the llm", t0);
        assert_eq!(p.email_count, 1);
        assert_eq!(p.first_name, "Nate");
        assert!(p.topics.contains("AI"));

        let p = book.observe(sender, "Funding", "investment round", t1);
        assert_eq!(p.email_count, 2);
        assert_eq!(p.first_seen, t0);
        assert_eq!(p.last_seen, t1);

        assert!(book.observe_email("e1", sender, "Old", "", t0 - chrono::Duration::days(3)).is_some());
        assert!(book.observe_email("e1", sender, "Old", "", t0).is_none());
        let p = book.get(sender).unwrap();
        assert_eq!(p.email_count, 3);
        assert_eq!(p.first_seen, t0 - chrono::Duration::days(3));
        assert!(p.topics.contains("Business") && p.topics.contains("AI"));

        assert!(book.add_label(sender, "substack.com"));
        assert!(!book.add_label("ghost@example.com", "x"));
        assert!(book.get(sender).unwrap().labels.contains("substack.com"));
        assert_eq!(book.find_by_first_name("nate").unwrap().sender, sender);
        assert!(book.find_by_first_name("Zed").is_none());
    }

    struct Echo {
        models: Vec<String>,
        fail: bool,
    }

    #[async_trait]
    impl GenerationProvider for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn models(&self) -> &[String] {
            &self.models
        }
        fn token_limit(&self) -> usize {
            100_000
        }
        async fn generate(&self, _model: &str, request: &GenerationRequest) -> anyhow::Result<String> {
            if self.fail {
                anyhow::bail!("down");
            }
            Ok(format!("tokens={} temp={}", request.max_tokens, request.temperature))
        }
    }

    fn chain(fail: bool) -> GenerationChain {
        GenerationChain::new(vec![Arc::new(Echo {
            models: vec!["m".into()],
            fail,
        })])
    }

    #[tokio::test]
    async fn test_derive_traits() {
        let composer = PromptComposer::new(PromptRegistry::builtin()).unwrap();
        let samples = vec![Document::new("Cheers, N.")];

        let traits = derive_traits(&chain(false), &composer, "Nate", &samples)
            .await
            .unwrap();
        assert_eq!(traits, "tokens=100 temp=0.2");

        let traits = derive_traits(&chain(true), &composer, "Nate", &samples)
            .await
            .unwrap();
        assert_eq!(traits, NEUTRAL_TRAITS);

        let traits = derive_traits(&chain(false), &composer, "Nate", &[]).await.unwrap();
        assert_eq!(traits, NEUTRAL_TRAITS);
    }

    #[tokio::test]
    async fn test_first_person_fallback() {
        let composer = PromptComposer::new(PromptRegistry::builtin()).unwrap();
        let out = generate_first_person(&chain(true), &composer, "Nate", NEUTRAL_TRAITS, "q", &[], 800, 0.7)
            .await
            .unwrap();
        assert!(out.is_fallback());
        assert_eq!(out.text, "I'm Nate, but I can't answer right now.");
    }
}
