//! Single-email helpers built on the generation chain: summary, topics and
//! sentiment. Each has a deterministic answer for when no provider responds.

use serde::Serialize;

use crate::error::Result;
use crate::generation::{GenerationChain, GenerationRequest};
use crate::models::Document;
use crate::persona::detect_topics;
use crate::prompt::PromptComposer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Negative,
    Neutral,
    /// No provider produced an answer.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SentimentReport {
    pub sentiment: Sentiment,
    pub explanation: String,
}

/// A few sentences summarising `doc`.
pub async fn summarize_email(
    chain: &GenerationChain,
    composer: &PromptComposer,
    doc: &Document,
) -> Result<String> {
    let prompt = composer.email_summary(doc)?;
    let fallback = format!(
        "Summary unavailable. Email from {}: {}",
        doc.sender().unwrap_or("Unknown sender"),
        doc.subject().unwrap_or("No subject")
    );
    Ok(chain
        .generate(&GenerationRequest::new(prompt, 200, 0.3), fallback)
        .await
        .text)
}

/// Topics of `doc`. Falls back to keyword detection.
pub async fn extract_topics(
    chain: &GenerationChain,
    composer: &PromptComposer,
    doc: &Document,
) -> Result<Vec<String>> {
    let prompt = composer.topic_extraction(doc)?;
    let request = GenerationRequest::new(prompt, 100, 0.1);
    let topics = match chain.try_generate(&request).await {
        Some(generation) => parse_topics(&generation.text),
        None => Vec::new(),
    };
    if !topics.is_empty() {
        return Ok(topics);
    }
    let text = format!("{} {}", doc.subject().unwrap_or_default(), doc.content);
    Ok(detect_topics(&text).into_iter().collect())
}

fn parse_topics(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for topic in text.split([',', '\n']) {
        let topic = topic.trim().trim_matches(|c: char| c == '-' || c == '*' || c == '.').trim();
        if !topic.is_empty() && !out.iter().any(|t| t.eq_ignore_ascii_case(topic)) {
            out.push(topic.to_string());
        }
    }
    out
}

/// Sentiment label plus the model's explanation.
pub async fn analyze_sentiment(
    chain: &GenerationChain,
    composer: &PromptComposer,
    doc: &Document,
) -> Result<SentimentReport> {
    let prompt = composer.sentiment_analysis(doc)?;
    let request = GenerationRequest::new(prompt, 150, 0.1);
    Ok(match chain.try_generate(&request).await {
        Some(generation) => SentimentReport {
            sentiment: parse_sentiment(&generation.text),
            explanation: generation.text,
        },
        None => SentimentReport {
            sentiment: Sentiment::Unknown,
            explanation: "Analysis failed".to_string(),
        },
    })
}

/// The last line naming a label decides; neutral when none does.
fn parse_sentiment(text: &str) -> Sentiment {
    let mut sentiment = Sentiment::Neutral;
    for line in text.lines() {
        let line = line.to_lowercase();
        if line.contains("positive") {
            sentiment = Sentiment::Positive;
        } else if line.contains("negative") {
            sentiment = Sentiment::Negative;
        } else if line.contains("neutral") {
            sentiment = Sentiment::Neutral;
        }
    }
    sentiment
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::GenerationProvider;
    use crate::prompt::PromptRegistry;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Canned(Option<&'static str>, Vec<String>);

    #[async_trait]
    impl GenerationProvider for Canned {
        fn name(&self) -> &str {
            "canned"
        }
        fn models(&self) -> &[String] {
            &self.1
        }
        fn token_limit(&self) -> usize {
            8000
        }
        async fn generate(&self, _model: &str, _request: &GenerationRequest) -> anyhow::Result<String> {
            match self.0 {
                Some(text) => Ok(text.to_string()),
                None => anyhow::bail!("offline"),
            }
        }
    }

    fn setup(reply: Option<&'static str>) -> (GenerationChain, PromptComposer) {
        (
            GenerationChain::new(vec![Arc::new(Canned(reply, vec!["m".into()]))]),
            PromptComposer::new(PromptRegistry::builtin()).unwrap(),
        )
    }

    fn email() -> Document {
        Document::new("Our new course on machine learning starts Monday.")
            .with_meta("sender", "Ana <ana@example.com>")
            .with_meta("subject", "Course launch")
    }

    #[tokio::test]
    async fn test_summary_fallback() {
        let (chain, composer) = setup(None);
        let summary = summarize_email(&chain, &composer, &email()).await.unwrap();
        assert_eq!(
            summary,
            "Summary unavailable. Email from Ana <ana@example.com>: Course launch"
        );
    }

    #[tokio::test]
    async fn test_topics_from_model_and_fallback() {
        let (chain, composer) = setup(Some("AI, Education,  ai\n- Careers"));
        let topics = extract_topics(&chain, &composer, &email()).await.unwrap();
        assert_eq!(topics, vec!["AI", "Education", "Careers"]);

        let (chain, composer) = setup(None);
        let topics = extract_topics(&chain, &composer, &email()).await.unwrap();
        assert_eq!(topics, vec!["AI", "Education"]);
    }

    #[tokio::test]
    async fn test_sentiment_parsing() {
        let (chain, composer) = setup(Some("Sentiment: Positive\nThe launch is announced warmly."));
        let report = analyze_sentiment(&chain, &composer, &email()).await.unwrap();
        assert_eq!(report.sentiment, Sentiment::Positive);
        assert!(report.explanation.contains("warmly"));

        let (chain, composer) = setup(Some("Hard to say."));
        let report = analyze_sentiment(&chain, &composer, &email()).await.unwrap();
        assert_eq!(report.sentiment, Sentiment::Neutral);

        let (chain, composer) = setup(None);
        let report = analyze_sentiment(&chain, &composer, &email()).await.unwrap();
        assert_eq!(report.sentiment, Sentiment::Unknown);
        assert_eq!(report.explanation, "Analysis failed");
    }
}
