//! Fallback keyword search.
//!
//! Used whenever semantic search is degraded: no index, no vectors, or a
//! query embedding that failed. Needs nothing but the document list, so it
//! is always available.
//!
//! # Scoring
//!
//! 1. Lowercase the query and split it on whitespace into terms
//!    (surrounding punctuation stripped).
//! 2. For each document, sum the non-overlapping occurrence counts of every
//!    term in the lowercased content.
//! 3. Drop documents that score zero or fail the filters.
//! 4. Sort by score descending. The sort is stable, so ties keep the
//!    original document order.
//! 5. Truncate to `k`.

use chrono::{DateTime, Utc};

use crate::models::{Document, ScoredDocument, SearchFilters};

/// Split a query into lowercase search terms.
pub fn query_terms(query: &str) -> Vec<String> {
    query
        .split_whitespace()
        .map(|t| {
            t.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|t| !t.is_empty())
        .collect()
}

/// Summed term-occurrence score of `content` for `terms`.
pub fn term_score(content: &str, terms: &[String]) -> usize {
    let haystack = content.to_lowercase();
    terms.iter().map(|t| haystack.matches(t.as_str()).count()).sum()
}

/// Rank `documents` against `query` by term occurrence.
pub fn text_search(
    documents: &[Document],
    query: &str,
    k: usize,
    filters: &SearchFilters,
    now: DateTime<Utc>,
) -> Vec<ScoredDocument> {
    let terms = query_terms(query);
    if terms.is_empty() || k == 0 {
        return Vec::new();
    }

    let mut scored: Vec<(usize, &Document)> = documents
        .iter()
        .filter(|doc| filters.matches(doc, now))
        .map(|doc| (term_score(&doc.content, &terms), doc))
        .filter(|(score, _)| *score > 0)
        .collect();

    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored.truncate(k);

    scored
        .into_iter()
        .map(|(score, doc)| ScoredDocument {
            document: doc.clone(),
            score: score as f32,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
    }

    fn corpus() -> Vec<Document> {
        vec![
            Document::new("Rust release notes: async closures land.")
                .with_meta("subject", "first")
                .with_meta("label", "news"),
            Document::new("Weekend football scores and highlights.")
                .with_meta("subject", "second")
                .with_meta("label", "sports"),
            Document::new("RUST and more rust: the borrow checker explained.")
                .with_meta("subject", "third")
                .with_meta("label", "news"),
            Document::new("Async runtimes compared, async everywhere.")
                .with_meta("subject", "fourth")
                .with_meta("label", "news"),
        ]
    }

    fn subjects(results: &[ScoredDocument]) -> Vec<&str> {
        results.iter().map(|r| r.document.subject().unwrap()).collect()
    }

    #[test]
    fn test_scores_sum_term_occurrences() {
        let results = text_search(&corpus(), "rust", 10, &SearchFilters::default(), now());
        assert_eq!(subjects(&results), vec!["third", "first"]);
        assert_eq!(results[0].score, 2.0);
        assert_eq!(results[1].score, 1.0);
    }

    #[test]
    fn test_ties_keep_document_order() {
        let results = text_search(&corpus(), "Rust async!", 10, &SearchFilters::default(), now());
        // first: rust 1 + async 1 = 2, third: 2, fourth: async 2
        assert_eq!(subjects(&results), vec!["first", "third", "fourth"]);
        assert!(results.iter().all(|r| r.score == 2.0));
    }

    #[test]
    fn test_excludes_zero_matches_and_applies_filters() {
        let filters = SearchFilters {
            label: Some("sports".into()),
            ..Default::default()
        };
        assert!(text_search(&corpus(), "rust", 10, &filters, now()).is_empty());
        let results = text_search(&corpus(), "football", 10, &filters, now());
        assert_eq!(subjects(&results), vec!["second"]);
    }

    #[test]
    fn test_truncates_to_k_and_ignores_blank_query() {
        let results = text_search(&corpus(), "rust async", 1, &SearchFilters::default(), now());
        assert_eq!(results.len(), 1);
        assert!(text_search(&corpus(), "  ?! ", 5, &SearchFilters::default(), now()).is_empty());
    }

    #[test]
    fn test_query_terms() {
        assert_eq!(query_terms("What's new, Rust?"), vec!["what's", "new", "rust"]);
    }
}
