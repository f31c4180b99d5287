//! Sentence-aware sliding-window chunker.
//!
//! Splits document text into overlapping windows sized for embedding-model
//! context limits. Window sizes are measured in characters, never bytes, so
//! multi-byte text is always cut on a `char` boundary.
//!
//! # Algorithm
//!
//! 1. Text no longer than `chunk_size` is returned as a single chunk.
//! 2. Otherwise a window of `chunk_size` characters is opened at `start`.
//! 3. Unless the window reaches the end of the text, the last 200
//!    characters of the window (never the overlap region at its head) are
//!    searched for the latest sentence break (`". "`, `"! "`, `"? "` or a
//!    blank line) and the window is cut just after it.
//! 4. The next window starts `overlap` characters before the cut. If the
//!    cut is too close to `start` to leave room for the overlap, the next
//!    window starts at the cut instead, so the loop always progresses.
//! 5. Windows that are blank after trimming are dropped.
//!
//! Without a sentence break the window advances by exactly
//! `chunk_size - overlap`.
//!
//! # Example
//!
//! ```rust
//! use letterbox_core::chunk::chunk_text;
//!
//! let chunks = chunk_text("Hello world. Second sentence.", 1000, 100).unwrap();
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].text, "Hello world. Second sentence.");
//! ```

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{RagError, Result};
use crate::models::Document;

/// How far back from a window's end to look for a sentence break.
pub const BOUNDARY_SEARCH_WINDOW: usize = 200;

const SENTENCE_BREAKS: [&str; 4] = [". ", "! ", "? ", "\n\n"];

/// A chunk of text plus the character span of the window it came from.
///
/// `text` is trimmed; `start..end` covers the untrimmed window in the
/// original text, in characters. Consecutive windows overlap by at most
/// the configured overlap and never leave a gap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub text: String,
    pub start: usize,
    pub end: usize,
}

/// Reject chunking parameters that cannot make progress.
pub fn validate_params(chunk_size: usize, overlap: usize) -> Result<()> {
    if chunk_size == 0 {
        return Err(RagError::InvalidConfig(
            "chunk_size must be greater than zero".into(),
        ));
    }
    if overlap >= chunk_size {
        return Err(RagError::InvalidConfig(format!(
            "chunk overlap ({}) must be smaller than chunk_size ({})",
            overlap, chunk_size
        )));
    }
    Ok(())
}

/// Split `text` into overlapping, sentence-aligned chunks.
///
/// Returns an empty vector for blank text.
///
/// # Errors
///
/// [`RagError::InvalidConfig`] if `chunk_size` is zero or
/// `overlap >= chunk_size`.
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Result<Vec<Chunk>> {
    validate_params(chunk_size, overlap)?;

    // Byte offset of every char, plus the end of the string.
    let offsets: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let total = offsets.len() - 1;

    if total <= chunk_size {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }
        return Ok(vec![Chunk {
            index: 0,
            text: trimmed.to_string(),
            start: 0,
            end: total,
        }]);
    }

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < total {
        let mut end = (start + chunk_size).min(total);

        if end < total {
            let search_from = end
                .saturating_sub(BOUNDARY_SEARCH_WINDOW)
                .max(start + overlap);
            let window = &text[offsets[search_from]..offsets[end]];
            if let Some(pos) = last_sentence_break(window) {
                // Every break token starts with an ASCII char, so one byte
                // past it is a char boundary.
                let cut = offsets[search_from] + pos + 1;
                end = offsets.binary_search(&cut).unwrap_or_else(|i| i);
            }
        }

        let piece = text[offsets[start]..offsets[end]].trim();
        if !piece.is_empty() {
            chunks.push(Chunk {
                index: chunks.len(),
                text: piece.to_string(),
                start,
                end,
            });
        }

        if end >= total {
            break;
        }
        start = if end > start + overlap { end - overlap } else { end };
    }

    Ok(chunks)
}

/// Byte position of the latest sentence break in `window`, if any.
fn last_sentence_break(window: &str) -> Option<usize> {
    SENTENCE_BREAKS
        .iter()
        .filter_map(|token| window.rfind(token))
        .max()
}

/// Chunk every document, producing derived documents.
///
/// Each derived document copies its parent's metadata and adds
/// `chunk_index`, `total_chunks`, `source_id` (the parent's id, or a
/// content hash when the parent has none) and `content_hash` (SHA-256 of
/// the chunk text). Documents with blank content produce no chunks.
pub fn chunk_documents(
    documents: &[Document],
    chunk_size: usize,
    overlap: usize,
) -> Result<Vec<Document>> {
    let mut out = Vec::with_capacity(documents.len());

    for doc in documents {
        let chunks = chunk_text(&doc.content, chunk_size, overlap)?;
        let total = chunks.len();
        let source_id = doc
            .source_id()
            .map(str::to_string)
            .unwrap_or_else(|| content_hash(&doc.content)[..16].to_string());

        for chunk in chunks {
            let mut metadata = doc.metadata.clone();
            metadata.insert("chunk_index".into(), Value::from(chunk.index));
            metadata.insert("total_chunks".into(), Value::from(total));
            metadata.insert("source_id".into(), Value::from(source_id.clone()));
            metadata.insert(
                "content_hash".into(),
                Value::from(content_hash(&chunk.text)),
            );
            out.push(Document {
                content: chunk.text,
                metadata,
            });
        }
    }

    Ok(out)
}

/// Hex SHA-256 of `text`.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slice_chars(text: &str, start: usize, end: usize) -> String {
        text.chars().skip(start).take(end - start).collect()
    }

    /// Rebuild the text from window spans with overlaps removed.
    fn reconstruct(text: &str, chunks: &[Chunk]) -> String {
        let mut out = String::new();
        let mut covered = 0;
        for c in chunks {
            assert!(c.start <= covered, "gap before chunk {}", c.index);
            out.push_str(&slice_chars(text, covered, c.end));
            covered = c.end;
        }
        out
    }

    #[test]
    fn test_short_text_single_chunk() {
        let chunks = chunk_text("Hello, world!", 1000, 100).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Hello, world!");
        assert_eq!((chunks[0].start, chunks[0].end), (0, 13));
    }

    #[test]
    fn test_blank_text_no_chunks() {
        assert!(chunk_text("", 100, 10).unwrap().is_empty());
        assert!(chunk_text("   \n\n  ", 100, 10).unwrap().is_empty());
    }

    #[test]
    fn test_rejects_overlap_not_smaller_than_size() {
        assert!(matches!(
            chunk_text("abc", 10, 10),
            Err(RagError::InvalidConfig(_))
        ));
        assert!(matches!(
            chunk_text("abc", 0, 0),
            Err(RagError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_hard_cut_without_sentence_breaks() {
        let text = "a".repeat(250);
        let chunks = chunk_text(&text, 100, 20).unwrap();
        let spans: Vec<(usize, usize)> = chunks.iter().map(|c| (c.start, c.end)).collect();
        assert_eq!(spans, vec![(0, 100), (80, 180), (160, 250)]);
        assert_eq!(reconstruct(&text, &chunks), text);
    }

    #[test]
    fn test_cuts_after_sentence_break() {
        let first = format!("{}. ", "x".repeat(60));
        let text = format!("{}{}", first, "y".repeat(100));
        let chunks = chunk_text(&text, 100, 10).unwrap();
        assert!(chunks[0].text.ends_with('.'));
        assert_eq!(chunks[0].end, 61);
        assert_eq!(reconstruct(&text, &chunks), text);
    }

    #[test]
    fn test_reconstructs_prose() {
        let text = (0..120)
            .map(|i| format!("Sentence number {} talks about topic {}.", i, i % 7))
            .collect::<Vec<_>>()
            .join(" ");
        for (size, overlap) in [(300, 50), (1000, 100), (64, 63)] {
            let chunks = chunk_text(&text, size, overlap).unwrap();
            assert!(chunks.len() > 1);
            assert_eq!(reconstruct(&text, &chunks), text, "size {}", size);
            for (i, c) in chunks.iter().enumerate() {
                assert_eq!(c.index, i);
                assert!(!c.text.trim().is_empty());
                assert!(c.end - c.start <= size);
            }
        }
    }

    #[test]
    fn test_multibyte_text_cut_on_char_boundaries() {
        let text = "┌──┐ Größe! Ünïcödé? ".repeat(40);
        let chunks = chunk_text(&text, 50, 5).unwrap();
        assert!(chunks.len() > 1);
        assert_eq!(reconstruct(&text, &chunks), text);
    }

    #[test]
    fn test_chunk_documents_metadata() {
        let long = "Alpha beta gamma. ".repeat(20);
        let docs = vec![
            Document::new(long).with_meta("source_id", "mail-1").with_meta("label", "news"),
            Document::new("   "),
            Document::new("Short note.").with_meta("sender", "a@b.c"),
        ];
        let chunks = chunk_documents(&docs, 100, 10).unwrap();
        let parents: Vec<_> = chunks.iter().map(|d| d.source_id().unwrap()).collect();
        assert!(parents.iter().filter(|p| **p == "mail-1").count() > 1);

        let first = &chunks[0];
        assert_eq!(first.label(), Some("news"));
        assert_eq!(first.chunk_index(), Some(0));
        let total = first.total_chunks().unwrap() as usize;
        assert_eq!(total, parents.len() - 1);

        let last = chunks.last().unwrap();
        assert_eq!(last.content, "Short note.");
        assert_eq!(last.source_id().map(str::len), Some(16));
        assert_eq!(
            last.metadata["content_hash"].as_str().unwrap(),
            content_hash("Short note.")
        );
    }
}
