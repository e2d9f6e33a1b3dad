// src/chunk.rs
//! Splits normalized documents into bounded chunks for summarization.
//!
//! Splits land on paragraph or sentence boundaries nearest the size limit.
//! A split point that would cut through a numeric value, date, or named
//! event is shifted outward past the entity, letting that chunk exceed the
//! nominal bound. Consecutive chunks share a flagged overlap region so
//! cross-sentence context survives entity extraction without being counted
//! twice downstream.

use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::entity;
use crate::normalize::NormalizedDocument;

#[derive(Debug, Clone, Copy)]
pub struct ChunkConfig {
    /// Nominal maximum chunk size in characters; entity shifting may exceed it.
    pub max_chars: usize,
    /// Trailing/leading overlap between consecutive chunks, in characters.
    pub overlap_chars: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_chars: 3000,
            overlap_chars: 200,
        }
    }
}

/// One bounded segment of a document. `seq` ordering is significant and is
/// preserved end-to-end through summarization into provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub doc_id: String,
    pub seq: usize,
    pub text: String,
    /// True when the start of this chunk repeats the tail of the previous one.
    pub has_overlap: bool,
}

/// Byte offset of the `chars`-th character after `start`.
fn byte_advance(text: &str, start: usize, chars: usize) -> usize {
    text[start..]
        .char_indices()
        .nth(chars)
        .map(|(i, _)| start + i)
        .unwrap_or(text.len())
}

fn floor_char_boundary(text: &str, mut i: usize) -> usize {
    while i > 0 && !text.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Best split position in `text[start..limit]`: last paragraph break, else
/// last sentence end, else last whitespace, else the raw limit.
fn natural_boundary(text: &str, start: usize, limit: usize) -> usize {
    let window = &text[start..limit];

    if let Some(pos) = window.rfind("\n\n") {
        if pos > 0 {
            return start + pos + 2; // keep the break with the earlier chunk
        }
    }

    static RE_SENTENCE: OnceCell<Regex> = OnceCell::new();
    let re = RE_SENTENCE
        .get_or_init(|| Regex::new(r#"[.!?]["')]?\s"#).expect("sentence boundary regex"));
    if let Some(m) = re.find_iter(window).last() {
        if m.end() < window.len() {
            return start + m.end();
        }
    }

    if let Some(pos) = window.rfind(char::is_whitespace) {
        if pos > 0 {
            return start + pos + 1;
        }
    }

    floor_char_boundary(text, limit)
}

/// NormalizedDocument -> ordered chunk sequence. Chunks are exact slices of
/// the body; the next chunk starts `overlap_chars` before the previous cut,
/// so concatenating chunk texts minus marked overlaps reconstructs the body.
pub fn split_document(doc: &NormalizedDocument, cfg: &ChunkConfig) -> Vec<Chunk> {
    split_text(&doc.source_id, &doc.body, cfg)
}

pub fn split_text(doc_id: &str, text: &str, cfg: &ChunkConfig) -> Vec<Chunk> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    let spans = entity::protected_spans(text);
    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut has_overlap = false;

    loop {
        let limit = byte_advance(text, start, cfg.max_chars);
        if limit >= text.len() {
            chunks.push(Chunk {
                doc_id: doc_id.to_string(),
                seq: chunks.len(),
                text: text[start..].to_string(),
                has_overlap,
            });
            break;
        }

        let mut cut = natural_boundary(text, start, limit);

        // Never cut through a protected entity: shift the split outward.
        while entity::inside_span(&spans, cut) {
            let span_end = spans
                .iter()
                .find(|r| cut > r.start && cut < r.end)
                .map(|r| r.end)
                .unwrap_or(cut);
            cut = span_end;
        }
        if cut <= start {
            // Degenerate window (single giant token/entity): hard-advance.
            cut = floor_char_boundary(text, limit.max(start + 1));
            while entity::inside_span(&spans, cut) {
                cut = spans
                    .iter()
                    .find(|r| cut > r.start && cut < r.end)
                    .map(|r| r.end)
                    .unwrap_or(cut);
            }
        }
        if cut >= text.len() {
            chunks.push(Chunk {
                doc_id: doc_id.to_string(),
                seq: chunks.len(),
                text: text[start..].to_string(),
                has_overlap,
            });
            break;
        }

        chunks.push(Chunk {
            doc_id: doc_id.to_string(),
            seq: chunks.len(),
            text: text[start..cut].to_string(),
            has_overlap,
        });

        // Overlap context for the next chunk, pulled back out of any entity
        // span so a partial number never opens a chunk.
        let mut next_start = {
            let mut back = cut;
            let mut taken = 0;
            while back > 0 && taken < cfg.overlap_chars {
                back = floor_char_boundary(text, back - 1);
                taken += 1;
            }
            back
        };
        while entity::inside_span(&spans, next_start) {
            next_start = spans
                .iter()
                .find(|r| next_start > r.start && next_start < r.end)
                .map(|r| r.start)
                .unwrap_or(next_start);
        }
        if next_start <= start || next_start >= cut {
            next_start = cut;
        }
        has_overlap = next_start < cut;
        start = next_start;
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{extract_entities, EntityKind};

    fn cfg(max: usize, overlap: usize) -> ChunkConfig {
        ChunkConfig {
            max_chars: max,
            overlap_chars: overlap,
        }
    }

    #[test]
    fn short_text_is_one_chunk() {
        let chunks = split_text("doc", "One short paragraph only.", &cfg(3000, 200));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].seq, 0);
        assert!(!chunks[0].has_overlap);
    }

    #[test]
    fn splits_on_paragraph_boundaries() {
        let text = format!("{}\n\n{}", "alpha beta gamma. ".repeat(12), "delta epsilon zeta. ".repeat(12));
        let chunks = split_text("doc", &text, &cfg(260, 0));
        assert!(chunks.len() >= 2);
        // First cut lands on the paragraph break.
        assert!(chunks[0].text.ends_with("\n\n") || chunks[0].text.ends_with(". "));
    }

    #[test]
    fn money_value_is_never_split_across_chunks() {
        // No punctuation, so the boundary search falls back to whitespace, and
        // the nominal limit lands between "$12.4" and "billion".
        let words = "alpha bravo charlie delta echo foxtrot ".repeat(5);
        let text = format!("{words}growth reached $12.4 billion according to officials");
        let limit = text.find("billion").unwrap() + 3; // mid-entity
        let chunks = split_text("doc", &text, &cfg(limit, 0));

        assert!(chunks.len() >= 2);
        // The split was shifted outward past the whole amount.
        assert!(chunks[0].text.ends_with("$12.4 billion"));
        let containing: Vec<_> = chunks
            .iter()
            .filter(|c| c.text.contains("$12.4 billion"))
            .collect();
        assert_eq!(containing.len(), 1, "entity must appear intact exactly once");
        for c in &chunks {
            assert!(!c.text.contains("$12.4") || c.text.contains("$12.4 billion"));
        }
    }

    #[test]
    fn overlap_is_flagged_and_repeats_previous_tail() {
        let text = "word ".repeat(400);
        let chunks = split_text("doc", &text, &cfg(300, 50));
        assert!(chunks.len() >= 2);
        assert!(!chunks[0].has_overlap);
        for pair in chunks.windows(2) {
            assert!(pair[1].has_overlap);
            // The second chunk opens with text the first chunk already ended with.
            let head: String = pair[1].text.chars().take(20).collect();
            assert!(pair[0].text.contains(&head));
        }
    }

    #[test]
    fn union_of_chunk_entities_covers_document_entities() {
        let text = format!(
            "{}\n\nReserves stood at $36.2 billion on 2026-08-20. {}\n\nInflation printed 8.4% in July, \
             and the FOMC meets again Sep 17, 2026. {}",
            "Context paragraph about regional markets and trade flows. ".repeat(4),
            "More context on export volumes and pipeline throughput follows here. ".repeat(4),
            "Final remarks about liquidity conditions in the banking sector. ".repeat(4),
        );
        let chunks = split_text("doc", &text, &cfg(220, 40));
        assert!(chunks.len() > 2);

        let doc_entities = extract_entities(&text);
        let mut union = std::collections::BTreeSet::new();
        for c in &chunks {
            union.extend(extract_entities(&c.text));
        }
        for e in doc_entities {
            assert!(union.contains(&e), "entity lost by chunking: {:?}", e);
        }
        assert!(union.iter().any(|e| e.kind == EntityKind::Number));
        assert!(union.iter().any(|e| e.kind == EntityKind::Date));
    }

    #[test]
    fn sequence_indices_are_dense_and_ordered() {
        let text = "sentence one here. ".repeat(100);
        let chunks = split_text("doc", &text, &cfg(200, 30));
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.seq, i);
        }
    }
}
