// src/entity.rs
//! Regex extraction of the entities the pipeline must never lose:
//! numeric values, dates, and named events.
//!
//! Used three ways: the chunker treats entity match ranges as protected spans
//! that a split point may not cut through; the summarizer round-trips entities
//! through the model output; the aggregator checks merged text against the
//! contributing entities (fabrication guard).

use std::collections::BTreeSet;
use std::ops::Range;

use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Number,
    Date,
    Event,
}

/// A tagged, verbatim span of source text.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Entity {
    pub kind: EntityKind,
    pub text: String,
}

impl Entity {
    pub fn new(kind: EntityKind, text: &str) -> Self {
        Self {
            kind,
            text: squash_ws(text),
        }
    }
}

fn squash_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn re_number() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?x)
            [$€£₸]\s?\d[\d,]*(?:\.\d+)?(?:\s?(?:trillion|billion|million|bn|mln))?
            | \b\d[\d,]*(?:\.\d+)?%
            | \b\d[\d,]*(?:\.\d+)?\s?(?:percent|percentage\ points|basis\ points|bps|trillion|billion|million|bn|mln)\b
            | \b\d{1,3}(?:,\d{3})+(?:\.\d+)?\b
            | \b\d+\.\d+\b
            ",
        )
        .expect("number regex")
    })
}

fn re_date() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?x)
            \b\d{4}-\d{2}-\d{2}\b
            | \b(?:January|February|March|April|May|June|July|August|September|October|November|December
                 |Jan|Feb|Mar|Apr|Jun|Jul|Aug|Sep|Sept|Oct|Nov|Dec)\.?\s\d{1,2}(?:,\s?\d{4})?\b
            | \b\d{1,2}\s(?:January|February|March|April|May|June|July|August|September|October|November|December)(?:\s\d{4})?\b
            | \bQ[1-4]\s\d{4}\b
            | \b\d{1,2}/\d{1,2}/\d{4}\b
            ",
        )
        .expect("date regex")
    })
}

fn re_event() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?x)
            \b(?:[A-Z][A-Za-z&-]+\s){1,3}(?:Summit|Meeting|Report|Conference|Decision|Statement|Accord|Agreement|Forum|Review|Auction)\b
            | \b(?:FOMC|OPEC\+?|IMF|ECB|Federal\ Reserve|World\ Bank|National\ Bank|Central\ Bank)\b
            ",
        )
        .expect("event regex")
    })
}

/// All entities in `text`, deterministically ordered.
pub fn extract_entities(text: &str) -> BTreeSet<Entity> {
    let mut out = BTreeSet::new();
    for m in re_number().find_iter(text) {
        out.insert(Entity::new(EntityKind::Number, m.as_str()));
    }
    for m in re_date().find_iter(text) {
        out.insert(Entity::new(EntityKind::Date, m.as_str()));
    }
    for m in re_event().find_iter(text) {
        out.insert(Entity::new(EntityKind::Event, m.as_str()));
    }
    out
}

/// Byte ranges a chunk split must not cut through, merged and sorted.
pub fn protected_spans(text: &str) -> Vec<Range<usize>> {
    let mut spans: Vec<Range<usize>> = Vec::new();
    for re in [re_number(), re_date(), re_event()] {
        for m in re.find_iter(text) {
            spans.push(m.range());
        }
    }
    spans.sort_by_key(|r| (r.start, r.end));

    let mut merged: Vec<Range<usize>> = Vec::with_capacity(spans.len());
    for span in spans {
        match merged.last_mut() {
            Some(last) if span.start <= last.end => {
                last.end = last.end.max(span.end);
            }
            _ => merged.push(span),
        }
    }
    merged
}

/// True if `pos` falls strictly inside one of the `spans`.
pub fn inside_span(spans: &[Range<usize>], pos: usize) -> bool {
    spans.iter().any(|r| pos > r.start && pos < r.end)
}
