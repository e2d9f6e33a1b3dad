// src/normalize.rs
//! Raw payload -> normalized document: markup stripped, title and publication
//! date pulled out heuristically, content hashed for duplicate detection.
//!
//! Normalization never errors: an unusable payload is dropped. Near-identical
//! documents across sources are deduplicated within the run, keeping the copy
//! from the highest-priority source.

use chrono::{DateTime, NaiveDate, Utc};
use metrics::counter;
use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::fetch::RawDocument;
use crate::registry::{Category, SourceRegistry};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedDocument {
    pub source_id: String,
    pub category: Category,
    pub title: String,
    pub body: String,
    pub published_at: Option<DateTime<Utc>>,
    pub content_hash: String,
}

#[derive(Debug, Clone)]
pub struct NormalizeConfig {
    /// Extractions shorter than this are dropped, not errors.
    pub min_body_chars: usize,
    /// Similarity at or above this counts as a near-duplicate.
    pub near_dup_threshold: f64,
    /// Similarity is computed over this prefix of the body.
    pub dup_prefix_chars: usize,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            min_body_chars: 120,
            near_dup_threshold: 0.9,
            dup_prefix_chars: 400,
        }
    }
}

/// Normalizes every successful raw document and deduplicates within the run.
/// Output is ordered by source priority (descending), then registry order, so
/// dedup deterministically keeps the higher-priority copy.
pub fn normalize_batch(
    batch: &[RawDocument],
    registry: &SourceRegistry,
    cfg: &NormalizeConfig,
) -> Vec<NormalizedDocument> {
    let mut candidates: Vec<(i32, usize, NormalizedDocument)> = Vec::new();

    for (idx, raw) in batch.iter().enumerate() {
        if !raw.is_ok() {
            continue;
        }
        let Some(source) = registry.get(&raw.source_id) else {
            continue;
        };
        match normalize_document(raw, source.category, cfg) {
            Some(doc) => candidates.push((source.priority, idx, doc)),
            None => {
                tracing::debug!(source = %raw.source_id, "dropped at normalization");
                counter!("digest_documents_dropped_total").increment(1);
            }
        }
    }

    // Priority descending, registry order as the tiebreak.
    candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

    let mut kept: Vec<NormalizedDocument> = Vec::with_capacity(candidates.len());
    let mut deduped = 0usize;
    for (_, _, doc) in candidates {
        let duplicate = kept.iter().any(|existing| {
            existing.content_hash == doc.content_hash
                || near_duplicate(&existing.body, &doc.body, cfg)
        });
        if duplicate {
            deduped += 1;
            continue;
        }
        kept.push(doc);
    }

    counter!("digest_documents_kept_total").increment(kept.len() as u64);
    counter!("digest_documents_deduped_total").increment(deduped as u64);
    kept
}

/// RawDocument -> NormalizedDocument, or None when extraction is empty or
/// below the minimum length.
pub fn normalize_document(
    raw: &RawDocument,
    category: Category,
    cfg: &NormalizeConfig,
) -> Option<NormalizedDocument> {
    let body = normalize_body(&raw.payload);
    if body.chars().count() < cfg.min_body_chars {
        return None;
    }
    let title = extract_title(&raw.payload)
        .unwrap_or_else(|| body.lines().next().unwrap_or_default().chars().take(120).collect());
    let published_at = extract_published_at(&raw.payload);

    Some(NormalizedDocument {
        source_id: raw.source_id.clone(),
        category,
        title,
        body: body.clone(),
        published_at,
        content_hash: content_hash(&body),
    })
}

fn near_duplicate(a: &str, b: &str, cfg: &NormalizeConfig) -> bool {
    let pa: String = a.chars().take(cfg.dup_prefix_chars).collect();
    let pb: String = b.chars().take(cfg.dup_prefix_chars).collect();
    strsim::normalized_levenshtein(&pa, &pb) >= cfg.near_dup_threshold
}

pub fn content_hash(body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Strips markup and boilerplate while keeping paragraph structure, which the
/// chunker relies on for boundary selection.
pub fn normalize_body(payload: &str) -> String {
    static RE_DROP: OnceCell<Regex> = OnceCell::new();
    let re_drop = RE_DROP.get_or_init(|| {
        Regex::new(
            r"(?is)<script[^>]*>.*?</script>|<style[^>]*>.*?</style>|<noscript[^>]*>.*?</noscript>|<!--.*?-->",
        )
        .expect("markup drop regex")
    });
    static RE_BLOCK: OnceCell<Regex> = OnceCell::new();
    let re_block = RE_BLOCK.get_or_init(|| {
        Regex::new(r"(?i)</p>|</div>|</h[1-6]>|</li>|</tr>|<br\s*/?>").expect("block regex")
    });
    static RE_TAGS: OnceCell<Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| Regex::new(r"(?is)</?[^>]+>").expect("tag regex"));

    let mut out = re_drop.replace_all(payload, "").to_string();
    out = re_block.replace_all(&out, "\n\n").to_string();
    out = re_tags.replace_all(&out, " ").to_string();
    out = html_escape::decode_html_entities(&out).to_string();

    // Fold typographic quotes to ASCII.
    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    // Collapse horizontal whitespace but keep paragraph breaks.
    static RE_HWS: OnceCell<Regex> = OnceCell::new();
    let re_hws = RE_HWS.get_or_init(|| Regex::new(r"[ \t\r]+").expect("hws regex"));
    out = re_hws.replace_all(&out, " ").to_string();

    static RE_PARA: OnceCell<Regex> = OnceCell::new();
    let re_para = RE_PARA.get_or_init(|| Regex::new(r"\s*\n\s*(\n\s*)*").expect("para regex"));
    out = re_para.replace_all(&out, "\n\n").to_string();

    // Drop degenerate one-word "paragraphs" (nav links and such).
    let paragraphs: Vec<&str> = out
        .split("\n\n")
        .map(str::trim)
        .filter(|p| p.split_whitespace().count() >= 2)
        .collect();
    paragraphs.join("\n\n").trim().to_string()
}

pub fn extract_title(payload: &str) -> Option<String> {
    static RE_TITLE: OnceCell<Regex> = OnceCell::new();
    let re_title =
        RE_TITLE.get_or_init(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("title re"));
    static RE_H1: OnceCell<Regex> = OnceCell::new();
    let re_h1 = RE_H1.get_or_init(|| Regex::new(r"(?is)<h1[^>]*>(.*?)</h1>").expect("h1 re"));

    let raw = re_title
        .captures(payload)
        .or_else(|| re_h1.captures(payload))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())?;

    let cleaned = html_escape::decode_html_entities(raw)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

/// Publication date from common markup: `<time datetime=...>`,
/// `article:published_time` meta tags (either attribute order), with
/// RFC 3339 / RFC 2822 / bare-date parsing.
pub fn extract_published_at(payload: &str) -> Option<DateTime<Utc>> {
    static RE_TIME: OnceCell<Regex> = OnceCell::new();
    let re_time = RE_TIME
        .get_or_init(|| Regex::new(r#"(?i)<time[^>]+datetime="([^"]+)""#).expect("time re"));
    static RE_META_A: OnceCell<Regex> = OnceCell::new();
    let re_meta_a = RE_META_A.get_or_init(|| {
        Regex::new(
            r#"(?i)<meta[^>]+(?:property|name)="(?:article:published_time|publish-date|date)"[^>]+content="([^"]+)""#,
        )
        .expect("meta re")
    });
    static RE_META_B: OnceCell<Regex> = OnceCell::new();
    let re_meta_b = RE_META_B.get_or_init(|| {
        Regex::new(
            r#"(?i)<meta[^>]+content="([^"]+)"[^>]+(?:property|name)="(?:article:published_time|publish-date|date)""#,
        )
        .expect("meta re")
    });

    let candidate = re_time
        .captures(payload)
        .or_else(|| re_meta_a.captures(payload))
        .or_else(|| re_meta_b.captures(payload))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())?;

    parse_date(&candidate)
}

fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return d.and_hms_opt(0, 0, 0).map(|ndt| ndt.and_utc());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::FetchStatus;
    use crate::registry::SourceRegistry;

    fn raw(source_id: &str, payload: &str) -> RawDocument {
        RawDocument {
            source_id: source_id.to_string(),
            fetched_at: Utc::now(),
            payload: payload.to_string(),
            status: FetchStatus::Ok,
        }
    }

    const PAGE: &str = concat!(
        r#"<html><head><title>Base rate held &mdash; August review</title>"#,
        r#"<meta property="article:published_time" content="2026-08-25T09:00:00+05:00"/>"#,
        r#"<script>var x = 1;</script></head>"#,
        r#"<body><h1>Ignored, title wins</h1>"#,
        r#"<p>The central bank held the base rate at 15.25% after its August policy meeting, "#,
        r#"citing inflation of 8.4% and reserves of $36.2 billion.</p>"#,
        r#"<p>Analysts expect the next move no earlier than Q4 2026, once the"#,
        r#" government finalizes its budget assumptions for the coming year.</p></body></html>"#
    );

    #[test]
    fn strips_markup_and_keeps_paragraphs() {
        let body = normalize_body(PAGE);
        assert!(!body.contains('<'));
        assert!(!body.contains("var x"));
        assert!(body.contains("15.25%"));
        assert_eq!(body.split("\n\n").count(), 3); // head text line + two paragraphs
    }

    #[test]
    fn extracts_title_and_published_date() {
        assert_eq!(
            extract_title(PAGE).unwrap(),
            "Base rate held — August review".to_string()
        );
        let dt = extract_published_at(PAGE).unwrap();
        assert_eq!(dt.to_rfc3339(), "2026-08-25T04:00:00+00:00");
    }

    fn test_registry() -> SourceRegistry {
        SourceRegistry::from_toml_str(
            r#"
            [[source]]
            id = "a"
            category = "macro"
            strategy = "static"
            url = "https://a.test/"
            priority = 1

            [[source]]
            id = "b"
            category = "macro"
            strategy = "static"
            url = "https://b.test/"
            priority = 5
            "#,
        )
        .unwrap()
    }

    #[test]
    fn near_duplicates_keep_higher_priority_source() {
        let article = "The central bank held its base rate at 15.25 percent on Monday, \
                       pointing to persistent services inflation and a weaker exchange rate. \
                       Officials signalled the stance would stay tight through the end of the year.";
        let tweaked = article.replace("Monday", "Tuesday");

        let batch = vec![
            raw("a", &format!("<p>{article}</p>")),
            raw("b", &format!("<p>{tweaked}</p>")),
        ];
        let cfg = NormalizeConfig {
            min_body_chars: 50,
            ..NormalizeConfig::default()
        };
        let docs = normalize_batch(&batch, &test_registry(), &cfg);
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].source_id, "b"); // priority 5 beats priority 1
    }

    #[test]
    fn short_extraction_is_dropped_not_an_error() {
        let batch = vec![raw("a", "<p>too short</p>")];
        let docs = normalize_batch(&batch, &test_registry(), &NormalizeConfig::default());
        assert!(docs.is_empty());
    }
}
