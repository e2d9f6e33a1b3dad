// src/fetch.rs
//! Fetcher pool: bounded-concurrency retrieval of every registered source.
//!
//! Each source is fetched by its declared strategy (static page, rendered
//! page, feed) with its own timeout and retry budget. Failures stay local to
//! the source: the pool always returns one record per source, and a run
//! proceeds with whatever succeeded. Every attempt, including retries, emits
//! a `ScrapingLogEntry` for observability.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::{format_description::well_known::Rfc2822, OffsetDateTime, UtcOffset};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::registry::{FetchStrategy, SourceDescriptor, SourceRegistry};
use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected HTTP status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("fetch timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("render endpoint error {status}: {message}")]
    Render { status: u16, message: String },

    #[error("source requires rendering but no render endpoint is configured")]
    RenderUnconfigured,

    #[error("empty body from {url}")]
    EmptyBody { url: String },

    #[error("feed parse error: {0}")]
    Feed(String),
}

impl FetchError {
    /// Transient failures are retried per the source's budget; terminal ones
    /// (client errors, empty or malformed content) are not.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Http(_) | FetchError::Timeout { .. } => true,
            FetchError::Status { status, .. } => *status == 429 || *status >= 500,
            FetchError::Render { status, .. } => *status == 429 || *status >= 500,
            FetchError::RenderUnconfigured
            | FetchError::EmptyBody { .. }
            | FetchError::Feed(_) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    Ok,
    Timeout,
    Error,
}

/// Raw per-source fetch result. Consumed by the normalizer and then dropped;
/// never persisted.
#[derive(Debug, Clone)]
pub struct RawDocument {
    pub source_id: String,
    pub fetched_at: DateTime<Utc>,
    pub payload: String,
    pub status: FetchStatus,
}

impl RawDocument {
    pub fn is_ok(&self) -> bool {
        self.status == FetchStatus::Ok
    }
}

/// One fetch attempt (retries included). Written to the persistence layer
/// independently of the digest; never blocks the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapingLogEntry {
    pub source_id: String,
    pub run_id: String,
    pub attempt: u32,
    pub success: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Everything one fetch pass produced.
#[derive(Debug)]
pub struct FetchBatch {
    /// One entry per registered source, in registry order.
    pub documents: Vec<RawDocument>,
    pub log: Vec<ScrapingLogEntry>,
    /// True if the run deadline expired while fetches were still in flight.
    pub deadline_hit: bool,
}

impl FetchBatch {
    pub fn succeeded(&self) -> usize {
        self.documents.iter().filter(|d| d.is_ok()).count()
    }

    pub fn failed_sources(&self) -> Vec<String> {
        self.documents
            .iter()
            .filter(|d| !d.is_ok())
            .map(|d| d.source_id.clone())
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub workers: usize,
    pub render_endpoint: Option<String>,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            render_endpoint: None,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(15),
        }
    }
}

pub struct FetcherPool {
    client: reqwest::Client,
    cfg: FetcherConfig,
}

impl FetcherPool {
    pub fn new(cfg: FetcherConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("findigest/0.1 (+digest pipeline)")
            .connect_timeout(Duration::from_secs(4))
            .build()?;
        Ok(Self { client, cfg })
    }

    /// Fetches every source in the registry. Worker count bounds concurrency;
    /// `deadline` cancels in-flight fetches, recording them as timeouts.
    pub async fn fetch_all(
        &self,
        registry: &SourceRegistry,
        run_id: &str,
        deadline: Instant,
    ) -> FetchBatch {
        let semaphore = Arc::new(Semaphore::new(self.cfg.workers.max(1)));
        let mut set: JoinSet<(usize, RawDocument, Vec<ScrapingLogEntry>)> = JoinSet::new();

        let sources: Vec<SourceDescriptor> = registry.iter().cloned().collect();
        for (idx, source) in sources.iter().enumerate() {
            let permit_sem = Arc::clone(&semaphore);
            let client = self.client.clone();
            let render = self.cfg.render_endpoint.clone();
            let source = source.clone();
            let run_id = run_id.to_string();
            let backoff = (self.cfg.backoff_base, self.cfg.backoff_max);
            set.spawn(async move {
                let _permit = permit_sem.acquire_owned().await.expect("semaphore closed");
                let (doc, log) =
                    fetch_source(&client, render.as_deref(), &source, &run_id, backoff).await;
                (idx, doc, log)
            });
        }

        let mut slots: Vec<Option<RawDocument>> = vec![None; sources.len()];
        let mut log = Vec::new();
        let mut deadline_hit = false;

        loop {
            tokio::select! {
                joined = set.join_next() => {
                    match joined {
                        Some(Ok((idx, doc, mut entries))) => {
                            slots[idx] = Some(doc);
                            log.append(&mut entries);
                        }
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "fetch task panicked or was cancelled");
                        }
                        None => break,
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::warn!(run_id, "run deadline expired, cancelling in-flight fetches");
                    set.abort_all();
                    deadline_hit = true;
                    break;
                }
            }
        }
        // Drain whatever finished between the deadline firing and abort.
        while let Some(joined) = set.join_next().await {
            if let Ok((idx, doc, mut entries)) = joined {
                slots[idx] = Some(doc);
                log.append(&mut entries);
            }
        }

        let now = Utc::now();
        let documents: Vec<RawDocument> = slots
            .into_iter()
            .enumerate()
            .map(|(idx, slot)| {
                slot.unwrap_or_else(|| {
                    // Cancelled by the run deadline before completing.
                    log.push(ScrapingLogEntry {
                        source_id: sources[idx].id.clone(),
                        run_id: run_id.to_string(),
                        attempt: 0,
                        success: false,
                        latency_ms: 0,
                        content_length: None,
                        error: Some("run deadline expired".to_string()),
                    });
                    RawDocument {
                        source_id: sources[idx].id.clone(),
                        fetched_at: now,
                        payload: String::new(),
                        status: FetchStatus::Timeout,
                    }
                })
            })
            .collect();

        let failed = documents.iter().filter(|d| !d.is_ok()).count();
        counter!("digest_sources_fetched_total").increment((documents.len() - failed) as u64);
        counter!("digest_sources_failed_total").increment(failed as u64);

        FetchBatch {
            documents,
            log,
            deadline_hit,
        }
    }
}

/// Fetches one source with retries, recording every attempt.
async fn fetch_source(
    client: &reqwest::Client,
    render: Option<&str>,
    source: &SourceDescriptor,
    run_id: &str,
    (backoff_base, backoff_max): (Duration, Duration),
) -> (RawDocument, Vec<ScrapingLogEntry>) {
    let policy = RetryPolicy::new(source.max_retries, backoff_base, backoff_max);
    let attempts: Mutex<Vec<ScrapingLogEntry>> = Mutex::new(Vec::new());
    let attempt_no = AtomicU32::new(0);

    let result = policy
        .run(FetchError::is_transient, || {
            let attempt = attempt_no.fetch_add(1, Ordering::SeqCst);
            let attempts = &attempts;
            async move {
                let t0 = Instant::now();
                let res = fetch_once(client, render, source).await;
                let latency_ms = t0.elapsed().as_millis() as u64;
                histogram!("digest_fetch_latency_ms").record(latency_ms as f64);
                attempts.lock().expect("attempt log mutex").push(ScrapingLogEntry {
                    source_id: source.id.clone(),
                    run_id: run_id.to_string(),
                    attempt,
                    success: res.is_ok(),
                    latency_ms,
                    content_length: res.as_ref().ok().map(String::len),
                    error: res.as_ref().err().map(ToString::to_string),
                });
                res
            }
        })
        .await;

    let fetched_at = Utc::now();
    let doc = match result {
        Ok(payload) => RawDocument {
            source_id: source.id.clone(),
            fetched_at,
            payload,
            status: FetchStatus::Ok,
        },
        Err(err) => {
            tracing::warn!(source = %source.id, error = %err, "source failed after retries");
            let status = match err {
                FetchError::Timeout { .. } => FetchStatus::Timeout,
                _ => FetchStatus::Error,
            };
            RawDocument {
                source_id: source.id.clone(),
                fetched_at,
                payload: String::new(),
                status,
            }
        }
    };

    (doc, attempts.into_inner().expect("attempt log mutex"))
}

/// One attempt, dispatched by the source's declared strategy.
async fn fetch_once(
    client: &reqwest::Client,
    render: Option<&str>,
    source: &SourceDescriptor,
) -> Result<String, FetchError> {
    let timeout = Duration::from_secs(source.timeout_secs);
    match source.strategy {
        FetchStrategy::Static => fetch_static(client, &source.url, timeout).await,
        FetchStrategy::Rendered => fetch_rendered(client, render, &source.url, timeout).await,
        FetchStrategy::Feed => {
            let xml = fetch_static(client, &source.url, timeout).await?;
            flatten_feed(&xml)
        }
    }
}

async fn fetch_static(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<String, FetchError> {
    let resp = client
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| classify_reqwest(e, timeout))?;
    let status = resp.status();
    if !status.is_success() {
        return Err(FetchError::Status {
            status: status.as_u16(),
            url: url.to_string(),
        });
    }
    let body = resp
        .text()
        .await
        .map_err(|e| classify_reqwest(e, timeout))?;
    if body.trim().is_empty() {
        return Err(FetchError::EmptyBody {
            url: url.to_string(),
        });
    }
    Ok(body)
}

/// POSTs `{ "url": ... }` to the configured headless-render endpoint and
/// returns the rendered HTML.
async fn fetch_rendered(
    client: &reqwest::Client,
    render: Option<&str>,
    url: &str,
    timeout: Duration,
) -> Result<String, FetchError> {
    let endpoint = render.ok_or(FetchError::RenderUnconfigured)?;
    let body = serde_json::json!({ "url": url });
    let resp = client
        .post(endpoint)
        .timeout(timeout)
        .json(&body)
        .send()
        .await
        .map_err(|e| classify_reqwest(e, timeout))?;
    let status = resp.status();
    if !status.is_success() {
        let message = resp.text().await.unwrap_or_default();
        return Err(FetchError::Render {
            status: status.as_u16(),
            message,
        });
    }
    let html = resp
        .text()
        .await
        .map_err(|e| classify_reqwest(e, timeout))?;
    if html.trim().is_empty() {
        return Err(FetchError::EmptyBody {
            url: url.to_string(),
        });
    }
    Ok(html)
}

fn classify_reqwest(e: reqwest::Error, timeout: Duration) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout {
            secs: timeout.as_secs(),
        }
    } else {
        FetchError::Http(e)
    }
}

// --- Feed flattening -------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}
#[derive(Debug, Deserialize)]
struct Channel {
    title: Option<String>,
    #[serde(default, rename = "item")]
    item: Vec<Item>,
}
#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
}

fn parse_rfc2822_to_unix(ts: &str) -> Option<i64> {
    OffsetDateTime::parse(ts, &Rfc2822)
        .ok()
        .map(|dt| dt.to_offset(UtcOffset::UTC).unix_timestamp())
}

/// Turns a feed into a synthetic HTML document so the normalizer sees the
/// same shape as page sources: a `<title>`, a `<time>` stamp from the newest
/// item, and one paragraph per item.
pub fn flatten_feed(xml: &str) -> Result<String, FetchError> {
    let cleaned = scrub_html_entities_for_xml(xml);
    let rss: Rss =
        quick_xml::de::from_str(&cleaned).map_err(|e| FetchError::Feed(e.to_string()))?;

    if rss.channel.item.is_empty() {
        return Err(FetchError::Feed("feed has no items".to_string()));
    }

    let newest = rss
        .channel
        .item
        .iter()
        .filter_map(|it| it.pub_date.as_deref().and_then(parse_rfc2822_to_unix))
        .max();

    let mut out = String::new();
    if let Some(title) = &rss.channel.title {
        out.push_str(&format!("<title>{title}</title>\n"));
    }
    if let Some(ts) = newest.and_then(|secs| DateTime::from_timestamp(secs, 0)) {
        out.push_str(&format!("<time datetime=\"{}\"></time>\n", ts.to_rfc3339()));
    }
    for it in &rss.channel.item {
        let title = it.title.as_deref().unwrap_or_default();
        let desc = it.description.as_deref().unwrap_or_default();
        if title.is_empty() && desc.is_empty() {
            continue;
        }
        out.push_str(&format!("<p>{title}. {desc}</p>\n"));
    }
    Ok(out)
}

fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
}
