// src/pipeline.rs
//! Run orchestration: fetch, normalize, chunk, summarize, aggregate, persist.
//!
//! A run degrades instead of aborting. Source failures below the success
//! threshold, terminal chunk failures, and a deadline cutting the run short
//! all mark the digest degraded; only a completely empty harvest or a storage
//! error ends a run without a digest.

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge, histogram};

use crate::aggregate::Aggregator;
use crate::chunk::{split_document, Chunk, ChunkConfig};
use crate::fetch::FetcherPool;
use crate::normalize::{normalize_batch, NormalizeConfig, NormalizedDocument};
use crate::notify::{DynRunNotifier, RunEvent, RunOutcome};
use crate::persist::{DigestStore, WriteOutcome};
use crate::registry::SourceRegistry;
use crate::summarize::Summarizer;

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub outcome: RunOutcome,
    pub sources_total: usize,
    pub sources_succeeded: usize,
    pub documents_kept: usize,
    pub chunks_total: usize,
    pub chunks_failed: usize,
    pub degraded: bool,
    pub deadline_hit: bool,
}

pub struct Pipeline {
    registry: SourceRegistry,
    fetcher: FetcherPool,
    summarizer: Summarizer,
    aggregator: Aggregator,
    store: Arc<dyn DigestStore>,
    notifier: DynRunNotifier,
    normalize_cfg: NormalizeConfig,
    chunk_cfg: ChunkConfig,
    /// Below this fraction of succeeding sources the digest is degraded.
    min_success_ratio: f64,
    run_deadline: Duration,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: SourceRegistry,
        fetcher: FetcherPool,
        summarizer: Summarizer,
        aggregator: Aggregator,
        store: Arc<dyn DigestStore>,
        notifier: DynRunNotifier,
        normalize_cfg: NormalizeConfig,
        chunk_cfg: ChunkConfig,
        min_success_ratio: f64,
        run_deadline: Duration,
    ) -> Self {
        Self {
            registry,
            fetcher,
            summarizer,
            aggregator,
            store,
            notifier,
            normalize_cfg,
            chunk_cfg,
            min_success_ratio,
            run_deadline,
        }
    }

    /// Executes one digest run end to end. Re-running an already persisted
    /// run id returns early without fetching anything.
    pub async fn run(&self, run_id: &str) -> anyhow::Result<RunReport> {
        let started = std::time::Instant::now();

        let existing = match self.store.read_digest(run_id).await {
            Ok(d) => d,
            Err(e) => {
                tracing::error!(run_id, error = %e, "store unavailable before run start");
                let report = RunReport {
                    run_id: run_id.to_string(),
                    outcome: RunOutcome::Failed,
                    sources_total: self.registry.len(),
                    sources_succeeded: 0,
                    documents_kept: 0,
                    chunks_total: 0,
                    chunks_failed: 0,
                    degraded: true,
                    deadline_hit: false,
                };
                self.record(&report, started);
                self.notify(&report, "digest store is unavailable").await;
                return Err(e.into());
            }
        };
        if existing.is_some() {
            tracing::info!(run_id, "digest already exists, skipping run");
            let report = RunReport {
                run_id: run_id.to_string(),
                outcome: RunOutcome::AlreadyExisted,
                sources_total: self.registry.len(),
                sources_succeeded: 0,
                documents_kept: 0,
                chunks_total: 0,
                chunks_failed: 0,
                degraded: false,
                deadline_hit: false,
            };
            self.record(&report, started);
            return Ok(report);
        }

        let deadline = tokio::time::Instant::now() + self.run_deadline;

        let batch = self.fetcher.fetch_all(&self.registry, run_id, deadline).await;
        let sources_total = batch.documents.len();
        let sources_succeeded = batch.succeeded();
        if !batch.failed_sources().is_empty() {
            tracing::warn!(
                run_id,
                failed = ?batch.failed_sources(),
                "some sources did not yield content"
            );
        }

        // The log survives even when the run produces no digest, and a lost
        // log never costs the digest.
        if let Err(e) = self.store.write_scraping_log(run_id, &batch.log).await {
            tracing::warn!(run_id, error = %e, "failed to write scraping log");
        }

        let docs = normalize_batch(&batch.documents, &self.registry, &self.normalize_cfg);
        let documents_kept = docs.len();

        if docs.is_empty() {
            tracing::error!(run_id, "no usable documents, recording run without digest");
            let report = RunReport {
                run_id: run_id.to_string(),
                outcome: RunOutcome::NoContent,
                sources_total,
                sources_succeeded,
                documents_kept: 0,
                chunks_total: 0,
                chunks_failed: 0,
                degraded: true,
                deadline_hit: batch.deadline_hit,
            };
            self.record(&report, started);
            self.notify(&report, "every source failed or produced nothing usable")
                .await;
            return Ok(report);
        }

        let chunked: Vec<(NormalizedDocument, Vec<Chunk>)> = docs
            .into_iter()
            .map(|d| {
                let chunks = split_document(&d, &self.chunk_cfg);
                (d, chunks)
            })
            .collect();
        let chunks_total: usize = chunked.iter().map(|(_, c)| c.len()).sum();

        let (summaries, summarize_deadline_hit) =
            self.summarizer.summarize_all(&chunked, deadline).await;
        let chunks_failed = summaries.iter().filter(|s| !s.is_ok()).count();

        let deadline_hit = batch.deadline_hit || summarize_deadline_hit;
        let success_ratio = sources_succeeded as f64 / sources_total.max(1) as f64;
        let degraded = deadline_hit || chunks_failed > 0 || success_ratio < self.min_success_ratio;

        if summaries.iter().all(|s| !s.is_ok()) {
            tracing::error!(run_id, "every chunk failed, recording run without digest");
            let report = RunReport {
                run_id: run_id.to_string(),
                outcome: RunOutcome::NoContent,
                sources_total,
                sources_succeeded,
                documents_kept,
                chunks_total,
                chunks_failed,
                degraded: true,
                deadline_hit,
            };
            self.record(&report, started);
            self.notify(&report, "summarization produced no usable output")
                .await;
            return Ok(report);
        }

        let digest = self.aggregator.aggregate(run_id, &summaries, degraded).await;

        let outcome = match self.store.write_digest(&digest).await {
            Ok(WriteOutcome::Written) => RunOutcome::Persisted,
            Ok(WriteOutcome::AlreadyExists) => RunOutcome::AlreadyExisted,
            Err(e) => {
                tracing::error!(run_id, error = %e, "failed to persist digest");
                let report = RunReport {
                    run_id: run_id.to_string(),
                    outcome: RunOutcome::Failed,
                    sources_total,
                    sources_succeeded,
                    documents_kept,
                    chunks_total,
                    chunks_failed,
                    degraded: true,
                    deadline_hit,
                };
                self.record(&report, started);
                self.notify(&report, "digest could not be persisted").await;
                return Err(e.into());
            }
        };

        let report = RunReport {
            run_id: run_id.to_string(),
            outcome,
            sources_total,
            sources_succeeded,
            documents_kept,
            chunks_total,
            chunks_failed,
            degraded,
            deadline_hit,
        };
        self.record(&report, started);

        let message = if degraded {
            "persisted with partial coverage".to_string()
        } else {
            "persisted with full coverage".to_string()
        };
        self.notify(&report, &message).await;

        tracing::info!(
            run_id,
            outcome = report.outcome.as_str(),
            sources = %format!("{sources_succeeded}/{sources_total}"),
            chunks_failed,
            degraded,
            "run finished"
        );
        Ok(report)
    }

    fn record(&self, report: &RunReport, started: std::time::Instant) {
        counter!("digest_runs_total", "outcome" => report.outcome.as_str()).increment(1);
        if report.degraded {
            counter!("digest_runs_degraded_total").increment(1);
        }
        histogram!("digest_run_duration_ms").record(started.elapsed().as_millis() as f64);
        gauge!("digest_last_run_unix").set(chrono::Utc::now().timestamp() as f64);
    }

    async fn notify(&self, report: &RunReport, message: &str) {
        let event = RunEvent {
            run_id: report.run_id.clone(),
            outcome: report.outcome,
            degraded: report.degraded,
            sources_succeeded: report.sources_succeeded,
            sources_total: report.sources_total,
            chunks_failed: report.chunks_failed,
            message: message.to_string(),
        };
        self.notifier.notify(&event).await;
    }
}
