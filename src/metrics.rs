use std::sync::Once;

use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub struct Metrics {
    pub handle: PrometheusHandle,
}

static DESCRIBE: Once = Once::new();

/// Registers metric descriptions once per process. Safe to call from tests
/// where no recorder is installed.
pub fn ensure_metrics_described() {
    DESCRIBE.call_once(|| {
        describe_counter!(
            "digest_sources_fetched_total",
            "Sources fetched successfully"
        );
        describe_counter!(
            "digest_sources_failed_total",
            "Sources that failed all retries"
        );
        describe_counter!(
            "digest_documents_kept_total",
            "Documents surviving normalization"
        );
        describe_counter!(
            "digest_documents_dropped_total",
            "Documents dropped as too short or empty"
        );
        describe_counter!(
            "digest_documents_deduped_total",
            "Documents dropped as duplicates"
        );
        describe_counter!(
            "digest_chunks_summarized_total",
            "Chunks summarized successfully"
        );
        describe_counter!(
            "digest_chunk_summary_failures_total",
            "Chunks that failed summarization terminally"
        );
        describe_counter!(
            "digest_fabrication_fallbacks_total",
            "Merges replaced by concatenation after the numeric grounding check"
        );
        describe_counter!(
            "digest_aggregate_failures_total",
            "Merge calls that failed terminally"
        );
        describe_counter!("digest_runs_total", "Completed runs by outcome");
        describe_counter!(
            "digest_runs_degraded_total",
            "Runs that produced a degraded digest"
        );
        describe_histogram!("digest_fetch_latency_ms", "Per-source fetch latency");
        describe_histogram!("digest_run_duration_ms", "End-to-end run duration");
        describe_gauge!(
            "digest_last_run_unix",
            "Unix timestamp of the most recent completed run"
        );
    });
}

impl Metrics {
    /// Initialize the Prometheus recorder.
    pub fn init() -> Self {
        // Use default buckets to avoid API differences across crate versions.
        let builder = PrometheusBuilder::new();

        let handle = builder
            .install_recorder()
            .expect("prometheus: install recorder");

        ensure_metrics_described();

        Self { handle }
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}
