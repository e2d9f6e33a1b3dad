//! Daily Financial Digest — Binary Entrypoint
//! Boots the Axum HTTP server and the daily scheduler loop.

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use findigest::config::AppConfig;
use findigest::fetch::FetcherPool;
use findigest::metrics::Metrics;
use findigest::model::{DynModelClient, ModelGate, OpenAiClient};
use findigest::notify::{DynRunNotifier, NoopNotifier, RunOutcome, WebhookNotifier};
use findigest::persist::{DigestStore, FileDigestStore};
use findigest::schedule::{self, RunGuard};
use findigest::{aggregate::Aggregator, summarize::Summarizer};
use findigest::{Pipeline, SourceRegistry};

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("findigest=info,warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();

    init_tracing();

    let cfg = AppConfig::load_default()?;
    let registry = SourceRegistry::load_default()?;
    tracing::info!(sources = registry.len(), "source registry loaded");

    let metrics = Metrics::init();

    let store: Arc<dyn DigestStore> = Arc::new(FileDigestStore::new(&cfg.store_root));

    let model: DynModelClient = Arc::new(OpenAiClient::new(
        cfg.model_api_key()?,
        cfg.model.model.clone(),
        Duration::from_secs(cfg.model.timeout_secs),
    )?);
    let gate = Arc::new(ModelGate::new(
        cfg.model.requests_per_minute,
        Duration::from_secs(60),
        cfg.model.max_concurrency,
    ));
    let retry = cfg.model_retry_policy();

    let notifier: DynRunNotifier = match cfg.webhook_url() {
        Some(url) => Arc::new(WebhookNotifier::new(url)),
        None => Arc::new(NoopNotifier),
    };

    let pipeline = Arc::new(Pipeline::new(
        registry,
        FetcherPool::new(cfg.fetcher_config())?,
        Summarizer::new(Arc::clone(&model), Arc::clone(&gate), retry),
        Aggregator::new(Arc::clone(&model), Arc::clone(&gate), retry),
        Arc::clone(&store),
        notifier,
        cfg.normalize_config(),
        cfg.chunk_config(),
        cfg.min_success_ratio,
        cfg.run_deadline(),
    ));

    let guard = Arc::new(RunGuard::new());
    {
        let pipeline = Arc::clone(&pipeline);
        let guard = Arc::clone(&guard);
        let store = Arc::clone(&store);
        let schedule_cfg = cfg.schedule;
        tokio::spawn(async move {
            schedule::run_daily(schedule_cfg, guard, store, move |run_id| {
                let pipeline = Arc::clone(&pipeline);
                async move {
                    match pipeline.run(&run_id).await {
                        Ok(report) => !matches!(
                            report.outcome,
                            RunOutcome::NoContent | RunOutcome::Failed
                        ),
                        Err(e) => {
                            tracing::error!(run_id = %run_id, error = %e, "run failed");
                            false
                        }
                    }
                }
            })
            .await;
        });
    }

    let router = findigest::create_router(store, guard, cfg.schedule).merge(metrics.router());

    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    tracing::info!(addr = %cfg.bind_addr, "listening");
    axum::serve(listener, router).await?;
    Ok(())
}
