// src/config.rs
//! Process configuration.
//!
//! One TOML file drives the whole pipeline. Resolution order:
//! 1) $DIGEST_CONFIG_PATH
//! 2) config/digest.toml
//! 3) built-in defaults
//!
//! Secrets never live in the file: the model API key comes from
//! OPENAI_API_KEY, the rendering endpoint from DIGEST_RENDER_ENDPOINT and
//! the notification webhook from DIGEST_WEBHOOK_URL.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::chunk::ChunkConfig;
use crate::fetch::FetcherConfig;
use crate::normalize::NormalizeConfig;
use crate::retry::RetryPolicy;
use crate::schedule::ScheduleConfig;

const ENV_PATH: &str = "DIGEST_CONFIG_PATH";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub bind_addr: String,
    /// Root directory for digests, the latest pointer and scraping logs.
    pub store_root: PathBuf,
    pub run_deadline_secs: u64,
    /// Below this fraction of succeeding sources a digest is marked degraded.
    pub min_success_ratio: f64,
    pub fetch: FetchSection,
    pub model: ModelSection,
    pub normalize: NormalizeSection,
    pub chunk: ChunkSection,
    pub schedule: ScheduleConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_string(),
            store_root: PathBuf::from("data"),
            run_deadline_secs: 600,
            min_success_ratio: 0.5,
            fetch: FetchSection::default(),
            model: ModelSection::default(),
            normalize: NormalizeSection::default(),
            chunk: ChunkSection::default(),
            schedule: ScheduleConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchSection {
    pub workers: usize,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for FetchSection {
    fn default() -> Self {
        Self {
            workers: 8,
            backoff_base_ms: 500,
            backoff_max_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSection {
    pub model: String,
    pub requests_per_minute: usize,
    pub max_concurrency: usize,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            requests_per_minute: 60,
            max_concurrency: 4,
            timeout_secs: 30,
            max_retries: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizeSection {
    pub min_body_chars: usize,
    pub near_dup_threshold: f64,
}

impl Default for NormalizeSection {
    fn default() -> Self {
        let d = NormalizeConfig::default();
        Self {
            min_body_chars: d.min_body_chars,
            near_dup_threshold: d.near_dup_threshold,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkSection {
    pub max_chars: usize,
    pub overlap_chars: usize,
}

impl Default for ChunkSection {
    fn default() -> Self {
        let d = ChunkConfig::default();
        Self {
            max_chars: d.max_chars,
            overlap_chars: d.overlap_chars,
        }
    }
}

impl AppConfig {
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        let mut cfg: AppConfig = toml::from_str(&content)
            .with_context(|| format!("parsing config from {}", path.display()))?;
        cfg.sanitize();
        Ok(cfg)
    }

    /// Env var path, then the conventional location, then defaults.
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_PATH) {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Self::load_from(&pb);
            }
            return Err(anyhow!("DIGEST_CONFIG_PATH points to non-existent path"));
        }
        let conventional = PathBuf::from("config/digest.toml");
        if conventional.exists() {
            return Self::load_from(&conventional);
        }
        Ok(Self::default())
    }

    fn sanitize(&mut self) {
        if !(0.0..=1.0).contains(&self.min_success_ratio) {
            self.min_success_ratio = 0.5;
        }
        if !(0.0..=1.0).contains(&self.normalize.near_dup_threshold) {
            self.normalize.near_dup_threshold = NormalizeConfig::default().near_dup_threshold;
        }
        if self.chunk.max_chars == 0 {
            self.chunk.max_chars = ChunkConfig::default().max_chars;
        }
        if self.chunk.overlap_chars >= self.chunk.max_chars {
            self.chunk.overlap_chars = self.chunk.max_chars / 4;
        }
        if self.fetch.workers == 0 {
            self.fetch.workers = 1;
        }
    }

    pub fn run_deadline(&self) -> Duration {
        Duration::from_secs(self.run_deadline_secs.max(1))
    }

    pub fn fetcher_config(&self) -> FetcherConfig {
        FetcherConfig {
            workers: self.fetch.workers,
            render_endpoint: std::env::var("DIGEST_RENDER_ENDPOINT").ok(),
            backoff_base: Duration::from_millis(self.fetch.backoff_base_ms),
            backoff_max: Duration::from_millis(self.fetch.backoff_max_ms),
        }
    }

    pub fn normalize_config(&self) -> NormalizeConfig {
        NormalizeConfig {
            min_body_chars: self.normalize.min_body_chars,
            near_dup_threshold: self.normalize.near_dup_threshold,
            ..NormalizeConfig::default()
        }
    }

    pub fn chunk_config(&self) -> ChunkConfig {
        ChunkConfig {
            max_chars: self.chunk.max_chars,
            overlap_chars: self.chunk.overlap_chars,
        }
    }

    pub fn model_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.model.max_retries,
            Duration::from_millis(500),
            Duration::from_secs(30),
        )
    }

    pub fn model_api_key(&self) -> Result<String> {
        std::env::var("OPENAI_API_KEY").map_err(|_| anyhow!("Missing OPENAI_API_KEY env var"))
    }

    pub fn webhook_url(&self) -> Option<String> {
        std::env::var("DIGEST_WEBHOOK_URL")
            .ok()
            .filter(|s| !s.trim().is_empty())
    }
}
