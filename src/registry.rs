// src/registry.rs
//! Static catalog of fetchable sources.
//!
//! Loaded once at startup from a TOML file (`config/sources.toml`, overridable
//! via `DIGEST_SOURCES_PATH`) and immutable afterwards. Each source declares
//! its category, fetch strategy and a per-source timeout/retry budget.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

const ENV_PATH: &str = "DIGEST_SOURCES_PATH";
const DEFAULT_PATH: &str = "config/sources.toml";

/// Digest category. The declaration order here is the canonical ordering used
/// everywhere a digest lists categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Macro,
    Fx,
    Commodities,
    Banking,
    Other,
}

impl Category {
    /// Canonical digest ordering.
    pub const ALL: [Category; 5] = [
        Category::Macro,
        Category::Fx,
        Category::Commodities,
        Category::Banking,
        Category::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Macro => "macro",
            Category::Fx => "fx",
            Category::Commodities => "commodities",
            Category::Banking => "banking",
            Category::Other => "other",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a source's content is retrieved. One handler per variant in the
/// fetcher; selection is explicit dispatch, never runtime sniffing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStrategy {
    /// Plain HTTP GET of a static page.
    Static,
    /// Script-rendered page via a headless-render endpoint.
    Rendered,
    /// Syndication feed (RSS) pull.
    Feed,
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    2
}

/// One registered source. Immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub id: String,
    pub category: Category,
    pub strategy: FetchStrategy,
    pub url: String,
    /// Per-fetch timeout; each retry attempt gets the full budget.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Additional attempts after the first failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Dedup keeps the copy from the highest-priority source.
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default, rename = "source")]
    sources: Vec<SourceDescriptor>,
}

/// Read-only source catalog. Iteration order is declaration order.
#[derive(Debug, Clone)]
pub struct SourceRegistry {
    sources: Vec<SourceDescriptor>,
}

impl SourceRegistry {
    pub fn new(sources: Vec<SourceDescriptor>) -> Result<Self> {
        let mut seen = HashSet::new();
        for s in &sources {
            if s.id.trim().is_empty() {
                return Err(anyhow!("source with empty id (url {})", s.url));
            }
            if !seen.insert(s.id.clone()) {
                return Err(anyhow!("duplicate source id: {}", s.id));
            }
        }
        Ok(Self { sources })
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let parsed: RegistryFile = toml::from_str(s).context("parsing source registry toml")?;
        Self::new(parsed.sources)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading source registry from {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// Load using env var + default path fallback:
    /// 1) $DIGEST_SOURCES_PATH
    /// 2) config/sources.toml
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_PATH) {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Self::load_from(&pb);
            }
            return Err(anyhow!("DIGEST_SOURCES_PATH points to non-existent path"));
        }
        Self::load_from(Path::new(DEFAULT_PATH))
    }

    pub fn get(&self, id: &str) -> Option<&SourceDescriptor> {
        self.sources.iter().find(|s| s.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SourceDescriptor> {
        self.sources.iter()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}
