// src/persist.rs
//! Idempotent digest persistence.
//!
//! One JSON file per run under `digests/`, a `latest.json` pointer that moves
//! only forward and only after the digest file is committed, and one scraping
//! log per run
//! under `logs/`. All writes go through a temp file plus rename on the same
//! filesystem, so a reader never observes a partial digest. Writing an
//! already persisted run is a no-op that reports `AlreadyExists`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::aggregate::Digest;
use crate::fetch::ScrapingLogEntry;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    AlreadyExists,
}

#[async_trait]
pub trait DigestStore: Send + Sync {
    /// Persists the digest under its run id, or reports that a digest for
    /// this run already exists without modifying anything.
    async fn write_digest(&self, digest: &Digest) -> Result<WriteOutcome, StoreError>;

    async fn read_digest(&self, run_id: &str) -> Result<Option<Digest>, StoreError>;

    /// The digest most recently committed, if any.
    async fn latest(&self) -> Result<Option<Digest>, StoreError>;

    /// Scraping logs are diagnostic and written unconditionally, re-runs
    /// overwrite the previous log for the same run id.
    async fn write_scraping_log(
        &self,
        run_id: &str,
        entries: &[ScrapingLogEntry],
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct LatestPointer {
    run_id: String,
}

pub struct FileDigestStore {
    root: PathBuf,
}

impl FileDigestStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn digest_path(&self, run_id: &str) -> PathBuf {
        self.root.join("digests").join(format!("{run_id}.json"))
    }

    fn log_path(&self, run_id: &str) -> PathBuf {
        self.root.join("logs").join(format!("{run_id}.json"))
    }

    fn latest_path(&self) -> PathBuf {
        self.root.join("latest.json")
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::other("path has no parent directory"))?;
    std::fs::create_dir_all(parent)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl DigestStore for FileDigestStore {
    async fn write_digest(&self, digest: &Digest) -> Result<WriteOutcome, StoreError> {
        let path = self.digest_path(&digest.run_id);
        if path.exists() {
            tracing::info!(run_id = %digest.run_id, "digest already persisted, skipping");
            return Ok(WriteOutcome::AlreadyExists);
        }
        let bytes = serde_json::to_vec_pretty(digest)?;
        write_atomic(&path, &bytes)?;
        // The pointer moves only after the digest file is in place, and only
        // forward: run ids embed the ISO date, so lexicographic order is
        // chronological and a backfilled older run must not become "latest".
        let moves_forward = match read_json::<LatestPointer>(&self.latest_path())? {
            Some(current) => current.run_id < digest.run_id,
            None => true,
        };
        if moves_forward {
            let pointer = serde_json::to_vec_pretty(&LatestPointer {
                run_id: digest.run_id.clone(),
            })?;
            write_atomic(&self.latest_path(), &pointer)?;
        }
        tracing::info!(run_id = %digest.run_id, "digest persisted");
        Ok(WriteOutcome::Written)
    }

    async fn read_digest(&self, run_id: &str) -> Result<Option<Digest>, StoreError> {
        read_json(&self.digest_path(run_id))
    }

    async fn latest(&self) -> Result<Option<Digest>, StoreError> {
        let Some(pointer) = read_json::<LatestPointer>(&self.latest_path())? else {
            return Ok(None);
        };
        self.read_digest(&pointer.run_id).await
    }

    async fn write_scraping_log(
        &self,
        run_id: &str,
        entries: &[ScrapingLogEntry],
    ) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(entries)?;
        write_atomic(&self.log_path(run_id), &bytes)?;
        Ok(())
    }
}
