// src/notify.rs
//! Run-completion notifications.
//!
//! Notification is best effort: a webhook outage never affects a run's
//! outcome. Failures are logged and dropped after the retry budget.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Persisted,
    AlreadyExisted,
    NoContent,
    Failed,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Persisted => "persisted",
            RunOutcome::AlreadyExisted => "already_existed",
            RunOutcome::NoContent => "no_content",
            RunOutcome::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunEvent {
    pub run_id: String,
    pub outcome: RunOutcome,
    pub degraded: bool,
    pub sources_succeeded: usize,
    pub sources_total: usize,
    pub chunks_failed: usize,
    pub message: String,
}

#[async_trait]
pub trait RunNotifier: Send + Sync {
    async fn notify(&self, event: &RunEvent);
}

pub type DynRunNotifier = Arc<dyn RunNotifier>;

pub struct NoopNotifier;

#[async_trait]
impl RunNotifier for NoopNotifier {
    async fn notify(&self, event: &RunEvent) {
        tracing::debug!(run_id = %event.run_id, outcome = event.outcome.as_str(), "notification suppressed");
    }
}

pub struct WebhookNotifier {
    webhook: String,
    client: Client,
    timeout: Duration,
    max_retries: u8,
}

impl WebhookNotifier {
    pub fn new(webhook: String) -> Self {
        Self {
            webhook,
            client: Client::new(),
            timeout: Duration::from_secs(5),
            max_retries: 3,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    async fn post(&self, event: &RunEvent) -> Result<()> {
        let payload = WebhookPayload::for_event(event);

        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            let res = self
                .client
                .post(&self.webhook)
                .timeout(self.timeout)
                .json(&payload)
                .send()
                .await;

            match res {
                Ok(rsp) => {
                    if let Err(e) = rsp.error_for_status_ref() {
                        if attempt < self.max_retries {
                            tokio::time::sleep(Duration::from_millis(500u64 << (attempt - 1)))
                                .await;
                            continue;
                        }
                        return Err(anyhow!("run webhook HTTP error: {e}"));
                    }
                    return Ok(());
                }
                Err(e) => {
                    if attempt < self.max_retries {
                        tokio::time::sleep(Duration::from_millis(500u64 << (attempt - 1))).await;
                        continue;
                    }
                    return Err(anyhow!("run webhook request failed: {e}"));
                }
            }
        }
    }
}

#[async_trait]
impl RunNotifier for WebhookNotifier {
    async fn notify(&self, event: &RunEvent) {
        if let Err(e) = self.post(event).await {
            tracing::warn!(run_id = %event.run_id, error = %e, "run notification failed");
        }
    }
}

#[derive(Serialize)]
struct WebhookPayload {
    content: String,
    event: RunEvent,
}

impl WebhookPayload {
    fn for_event(event: &RunEvent) -> Self {
        let flag = if event.degraded { " (degraded)" } else { "" };
        Self {
            content: format!(
                "Digest {}: {}{} — sources {}/{} ok, {} chunk failures. {}",
                event.run_id,
                event.outcome.as_str(),
                flag,
                event.sources_succeeded,
                event.sources_total,
                event.chunks_failed,
                event.message
            ),
            event: event.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_summarizes_the_run() {
        let event = RunEvent {
            run_id: "digest-2026-08-26".to_string(),
            outcome: RunOutcome::Persisted,
            degraded: true,
            sources_succeeded: 4,
            sources_total: 5,
            chunks_failed: 2,
            message: "persisted with partial coverage".to_string(),
        };
        let payload = WebhookPayload::for_event(&event);
        assert!(payload.content.contains("digest-2026-08-26"));
        assert!(payload.content.contains("4/5"));
        assert!(payload.content.contains("degraded"));
    }
}
