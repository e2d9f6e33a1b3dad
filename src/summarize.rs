// src/summarize.rs
//! Chunk -> ChunkSummary via the model service.
//!
//! All calls share the process-wide gate (rate limit + concurrency cap) and a
//! retry policy for transient failures; a terminal failure is contained to
//! its chunk. The summarizer enforces the preservation contract structurally:
//! any numeric value, date, or named event extracted from the chunk that the
//! model dropped is appended verbatim to the summary.

use std::collections::BTreeSet;
use std::sync::Arc;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::chunk::Chunk;
use crate::entity::{extract_entities, Entity};
use crate::model::{DynModelClient, ModelGate, ModelRequest, PromptRole};
use crate::normalize::NormalizedDocument;
use crate::registry::Category;
use crate::retry::RetryPolicy;

/// Stable reference to a chunk, used for provenance ordering.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ChunkRef {
    pub doc_id: String,
    pub seq: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryStatus {
    Ok,
    FailedTerminal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkSummary {
    pub chunk: ChunkRef,
    pub category: Category,
    pub text: String,
    pub entities: BTreeSet<Entity>,
    pub status: SummaryStatus,
    /// Mirrors the chunk's overlap flag so aggregation can discount
    /// entities duplicated across the shared region.
    pub has_overlap: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChunkSummary {
    pub fn is_ok(&self) -> bool {
        self.status == SummaryStatus::Ok
    }

    fn failed(chunk: ChunkRef, category: Category, has_overlap: bool, error: String) -> Self {
        // Invariant: a terminal failure carries no entities.
        Self {
            chunk,
            category,
            text: String::new(),
            entities: BTreeSet::new(),
            status: SummaryStatus::FailedTerminal,
            has_overlap,
            error: Some(error),
        }
    }
}

pub struct Summarizer {
    model: DynModelClient,
    gate: Arc<ModelGate>,
    retry: RetryPolicy,
}

impl Summarizer {
    pub fn new(model: DynModelClient, gate: Arc<ModelGate>, retry: RetryPolicy) -> Self {
        Self { model, gate, retry }
    }

    /// Summarizes every chunk of every document concurrently under the shared
    /// gate. Chunk order within each document is preserved in the output;
    /// documents appear in input order. Returns the summaries plus whether
    /// the deadline cut the stage short.
    pub async fn summarize_all(
        &self,
        docs: &[(NormalizedDocument, Vec<Chunk>)],
        deadline: Instant,
    ) -> (Vec<ChunkSummary>, bool) {
        let mut set: JoinSet<(usize, usize, ChunkSummary)> = JoinSet::new();

        for (doc_idx, (doc, chunks)) in docs.iter().enumerate() {
            for chunk in chunks {
                let model = Arc::clone(&self.model);
                let gate = Arc::clone(&self.gate);
                let retry = self.retry;
                let category = doc.category;
                let chunk = chunk.clone();
                set.spawn(async move {
                    let summary = summarize_chunk(model, gate, retry, category, &chunk).await;
                    (doc_idx, chunk.seq, summary)
                });
            }
        }

        let mut slots: Vec<Vec<Option<ChunkSummary>>> =
            docs.iter().map(|(_, chunks)| vec![None; chunks.len()]).collect();
        let mut deadline_hit = false;

        loop {
            tokio::select! {
                joined = set.join_next() => {
                    match joined {
                        Some(Ok((doc_idx, seq, summary))) => slots[doc_idx][seq] = Some(summary),
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "summarize task panicked or was cancelled");
                        }
                        None => break,
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::warn!("run deadline expired, cancelling in-flight summarizations");
                    set.abort_all();
                    deadline_hit = true;
                    break;
                }
            }
        }
        while let Some(joined) = set.join_next().await {
            if let Ok((doc_idx, seq, summary)) = joined {
                slots[doc_idx][seq] = Some(summary);
            }
        }

        let mut out = Vec::new();
        for (doc_idx, (doc, chunks)) in docs.iter().enumerate() {
            for chunk in chunks {
                let summary = slots[doc_idx][chunk.seq].take().unwrap_or_else(|| {
                    ChunkSummary::failed(
                        ChunkRef {
                            doc_id: chunk.doc_id.clone(),
                            seq: chunk.seq,
                        },
                        doc.category,
                        chunk.has_overlap,
                        "run deadline expired".to_string(),
                    )
                });
                out.push(summary);
            }
        }

        let failed = out.iter().filter(|s| !s.is_ok()).count();
        counter!("digest_chunks_summarized_total").increment((out.len() - failed) as u64);
        counter!("digest_chunk_summary_failures_total").increment(failed as u64);

        (out, deadline_hit)
    }
}

async fn summarize_chunk(
    model: DynModelClient,
    gate: Arc<ModelGate>,
    retry: RetryPolicy,
    category: Category,
    chunk: &Chunk,
) -> ChunkSummary {
    let chunk_ref = ChunkRef {
        doc_id: chunk.doc_id.clone(),
        seq: chunk.seq,
    };
    let entities = extract_entities(&chunk.text);

    let req = ModelRequest {
        role: PromptRole::SummarizeChunk,
        input: chunk.text.clone(),
        category: Some(category),
    };

    let model = &model;
    let gate = &gate;
    let req = &req;
    let result = retry
        .run(crate::model::ModelError::is_transient, || async move {
            // Each attempt takes its own rate slot and permit.
            let _permit = gate.acquire().await;
            model.complete(req).await
        })
        .await;

    match result {
        Ok(resp) => {
            let text = repair_missing_entities(resp.text, &resp.entities, &entities);
            ChunkSummary {
                chunk: chunk_ref,
                category,
                text,
                entities,
                status: SummaryStatus::Ok,
                has_overlap: chunk.has_overlap,
                error: None,
            }
        }
        Err(err) => {
            tracing::warn!(
                doc = %chunk_ref.doc_id,
                seq = chunk_ref.seq,
                error = %err,
                "chunk summarization failed terminally"
            );
            ChunkSummary::failed(chunk_ref, category, chunk.has_overlap, err.to_string())
        }
    }
}

/// Appends any source entity the model output dropped, keeping the
/// preservation contract independent of model behavior.
fn repair_missing_entities(
    mut text: String,
    claimed: &[String],
    required: &BTreeSet<Entity>,
) -> String {
    let missing: Vec<&Entity> = required
        .iter()
        .filter(|e| !text.contains(&e.text) && !claimed.iter().any(|c| c.contains(&e.text)))
        .collect();
    if !missing.is_empty() {
        let appended: Vec<&str> = missing.iter().map(|e| e.text.as_str()).collect();
        text.push_str("\nKey figures: ");
        text.push_str(&appended.join("; "));
    }
    text
}
