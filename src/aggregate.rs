// src/aggregate.rs
//! Two-phase digest aggregation.
//!
//! Phase one merges the surviving chunk summaries of each category into one
//! category section; phase two merges the sections into the digest narrative.
//! Every model call is guarded by a numeric fabrication check: a merged text
//! that mentions a number absent from its contributors is discarded in favor
//! of the deterministic concatenation of the inputs, so the digest can never
//! invent a figure.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};

use crate::entity::{extract_entities, EntityKind};
use crate::model::{DynModelClient, ModelError, ModelGate, ModelRequest, PromptRole};
use crate::registry::Category;
use crate::retry::RetryPolicy;
use crate::summarize::{ChunkRef, ChunkSummary};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryDigest {
    pub category: Category,
    /// Chunk provenance, in document order.
    pub contributing: Vec<ChunkRef>,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Digest {
    pub run_id: String,
    pub generated_at: DateTime<Utc>,
    pub model_id: String,
    /// Canonical category order; empty categories are omitted.
    pub categories: Vec<CategoryDigest>,
    pub text: String,
    pub degraded: bool,
}

pub struct Aggregator {
    model: DynModelClient,
    gate: Arc<ModelGate>,
    retry: RetryPolicy,
}

impl Aggregator {
    pub fn new(model: DynModelClient, gate: Arc<ModelGate>, retry: RetryPolicy) -> Self {
        Self { model, gate, retry }
    }

    /// Builds the digest from the successful chunk summaries. Failed chunks
    /// were already excluded by the summarizer contract; callers pass the
    /// `degraded` flag describing the run as a whole.
    pub async fn aggregate(
        &self,
        run_id: &str,
        summaries: &[ChunkSummary],
        degraded: bool,
    ) -> Digest {
        let mut categories = Vec::new();

        for category in Category::ALL {
            let contributors: Vec<&ChunkSummary> = summaries
                .iter()
                .filter(|s| s.category == category && s.is_ok())
                .collect();
            if contributors.is_empty() {
                continue;
            }
            let section = self.merge_category(category, &contributors).await;
            categories.push(section);
        }

        let text = if categories.is_empty() {
            String::new()
        } else {
            self.merge_digest(&categories).await
        };

        Digest {
            run_id: run_id.to_string(),
            generated_at: Utc::now(),
            model_id: self.model.model_id().to_string(),
            categories,
            text,
            degraded,
        }
    }

    async fn merge_category(
        &self,
        category: Category,
        contributors: &[&ChunkSummary],
    ) -> CategoryDigest {
        let contributing: Vec<ChunkRef> =
            contributors.iter().map(|s| s.chunk.clone()).collect();
        let allowed: BTreeSet<&str> = contributors
            .iter()
            .flat_map(|s| s.entities.iter())
            .filter(|e| e.kind == EntityKind::Number)
            .map(|e| e.text.as_str())
            .collect();
        let fallback = concat_texts(contributors.iter().map(|s| s.text.as_str()));

        let req = ModelRequest {
            role: PromptRole::AggregateCategory,
            input: fallback.clone(),
            category: Some(category),
        };
        let text = match self.call(&req).await {
            Ok(merged) if numbers_are_grounded(&merged, &allowed) => merged,
            Ok(_) => {
                counter!("digest_fabrication_fallbacks_total").increment(1);
                tracing::warn!(
                    category = category.as_str(),
                    "merged section mentioned an ungrounded number, using concatenation"
                );
                fallback
            }
            Err(err) => {
                counter!("digest_aggregate_failures_total").increment(1);
                tracing::warn!(
                    category = category.as_str(),
                    error = %err,
                    "category merge failed, using concatenation"
                );
                fallback
            }
        };

        CategoryDigest {
            category,
            contributing,
            text,
        }
    }

    async fn merge_digest(&self, categories: &[CategoryDigest]) -> String {
        let allowed: BTreeSet<String> = categories
            .iter()
            .flat_map(|c| extract_entities(&c.text))
            .filter(|e| e.kind == EntityKind::Number)
            .map(|e| e.text)
            .collect();
        let allowed: BTreeSet<&str> = allowed.iter().map(String::as_str).collect();
        let fallback = concat_sections(categories);

        let req = ModelRequest {
            role: PromptRole::AggregateDigest,
            input: fallback.clone(),
            category: None,
        };
        match self.call(&req).await {
            Ok(merged) if numbers_are_grounded(&merged, &allowed) => merged,
            Ok(_) => {
                counter!("digest_fabrication_fallbacks_total").increment(1);
                tracing::warn!("digest narrative mentioned an ungrounded number, using sections");
                fallback
            }
            Err(err) => {
                counter!("digest_aggregate_failures_total").increment(1);
                tracing::warn!(error = %err, "digest merge failed, using sections");
                fallback
            }
        }
    }

    async fn call(&self, req: &ModelRequest) -> Result<String, ModelError> {
        let model = &self.model;
        let gate = &self.gate;
        let resp = self
            .retry
            .run(ModelError::is_transient, || async move {
                let _permit = gate.acquire().await;
                model.complete(req).await
            })
            .await?;
        Ok(resp.text)
    }
}

/// Every number entity in the merged text must appear among the contributors.
fn numbers_are_grounded(merged: &str, allowed: &BTreeSet<&str>) -> bool {
    extract_entities(merged)
        .iter()
        .filter(|e| e.kind == EntityKind::Number)
        .all(|e| allowed.contains(e.text.as_str()))
}

fn concat_texts<'a>(texts: impl Iterator<Item = &'a str>) -> String {
    texts.collect::<Vec<_>>().join("\n\n")
}

fn concat_sections(categories: &[CategoryDigest]) -> String {
    categories
        .iter()
        .map(|c| format!("## {}\n{}", c.category.as_str(), c.text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MockModel, ModelResponse};
    use crate::summarize::SummaryStatus;
    use std::time::Duration;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(2))
    }

    fn gate() -> Arc<ModelGate> {
        Arc::new(ModelGate::new(1000, Duration::from_secs(1), 8))
    }

    fn summary(doc_id: &str, seq: usize, category: Category, text: &str) -> ChunkSummary {
        ChunkSummary {
            chunk: ChunkRef {
                doc_id: doc_id.to_string(),
                seq,
            },
            category,
            text: text.to_string(),
            entities: extract_entities(text),
            status: SummaryStatus::Ok,
            has_overlap: false,
            error: None,
        }
    }

    #[tokio::test]
    async fn categories_follow_canonical_order_and_skip_empty() {
        let agg = Aggregator::new(Arc::new(MockModel::echo()), gate(), fast_retry());
        // Deliberately out of order on input.
        let summaries = vec![
            summary("s-fx", 0, Category::Fx, "The tenge moved 0.8% on thin volume."),
            summary("s-macro", 0, Category::Macro, "Inflation printed 8.4% in July."),
        ];
        let digest = agg.aggregate("digest-2026-08-26", &summaries, false).await;
        let order: Vec<Category> = digest.categories.iter().map(|c| c.category).collect();
        assert_eq!(order, vec![Category::Macro, Category::Fx]);
        assert!(digest.text.contains("## macro"));
        assert!(digest.text.find("## macro").unwrap() < digest.text.find("## fx").unwrap());
    }

    #[tokio::test]
    async fn fabricated_number_triggers_concatenation_fallback() {
        let model = MockModel::new(|req| {
            Ok(match req.role {
                PromptRole::AggregateCategory => ModelResponse {
                    text: "Reserves surged 47.5% according to nobody.".to_string(),
                    entities: Vec::new(),
                },
                _ => ModelResponse {
                    text: req.input.clone(),
                    entities: Vec::new(),
                },
            })
        });
        let agg = Aggregator::new(Arc::new(model), gate(), fast_retry());
        let summaries = vec![
            summary("s-a", 0, Category::Macro, "Reserves reached $36.2 billion."),
            summary("s-b", 0, Category::Macro, "The base rate was held at 14.75%."),
        ];
        let digest = agg.aggregate("digest-2026-08-26", &summaries, false).await;
        let section = &digest.categories[0];
        assert!(!section.text.contains("47.5%"));
        assert!(section.text.contains("$36.2 billion"));
        assert!(section.text.contains("14.75%"));
    }

    #[tokio::test]
    async fn terminal_model_failure_falls_back_to_concatenation() {
        let model = MockModel::new(|_req| {
            Err(ModelError::InvalidResponse {
                reason: "not json".to_string(),
            })
        });
        let agg = Aggregator::new(Arc::new(model), gate(), fast_retry());
        let summaries = vec![summary(
            "s-a",
            0,
            Category::Commodities,
            "Brent settled near $82.10 after the OPEC+ Meeting.",
        )];
        let digest = agg.aggregate("digest-2026-08-26", &summaries, true).await;
        assert!(digest.degraded);
        assert_eq!(digest.categories.len(), 1);
        assert!(digest.categories[0].text.contains("$82.10"));
        assert!(digest.text.contains("## commodities"));
    }

    #[tokio::test]
    async fn failed_chunks_never_contribute() {
        let agg = Aggregator::new(Arc::new(MockModel::echo()), gate(), fast_retry());
        let mut bad = summary("s-bad", 0, Category::Banking, "ignored");
        bad.status = SummaryStatus::FailedTerminal;
        bad.entities.clear();
        let summaries = vec![
            bad,
            summary("s-ok", 0, Category::Banking, "Deposit rates moved to 14.1%."),
        ];
        let digest = agg.aggregate("digest-2026-08-26", &summaries, true).await;
        assert_eq!(digest.categories.len(), 1);
        let contributing = &digest.categories[0].contributing;
        assert_eq!(contributing.len(), 1);
        assert_eq!(contributing[0].doc_id, "s-ok");
    }
}
