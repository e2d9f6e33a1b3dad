// src/model.rs
//! Language-model service client: prompt roles, structured-output validation,
//! transient/terminal error taxonomy, and the shared rate-limit gate.
//!
//! Every call the pipeline makes goes through `ModelGate` (token-bucket rate
//! limiter + concurrency cap, shared process-wide by handle) and classifies
//! its failures so the caller's retry policy can act correctly. A response is
//! only trusted after its structured JSON validates; anything else is a
//! terminal failure for that unit of work, not a crash.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::registry::Category;

/// Which stage of the pipeline is asking; selects the system prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptRole {
    SummarizeChunk,
    AggregateCategory,
    AggregateDigest,
}

#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub role: PromptRole,
    pub input: String,
    pub category: Option<Category>,
}

/// Validated structured output of a model call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub text: String,
    /// Entities the model claims to have preserved; the summarizer verifies
    /// them against the source chunk rather than trusting them blindly.
    #[serde(default)]
    pub entities: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("model service returned status {status}")]
    Status { status: u16 },

    #[error("model call timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("model service rate limited the request")]
    RateLimited,

    #[error("model response failed schema validation: {reason}")]
    InvalidResponse { reason: String },

    #[error("model rejected the content: {reason}")]
    PolicyRejection { reason: String },

    #[error("model client is disabled")]
    Disabled,
}

impl ModelError {
    /// Transient failures are retried with backoff; terminal ones fail the
    /// chunk or category they belong to and nothing else.
    pub fn is_transient(&self) -> bool {
        match self {
            ModelError::Http(_) | ModelError::Timeout { .. } | ModelError::RateLimited => true,
            ModelError::Status { status } => *status >= 500,
            ModelError::InvalidResponse { .. }
            | ModelError::PolicyRejection { .. }
            | ModelError::Disabled => false,
        }
    }
}

/// The external reasoning service, behind a seam so tests can script it.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, req: &ModelRequest) -> Result<ModelResponse, ModelError>;
    fn model_id(&self) -> &str;
}

pub type DynModelClient = Arc<dyn ModelClient>;

// ---------------------------------------------------------------------------
// Shared gate: token-bucket rate limiter + concurrency cap
// ---------------------------------------------------------------------------

/// Sliding-window rate limiter: at most `capacity` acquisitions per `window`.
pub struct RateLimiter {
    capacity: usize,
    window: Duration,
    recent: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            window,
            recent: Mutex::new(VecDeque::new()),
        }
    }

    /// Waits until a slot inside the window is free, then claims it.
    pub async fn acquire(&self) {
        loop {
            let wait_until = {
                let mut recent = self.recent.lock().await;
                let now = Instant::now();
                while let Some(front) = recent.front() {
                    if now.duration_since(*front) >= self.window {
                        recent.pop_front();
                    } else {
                        break;
                    }
                }
                if recent.len() < self.capacity {
                    recent.push_back(now);
                    return;
                }
                *recent.front().expect("non-empty at capacity") + self.window
            };
            tokio::time::sleep_until(wait_until).await;
        }
    }
}

/// Process-wide gate for model calls, passed around by explicit handle.
pub struct ModelGate {
    limiter: RateLimiter,
    permits: Arc<Semaphore>,
}

impl ModelGate {
    pub fn new(requests_per_window: usize, window: Duration, max_concurrency: usize) -> Self {
        Self {
            limiter: RateLimiter::new(requests_per_window, window),
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
        }
    }

    /// Blocks until both a concurrency permit and a rate slot are available.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .expect("model gate semaphore closed");
        self.limiter.acquire().await;
        permit
    }
}

// ---------------------------------------------------------------------------
// OpenAI-compatible client
// ---------------------------------------------------------------------------

pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    endpoint: String,
    timeout: Duration,
}

impl OpenAiClient {
    pub fn new(api_key: String, model: String, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent("findigest/0.1 (+digest pipeline)")
            .connect_timeout(Duration::from_secs(4))
            .build()?;
        Ok(Self {
            http,
            api_key,
            model,
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            timeout,
        })
    }

    fn system_prompt(role: PromptRole, category: Option<Category>) -> String {
        let cat = category.map(|c| c.as_str()).unwrap_or("general");
        match role {
            PromptRole::SummarizeChunk => format!(
                "You condense financial news fragments (category: {cat}). Reply with JSON \
                 {{\"text\": ..., \"entities\": [...]}}. Keep every numeric value, date and \
                 named event from the input verbatim in the summary and list them in entities."
            ),
            PromptRole::AggregateCategory => format!(
                "You merge ordered chunk summaries into one {cat} market narrative. The input \
                 may repeat entities where chunks overlapped; state each fact once. Never \
                 introduce a number that is not present in the input. Reply with JSON \
                 {{\"text\": ..., \"entities\": [...]}}."
            ),
            PromptRole::AggregateDigest => "You merge per-category narratives into one daily \
                 financial digest, keeping the section order given. Reply with JSON \
                 {\"text\": ..., \"entities\": []}."
                .to_string(),
        }
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}
#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}
#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

/// Parses and validates the structured body a provider returned. Exposed for
/// tests; the schema check is the trust boundary for extracted entities.
pub fn validate_structured(content: &str) -> Result<ModelResponse, ModelError> {
    let trimmed = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let parsed: ModelResponse =
        serde_json::from_str(trimmed).map_err(|e| ModelError::InvalidResponse {
            reason: e.to_string(),
        })?;
    if parsed.text.trim().is_empty() {
        return Err(ModelError::InvalidResponse {
            reason: "empty text field".to_string(),
        });
    }
    Ok(parsed)
}

#[async_trait]
impl ModelClient for OpenAiClient {
    async fn complete(&self, req: &ModelRequest) -> Result<ModelResponse, ModelError> {
        if self.api_key.is_empty() {
            return Err(ModelError::Disabled);
        }

        let system = Self::system_prompt(req.role, req.category);
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &system,
                },
                ChatMessage {
                    role: "user",
                    content: &req.input,
                },
            ],
            temperature: 0.2,
        };

        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ModelError::Timeout {
                        secs: self.timeout.as_secs(),
                    }
                } else {
                    ModelError::Http(e)
                }
            })?;

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(ModelError::RateLimited);
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            if text.contains("content_policy") || text.contains("content_filter") {
                return Err(ModelError::PolicyRejection { reason: text });
            }
            return Err(ModelError::Status {
                status: status.as_u16(),
            });
        }

        let parsed: ChatResponse = resp.json().await.map_err(ModelError::Http)?;
        let content = parsed
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| ModelError::InvalidResponse {
                reason: "no choices in response".to_string(),
            })?;
        validate_structured(content)
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

// ---------------------------------------------------------------------------
// Scripted client for tests
// ---------------------------------------------------------------------------

type Responder = dyn Fn(&ModelRequest) -> Result<ModelResponse, ModelError> + Send + Sync;

/// Deterministic in-process model for tests: responses come from a closure,
/// calls are counted.
pub struct MockModel {
    responder: Box<Responder>,
    calls: std::sync::atomic::AtomicU32,
}

impl MockModel {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&ModelRequest) -> Result<ModelResponse, ModelError> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            calls: std::sync::atomic::AtomicU32::new(0),
        }
    }

    /// Echoes the input back as the "summary".
    pub fn echo() -> Self {
        Self::new(|req| {
            Ok(ModelResponse {
                text: req.input.clone(),
                entities: Vec::new(),
            })
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelClient for MockModel {
    async fn complete(&self, req: &ModelRequest) -> Result<ModelResponse, ModelError> {
        self.calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        (self.responder)(req)
    }

    fn model_id(&self) -> &str {
        "mock"
    }
}
