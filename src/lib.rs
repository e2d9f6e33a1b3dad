// src/lib.rs
// Public library surface for integration tests (and potential reuse).

pub mod aggregate;
pub mod api;
pub mod chunk;
pub mod config;
pub mod entity;
pub mod fetch;
pub mod metrics;
pub mod model;
pub mod normalize;
pub mod notify;
pub mod persist;
pub mod pipeline;
pub mod registry;
pub mod retry;
pub mod schedule;
pub mod summarize;

// ---- Re-exports for stable public API ----
pub use crate::aggregate::{CategoryDigest, Digest};
pub use crate::api::create_router;
pub use crate::pipeline::{Pipeline, RunReport};
pub use crate::registry::{Category, SourceRegistry};
