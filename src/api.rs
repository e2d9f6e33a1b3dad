use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use tower_http::cors::CorsLayer;

use crate::aggregate::Digest;
use crate::persist::DigestStore;
use crate::schedule::{run_id_for, RunGuard, RunState, ScheduleConfig};

#[derive(Clone)]
pub struct AppState {
    store: Arc<dyn DigestStore>,
    guard: Arc<RunGuard>,
    schedule: ScheduleConfig,
}

pub fn create_router(
    store: Arc<dyn DigestStore>,
    guard: Arc<RunGuard>,
    schedule: ScheduleConfig,
) -> Router {
    let state = AppState {
        store,
        guard,
        schedule,
    };

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/digest/latest", get(latest_digest))
        .route("/digest/{run_id}", get(digest_by_run_id))
        .route("/scheduler/status", get(scheduler_status))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

async fn latest_digest(State(state): State<AppState>) -> Result<Json<Digest>, StatusCode> {
    match state.store.latest().await {
        Ok(Some(digest)) => Ok(Json(digest)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!(error = %e, "failed to read latest digest");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn digest_by_run_id(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Digest>, StatusCode> {
    match state.store.read_digest(&run_id).await {
        Ok(Some(digest)) => Ok(Json(digest)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!(run_id, error = %e, "failed to read digest");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[derive(serde::Serialize)]
struct SchedulerStatus {
    state: RunState,
    next_trigger: DateTime<Utc>,
    next_run_id: String,
}

async fn scheduler_status(State(state): State<AppState>) -> Json<SchedulerStatus> {
    let now = Utc::now();
    let next_trigger = state.schedule.next_trigger(now);
    Json(SchedulerStatus {
        state: state.guard.state(),
        next_trigger,
        next_run_id: run_id_for(state.schedule.local_date(next_trigger)),
    })
}
