// tests/api_http.rs
//
// HTTP-level tests for the public API Router without opening sockets.
// We exercise the router directly via tower::ServiceExt::oneshot.
//
// Covered:
// - GET /health
// - GET /digest/latest (404 before any run, 200 after)
// - GET /digest/{run_id}
// - GET /scheduler/status

use std::sync::Arc;

use axum::{
    body::{self, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::Value as Json;
use tower::ServiceExt as _; // for `oneshot`

use chrono::Utc;
use findigest::aggregate::{CategoryDigest, Digest};
use findigest::persist::{DigestStore, FileDigestStore};
use findigest::schedule::{RunGuard, ScheduleConfig};
use findigest::summarize::ChunkRef;
use findigest::Category;

const BODY_LIMIT: usize = 1024 * 1024;

fn sample_digest(run_id: &str) -> Digest {
    Digest {
        run_id: run_id.to_string(),
        generated_at: Utc::now(),
        model_id: "mock".to_string(),
        categories: vec![CategoryDigest {
            category: Category::Macro,
            contributing: vec![ChunkRef {
                doc_id: "src-a".to_string(),
                seq: 0,
            }],
            text: "Inflation printed 8.4% in July.".to_string(),
        }],
        text: "## macro\nInflation printed 8.4% in July.".to_string(),
        degraded: false,
    }
}

fn test_router(store: Arc<dyn DigestStore>) -> Router {
    findigest::create_router(store, Arc::new(RunGuard::new()), ScheduleConfig::default())
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, Option<Json>) {
    let req = Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .expect("build request");
    let resp = app.oneshot(req).await.expect("oneshot");
    let status = resp.status();
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT)
        .await
        .expect("read body");
    let json = serde_json::from_slice(&bytes).ok();
    (status, json)
}

#[tokio::test]
async fn health_returns_200_and_ok_body() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_router(Arc::new(FileDigestStore::new(dir.path())));

    let req = Request::builder()
        .method("GET")
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT).await.unwrap();
    assert_eq!(String::from_utf8(bytes.to_vec()).unwrap().trim(), "ok");
}

#[tokio::test]
async fn latest_digest_is_404_until_a_run_commits() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn DigestStore> = Arc::new(FileDigestStore::new(dir.path()));

    let (status, _) = get_json(test_router(Arc::clone(&store)), "/digest/latest").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    store
        .write_digest(&sample_digest("digest-2026-08-26"))
        .await
        .unwrap();

    let (status, json) = get_json(test_router(store), "/digest/latest").await;
    assert_eq!(status, StatusCode::OK);
    let json = json.unwrap();
    assert_eq!(json["run_id"], "digest-2026-08-26");
    assert_eq!(json["categories"][0]["category"], "macro");
}

#[tokio::test]
async fn digest_by_run_id_resolves_or_404s() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn DigestStore> = Arc::new(FileDigestStore::new(dir.path()));
    store
        .write_digest(&sample_digest("digest-2026-08-25"))
        .await
        .unwrap();

    let (status, json) = get_json(
        test_router(Arc::clone(&store)),
        "/digest/digest-2026-08-25",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json.unwrap()["run_id"], "digest-2026-08-25");

    let (status, _) = get_json(test_router(store), "/digest/digest-1999-01-01").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn scheduler_status_reports_state_and_next_trigger() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_router(Arc::new(FileDigestStore::new(dir.path())));

    let (status, json) = get_json(app, "/scheduler/status").await;
    assert_eq!(status, StatusCode::OK);
    let json = json.unwrap();
    assert_eq!(json["state"], "idle");
    assert!(json["next_trigger"].is_string());
    assert!(json["next_run_id"].as_str().unwrap().starts_with("digest-"));
}
