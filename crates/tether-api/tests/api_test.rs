//! HTTP API tests.
//!
//! Drive the full router (middleware included) with `tower::ServiceExt::oneshot`
//! over an in-memory store. Jobs are run inline with `DetectionWorker::run_next`
//! so every assertion sees a settled state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use futures::StreamExt;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use tether_api::{router, AppState};
use tether_core::{
    ChunkContent, ConnectionDetector, ConnectionKind, ConnectionTarget, DetectedConnection,
    Error, EventBus, NewChunk, Repositories, Result,
};
use tether_db::MemoryStore;
use tether_jobs::{DetectionService, DetectionWorker, WorkerBuilder};

/// Fails on odd sequence numbers, links even ones to an external topic.
struct EvenOnlyDetector;

#[async_trait]
impl ConnectionDetector for EvenOnlyDetector {
    fn name(&self) -> &str {
        "even-only"
    }

    async fn detect(&self, chunk: &ChunkContent) -> Result<Vec<DetectedConnection>> {
        if chunk.sequence_number % 2 == 1 {
            return Err(Error::Detector("odd chunk".to_string()));
        }
        Ok(vec![DetectedConnection {
            target: ConnectionTarget::External(format!("topic:{}", chunk.sequence_number)),
            kind: ConnectionKind::Contradiction,
            strength: 0.4,
            metadata: None,
        }])
    }
}

struct TestApp {
    app: Router,
    repos: Repositories,
    worker: DetectionWorker,
}

impl TestApp {
    fn new() -> Self {
        let repos = MemoryStore::new().repositories();
        let service = DetectionService::new(repos.clone(), Arc::new(EventBus::new(32)));
        let worker = WorkerBuilder::new(repos.clone())
            .with_detector(EvenOnlyDetector)
            .build()
            .unwrap();
        Self {
            app: router(AppState::new(service)),
            repos,
            worker,
        }
    }

    async fn document(&self, chunks: i32) -> (Uuid, Vec<Uuid>) {
        let doc = self.repos.documents.insert("Field notes").await.unwrap();
        let ids = self
            .repos
            .chunks
            .insert_batch(
                doc,
                (0..chunks)
                    .map(|i| NewChunk {
                        sequence_number: i,
                        content: format!("Observation number {}.", i),
                    })
                    .collect(),
            )
            .await
            .unwrap();
        (doc, ids)
    }

    async fn request(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.request("GET", uri, None).await
    }

    async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.request("POST", uri, Some(body)).await
    }
}

fn job_id(body: &Value) -> Uuid {
    body["job_id"].as_str().unwrap().parse().unwrap()
}

#[tokio::test]
async fn test_health() {
    let t = TestApp::new();
    let (status, body) = t.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_request_detection_status_codes() {
    let t = TestApp::new();
    let (doc, _) = t.document(2).await;

    let (status, _) = t
        .post(&format!("/api/v1/documents/{}/detect", Uuid::new_v4()), json!({}))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = t
        .post(&format!("/api/v1/documents/{}/detect", doc), json!({}))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let first = job_id(&body);

    let (status, body) = t
        .post(&format!("/api/v1/documents/{}/detect", doc), json!({}))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["active_job_id"], first.to_string());

    let (status, body) = t.get(&format!("/api/v1/jobs/{}", first)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "pending");
    assert_eq!(body["scope"]["kind"], "full");
}

#[tokio::test]
async fn test_bodiless_detect_queues_full_user_job() {
    let t = TestApp::new();
    let (doc, _) = t.document(2).await;

    let (status, body) = t
        .request("POST", &format!("/api/v1/documents/{}/detect", doc), None)
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (_, job) = t.get(&format!("/api/v1/jobs/{}", job_id(&body))).await;
    assert_eq!(job["scope"]["kind"], "full");
    assert_eq!(job["created_by"], "user");
}

#[tokio::test]
async fn test_invalid_scope_is_bad_request() {
    let t = TestApp::new();
    let (doc, _) = t.document(1).await;
    let (status, body) = t
        .post(
            &format!("/api/v1/documents/{}/detect", doc),
            json!({ "scope": { "kind": "selective", "chunk_ids": [] } }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("at least one chunk"));
}

#[tokio::test]
async fn test_ingested_signal_honors_flag() {
    let t = TestApp::new();
    let (off, _) = t.document(1).await;
    let (on, _) = t.document(1).await;

    let (status, body) = t
        .post(
            &format!("/api/v1/documents/{}/ingested", off),
            json!({ "detect_connections": false }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["job_id"].is_null());

    let (status, body) = t
        .post(
            &format!("/api/v1/documents/{}/ingested", on),
            json!({ "detect_connections": true }),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let (_, job) = t.get(&format!("/api/v1/jobs/{}", job_id(&body))).await;
    assert_eq!(job["created_by"], "auto");
}

#[tokio::test]
async fn test_partial_detection_is_visible_and_retryable() {
    let t = TestApp::new();
    let (doc, ids) = t.document(4).await;

    let (_, body) = t
        .post(&format!("/api/v1/documents/{}/detect", doc), json!({}))
        .await;
    let first = job_id(&body);
    t.worker.run_next().await.unwrap();

    let (_, job) = t.get(&format!("/api/v1/jobs/{}", first)).await;
    assert_eq!(job["status"], "completed");
    assert_eq!(job["progress"]["completed"], 2);
    assert_eq!(job["progress"]["failed"], 2);

    let (status, stats) = t.get(&format!("/api/v1/documents/{}/stats", doc)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["total"], 4);
    assert_eq!(stats["detected"], 2);
    assert_eq!(stats["undetected"], 2);
    assert_eq!(stats["total_connections"], 2);

    let (_, chunks) = t
        .get(&format!("/api/v1/documents/{}/chunks?filter=undetected", doc))
        .await;
    assert_eq!(chunks["total"], 2);
    assert_eq!(chunks["data"][0]["id"], ids[1].to_string());
    assert_eq!(chunks["data"][0]["detection_state"], "undetected");
    assert_eq!(chunks["data"][0]["preview"], "Observation number 1.");

    let (_, connections) = t
        .get(&format!("/api/v1/chunks/{}/connections", ids[0]))
        .await;
    assert_eq!(connections["total"], 1);

    // Retry still fails the odd chunks, but is accepted and queued.
    let (status, body) = t.post(&format!("/api/v1/jobs/{}/retry", first), json!({})).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let retry = job_id(&body);
    let (_, job) = t.get(&format!("/api/v1/jobs/{}", retry)).await;
    assert_eq!(job["scope"]["kind"], "selective");

    let (_, jobs) = t.get(&format!("/api/v1/documents/{}/jobs", doc)).await;
    assert_eq!(jobs["total"], 2);
    assert_eq!(jobs["data"][0]["id"], retry.to_string());
}

#[tokio::test]
async fn test_chunk_content_and_not_found() {
    let t = TestApp::new();
    let (_, ids) = t.document(1).await;

    let (status, body) = t.get(&format!("/api/v1/chunks/{}/content", ids[0])).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["content"], "Observation number 0.");

    let (status, body) = t
        .get(&format!("/api/v1/chunks/{}/content", Uuid::new_v4()))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());

    let (status, _) = t.get(&format!("/api/v1/jobs/{}", Uuid::new_v4())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_corpus_detection_and_stats() {
    let t = TestApp::new();
    let (a, _) = t.document(2).await;
    let (b, _) = t.document(1).await;
    t.post(&format!("/api/v1/documents/{}/detect", a), json!({}))
        .await;

    let (status, body) = t.post("/api/v1/detect", json!({})).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["total"], 2);
    let outcome = |doc: Uuid| {
        body["data"]
            .as_array()
            .unwrap()
            .iter()
            .find(|o| o["document_id"] == doc.to_string())
            .unwrap()["outcome"]
            .clone()
    };
    assert_eq!(outcome(a), "skipped");
    assert_eq!(outcome(b), "queued");

    let (_, stats) = t.get("/api/v1/stats").await;
    assert_eq!(stats["documents"], 2);
    assert_eq!(stats["documents_in_progress"], 2);
    assert_eq!(stats["total"], 3);
}

#[tokio::test]
async fn test_cursor_write_and_echo_suppression() {
    let t = TestApp::new();
    let (_, ids) = t.document(2).await;

    let (status, cursor) = t
        .request(
            "PUT",
            "/api/v1/cursor",
            Some(json!({ "chunk_id": ids[1], "origin": "list_view" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cursor["origin"], "list_view");
    assert_eq!(cursor["revision"], 1);

    // The reader re-centers on the same chunk and reports it: no write.
    let (_, cursor) = t
        .request(
            "PUT",
            "/api/v1/cursor",
            Some(json!({ "chunk_id": ids[1], "origin": "reader" })),
        )
        .await;
    assert_eq!(cursor["origin"], "list_view");
    assert_eq!(cursor["revision"], 1);

    let (status, _) = t
        .request(
            "PUT",
            "/api/v1/cursor",
            Some(json!({ "chunk_id": Uuid::new_v4(), "origin": "reader" })),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, current) = t.get("/api/v1/cursor").await;
    assert_eq!(current["chunk_id"], ids[1].to_string());
}

#[tokio::test]
async fn test_cursor_stream_delivers_other_views_writes() {
    let t = TestApp::new();
    let (_, ids) = t.document(2).await;

    let response = t
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/cursor/stream?observer=reader")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let mut frames = response.into_body().into_data_stream();

    // The reader's own write is not delivered to the reader.
    t.request(
        "PUT",
        "/api/v1/cursor",
        Some(json!({ "chunk_id": ids[0], "origin": "reader" })),
    )
    .await;
    t.request(
        "PUT",
        "/api/v1/cursor",
        Some(json!({ "chunk_id": ids[1], "origin": "list_view" })),
    )
    .await;

    let frame = tokio::time::timeout(Duration::from_secs(2), frames.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let text = String::from_utf8(frame.to_vec()).unwrap();
    assert!(text.contains("event: cursor"));
    assert!(text.contains(&ids[1].to_string()));
    assert!(!text.contains(&ids[0].to_string()));
}

#[tokio::test]
async fn test_cors_preflight_allows_default_origin() {
    let t = TestApp::new();
    let response = t
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("OPTIONS")
                .uri("/api/v1/stats")
                .header(header::ORIGIN, "http://localhost:3000")
                .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .unwrap(),
        "http://localhost:3000"
    );
}
