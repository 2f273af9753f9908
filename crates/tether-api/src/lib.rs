//! # tether-api
//!
//! HTTP surface of tether: detection requests, job status, stats, chunk
//! listings, the shared reader/list cursor, and SSE streams for job events
//! and cursor changes.

pub mod error;
pub mod handlers;

use std::time::Duration;

use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use tether_core::{defaults, CursorCoordinator};
use tether_jobs::DetectionService;

pub use error::ApiError;
use handlers::{cursor, detection, events};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: DetectionService,
    /// Focus shared by the reader and the chunk list.
    pub cursor: CursorCoordinator,
}

impl AppState {
    pub fn new(service: DetectionService) -> Self {
        Self {
            service,
            cursor: CursorCoordinator::new(),
        }
    }
}

/// Build the full application router, middleware included.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        // Detection requests
        .route(
            "/api/v1/documents/:id/detect",
            post(detection::request_detection),
        )
        .route(
            "/api/v1/documents/:id/ingested",
            post(detection::document_ingested),
        )
        .route("/api/v1/detect", post(detection::request_corpus_detection))
        // Read side
        .route("/api/v1/documents/:id/stats", get(detection::document_stats))
        .route("/api/v1/documents/:id/chunks", get(detection::list_chunks))
        .route("/api/v1/documents/:id/jobs", get(detection::list_jobs))
        .route("/api/v1/stats", get(detection::corpus_stats))
        .route("/api/v1/chunks/:id/content", get(detection::chunk_content))
        .route(
            "/api/v1/chunks/:id/connections",
            get(detection::chunk_connections),
        )
        .route("/api/v1/jobs/:id", get(detection::job_status))
        .route("/api/v1/jobs/:id/retry", post(detection::retry_job))
        // View sync
        .route(
            "/api/v1/cursor",
            get(cursor::get_cursor).put(cursor::set_cursor),
        )
        .route("/api/v1/cursor/stream", get(cursor::cursor_stream))
        // Live job events
        .route("/api/v1/events", get(events::sse_events))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(parse_allowed_origins()))
        .with_state(state)
}

fn cors_layer(allowed_origins: Vec<HeaderValue>) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT])
        .allow_credentials(true)
        .max_age(Duration::from_secs(defaults::CORS_MAX_AGE_SECS))
}

/// Parse `ALLOWED_ORIGINS` (comma-separated) into CORS origins.
///
/// Invalid entries are skipped with a warning. Unset or empty falls back to
/// `http://localhost:3000`.
pub fn parse_allowed_origins() -> Vec<HeaderValue> {
    let origins = std::env::var("ALLOWED_ORIGINS").unwrap_or_default();
    parse_origin_list(&origins)
}

fn parse_origin_list(origins: &str) -> Vec<HeaderValue> {
    let parsed: Vec<HeaderValue> = origins
        .split(',')
        .filter_map(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            match trimmed.parse::<HeaderValue>() {
                Ok(v) => Some(v),
                Err(e) => {
                    tracing::warn!("Invalid CORS origin '{}': {}", trimmed, e);
                    None
                }
            }
        })
        .collect();

    if parsed.is_empty() {
        vec![HeaderValue::from_static("http://localhost:3000")]
    } else {
        parsed
    }
}
