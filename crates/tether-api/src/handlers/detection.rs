//! Detection requests, job status, stats and chunk listings.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tether_core::{CreatedBy, DetectionFilter, JobScope, RequestOutcome};

use super::ListResponse;
use crate::error::ApiError;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct DetectBody {
    #[serde(default = "full_scope")]
    pub scope: JobScope,
    #[serde(default = "user")]
    pub created_by: CreatedBy,
}

fn full_scope() -> JobScope {
    JobScope::Full
}

fn user() -> CreatedBy {
    CreatedBy::User
}

impl Default for DetectBody {
    fn default() -> Self {
        Self {
            scope: full_scope(),
            created_by: user(),
        }
    }
}

#[derive(Debug, Serialize)]
struct QueuedResponse {
    job_id: Uuid,
}

/// `POST /api/v1/documents/:id/detect`
///
/// The body is optional; without one a `full` user request is queued.
pub async fn request_detection(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    body: Option<Json<DetectBody>>,
) -> Result<impl IntoResponse, ApiError> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let job_id = state
        .service
        .request_detection(document_id, body.scope, body.created_by)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(QueuedResponse { job_id })))
}

#[derive(Debug, Deserialize)]
pub struct IngestedBody {
    pub detect_connections: bool,
}

/// `POST /api/v1/documents/:id/ingested`
///
/// Completion signal from the ingestion pipeline. Answers 202 with the
/// queued job, or 200 with `job_id: null` when detection was not requested.
pub async fn document_ingested(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    Json(body): Json<IngestedBody>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = state
        .service
        .request_detection_for_document(document_id, body.detect_connections)
        .await?;
    let status = if job_id.is_some() {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(serde_json::json!({ "job_id": job_id }))))
}

#[derive(Debug, Serialize)]
struct CorpusOutcome {
    document_id: Uuid,
    #[serde(flatten)]
    outcome: RequestOutcome,
}

/// `POST /api/v1/detect`
pub async fn request_corpus_detection(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let outcomes: Vec<CorpusOutcome> = state
        .service
        .request_detection_for_corpus(CreatedBy::User)
        .await?
        .into_iter()
        .map(|(document_id, outcome)| CorpusOutcome {
            document_id,
            outcome,
        })
        .collect();
    Ok((StatusCode::ACCEPTED, Json(ListResponse::new(outcomes))))
}

/// `GET /api/v1/documents/:id/stats`
pub async fn document_stats(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.compute_stats(document_id).await?))
}

/// `GET /api/v1/stats`
pub async fn corpus_stats(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.compute_corpus_stats().await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct ChunkListQuery {
    #[serde(default)]
    pub filter: DetectionFilter,
}

/// `GET /api/v1/documents/:id/chunks?filter=detected|undetected|all`
pub async fn list_chunks(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    Query(query): Query<ChunkListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let chunks = state
        .service
        .list_chunks(document_id, query.filter)
        .await?;
    Ok(Json(ListResponse::new(chunks)))
}

/// `GET /api/v1/documents/:id/jobs`
pub async fn list_jobs(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(ListResponse::new(
        state.service.list_jobs(document_id).await?,
    )))
}

/// `GET /api/v1/chunks/:id/content`
pub async fn chunk_content(
    State(state): State<AppState>,
    Path(chunk_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.get_chunk_content(chunk_id).await?))
}

/// `GET /api/v1/chunks/:id/connections`
pub async fn chunk_connections(
    State(state): State<AppState>,
    Path(chunk_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(ListResponse::new(
        state.service.list_connections(chunk_id).await?,
    )))
}

/// `GET /api/v1/jobs/:id`
pub async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.get_job_status(job_id).await?))
}

/// `POST /api/v1/jobs/:id/retry`
pub async fn retry_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = state.service.retry_failed(job_id).await?;
    Ok((StatusCode::ACCEPTED, Json(QueuedResponse { job_id })))
}
