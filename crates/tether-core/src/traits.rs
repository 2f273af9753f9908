//! Core traits for tether abstractions.
//!
//! Storage is reached only through these repository traits so the
//! orchestrator and worker run unchanged over PostgreSQL or the in-process
//! store, and the detection algorithm is plugged in through
//! [`ConnectionDetector`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;

// =============================================================================
// DOCUMENT REPOSITORY
// =============================================================================

/// Documents are owned by the ingestion pipeline; detection only reads them.
#[async_trait]
pub trait DocumentRepository: Send + Sync {
    /// Register a document (ingestion side).
    async fn insert(&self, title: &str) -> Result<Uuid>;

    /// Fetch a document by ID.
    async fn get(&self, id: Uuid) -> Result<Option<Document>>;

    /// Check if a document exists.
    async fn exists(&self, id: Uuid) -> Result<bool>;

    /// All document IDs, oldest first.
    async fn list_ids(&self) -> Result<Vec<Uuid>>;
}

// =============================================================================
// CHUNK STATE STORE
// =============================================================================

/// Per-chunk detection state.
///
/// Every mutation touches exactly one chunk row and applies atomically.
#[async_trait]
pub trait ChunkRepository: Send + Sync {
    /// Store the chunks of a freshly ingested document, all `Undetected`.
    ///
    /// Fails with `InvalidInput` on a duplicate sequence number.
    async fn insert_batch(&self, document_id: Uuid, chunks: Vec<NewChunk>) -> Result<Vec<Uuid>>;

    /// Fetch chunk metadata by ID.
    async fn get(&self, id: Uuid) -> Result<Option<Chunk>>;

    /// Fetch several chunks, ordered by (document, sequence number).
    /// Unknown IDs are omitted.
    async fn get_many(&self, ids: &[Uuid]) -> Result<Vec<Chunk>>;

    /// Current detection state; `ChunkNotFound` for unknown IDs.
    async fn get_state(&self, id: Uuid) -> Result<DetectionState>;

    /// Transition to `Detected`. Idempotent; refreshes `detected_at` when
    /// the chunk is already detected.
    async fn mark_detected(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Reset to `Undetected`, clearing `detected_at`.
    async fn mark_undetected(&self, id: Uuid) -> Result<()>;

    /// Chunks of a document matching `filter`, in sequence order.
    async fn list_by_document(
        &self,
        document_id: Uuid,
        filter: DetectionFilter,
    ) -> Result<Vec<Chunk>>;

    /// Lightweight projections (with connection counts and preview text),
    /// in sequence order.
    async fn list_summaries(
        &self,
        document_id: Uuid,
        filter: DetectionFilter,
    ) -> Result<Vec<ChunkSummary>>;

    /// Full chunk content; `ChunkNotFound` for unknown IDs.
    async fn fetch_content(&self, id: Uuid) -> Result<ChunkContent>;
}

// =============================================================================
// CONNECTION STORE
// =============================================================================

#[async_trait]
pub trait ConnectionRepository: Send + Sync {
    /// Store one detection run's connections for a chunk.
    ///
    /// Within a run, a `(target, kind)` pair is stored at most once.
    /// `RedetectPolicy::Replace` removes earlier runs' rows for the chunk in
    /// the same transaction. Returns the number of rows inserted.
    async fn record(
        &self,
        source_chunk_id: Uuid,
        job_id: Uuid,
        connections: Vec<DetectedConnection>,
        policy: RedetectPolicy,
    ) -> Result<usize>;

    /// Connections whose source is the given chunk, oldest first.
    async fn list_for_chunk(&self, chunk_id: Uuid) -> Result<Vec<Connection>>;

    /// Number of connections whose source is the given chunk.
    async fn count_for_chunk(&self, chunk_id: Uuid) -> Result<i64>;
}

// =============================================================================
// DETECTION JOB REPOSITORY
// =============================================================================

#[async_trait]
pub trait DetectionJobRepository: Send + Sync {
    /// Create a `Pending` job unless the document already has a non-terminal
    /// job. The check and insert are a single atomic step.
    ///
    /// Returns `None` when another job is active.
    async fn create_exclusive(
        &self,
        document_id: Uuid,
        scope: JobScope,
        created_by: CreatedBy,
    ) -> Result<Option<Uuid>>;

    /// Fetch a job snapshot.
    async fn get(&self, id: Uuid) -> Result<Option<DetectionJob>>;

    /// The document's `Pending` or `Running` job, if any.
    async fn active_for_document(&self, document_id: Uuid) -> Result<Option<DetectionJob>>;

    /// All jobs of a document, newest first.
    async fn list_for_document(&self, document_id: Uuid) -> Result<Vec<DetectionJob>>;

    /// Atomically move the oldest `Pending` job to `Running` and return it.
    async fn claim_next(&self) -> Result<Option<DetectionJob>>;

    /// Record the resolved chunk count of a running job.
    ///
    /// Returns `false` when the job is no longer `Running`; the worker must
    /// then stop processing it.
    async fn start(&self, id: Uuid, total: i32) -> Result<bool>;

    /// Record one processed chunk. `failure` is `None` for a success.
    /// Returns `false`, recording nothing, when the job is no longer `Running`.
    async fn record_progress(&self, id: Uuid, failure: Option<ChunkFailure>) -> Result<bool>;

    /// Mark a running job `Completed`. Returns whether the transition happened.
    async fn complete(&self, id: Uuid) -> Result<bool>;

    /// Mark a non-terminal job `Failed`. Terminal jobs are left untouched and
    /// `false` is returned.
    async fn fail(&self, id: Uuid, error: &str) -> Result<bool>;

    /// Fail every `Running` job whose last heartbeat is older than
    /// `not_updated_since`. Queued `Pending` jobs have no worker to go silent
    /// and are never reaped. Returns the reaped job IDs.
    async fn fail_stale(&self, not_updated_since: DateTime<Utc>) -> Result<Vec<Uuid>>;

    /// Notified whenever a job is queued.
    fn notifier(&self) -> Arc<Notify>;
}

/// The repositories the orchestrator and worker operate on.
#[derive(Clone)]
pub struct Repositories {
    pub documents: Arc<dyn DocumentRepository>,
    pub chunks: Arc<dyn ChunkRepository>,
    pub connections: Arc<dyn ConnectionRepository>,
    pub jobs: Arc<dyn DetectionJobRepository>,
}

// =============================================================================
// DETECTOR
// =============================================================================

/// The pluggable connection-detection algorithm.
///
/// Implementations may block for a long time; the worker holds no store
/// locks while awaiting them.
#[async_trait]
pub trait ConnectionDetector: Send + Sync {
    /// Human-readable detector name for logs.
    fn name(&self) -> &str;

    /// Detect connections for one chunk. Errors are per-chunk failures.
    async fn detect(&self, chunk: &ChunkContent) -> Result<Vec<DetectedConnection>>;
}
