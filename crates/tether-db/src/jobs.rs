//! Detection job repository implementation.
//!
//! At most one pending or running job exists per document. The partial
//! unique index `idx_detection_job_one_active` enforces this, so
//! `create_exclusive` is a single `INSERT ... ON CONFLICT DO NOTHING`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use tokio::sync::Notify;
use uuid::Uuid;

use tether_core::{
    new_v7, ChunkFailure, CreatedBy, DetectionJob, DetectionJobRepository, Error, JobProgress,
    JobScope, JobStatus, Result,
};

const JOB_COLUMNS: &str = "id, document_id, scope, status, completed_count, failed_count, \
     total_count, failures, error_message, created_by, created_at, started_at, updated_at, \
     completed_at";

/// PostgreSQL implementation of DetectionJobRepository.
pub struct PgDetectionJobRepository {
    pool: Pool<Postgres>,
    /// Woken whenever a job is queued.
    notify: Arc<Notify>,
}

impl PgDetectionJobRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self {
            pool,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Share an existing notify handle, e.g. across `Database` clones.
    pub fn with_notify(pool: Pool<Postgres>, notify: Arc<Notify>) -> Self {
        Self { pool, notify }
    }

    fn parse_job_row(row: PgRow) -> Result<DetectionJob> {
        let scope: JsonValue = row.get("scope");
        let failures: JsonValue = row.get("failures");
        let status: String = row.get("status");
        let created_by: String = row.get("created_by");

        Ok(DetectionJob {
            id: row.get("id"),
            document_id: row.get("document_id"),
            scope: serde_json::from_value::<JobScope>(scope)?,
            status: JobStatus::parse(&status)
                .ok_or_else(|| Error::Internal(format!("unknown job status '{}'", status)))?,
            progress: JobProgress {
                completed: row.get("completed_count"),
                failed: row.get("failed_count"),
                total: row.get("total_count"),
            },
            failures: serde_json::from_value::<Vec<ChunkFailure>>(failures)?,
            error_message: row.get("error_message"),
            created_by: CreatedBy::parse(&created_by)
                .ok_or_else(|| Error::Internal(format!("unknown job creator '{}'", created_by)))?,
            created_at: row.get("created_at"),
            started_at: row.get("started_at"),
            updated_at: row.get("updated_at"),
            completed_at: row.get("completed_at"),
        })
    }

    async fn job_exists(&self, id: Uuid) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM detection_job WHERE id = $1)")
                .bind(id)
                .fetch_one(&self.pool)
                .await
                .map_err(Error::Database)?;
        Ok(exists)
    }

    /// Whether a guarded update applied. A zero-row update is `JobNotFound`
    /// when the job is unknown and `false` when its status did not match.
    async fn applied(&self, id: Uuid, rows_affected: u64) -> Result<bool> {
        if rows_affected > 0 {
            return Ok(true);
        }
        if !self.job_exists(id).await? {
            return Err(Error::JobNotFound(id));
        }
        Ok(false)
    }
}

#[async_trait]
impl DetectionJobRepository for PgDetectionJobRepository {
    async fn create_exclusive(
        &self,
        document_id: Uuid,
        scope: JobScope,
        created_by: CreatedBy,
    ) -> Result<Option<Uuid>> {
        let job_id = new_v7();
        let now = Utc::now();
        let scope_json = serde_json::to_value(&scope)?;

        let result = sqlx::query_scalar::<_, Uuid>(
            "INSERT INTO detection_job (id, document_id, scope, status, created_by, created_at, updated_at)
             VALUES ($1, $2, $3, 'pending', $4, $5, $5)
             ON CONFLICT DO NOTHING
             RETURNING id",
        )
        .bind(job_id)
        .bind(document_id)
        .bind(&scope_json)
        .bind(created_by.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(db) = &e {
                if db.is_foreign_key_violation() {
                    return Error::DocumentNotFound(document_id);
                }
            }
            Error::Database(e)
        })?;

        if result.is_some() {
            self.notify.notify_waiters();
        }
        Ok(result)
    }

    async fn get(&self, id: Uuid) -> Result<Option<DetectionJob>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM detection_job WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(Self::parse_job_row).transpose()
    }

    async fn active_for_document(&self, document_id: Uuid) -> Result<Option<DetectionJob>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM detection_job
             WHERE document_id = $1 AND status IN ('pending', 'running')
             LIMIT 1"
        ))
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(Self::parse_job_row).transpose()
    }

    async fn list_for_document(&self, document_id: Uuid) -> Result<Vec<DetectionJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM detection_job
             WHERE document_id = $1
             ORDER BY created_at DESC, id DESC"
        ))
        .bind(document_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.into_iter().map(Self::parse_job_row).collect()
    }

    async fn claim_next(&self) -> Result<Option<DetectionJob>> {
        let now = Utc::now();

        // FOR UPDATE SKIP LOCKED lets several workers claim concurrently.
        let row = sqlx::query(&format!(
            "UPDATE detection_job
             SET status = 'running', started_at = $1, updated_at = $1
             WHERE id = (
                 SELECT id FROM detection_job
                 WHERE status = 'pending'
                 ORDER BY created_at ASC
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(Self::parse_job_row).transpose()
    }

    async fn start(&self, id: Uuid, total: i32) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE detection_job SET total_count = $1, updated_at = $2
             WHERE id = $3 AND status = 'running'",
        )
        .bind(total)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        self.applied(id, result.rows_affected()).await
    }

    async fn record_progress(&self, id: Uuid, failure: Option<ChunkFailure>) -> Result<bool> {
        let now = Utc::now();
        let result = match failure {
            None => {
                sqlx::query(
                    "UPDATE detection_job
                     SET completed_count = completed_count + 1, updated_at = $1
                     WHERE id = $2 AND status = 'running'",
                )
                .bind(now)
                .bind(id)
                .execute(&self.pool)
                .await
            }
            Some(failure) => {
                let entry = serde_json::to_value(vec![failure])?;
                sqlx::query(
                    "UPDATE detection_job
                     SET failed_count = failed_count + 1, failures = failures || $1,
                         updated_at = $2
                     WHERE id = $3 AND status = 'running'",
                )
                .bind(&entry)
                .bind(now)
                .bind(id)
                .execute(&self.pool)
                .await
            }
        }
        .map_err(Error::Database)?;

        self.applied(id, result.rows_affected()).await
    }

    async fn complete(&self, id: Uuid) -> Result<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE detection_job
             SET status = 'completed', completed_at = $1, updated_at = $1
             WHERE id = $2 AND status = 'running'",
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        self.applied(id, result.rows_affected()).await
    }

    async fn fail(&self, id: Uuid, error: &str) -> Result<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE detection_job
             SET status = 'failed', error_message = $1, completed_at = $2, updated_at = $2
             WHERE id = $3 AND status IN ('pending', 'running')",
        )
        .bind(error)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        self.applied(id, result.rows_affected()).await
    }

    async fn fail_stale(&self, not_updated_since: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let now = Utc::now();
        let ids: Vec<Uuid> = sqlx::query_scalar(
            "UPDATE detection_job
             SET status = 'failed',
                 error_message = 'no progress since ' || updated_at::text,
                 completed_at = $1, updated_at = $1
             WHERE status = 'running' AND updated_at < $2
             RETURNING id",
        )
        .bind(now)
        .bind(not_updated_since)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(ids)
    }

    fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}
